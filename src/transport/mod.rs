//! Transport layer for the relay.
//!
//! The listener receives client queries and sends replies back; the UDP
//! reactor multiplexes the listener with every session socket.

pub mod listener;
pub mod udp;

/// Standard DNS port, used for the listener and for upstreams given without one.
pub const DNS_PORT: u16 = 53;

/// Default size of the inbound datagram buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 65536;
