//! dnsfan - a UDP relay that fans DNS queries out to several upstreams.
//!
//! Every client query is sent to all configured resolvers through a
//! per-(client, upstream) session; the first reply on each session is
//! relayed back to the client. Payloads are never parsed.

pub mod error;
pub mod pool;
pub mod proxy;
pub mod resolver;
pub mod session;
pub mod stats;
pub mod transport;
