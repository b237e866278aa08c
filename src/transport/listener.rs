//! The client-facing UDP socket.

use std::io;
use std::net::SocketAddr;

use log::debug;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::RelayError;

/// Bound UDP socket that receives every client query.
///
/// Sessions relay replies through [`Listener::send`]; they borrow the
/// listener from the reactor and never own it.
pub struct Listener {
    socket: UdpSocket,
}

impl Listener {
    /// Bind the listener with `SO_REUSEADDR` set. Failure here is a startup
    /// error.
    pub async fn bind(addr: SocketAddr) -> Result<Self, RelayError> {
        let socket =
            new_reusable_socket(addr).map_err(|source| RelayError::Bind { addr, source })?;

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wait for one client datagram.
    ///
    /// Receive failures are absorbed and reported as `None`. Cancel safe.
    pub async fn receive(&self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        match self.socket.recv_from(buf).await {
            Ok(received) => Some(received),
            Err(e) => {
                debug!("listener recv absorbed: {}", e);
                None
            }
        }
    }

    /// Send a reply to a client without blocking.
    ///
    /// Returns `None` when the datagram could not be sent, including when the
    /// socket's send buffer is full; callers drop it.
    pub fn send(&self, payload: &[u8], client: SocketAddr) -> Option<usize> {
        match self.socket.try_send_to(payload, client) {
            Ok(sent) => Some(sent),
            Err(e) => {
                debug!("reply to {} dropped: {}", client, e);
                None
            }
        }
    }
}

fn new_reusable_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    UdpSocket::from_std(socket.into())
}
