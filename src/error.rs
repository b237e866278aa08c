//! Error types for the relay.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors produced by the relay.
///
/// Everything except [`RelayError::SessionClosed`] and per-datagram I/O is a
/// startup error and terminates the process.
#[derive(Debug, Error)]
pub enum RelayError {
    /// I/O errors from the underlying system.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An upstream resolver name could not be resolved.
    #[error("Name service failure for upstream {upstream}: {source}")]
    Resolve {
        upstream: String,
        #[source]
        source: io::Error,
    },

    /// The upstream list is empty after resolution.
    #[error("No upstream resolvers configured")]
    NoUpstreams,

    /// A socket could not be bound.
    #[error("Network failure binding {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The session was evicted before the operation ran.
    #[error("Session closed")]
    SessionClosed,
}
