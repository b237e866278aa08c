//! Startup resolution of the listen address and upstream endpoints.
//!
//! Both lists are fixed configuration. Anything that fails to resolve here
//! is a startup error, never a runtime one.

use std::io;
use std::net::{IpAddr, SocketAddr};

use log::warn;
use tokio::net::lookup_host;

use crate::error::RelayError;

/// Parse the wildcard (or explicit) address the listener binds to.
pub fn listen_addr(bind: &str, port: u16) -> Result<SocketAddr, RelayError> {
    let ip: IpAddr = bind
        .trim()
        .parse()
        .map_err(|_| RelayError::Config(format!("invalid bind address '{}'", bind)))?;

    Ok(SocketAddr::new(ip, port))
}

/// Resolve one upstream given as `ip`, `ip:port`, `host` or `host:port`.
///
/// `default_port` applies when the entry carries no port. The first address
/// returned by the resolver is used.
pub async fn resolve_upstream(upstream: &str, default_port: u16) -> Result<SocketAddr, RelayError> {
    let upstream = upstream.trim();

    if let Ok(addr) = upstream.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = upstream.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let resolved: io::Result<Vec<SocketAddr>> = if upstream.contains(':') {
        lookup_host(upstream).await.map(|addrs| addrs.collect())
    } else {
        lookup_host((upstream, default_port))
            .await
            .map(|addrs| addrs.collect())
    };

    resolved
        .map_err(|source| RelayError::Resolve {
            upstream: upstream.to_string(),
            source,
        })?
        .into_iter()
        .next()
        .ok_or_else(|| RelayError::Resolve {
            upstream: upstream.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        })
}

/// Resolve the configured upstream list, keeping order and dropping
/// duplicates.
pub async fn resolve_upstreams(
    upstreams: &[String],
    default_port: u16,
) -> Result<Vec<SocketAddr>, RelayError> {
    let mut resolved = Vec::with_capacity(upstreams.len());

    for upstream in upstreams {
        let addr = resolve_upstream(upstream, default_port).await?;
        if resolved.contains(&addr) {
            warn!("upstream {} listed twice, ignoring duplicate", addr);
            continue;
        }
        resolved.push(addr);
    }

    if resolved.is_empty() {
        return Err(RelayError::NoUpstreams);
    }
    Ok(resolved)
}
