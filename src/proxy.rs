//! Relay orchestration.
//!
//! Builds the listener, session table, send pool and reactor, then runs the
//! reactor forever.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::runtime::Handle;

use crate::error::RelayError;
use crate::pool::SendPool;
use crate::session::{Clock, SessionTable};
use crate::stats::Stats;
use crate::transport::listener::Listener;
use crate::transport::udp::Reactor;

/// Configuration for the relay.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to bind (e.g., 0.0.0.0:53)
    pub bind_addr: SocketAddr,
    /// Upstream resolvers; every query goes to all of them
    pub upstreams: Vec<SocketAddr>,
    /// Idle time after which a session is evicted
    pub ttl: Duration,
    /// Size of the inbound datagram buffers
    pub buffer_size: usize,
    /// Number of send workers
    pub workers: usize,
    /// How often to log stats; `None` disables
    pub stats_interval: Option<Duration>,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.upstreams.is_empty() {
            return Err(RelayError::NoUpstreams);
        }
        check_workers(self.workers)?;
        if self.buffer_size == 0 {
            return Err(RelayError::Config("buffer size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Reject an empty send pool.
///
/// Also called before the worker runtime is built, since tokio panics on a
/// zero thread count.
pub fn check_workers(workers: usize) -> Result<(), RelayError> {
    if workers == 0 {
        return Err(RelayError::Config("worker pool size must be at least 1".into()));
    }
    Ok(())
}

/// Bind the listener and assemble a reactor.
///
/// Send workers are spawned on `pool_handle`, which should belong to a
/// different runtime than the one driving the reactor.
pub async fn bind(
    config: &ProxyConfig,
    pool_handle: &Handle,
    stats: Arc<Stats>,
) -> Result<Reactor, RelayError> {
    config.validate()?;

    let listener = Listener::bind(config.bind_addr).await?;
    let table = SessionTable::new(config.ttl, Clock::new(), stats.clone());
    let pool = SendPool::new(config.workers, pool_handle, stats.clone());

    Ok(Reactor::new(
        listener,
        config.upstreams.clone(),
        table,
        pool,
        stats,
        config.buffer_size,
    ))
}

/// Run the relay with the given configuration. Runs indefinitely.
pub async fn run(config: ProxyConfig, pool_handle: Handle) -> Result<(), RelayError> {
    let stats = Arc::new(Stats::new());
    let reactor = bind(&config, &pool_handle, stats.clone()).await?;

    info!(
        "DNS relay listening on {} (ttl={}s, workers={})",
        reactor.local_addr()?,
        config.ttl.as_secs(),
        config.workers
    );
    let upstream_strs: Vec<_> = config.upstreams.iter().map(|a| a.to_string()).collect();
    info!("Fanning out to upstreams: {}", upstream_strs.join(", "));

    if let Some(period) = config.stats_interval {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip first immediate tick
            loop {
                interval.tick().await;
                let s = stats.snapshot_and_reset();
                info!(
                    "[stats] queries={} dispatched={} send_failures={} relayed={} sessions_created={} sessions_evicted={}",
                    s.queries,
                    s.dispatched,
                    s.send_failures,
                    s.relayed,
                    s.sessions_created,
                    s.sessions_evicted
                );
            }
        });
    }

    reactor.run().await;

    Ok(())
}
