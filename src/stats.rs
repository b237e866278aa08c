//! Statistics tracking for the relay.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared by the reactor and the send workers.
pub struct Stats {
    pub queries: AtomicU64,
    pub dispatched: AtomicU64,
    pub send_failures: AtomicU64,
    pub relayed: AtomicU64,
    pub sessions_created: AtomicU64,
    pub sessions_evicted: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            queries: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            relayed: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
        }
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relayed(&self) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sessions_evicted(&self, count: usize) {
        self.sessions_evicted
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        StatsSnapshot {
            queries: self.queries.swap(0, Ordering::Relaxed),
            dispatched: self.dispatched.swap(0, Ordering::Relaxed),
            send_failures: self.send_failures.swap(0, Ordering::Relaxed),
            relayed: self.relayed.swap(0, Ordering::Relaxed),
            sessions_created: self.sessions_created.swap(0, Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub queries: u64,
    pub dispatched: u64,
    pub send_failures: u64,
    pub relayed: u64,
    pub sessions_created: u64,
    pub sessions_evicted: u64,
}
