//! Worker pool that performs upstream sends off the reactor thread.
//!
//! Each worker drains its own queue in order. A session is always routed to
//! the same worker, so sends for one session never overlap.
//!
//! Queues are unbounded: a burst of queries grows them without limit rather
//! than blocking or dropping at the reactor.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use log::debug;
use rustc_hash::FxHasher;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::session::{Session, SessionKey};
use crate::stats::Stats;

struct SendTask {
    session: Arc<Session>,
    payload: Arc<[u8]>,
}

/// Fixed set of send workers.
pub struct SendPool {
    workers: Vec<mpsc::UnboundedSender<SendTask>>,
}

impl SendPool {
    /// Spawn `size` workers on `handle`. `size` must be non-zero; see
    /// [`crate::proxy::check_workers`].
    pub fn new(size: usize, handle: &Handle, stats: Arc<Stats>) -> Self {
        debug_assert!(size > 0, "send pool needs at least one worker");
        let workers = (0..size)
            .map(|id| {
                let (tx, rx) = mpsc::unbounded_channel();
                handle.spawn(run_worker(id, rx, stats.clone()));
                tx
            })
            .collect();

        Self { workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a send and return immediately.
    pub fn submit(&self, session: Arc<Session>, payload: Arc<[u8]>) {
        let worker = self.worker_for(&session.key());
        if self.workers[worker]
            .send(SendTask { session, payload })
            .is_err()
        {
            debug!("send worker {} is gone, query dropped", worker);
        }
    }

    fn worker_for(&self, key: &SessionKey) -> usize {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() % self.workers.len() as u64) as usize
    }
}

async fn run_worker(id: usize, mut rx: mpsc::UnboundedReceiver<SendTask>, stats: Arc<Stats>) {
    while let Some(task) = rx.recv().await {
        // No retry: an upstream that misses the query just never answers.
        if let Err(e) = task.session.send(&task.payload).await {
            stats.record_send_failure();
            debug!("[{}] worker {} send failed: {}", task.session.key(), id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    use crate::session::Clock;

    #[tokio::test]
    async fn same_session_always_maps_to_same_worker() {
        let pool = SendPool::new(10, &Handle::current(), Arc::new(Stats::new()));
        let key = SessionKey::new(
            "127.0.0.1:40000".parse().unwrap(),
            "8.8.8.8:53".parse().unwrap(),
        );

        let first = pool.worker_for(&key);
        for _ in 0..100 {
            assert_eq!(pool.worker_for(&key), first);
        }
        assert!(first < pool.size());
    }

    #[tokio::test]
    async fn submitted_sends_reach_upstream_in_order() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let key = SessionKey::new(client, upstream.local_addr().unwrap());
        let session = Arc::new(
            Session::open(key, Duration::from_secs(10), Clock::new())
                .await
                .unwrap(),
        );

        let pool = SendPool::new(4, &Handle::current(), Arc::new(Stats::new()));
        for i in 0..5u8 {
            pool.submit(session.clone(), Arc::from(&[i][..]));
        }

        let mut buf = [0u8; 16];
        for i in 0..5u8 {
            let (len, _) = tokio::time::timeout(Duration::from_secs(1), upstream.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..len], &[i]);
        }
    }

    #[tokio::test]
    async fn closed_session_counts_send_failure() {
        let stats = Arc::new(Stats::new());
        let mut table = crate::session::SessionTable::new(
            Duration::from_secs(10),
            Clock::new(),
            stats.clone(),
        );
        let session = table
            .get_or_create(
                "127.0.0.1:40000".parse().unwrap(),
                "127.0.0.1:5300".parse().unwrap(),
            )
            .await
            .unwrap();
        table.remove(&session.key());

        let pool = SendPool::new(1, &Handle::current(), stats.clone());
        pool.submit(session, Arc::from(&b"query"[..]));

        for _ in 0..50 {
            if stats.send_failures.load(std::sync::atomic::Ordering::Relaxed) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("send failure was not recorded");
    }
}
