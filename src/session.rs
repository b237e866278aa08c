//! Per-(client, upstream) sessions and the table that owns them.
//!
//! Every client that sends a query gets one session per upstream resolver.
//! A session owns a UDP socket connected to its upstream, so replies arriving
//! on that socket can only belong to the client in the session key.
//!
//! The table is owned by the reactor. Pool workers hold `Arc<Session>`
//! clones for sending but never add or remove entries.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use log::debug;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;

use crate::error::RelayError;
use crate::stats::Stats;
use crate::transport::listener::Listener;

/// Monotonic millisecond clock for activity stamps.
///
/// Stamps are plain `u64`s so they fit in a single atomic.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds from the clock's epoch to `at`.
    pub fn millis_at(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64
    }

    pub fn now(&self) -> u64 {
        self.millis_at(Instant::now())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a session.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct SessionKey {
    pub client: SocketAddr,
    pub upstream: SocketAddr,
}

impl SessionKey {
    pub fn new(client: SocketAddr, upstream: SocketAddr) -> Self {
        Self { client, upstream }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.client, self.upstream)
    }
}

/// Outcome of servicing a readable session socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readable {
    /// A reply of this many bytes was relayed to the client.
    Relayed(usize),
    /// Nothing usable was received; the event is dropped.
    Absorbed,
}

/// One UDP conversation between a client and an upstream resolver.
pub struct Session {
    key: SessionKey,
    socket: UdpSocket,
    last_activity: AtomicU64,
    ttl: Duration,
    clock: Clock,
    closed: AtomicBool,
}

impl Session {
    /// Open a socket of the upstream's address family and connect it.
    pub async fn open(key: SessionKey, ttl: Duration, clock: Clock) -> io::Result<Self> {
        let local: SocketAddr = match key.upstream {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(key.upstream).await?;

        Ok(Self {
            key,
            socket,
            last_activity: AtomicU64::new(clock.now()),
            ttl,
            clock,
            closed: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.last_activity
            .store(self.clock.now(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// True when the session has been idle strictly longer than its TTL at `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        let idle = self
            .clock
            .millis_at(now)
            .saturating_sub(self.last_activity());
        Duration::from_millis(idle) > self.ttl
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Send a query to the upstream.
    ///
    /// Activity is stamped before the attempt, whatever its outcome.
    pub async fn send(&self, payload: &[u8]) -> Result<usize, RelayError> {
        if self.is_closed() {
            return Err(RelayError::SessionClosed);
        }
        self.touch();
        Ok(self.socket.send(payload).await?)
    }

    /// Wait until the upstream socket has something to read.
    pub async fn readable(&self) {
        // An error here surfaces again from `try_recv` in `handle_readable`.
        let _ = self.socket.readable().await;
    }

    /// Read one reply without blocking and relay it to the session's client.
    pub fn handle_readable(&self, buf: &mut [u8], listener: &Listener) -> Readable {
        match self.socket.try_recv(buf) {
            Ok(0) => Readable::Absorbed,
            Ok(len) => {
                self.touch();
                // Relay is best effort; the client retries on its own timeout.
                let _ = listener.send(&buf[..len], self.key.client);
                Readable::Relayed(len)
            }
            Err(e) => {
                debug!("[{}] upstream recv absorbed: {}", self.key, e);
                Readable::Absorbed
            }
        }
    }
}

struct Entry {
    session: Arc<Session>,
    /// Present while the socket is armed for read readiness.
    registration: Option<AbortHandle>,
}

type ReadinessFuture = Abortable<BoxFuture<'static, SessionKey>>;

/// All live sessions, keyed by (client, upstream).
pub struct SessionTable {
    sessions: FxHashMap<SessionKey, Entry>,
    readiness: FuturesUnordered<ReadinessFuture>,
    ttl: Duration,
    clock: Clock,
    stats: Arc<Stats>,
}

impl SessionTable {
    pub fn new(ttl: Duration, clock: Clock, stats: Arc<Stats>) -> Self {
        Self {
            sessions: FxHashMap::default(),
            readiness: FuturesUnordered::new(),
            ttl,
            clock,
            stats,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|e| e.session.clone())
    }

    pub fn is_armed(&self, key: &SessionKey) -> bool {
        self.sessions
            .get(key)
            .is_some_and(|e| e.registration.is_some())
    }

    /// Return the session for `(client, upstream)`, opening and arming a new
    /// one on first sight of the pair.
    pub async fn get_or_create(
        &mut self,
        client: SocketAddr,
        upstream: SocketAddr,
    ) -> io::Result<Arc<Session>> {
        let key = SessionKey::new(client, upstream);
        if let Some(entry) = self.sessions.get(&key) {
            return Ok(entry.session.clone());
        }

        let session = Arc::new(Session::open(key, self.ttl, self.clock).await?);
        self.sessions.insert(
            key,
            Entry {
                session: session.clone(),
                registration: None,
            },
        );
        self.arm(&key);
        self.stats.record_session_created();
        debug!("[{}] session created", key);

        Ok(session)
    }

    /// Register the session's socket for read readiness. No-op when already
    /// armed or when the key is unknown.
    pub fn arm(&mut self, key: &SessionKey) {
        let Some(entry) = self.sessions.get_mut(key) else {
            return;
        };
        if entry.registration.is_some() {
            return;
        }

        let session = entry.session.clone();
        let (handle, registration) = AbortHandle::new_pair();
        let wait = async move {
            session.readable().await;
            session.key()
        };
        self.readiness
            .push(Abortable::new(wait.boxed(), registration));
        entry.registration = Some(handle);
    }

    /// Cancel the session's read-readiness registration.
    pub fn disarm(&mut self, key: &SessionKey) {
        if let Some(handle) = self
            .sessions
            .get_mut(key)
            .and_then(|e| e.registration.take())
        {
            handle.abort();
        }
    }

    /// Deregister, close and forget a session. Returns false if the key was
    /// not present.
    pub fn remove(&mut self, key: &SessionKey) -> bool {
        let Some(mut entry) = self.sessions.remove(key) else {
            return false;
        };
        if let Some(handle) = entry.registration.take() {
            handle.abort();
        }
        entry.session.close();
        true
    }

    /// Remove every session idle strictly longer than its TTL at `now`.
    ///
    /// The reactor calls this once per listener event, so sessions left over
    /// from a burst are reclaimed only when the next query arrives.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, e)| e.session.is_expired_at(now))
            .map(|(k, _)| *k)
            .collect();

        for key in &expired {
            self.remove(key);
            debug!("[{}] session evicted", key);
        }

        if !expired.is_empty() {
            self.stats.record_sessions_evicted(expired.len());
        }
        expired.len()
    }

    /// Wait for the next armed session to become readable.
    ///
    /// The returned session is left disarmed; the caller re-arms it if it
    /// should keep listening. Pends forever while nothing is armed.
    /// Cancel safe.
    pub async fn next_readable(&mut self) -> Arc<Session> {
        while let Some(ready) = self.readiness.next().await {
            // Aborted registrations belong to removed or disarmed sessions.
            let Ok(key) = ready else {
                continue;
            };
            if let Some(entry) = self.sessions.get_mut(&key) {
                entry.registration = None;
                return entry.session.clone();
            }
        }
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn table() -> SessionTable {
        SessionTable::new(TTL, Clock::new(), Arc::new(Stats::new()))
    }

    #[tokio::test]
    async fn get_or_create_reuses_session_for_same_key() {
        let mut table = table();
        let client = addr("127.0.0.1:40000");
        let upstream = addr("127.0.0.1:5300");

        let first = table.get_or_create(client, upstream).await.unwrap();
        let second = table.get_or_create(client, upstream).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
        assert!(table.is_armed(&first.key()));
    }

    #[tokio::test]
    async fn distinct_clients_get_distinct_sessions() {
        let mut table = table();
        let upstream = addr("127.0.0.1:5300");

        let a = table
            .get_or_create(addr("127.0.0.1:40000"), upstream)
            .await
            .unwrap();
        let b = table
            .get_or_create(addr("127.0.0.1:40001"), upstream)
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_ne!(a.local_addr().unwrap(), b.local_addr().unwrap());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn session_family_follows_upstream() {
        let mut table = table();
        let session = table
            .get_or_create(addr("127.0.0.1:40000"), addr("127.0.0.1:5300"))
            .await
            .unwrap();

        assert!(session.local_addr().unwrap().is_ipv4());
    }

    #[tokio::test]
    async fn sweep_keeps_sessions_within_ttl() {
        let mut table = table();
        table
            .get_or_create(addr("127.0.0.1:40000"), addr("127.0.0.1:5300"))
            .await
            .unwrap();

        assert_eq!(table.sweep(Instant::now()), 0);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn sweep_evicts_idle_sessions_and_closes_them() {
        let stats = Arc::new(Stats::new());
        let mut table = SessionTable::new(TTL, Clock::new(), stats.clone());
        let client = addr("127.0.0.1:40000");
        let upstream = addr("127.0.0.1:5300");

        let session = table.get_or_create(client, upstream).await.unwrap();
        let evicted = table.sweep(Instant::now() + TTL + Duration::from_millis(50));

        assert_eq!(evicted, 1);
        assert!(table.is_empty());
        assert!(session.is_closed());
        assert!(matches!(
            session.send(b"query").await,
            Err(RelayError::SessionClosed)
        ));
        assert_eq!(stats.snapshot_and_reset().sessions_evicted, 1);

        // Evicted keys get a fresh session.
        let again = table.get_or_create(client, upstream).await.unwrap();
        assert!(!Arc::ptr_eq(&session, &again));
    }

    #[tokio::test]
    async fn evicted_socket_is_released() {
        let mut table = table();
        let session = table
            .get_or_create(addr("127.0.0.1:40000"), addr("127.0.0.1:5300"))
            .await
            .unwrap();
        let port = session.local_addr().unwrap().port();

        table.sweep(Instant::now() + TTL + Duration::from_millis(50));
        // Polling the readiness set drops the aborted registration.
        let _ = tokio::time::timeout(Duration::from_millis(20), table.next_readable()).await;
        drop(session);

        UdpSocket::bind(("0.0.0.0", port)).await.unwrap();
    }

    #[tokio::test]
    async fn touch_postpones_expiry() {
        let clock = Clock::new();
        let key = SessionKey::new(addr("127.0.0.1:40000"), addr("127.0.0.1:5300"));
        let session = Session::open(key, Duration::from_millis(100), clock)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        session.touch();

        assert!(!session.is_expired_at(Instant::now() + Duration::from_millis(60)));
        assert!(session.is_expired_at(Instant::now() + Duration::from_millis(150)));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let mut table = table();
        let session = table
            .get_or_create(addr("127.0.0.1:40000"), addr("127.0.0.1:5300"))
            .await
            .unwrap();

        assert!(table.remove(&session.key()));
        assert!(!table.remove(&session.key()));
    }

    #[tokio::test]
    async fn handle_readable_relays_reply_to_client() {
        let listener = Listener::bind(addr("127.0.0.1:0")).await.unwrap();
        let listener_addr = listener.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut table = table();
        let key = SessionKey::new(client.local_addr().unwrap(), upstream.local_addr().unwrap());
        table.get_or_create(key.client, key.upstream).await.unwrap();

        let session_port = table.get(&key).unwrap().local_addr().unwrap().port();
        upstream
            .send_to(b"\x12\x34reply", ("127.0.0.1", session_port))
            .await
            .unwrap();

        let ready = tokio::time::timeout(Duration::from_secs(1), table.next_readable())
            .await
            .unwrap();
        assert_eq!(ready.key(), key);
        assert!(!table.is_armed(&key));

        let mut buf = [0u8; 512];
        assert_eq!(ready.handle_readable(&mut buf, &listener), Readable::Relayed(7));

        let (len, from) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"\x12\x34reply");
        assert_eq!(from, listener_addr);
    }

    #[tokio::test]
    async fn handle_readable_absorbs_empty_socket() {
        let listener = Listener::bind(addr("127.0.0.1:0")).await.unwrap();
        let key = SessionKey::new(addr("127.0.0.1:40000"), addr("127.0.0.1:5300"));
        let session = Session::open(key, TTL, Clock::new()).await.unwrap();

        let mut buf = [0u8; 512];
        assert_eq!(session.handle_readable(&mut buf, &listener), Readable::Absorbed);
    }
}
