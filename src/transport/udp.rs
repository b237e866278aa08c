//! UDP reactor for the relay.
//!
//! A single task multiplexes the listener and every armed session socket
//! with `select!`. It owns the session table: all inserts, removals and
//! eviction decisions happen here, never in the send workers.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::pool::SendPool;
use crate::session::{Readable, Session, SessionTable};
use crate::stats::Stats;

use super::listener::Listener;

/// Event loop that fans client queries out to every upstream.
pub struct Reactor {
    listener: Listener,
    upstreams: Vec<SocketAddr>,
    table: SessionTable,
    pool: SendPool,
    stats: Arc<Stats>,
    buffer_size: usize,
}

impl Reactor {
    pub fn new(
        listener: Listener,
        upstreams: Vec<SocketAddr>,
        table: SessionTable,
        pool: SendPool,
        stats: Arc<Stats>,
        buffer_size: usize,
    ) -> Self {
        Self {
            listener,
            upstreams,
            table,
            pool,
            stats,
            buffer_size,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn upstreams(&self) -> &[SocketAddr] {
        &self.upstreams
    }

    pub fn table(&self) -> &SessionTable {
        &self.table
    }

    /// Run the event loop. Never returns.
    pub async fn run(mut self) {
        let mut client_buf = vec![0u8; self.buffer_size];
        let mut upstream_buf = vec![0u8; self.buffer_size];

        loop {
            tokio::select! {
                received = self.listener.receive(&mut client_buf) => {
                    if let Some((len, client)) = received {
                        self.dispatch(&client_buf[..len], client).await;
                    }
                    self.sweep();
                }
                session = self.table.next_readable() => {
                    self.on_readable(&session, &mut upstream_buf);
                }
            }
        }
    }

    /// Queue `query` towards every upstream through the client's sessions.
    pub async fn dispatch(&mut self, query: &[u8], client: SocketAddr) {
        self.stats.record_query();
        let payload: Arc<[u8]> = Arc::from(query);

        for &upstream in &self.upstreams {
            let session = match self.table.get_or_create(client, upstream).await {
                Ok(session) => session,
                Err(e) => {
                    warn!("[{}->{}] session socket failed: {}", client, upstream, e);
                    continue;
                }
            };

            // Stamp now so the sweep below cannot evict a session whose send
            // is still queued.
            session.touch();
            self.table.arm(&session.key());
            self.pool.submit(session, payload.clone());
            self.stats.record_dispatched();
        }

        debug!(
            "query from {} ({} bytes) fanned out to {} upstreams",
            client,
            query.len(),
            self.upstreams.len()
        );
    }

    /// Evict idle sessions.
    pub fn sweep(&mut self) -> usize {
        self.table.sweep(Instant::now())
    }

    fn on_readable(&mut self, session: &Session, buf: &mut [u8]) {
        match session.handle_readable(buf, &self.listener) {
            // One reply per dispatch: the session stays disarmed until the
            // client queries again.
            Readable::Relayed(len) => {
                self.stats.record_relayed();
                debug!("[{}] relayed {} bytes", session.key(), len);
            }
            Readable::Absorbed => self.table.arm(&session.key()),
        }
    }
}
