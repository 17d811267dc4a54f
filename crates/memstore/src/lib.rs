//! In-memory RESP server for tests
//!
//! Serves the subset of commands the call broker relies on: list push and
//! blocking pop, strings with millisecond expiry, the PTTL-and-DEL script,
//! and `CLUSTER SLOTS` with `MOVED`/`ASK` redirects when given a slot table.
//! Each [`MemStore`] listens on an ephemeral localhost port.

mod db;
mod server;
mod slots;

pub use db::{PTTL_NO_EXPIRY, PTTL_NO_KEY};
pub use slots::{key_slot, SlotOwner, SlotTable, TOTAL_SLOTS};

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tracing::info;

use crate::server::Shared;

/// A running in-memory server
pub struct MemStore {
    shared: Arc<Shared>,
}

impl MemStore {
    /// Bind an ephemeral port on 127.0.0.1 and start serving
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        let shared = Arc::new(Shared::new(addr.clone()));
        tokio::spawn(server::serve(listener, shared.clone()));
        info!("memstore listening on {}", addr);
        Ok(Self { shared })
    }

    /// Address as host:port
    pub fn addr(&self) -> String {
        self.shared.addr.clone()
    }

    /// Enable cluster mode with the given view, or disable it with `None`
    pub fn set_slots(&self, table: Option<SlotTable>) {
        *self.shared.slots.write() = table;
    }

    /// Number of clients currently blocked in BRPOP
    pub fn blocked_clients(&self) -> usize {
        self.shared.blocked.load(Ordering::SeqCst)
    }

    /// Stop accepting and drop every client connection
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Drop every current client connection but keep accepting new ones
    pub fn disconnect_clients(&self) {
        let mut clients = self.shared.clients.lock();
        clients.cancel();
        *clients = self.shared.shutdown.child_token();
    }

    pub fn lpush(&self, key: &str, value: impl Into<Bytes>) {
        let pushed = self
            .shared
            .db
            .lock()
            .lpush(Bytes::copy_from_slice(key.as_bytes()), vec![value.into()]);
        if pushed.is_ok() {
            self.shared.pushed.notify_waiters();
        }
    }

    pub fn set_px(&self, key: &str, value: &str, ttl: Duration) {
        self.shared.db.lock().set(
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
            Some(ttl),
        );
    }

    pub fn exists(&self, key: &str) -> bool {
        self.shared.db.lock().exists(key.as_bytes())
    }

    pub fn pttl(&self, key: &str) -> i64 {
        self.shared.db.lock().pttl(key.as_bytes())
    }

    pub fn llen(&self, key: &str) -> usize {
        self.shared.db.lock().llen(key.as_bytes())
    }
}

impl Drop for MemStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start `n` servers sharing an evenly split slot table
pub async fn start_cluster(n: usize) -> io::Result<Vec<MemStore>> {
    let mut nodes = Vec::with_capacity(n);
    for _ in 0..n {
        nodes.push(MemStore::start().await?);
    }
    let addrs: Vec<String> = nodes.iter().map(MemStore::addr).collect();
    let table = SlotTable::even(&addrs);
    for node in &nodes {
        node.set_slots(Some(table.clone()));
    }
    Ok(nodes)
}
