//! Connection pool
//!
//! Keeps idle connections per node address. Borrowed connections come back
//! when their [`PooledConnection`] guard is dropped, so every exit path of
//! the borrower releases them. Connections that failed or were interrupted
//! mid-command are closed instead of being returned.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::conn::{ClientError, Connection};

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle connections kept per node
    #[serde(default = "default_max_idle_per_node")]
    pub max_idle_per_node: usize,
    /// Upper bound on borrowed connections across all nodes (0 = unbounded)
    #[serde(default)]
    pub max_active: usize,
    /// Dial timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_node: default_max_idle_per_node(),
            max_active: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_max_idle_per_node() -> usize {
    8
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

/// Pool of connections keyed by node address
pub struct ConnectionPool {
    config: PoolConfig,
    idle: Mutex<HashMap<String, Vec<Connection>>>,
    active_limit: Option<Arc<Semaphore>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let active_limit = (config.max_active > 0).then(|| Arc::new(Semaphore::new(config.max_active)));
        Arc::new(Self {
            config,
            idle: Mutex::new(HashMap::new()),
            active_limit,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Borrow a connection to `addr`, dialing if none is idle
    ///
    /// Waits for a free slot when `max_active` is reached.
    pub async fn get(self: &Arc<Self>, addr: &str) -> Result<PooledConnection, ClientError> {
        self.acquire(addr, false).await
    }

    /// Borrow a long-lived connection that does not count against
    /// `max_active`
    ///
    /// For connections held for the lifetime of a consumer, such as a
    /// blocking poll, which would otherwise starve short borrows.
    pub async fn dedicated(self: &Arc<Self>, addr: &str) -> Result<PooledConnection, ClientError> {
        self.acquire(addr, true).await
    }

    pub(crate) async fn acquire(
        self: &Arc<Self>,
        addr: &str,
        dedicated: bool,
    ) -> Result<PooledConnection, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::PoolClosed);
        }

        let permit = match &self.active_limit {
            Some(limit) if !dedicated => Some(
                limit
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| ClientError::PoolClosed)?,
            ),
            _ => None,
        };

        let idle = self.idle.lock().get_mut(addr).and_then(Vec::pop);
        let conn = match idle {
            Some(conn) => conn,
            None => Connection::connect(addr, self.config.connect_timeout()).await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
            dedicated,
            _permit: permit,
        })
    }

    /// Number of idle connections held for `addr`
    pub fn idle_count(&self, addr: &str) -> usize {
        self.idle.lock().get(addr).map(Vec::len).unwrap_or(0)
    }

    /// Drop all idle connections and refuse new borrows
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.idle.lock().clear();
        if let Some(limit) = &self.active_limit {
            limit.close();
        }
    }

    fn put(&self, conn: Connection) {
        if conn.is_broken() {
            // the node most likely went away; its idle peers are stale too
            let stale = self.idle.lock().remove(conn.addr()).map_or(0, |l| l.len());
            debug!(
                "Discarding broken connection to {} and {} idle peers",
                conn.addr(),
                stale
            );
            return;
        }
        if self.closed.load(Ordering::Acquire) || !conn.is_reusable() {
            debug!("Discarding connection to {}", conn.addr());
            return;
        }
        let mut idle = self.idle.lock();
        let list = idle.entry(conn.addr().to_string()).or_default();
        if list.len() < self.config.max_idle_per_node {
            list.push(conn);
        }
    }
}

/// A borrowed connection, returned to its pool on drop
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
    dedicated: bool,
    _permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    /// Give the connection back to the pool
    pub fn release(self) {}

    /// Close the connection instead of returning it
    pub fn discard(mut self) {
        self.conn.take();
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Borrowed outside the `max_active` budget
    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}
