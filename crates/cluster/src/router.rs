//! Cluster router
//!
//! Binds connections to the node that owns the keys of an operation. In
//! standalone mode routing is the identity. In cluster mode every key of one
//! operation must hash to the same slot, since the store cannot run a single
//! command across shards.

use std::sync::Arc;

use resp::RespValue;
use thiserror::Error;
use tracing::{debug, warn};

use crate::conn::{ClientError, Cmd};
use crate::manager::TopologyManager;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::redirect::Redirect;
use crate::slot::key_slot;

/// Maximum redirects followed for one command
pub const MAX_REDIRECTS: usize = 5;

/// Routing errors
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("keys hash to different slots ({first} and {other})")]
    CrossSlot { first: u32, other: u32 },
    #[error("too many redirects for {0}")]
    TooManyRedirects(String),
    #[error("no node address available")]
    NoNodes,
    #[error(transparent)]
    Client(#[from] ClientError),
}

enum RouterMode {
    Standalone {
        addr: String,
    },
    Cluster {
        topology: Arc<TopologyManager>,
        refresh_on_moved: bool,
    },
}

/// Routes connections to the node serving a set of keys
#[derive(Clone)]
pub struct ClusterRouter {
    pool: Arc<ConnectionPool>,
    mode: Arc<RouterMode>,
}

impl ClusterRouter {
    /// Router for a single, non-clustered node
    pub fn standalone(pool: Arc<ConnectionPool>, addr: impl Into<String>) -> Self {
        Self {
            pool,
            mode: Arc::new(RouterMode::Standalone { addr: addr.into() }),
        }
    }

    /// Router for a cluster described by `topology`
    ///
    /// With `refresh_on_moved`, a `MOVED` reply also schedules a background
    /// topology refresh.
    pub fn cluster(
        pool: Arc<ConnectionPool>,
        topology: Arc<TopologyManager>,
        refresh_on_moved: bool,
    ) -> Self {
        Self {
            pool,
            mode: Arc::new(RouterMode::Cluster {
                topology,
                refresh_on_moved,
            }),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn topology(&self) -> Option<&Arc<TopologyManager>> {
        match self.mode.as_ref() {
            RouterMode::Cluster { topology, .. } => Some(topology),
            RouterMode::Standalone { .. } => None,
        }
    }

    pub fn is_cluster(&self) -> bool {
        self.topology().is_some()
    }

    /// Borrow a connection to an arbitrary node, to be routed later
    pub async fn connection(&self) -> Result<PooledConnection, RouteError> {
        self.connection_to_any(false).await
    }

    /// Like [`connection`](Self::connection), outside the pool's
    /// `max_active` budget
    pub async fn dedicated_connection(&self) -> Result<PooledConnection, RouteError> {
        self.connection_to_any(true).await
    }

    async fn connection_to_any(&self, dedicated: bool) -> Result<PooledConnection, RouteError> {
        let addr = match self.mode.as_ref() {
            RouterMode::Standalone { addr } => addr.clone(),
            RouterMode::Cluster { topology, .. } => topology
                .nodes()
                .into_iter()
                .next()
                .ok_or(RouteError::NoNodes)?,
        };
        Ok(self.pool.acquire(&addr, dedicated).await?)
    }

    /// Bind `conn` to the node serving all of `keys`
    ///
    /// In cluster mode the connection is swapped for one to the owning node
    /// unless it already points there. Before the first topology refresh the
    /// connection is kept as is and `MOVED` replies correct the target. A
    /// dedicated connection stays dedicated across rebinds.
    pub async fn route(
        &self,
        conn: PooledConnection,
        keys: &[&[u8]],
    ) -> Result<RoutedConnection, RouteError> {
        let dedicated = conn.is_dedicated();
        let conn = match self.mode.as_ref() {
            RouterMode::Standalone { .. } => conn,
            RouterMode::Cluster { topology, .. } => {
                match common_slot(keys)? {
                    Some(slot) => match topology.node_for_slot(slot) {
                        Some(addr) if addr != conn.addr() => {
                            debug!("Rebinding connection for slot {} to {}", slot, addr);
                            conn.release();
                            self.pool.acquire(&addr, dedicated).await?
                        }
                        Some(_) => conn,
                        None => {
                            debug!("No mapping for slot {}, keeping {}", slot, conn.addr());
                            conn
                        }
                    },
                    None => conn,
                }
            }
        };

        Ok(RoutedConnection {
            addr: conn.addr().to_string(),
            conn: Some(conn),
            dedicated,
            router: self.clone(),
        })
    }

    /// Borrow a connection and route it for `keys`
    pub async fn connect_for_keys(&self, keys: &[&[u8]]) -> Result<RoutedConnection, RouteError> {
        let conn = self.connection().await?;
        self.route(conn, keys).await
    }

    /// Borrow a dedicated connection and route it for `keys`
    pub async fn dedicated_for_keys(
        &self,
        keys: &[&[u8]],
    ) -> Result<RoutedConnection, RouteError> {
        common_slot(keys)?;
        let conn = self.dedicated_connection().await?;
        self.route(conn, keys).await
    }

    fn on_moved(&self) {
        if let RouterMode::Cluster {
            topology,
            refresh_on_moved: true,
        } = self.mode.as_ref()
        {
            topology.schedule_refresh();
        }
    }
}

/// Slot shared by all keys, `None` for a keyless command
fn common_slot(keys: &[&[u8]]) -> Result<Option<u32>, RouteError> {
    let mut slots = keys.iter().map(|k| key_slot(k));
    let first = match slots.next() {
        Some(first) => first,
        None => return Ok(None),
    };
    match slots.find(|&s| s != first) {
        Some(other) => Err(RouteError::CrossSlot { first, other }),
        None => Ok(Some(first)),
    }
}

/// A connection bound to the node owning an operation's keys
///
/// Follows `MOVED` (rebinding to the new owner) and `ASK` (one-shot, after
/// `ASKING`) redirects transparently. At most one pooled connection is held
/// at any time: the current one is given back before a redirect target is
/// borrowed, and borrowed again lazily.
pub struct RoutedConnection {
    addr: String,
    conn: Option<PooledConnection>,
    dedicated: bool,
    router: ClusterRouter,
}

impl RoutedConnection {
    /// Node the connection is bound to
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Execute one command, following redirects
    pub async fn execute(&mut self, cmd: Cmd) -> Result<RespValue, RouteError> {
        let mut ask_target: Option<String> = None;

        for _ in 0..=MAX_REDIRECTS {
            let result = match ask_target.take() {
                None => {
                    let conn = self.bound().await?;
                    conn.execute(cmd.clone()).await
                }
                Some(addr) => {
                    self.conn = None;
                    let mut conn = self.router.pool.acquire(&addr, self.dedicated).await?;
                    conn.execute(Cmd::new("ASKING")).await?;
                    conn.execute(cmd.clone()).await
                }
            };

            let msg = match result {
                Err(ClientError::Server(msg)) => msg,
                other => return other.map_err(RouteError::from),
            };
            match Redirect::parse(&msg) {
                Some(Redirect::Moved { slot, addr }) => {
                    warn!("{}: slot {} moved to {}", cmd.name(), slot, addr);
                    self.conn = None;
                    self.addr = addr;
                    self.router.on_moved();
                }
                Some(Redirect::Ask { slot, addr }) => {
                    debug!("{}: slot {} asked to {}", cmd.name(), slot, addr);
                    ask_target = Some(addr);
                }
                None => return Err(ClientError::Server(msg).into()),
            }
        }

        Err(RouteError::TooManyRedirects(cmd.name()))
    }

    async fn bound(&mut self) -> Result<&mut PooledConnection, RouteError> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.router.pool.acquire(&self.addr, self.dedicated).await?,
        };
        Ok(self.conn.insert(conn))
    }

    /// Unwrap the underlying pooled connection, if one is currently held
    pub fn into_inner(self) -> Option<PooledConnection> {
        self.conn
    }
}
