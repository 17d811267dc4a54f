//! Topology manager
//!
//! Owns the current [`ClusterTopology`] and refreshes it from a list of
//! startup nodes. Readers take a cheap `Arc` snapshot; a refresh builds a new
//! topology and installs it with one swap, so a partially updated mapping is
//! never visible.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::conn::{ClientError, Cmd};
use crate::pool::ConnectionPool;
use crate::slot::key_slot;
use crate::topology::{ClusterTopology, NodeFailure, NodeFailureReason, TopologyError};

/// Refresh state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TopologyState {
    /// No refresh attempted yet
    Unrefreshed = 0,
    Refreshing = 1,
    /// Last refresh installed a mapping
    Refreshed = 2,
    /// Last refresh exhausted all startup nodes
    Failed = 3,
}

impl TopologyState {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => TopologyState::Refreshing,
            2 => TopologyState::Refreshed,
            3 => TopologyState::Failed,
            _ => TopologyState::Unrefreshed,
        }
    }
}

struct AtomicTopologyState(AtomicU8);

impl AtomicTopologyState {
    fn new(state: TopologyState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> TopologyState {
        TopologyState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: TopologyState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Maintains the slot to node mapping of a cluster
pub struct TopologyManager {
    startup_nodes: Vec<String>,
    pool: Arc<ConnectionPool>,
    mapping: RwLock<Option<Arc<ClusterTopology>>>,
    state: AtomicTopologyState,
    /// Serializes refreshes: one writer at a time
    refresh_lock: tokio::sync::Mutex<()>,
}

impl TopologyManager {
    pub fn new(startup_nodes: Vec<String>, pool: Arc<ConnectionPool>) -> Arc<Self> {
        Arc::new(Self {
            startup_nodes,
            pool,
            mapping: RwLock::new(None),
            state: AtomicTopologyState::new(TopologyState::Unrefreshed),
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn startup_nodes(&self) -> &[String] {
        &self.startup_nodes
    }

    pub fn state(&self) -> TopologyState {
        self.state.load()
    }

    /// Snapshot of the current mapping
    pub fn mapping(&self) -> Option<Arc<ClusterTopology>> {
        self.mapping.read().clone()
    }

    /// Node serving `slot`, if a mapping is installed
    pub fn node_for_slot(&self, slot: u32) -> Option<String> {
        self.mapping
            .read()
            .as_ref()
            .and_then(|m| m.node_for_slot(slot).map(str::to_string))
    }

    pub fn node_for_key(&self, key: &[u8]) -> Option<String> {
        self.node_for_slot(key_slot(key))
    }

    /// Master addresses of the current mapping, or the startup nodes if none
    pub fn nodes(&self) -> Vec<String> {
        match self.mapping() {
            Some(m) => m.nodes(),
            None => self.startup_nodes.clone(),
        }
    }

    /// Query startup nodes in order until one returns a complete mapping
    pub async fn refresh_mapping(&self) -> Result<(), TopologyError> {
        if self.startup_nodes.is_empty() {
            return Err(TopologyError::NoStartupNodes);
        }

        let _guard = self.refresh_lock.lock().await;
        self.state.store(TopologyState::Refreshing);

        let mut failures = Vec::new();
        for addr in &self.startup_nodes {
            match self.fetch_from(addr).await {
                Ok(topology) => {
                    let ranges = topology.assignments().len();
                    let nodes = topology.nodes().len();
                    *self.mapping.write() = Some(Arc::new(topology));
                    self.state.store(TopologyState::Refreshed);
                    info!(
                        "Topology refreshed from {}: {} slot ranges on {} nodes",
                        addr, ranges, nodes
                    );
                    return Ok(());
                }
                Err(reason) => {
                    debug!("Topology query to {} failed: {}", addr, reason);
                    failures.push(NodeFailure {
                        addr: addr.clone(),
                        reason,
                    });
                }
            }
        }

        self.state.store(TopologyState::Failed);
        let err = TopologyError::AllNodesFailed(failures);
        warn!("Topology refresh failed: {}", err);
        Err(err)
    }

    /// Start a refresh in the background unless one is already running
    pub fn schedule_refresh(self: &Arc<Self>) {
        if self.refresh_lock.try_lock().is_err() {
            debug!("Topology refresh already running, not scheduling another");
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.refresh_mapping().await {
                warn!("Background topology refresh failed: {}", e);
            }
        });
    }

    async fn fetch_from(&self, addr: &str) -> Result<ClusterTopology, NodeFailureReason> {
        let mut conn = self.pool.get(addr).await?;
        let reply = conn.execute(Cmd::new("CLUSTER").arg("SLOTS")).await?;
        if reply.is_null() {
            return Err(ClientError::UnexpectedReply("CLUSTER SLOTS".to_string(), reply).into());
        }
        let assignments = ClusterTopology::parse_cluster_slots(reply, addr)?;
        Ok(ClusterTopology::from_assignments(assignments)?)
    }
}
