//! Cluster topology: slot range to node assignments
//!
//! A [`ClusterTopology`] is immutable once built. It is validated to cover
//! every slot exactly once, and is swapped wholesale by the
//! [`TopologyManager`](crate::TopologyManager) on refresh.

use std::collections::BTreeSet;

use resp::RespValue;
use thiserror::Error;

use crate::conn::ClientError;
use crate::slot::{key_slot, SlotRange, TOTAL_SLOTS};

/// Topology errors
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("invalid slot mapping: {0}")]
    InvalidMapping(String),
    #[error("unexpected CLUSTER SLOTS reply: {0}")]
    BadReply(String),
    #[error("{}", format_all_failed(.0))]
    AllNodesFailed(Vec<NodeFailure>),
    #[error("no startup nodes configured")]
    NoStartupNodes,
}

/// Why a single startup node could not provide a mapping
#[derive(Debug)]
pub struct NodeFailure {
    pub addr: String,
    pub reason: NodeFailureReason,
}

#[derive(Debug, Error)]
pub enum NodeFailureReason {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

fn format_all_failed(failures: &[NodeFailure]) -> String {
    let details: Vec<String> = failures
        .iter()
        .map(|f| format!("{}: {}", f.addr, f.reason))
        .collect();
    format!("all nodes failed ({})", details.join("; "))
}

/// One slot range served by a master node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAssignment {
    pub range: SlotRange,
    /// Master address (host:port)
    pub node: String,
    /// Replica addresses, informational
    pub replicas: Vec<String>,
}

impl SlotAssignment {
    pub fn new(start: u32, end: u32, node: impl Into<String>) -> Self {
        Self {
            range: SlotRange::new(start, end),
            node: node.into(),
            replicas: Vec::new(),
        }
    }
}

/// Slot to node mapping covering the whole slot space
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    /// Sorted by `range.start`, contiguous, non-overlapping
    assignments: Vec<SlotAssignment>,
}

impl ClusterTopology {
    /// Build a topology, rejecting gaps and overlaps
    pub fn from_assignments(mut assignments: Vec<SlotAssignment>) -> Result<Self, TopologyError> {
        assignments.sort_by_key(|a| a.range.start);

        let mut next = 0u32;
        for a in &assignments {
            if a.range.start >= a.range.end || a.range.end > TOTAL_SLOTS {
                return Err(TopologyError::InvalidMapping(format!(
                    "bad range {}..{} for {}",
                    a.range.start, a.range.end, a.node
                )));
            }
            if a.range.start < next {
                return Err(TopologyError::InvalidMapping(format!(
                    "slot {} assigned more than once",
                    a.range.start
                )));
            }
            if a.range.start > next {
                return Err(TopologyError::InvalidMapping(format!(
                    "slots {}..{} unassigned",
                    next, a.range.start
                )));
            }
            next = a.range.end;
        }
        if next != TOTAL_SLOTS {
            return Err(TopologyError::InvalidMapping(format!(
                "slots {}..{} unassigned",
                next, TOTAL_SLOTS
            )));
        }

        Ok(Self { assignments })
    }

    /// Parse a `CLUSTER SLOTS` reply received from `queried_addr`
    ///
    /// Each entry is `[start, end, [host, port, id?], replica...]` with an
    /// inclusive end. An empty host means the host of the queried node.
    pub fn parse_cluster_slots(
        reply: RespValue,
        queried_addr: &str,
    ) -> Result<Vec<SlotAssignment>, TopologyError> {
        let entries = reply
            .into_array()
            .ok_or_else(|| TopologyError::BadReply("expected array".to_string()))?;

        let queried_host = queried_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or("");

        let mut assignments = Vec::with_capacity(entries.len());
        for entry in entries {
            let items = entry
                .into_array()
                .ok_or_else(|| TopologyError::BadReply("expected slot entry array".to_string()))?;
            if items.len() < 3 {
                return Err(TopologyError::BadReply(format!(
                    "slot entry has {} elements",
                    items.len()
                )));
            }

            let start = slot_bound(&items[0])?;
            let end = slot_bound(&items[1])?;
            let mut nodes = items[2..]
                .iter()
                .map(|n| node_addr(n, queried_host));
            let node = nodes
                .next()
                .ok_or_else(|| TopologyError::BadReply("missing master".to_string()))??;
            let replicas = nodes.collect::<Result<Vec<_>, _>>()?;

            assignments.push(SlotAssignment {
                range: SlotRange::new(start, end + 1),
                node,
                replicas,
            });
        }
        Ok(assignments)
    }

    /// Find the node serving a slot
    pub fn node_for_slot(&self, slot: u32) -> Option<&str> {
        let idx = self
            .assignments
            .partition_point(|a| a.range.start <= slot);
        if idx == 0 {
            return None;
        }
        let candidate = &self.assignments[idx - 1];
        candidate
            .range
            .contains(slot)
            .then_some(candidate.node.as_str())
    }

    pub fn node_for_key(&self, key: &[u8]) -> Option<&str> {
        self.node_for_slot(key_slot(key))
    }

    pub fn assignments(&self) -> &[SlotAssignment] {
        &self.assignments
    }

    /// Distinct master addresses, sorted
    pub fn nodes(&self) -> Vec<String> {
        self.assignments
            .iter()
            .map(|a| a.node.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

fn slot_bound(value: &RespValue) -> Result<u32, TopologyError> {
    value
        .as_integer()
        .and_then(|i| u32::try_from(i).ok())
        .filter(|&s| s < TOTAL_SLOTS)
        .ok_or_else(|| TopologyError::BadReply(format!("bad slot bound {:?}", value)))
}

fn node_addr(value: &RespValue, queried_host: &str) -> Result<String, TopologyError> {
    let parts = match value {
        RespValue::Array(parts) if parts.len() >= 2 => parts,
        other => {
            return Err(TopologyError::BadReply(format!(
                "bad node entry {:?}",
                other
            )))
        }
    };
    let host = parts[0]
        .as_bytes()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .ok_or_else(|| TopologyError::BadReply("bad node host".to_string()))?;
    let port = parts[1]
        .as_integer()
        .ok_or_else(|| TopologyError::BadReply("bad node port".to_string()))?;

    let host = if host.is_empty() {
        queried_host.to_string()
    } else {
        host
    };
    Ok(format!("{}:{}", host, port))
}
