//! Slot-aware routing for a sharded RESP store
//!
//! - Key to slot hashing (CRC16, hash tags)
//! - Slot to node topology, refreshed from startup nodes
//! - Connection pool and a router that binds connections to the owning node

pub mod conn;
pub mod manager;
pub mod pool;
pub mod redirect;
pub mod router;
pub mod slot;
pub mod topology;

// Re-export commonly used types
pub use conn::{ClientError, Cmd, Connection, ToArg};
pub use manager::{TopologyManager, TopologyState};
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use redirect::Redirect;
pub use router::{ClusterRouter, RouteError, RoutedConnection, MAX_REDIRECTS};
pub use slot::{key_slot, SlotRange, TOTAL_SLOTS};
pub use topology::{ClusterTopology, SlotAssignment, TopologyError};
