//! Call delivery over a sharded RESP store
//!
//! Producers enqueue call envelopes on per-URI lists together with a timeout
//! key carrying the call's TTL. A [`CallSource`] pops entries with BRPOP,
//! atomically consumes the timeout key and delivers only calls that are
//! still valid.

pub mod broker;
pub mod calls;
pub mod config;
pub mod error;
pub mod expiry;
pub mod keys;
pub mod message;
pub mod metrics;

pub use broker::Broker;
pub use calls::{CallSource, CallStream};
pub use config::{CallsConfig, Config, ConfigError, LogConfig, StoreConfig, StoreMode};
pub use error::{BrokerError, CallsError};
pub use expiry::{ExpiryChecker, PTTL_DEL_SCRIPT};
pub use keys::{queue_key, timeout_key};
pub use message::{CallEnvelope, CallPayload};
pub use metrics::{CallMetrics, CallMetricsSnapshot};
