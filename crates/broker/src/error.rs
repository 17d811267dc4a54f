use cluster::{RouteError, TopologyError};
use resp::RespValue;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised while setting up a broker or producing calls
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("routing error: {0}")]
    Route(#[from] RouteError),
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("call TTL out of range (1 ms to u64::MAX ms)")]
    InvalidTtl,
    #[error("no call URIs given")]
    NoUris,
    #[error("unexpected reply to {0}: {1:?}")]
    UnexpectedReply(String, RespValue),
}

/// Terminal error of a call stream
#[derive(Debug, Error)]
pub enum CallsError {
    #[error("poll failed: {0}")]
    Poll(#[from] RouteError),
    #[error("unexpected BRPOP reply: {0:?}")]
    UnexpectedReply(RespValue),
    #[error("call source closed")]
    Closed,
}
