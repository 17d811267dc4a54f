//! Broker handle: builds the router from configuration, creates call
//! sources and pushes new calls.

use std::sync::Arc;
use std::time::Duration;

use cluster::{ClusterRouter, Cmd, ConnectionPool, TopologyManager};
use resp::RespValue;
use tracing::{debug, info, warn};

use crate::calls::CallSource;
use crate::config::{CallsConfig, Config, StoreMode};
use crate::error::BrokerError;
use crate::keys::{queue_key, timeout_key};
use crate::message::CallEnvelope;
use crate::metrics::{CallMetrics, CallMetricsSnapshot};

#[derive(Clone)]
pub struct Broker {
    router: ClusterRouter,
    calls_config: CallsConfig,
    metrics: Arc<CallMetrics>,
}

impl Broker {
    /// Connect to the store described by `config`
    ///
    /// In cluster mode the slot mapping is loaded before returning.
    pub async fn connect(config: &Config) -> Result<Self, BrokerError> {
        config.validate()?;
        let pool = ConnectionPool::new(config.store.pool.clone());

        let router = match config.store.mode {
            StoreMode::Standalone => {
                let addr = config.store.addrs[0].clone();
                info!("Using standalone store at {}", addr);
                ClusterRouter::standalone(pool, addr)
            }
            StoreMode::Cluster => {
                let topology = TopologyManager::new(config.store.addrs.clone(), pool.clone());
                topology.refresh_mapping().await?;
                info!(
                    "Using store cluster with {} nodes",
                    topology.nodes().len()
                );
                ClusterRouter::cluster(pool, topology, config.store.refresh_on_moved)
            }
        };

        Ok(Self::new(router, config.calls.clone()))
    }

    pub fn new(router: ClusterRouter, calls_config: CallsConfig) -> Self {
        Self {
            router,
            calls_config,
            metrics: Arc::new(CallMetrics::new()),
        }
    }

    pub fn router(&self) -> &ClusterRouter {
        &self.router
    }

    pub fn metrics(&self) -> CallMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Source polling `uris`
    pub async fn calls_source(&self, uris: &[&str]) -> Result<CallSource, BrokerError> {
        CallSource::new(
            self.router.clone(),
            uris.iter().map(|u| u.to_string()).collect(),
            &self.calls_config,
            self.metrics.clone(),
        )
        .await
    }

    /// Source polling the URIs listed in the configuration
    pub async fn configured_source(&self) -> Result<CallSource, BrokerError> {
        CallSource::new(
            self.router.clone(),
            self.calls_config.uris.clone(),
            &self.calls_config,
            self.metrics.clone(),
        )
        .await
    }

    /// Enqueue a call valid for `ttl`
    ///
    /// The timeout key is written before the entry becomes poppable.
    pub async fn call(&self, envelope: &CallEnvelope, ttl: Duration) -> Result<(), BrokerError> {
        let ttl_ms = match u64::try_from(ttl.as_millis()) {
            Ok(ms) if ms > 0 => ms,
            _ => return Err(BrokerError::InvalidTtl),
        };
        let payload = envelope.to_json()?;
        let queue = queue_key(&envelope.uri);
        let timeout = timeout_key(&envelope.uri, &envelope.msg_id);

        let mut conn = self
            .router
            .connect_for_keys(&[queue.as_bytes(), timeout.as_bytes()])
            .await?;

        match conn
            .execute(
                Cmd::new("SET")
                    .arg(&timeout)
                    .arg(ttl_ms)
                    .arg("PX")
                    .arg(ttl_ms),
            )
            .await?
        {
            RespValue::SimpleString(_) => {}
            other => return Err(BrokerError::UnexpectedReply("SET".to_string(), other)),
        }

        match conn
            .execute(Cmd::new("LPUSH").arg(&queue).arg(payload))
            .await
        {
            Ok(RespValue::Integer(_)) => {}
            Ok(other) => return Err(BrokerError::UnexpectedReply("LPUSH".to_string(), other)),
            Err(e) => {
                warn!("Push of {} failed after timeout key was set: {}", timeout, e);
                return Err(e.into());
            }
        }

        debug!("Queued call {} on {} ({} ms)", envelope.msg_id, queue, ttl_ms);
        Ok(())
    }
}
