//! Call source
//!
//! Polls the queues of a set of URIs with BRPOP on one dedicated
//! connection and hands every call whose timeout key still has a positive
//! TTL to the consumer through a bounded stream. Each popped entry is
//! processed on its own task, so a slow consumer only holds back the tasks
//! waiting to send.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use cluster::{ClusterRouter, Cmd, RoutedConnection};
use parking_lot::Mutex;
use resp::RespValue;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::config::CallsConfig;
use crate::error::{BrokerError, CallsError};
use crate::expiry::ExpiryChecker;
use crate::keys::{queue_key, timeout_key};
use crate::message::{CallEnvelope, CallPayload};
use crate::metrics::CallMetrics;

/// Receiving side of a call source
///
/// Clones share one receiver; each call is received by exactly one clone.
/// Polling stops once the source and every clone have been dropped.
#[derive(Clone)]
pub struct CallStream {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<CallPayload>>>,
    _stop_on_drop: Arc<DropGuard>,
}

impl CallStream {
    /// Next call, or `None` once the source has terminated
    pub async fn recv(&self) -> Option<CallPayload> {
        self.rx.lock().await.recv().await
    }
}

impl std::fmt::Debug for CallStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStream").finish_non_exhaustive()
    }
}

struct SourceInner {
    uris: Vec<String>,
    queue_keys: Vec<String>,
    pop_timeout_secs: u64,
    router: ClusterRouter,
    metrics: Arc<CallMetrics>,
    checker: ExpiryChecker,
    in_flight: Option<Arc<Semaphore>>,
    started: AtomicBool,
    /// Poll connection and sender, taken by whoever starts or closes first
    pending: Mutex<Option<(RoutedConnection, mpsc::Sender<CallPayload>)>>,
    err: Mutex<Option<Arc<CallsError>>>,
    cancel: CancellationToken,
}

/// Consumer of calls addressed to a set of URIs
///
/// Polling continues while the source or any [`CallStream`] obtained from
/// it is alive, until [`close`](Self::close) or a poll failure.
pub struct CallSource {
    inner: Arc<SourceInner>,
    stream: CallStream,
}

impl CallSource {
    /// Bind a poll connection to the shard serving `uris`
    ///
    /// All URIs must hash to the same slot in cluster mode.
    pub async fn new(
        router: ClusterRouter,
        uris: Vec<String>,
        config: &CallsConfig,
        metrics: Arc<CallMetrics>,
    ) -> Result<Self, BrokerError> {
        if uris.is_empty() {
            return Err(BrokerError::NoUris);
        }
        let queue_keys: Vec<String> = uris.iter().map(|u| queue_key(u)).collect();
        let keys: Vec<&[u8]> = queue_keys.iter().map(|k| k.as_bytes()).collect();
        let conn = router.dedicated_for_keys(&keys).await?;
        debug!("Call source for {:?} polling {}", uris, conn.addr());

        let (tx, rx) = mpsc::channel(config.stream_buffer.max(1));
        let in_flight = match config.max_in_flight {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        let cancel = CancellationToken::new();
        let stream = CallStream {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            _stop_on_drop: Arc::new(cancel.clone().drop_guard()),
        };

        Ok(Self {
            inner: Arc::new(SourceInner {
                uris,
                queue_keys,
                pop_timeout_secs: config.pop_timeout_secs.max(1),
                router,
                metrics,
                checker: ExpiryChecker::new(),
                in_flight,
                started: AtomicBool::new(false),
                pending: Mutex::new(Some((conn, tx))),
                err: Mutex::new(None),
                cancel,
            }),
            stream,
        })
    }

    pub fn uris(&self) -> &[String] {
        &self.inner.uris
    }

    /// Pop timeout actually sent to the store
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_secs(self.inner.pop_timeout_secs)
    }

    /// Start polling on first use and return the shared stream
    pub fn calls(&self) -> CallStream {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some((conn, tx)) = self.inner.pending.lock().take() {
                info!("Starting call source for {:?}", self.inner.uris);
                tokio::spawn(poll_loop(self.inner.clone(), conn, tx));
            }
        }
        self.stream.clone()
    }

    /// Terminal error, set once the stream has closed
    pub fn err(&self) -> Option<Arc<CallsError>> {
        self.inner.err.lock().clone()
    }

    /// Stop polling and release the poll connection
    ///
    /// No further entries are popped. Calls already popped are still
    /// checked and delivered; the stream closes after the last of them has
    /// been received, and [`err`](Self::err) then reports
    /// [`CallsError::Closed`].
    pub fn close(&self) {
        self.inner.cancel.cancel();
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some((conn, tx)) = self.inner.pending.lock().take() {
                if let Some(conn) = conn.into_inner() {
                    conn.discard();
                }
                self.inner.set_err(CallsError::Closed);
                drop(tx);
            }
        }
    }
}

impl SourceInner {
    fn set_err(&self, err: CallsError) {
        let mut slot = self.err.lock();
        if slot.is_none() {
            *slot = Some(Arc::new(err));
        }
    }
}

async fn poll_loop(
    inner: Arc<SourceInner>,
    mut conn: RoutedConnection,
    tx: mpsc::Sender<CallPayload>,
) {
    let mut tasks = JoinSet::new();

    let err = loop {
        while tasks.try_join_next().is_some() {}

        let permit = match &inner.in_flight {
            Some(sem) => tokio::select! {
                _ = inner.cancel.cancelled() => break CallsError::Closed,
                permit = sem.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break CallsError::Closed,
                },
            },
            None => None,
        };

        let cmd = Cmd::new("BRPOP")
            .args(&inner.queue_keys)
            .arg(inner.pop_timeout_secs);
        let reply = tokio::select! {
            _ = inner.cancel.cancelled() => break CallsError::Closed,
            reply = conn.execute(cmd) => reply,
        };

        let raw = match reply {
            Ok(reply) if reply.is_null() => continue,
            Ok(RespValue::Array(mut items)) if items.len() == 2 => match items.pop() {
                Some(RespValue::BulkString(Some(raw))) => raw,
                Some(other) => break CallsError::UnexpectedReply(other),
                None => continue,
            },
            Ok(other) => break CallsError::UnexpectedReply(other),
            Err(e) => break CallsError::Poll(e),
        };

        tasks.spawn(deliver(inner.clone(), raw, tx.clone(), permit));
    };

    match &err {
        CallsError::Closed => info!("Call source for {:?} closed", inner.uris),
        e => error!("Call source for {:?} failed: {}", inner.uris, e),
    }
    if let Some(conn) = conn.into_inner() {
        conn.discard();
    }

    while tasks.join_next().await.is_some() {}
    inner.set_err(err);
    drop(tx);
}

async fn deliver(
    inner: Arc<SourceInner>,
    raw: Bytes,
    tx: mpsc::Sender<CallPayload>,
    _permit: Option<OwnedSemaphorePermit>,
) {
    let envelope = match CallEnvelope::from_json(&raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            inner.metrics.inc_failed_unmarshal();
            warn!("Dropping undecodable call: {}", e);
            return;
        }
    };

    let key = timeout_key(&envelope.uri, &envelope.msg_id);
    let ttl = match inner.checker.check_routed(&inner.router, &key).await {
        Ok(ttl) => ttl,
        Err(e) => {
            inner.metrics.inc_failed_ttl_check();
            warn!("TTL check failed for {}: {}", key, e);
            return;
        }
    };
    let read_timestamp = Utc::now();

    let payload = if ttl > 0 {
        CallPayload::checked(envelope, Duration::from_millis(ttl as u64), read_timestamp)
    } else {
        None
    };
    let payload = match payload {
        Some(payload) => payload,
        None => {
            inner.metrics.inc_expired();
            debug!("Call {} expired (pttl {})", key, ttl);
            return;
        }
    };

    match tx.send(payload).await {
        Ok(()) => inner.metrics.inc_delivered(),
        Err(_) => warn!("Every call stream was dropped, losing call {}", key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster::{ConnectionPool, PoolConfig};
    use memstore::MemStore;

    fn config() -> CallsConfig {
        CallsConfig {
            pop_timeout_secs: 0,
            ..Default::default()
        }
    }

    async fn source(store: &MemStore, uris: &[&str]) -> CallSource {
        let router =
            ClusterRouter::standalone(ConnectionPool::new(PoolConfig::default()), store.addr());
        CallSource::new(
            router,
            uris.iter().map(|u| u.to_string()).collect(),
            &config(),
            Arc::new(CallMetrics::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_pop_timeout_clamped() {
        let store = MemStore::start().await.unwrap();
        let source = source(&store, &["a"]).await;
        assert_eq!(source.pop_timeout(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_no_uris() {
        let store = MemStore::start().await.unwrap();
        let router =
            ClusterRouter::standalone(ConnectionPool::new(PoolConfig::default()), store.addr());
        let result =
            CallSource::new(router, Vec::new(), &config(), Arc::new(CallMetrics::new())).await;
        assert!(matches!(result, Err(BrokerError::NoUris)));
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let store = MemStore::start().await.unwrap();
        let source = source(&store, &["a"]).await;
        assert!(source.err().is_none());

        source.close();
        let stream = source.calls();
        assert!(stream.recv().await.is_none());
        assert!(matches!(source.err().as_deref(), Some(CallsError::Closed)));
        assert_eq!(store.blocked_clients(), 0);
    }

    #[tokio::test]
    async fn test_close_while_polling() {
        let store = MemStore::start().await.unwrap();
        let source = source(&store, &["a"]).await;
        let stream = source.calls();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.blocked_clients(), 1);
        assert!(source.err().is_none());

        source.close();
        let next = tokio::time::timeout(Duration::from_secs(2), stream.recv())
            .await
            .unwrap();
        assert!(next.is_none());
        assert!(matches!(source.err().as_deref(), Some(CallsError::Closed)));
    }
}
