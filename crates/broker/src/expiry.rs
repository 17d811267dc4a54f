//! Server-side expiry check
//!
//! Reading the remaining TTL and deleting the timeout key happen in one
//! script, so at most one consumer ever observes a positive TTL for a call.

use cluster::{ClientError, ClusterRouter, Cmd, RouteError, RoutedConnection};
use resp::RespValue;
use tracing::debug;

/// Returns the PTTL of `KEYS[1]` and deletes it
pub const PTTL_DEL_SCRIPT: &str =
    "local ttl = redis.call('PTTL', KEYS[1]) redis.call('DEL', KEYS[1]) return ttl";

/// Atomic read-and-delete of a call's timeout key
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpiryChecker;

impl ExpiryChecker {
    pub fn new() -> Self {
        Self
    }

    /// Remaining TTL in milliseconds, consuming the key
    ///
    /// A missing key reads as `-2` and a key without expiry as `-1`; both
    /// mean the call is no longer valid. `conn` must be routed to the
    /// key's shard.
    pub async fn check(
        &self,
        timeout_key: &str,
        conn: &mut RoutedConnection,
    ) -> Result<i64, RouteError> {
        let reply = conn
            .execute(
                Cmd::new("EVAL")
                    .arg(PTTL_DEL_SCRIPT)
                    .arg(1u64)
                    .arg(timeout_key),
            )
            .await?;
        match reply {
            RespValue::Integer(ttl) => Ok(ttl),
            other => Err(ClientError::UnexpectedReply("EVAL".to_string(), other).into()),
        }
    }

    /// [`check`](Self::check) on a connection routed to the key's shard
    ///
    /// A connection found dead (for example an idle one left over from
    /// before a node restart) is retried once on a fresh connection.
    pub async fn check_routed(
        &self,
        router: &ClusterRouter,
        timeout_key: &str,
    ) -> Result<i64, RouteError> {
        let mut conn = router.connect_for_keys(&[timeout_key.as_bytes()]).await?;
        match self.check(timeout_key, &mut conn).await {
            Err(RouteError::Client(e @ (ClientError::Closed | ClientError::Io(_)))) => {
                debug!("Retrying TTL check of {} after: {}", timeout_key, e);
                drop(conn);
                let mut conn = router.connect_for_keys(&[timeout_key.as_bytes()]).await?;
                self.check(timeout_key, &mut conn).await
            }
            other => other,
        }
    }
}
