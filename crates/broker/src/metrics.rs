//! Call pipeline counters
//!
//! Plain atomics, independent of any lock held by routing code.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct CallMetrics {
    failed_unmarshal: AtomicU64,
    failed_ttl_check: AtomicU64,
    expired: AtomicU64,
    delivered: AtomicU64,
}

/// Point-in-time copy of [`CallMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallMetricsSnapshot {
    pub failed_unmarshal: u64,
    pub failed_ttl_check: u64,
    pub expired: u64,
    pub delivered: u64,
}

impl CallMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CallMetricsSnapshot {
        CallMetricsSnapshot {
            failed_unmarshal: self.failed_unmarshal.load(Ordering::Relaxed),
            failed_ttl_check: self.failed_ttl_check.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn inc_failed_unmarshal(&self) {
        self.failed_unmarshal.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_failed_ttl_check(&self) {
        self.failed_ttl_check.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = CallMetrics::new();
        metrics.inc_delivered();
        metrics.inc_delivered();
        metrics.inc_expired();
        assert_eq!(
            metrics.snapshot(),
            CallMetricsSnapshot {
                delivered: 2,
                expired: 1,
                ..Default::default()
            }
        );
    }
}
