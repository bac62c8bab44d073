//! Counters for the store layer

use std::sync::atomic::{AtomicU64, Ordering};

/// Store metrics collector, shared by the pub and sub sides
#[derive(Debug, Default)]
pub struct StoreMetrics {
    // pub side
    pub publishes: AtomicU64,
    pub publish_errors: AtomicU64,
    pub async_delivery_errors: AtomicU64,
    pub pool_rebuilds: AtomicU64,
    pub refreshes_refused: AtomicU64,

    // sub side
    pub subscribes: AtomicU64,
    pub admission_refusals: AtomicU64,
    pub join_failures: AtomicU64,
    pub evictions: AtomicU64,
    pub close_errors: AtomicU64,
}

impl StoreMetrics {
    pub fn record_publish(&self) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_async_delivery_error(&self) {
        self.async_delivery_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_rebuild(&self) {
        self.pool_rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_refused(&self) {
        self.refreshes_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscribe(&self) {
        self.subscribes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admission_refusal(&self) {
        self.admission_refusals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_join_failure(&self) {
        self.join_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_close_error(&self) {
        self.close_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            publishes: self.publishes.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            async_delivery_errors: self.async_delivery_errors.load(Ordering::Relaxed),
            pool_rebuilds: self.pool_rebuilds.load(Ordering::Relaxed),
            refreshes_refused: self.refreshes_refused.load(Ordering::Relaxed),
            subscribes: self.subscribes.load(Ordering::Relaxed),
            admission_refusals: self.admission_refusals.load(Ordering::Relaxed),
            join_failures: self.join_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            close_errors: self.close_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub publishes: u64,
    pub publish_errors: u64,
    pub async_delivery_errors: u64,
    pub pool_rebuilds: u64,
    pub refreshes_refused: u64,
    pub subscribes: u64,
    pub admission_refusals: u64,
    pub join_failures: u64,
    pub evictions: u64,
    pub close_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = StoreMetrics::default();
        metrics.record_publish();
        metrics.record_publish();
        metrics.record_admission_refusal();
        metrics.record_pool_rebuild();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.publishes, 2);
        assert_eq!(snapshot.admission_refusals, 1);
        assert_eq!(snapshot.pool_rebuilds, 1);
        assert_eq!(snapshot.evictions, 0);
    }
}
