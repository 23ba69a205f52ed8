//! Admission metrics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lock-free counters describing gate behaviour. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct GateMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    allowed: AtomicU64,
    denied: AtomicU64,
    unlimited: AtomicU64,
    failed_open: AtomicU64,
    failed_closed: AtomicU64,
    store_errors: AtomicU64,
    counters_reaped: AtomicU64,
}

impl GateMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allowed(&self) {
        self.inner.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_denied(&self) {
        self.inner.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unlimited(&self) {
        self.inner.unlimited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_open(&self) {
        self.inner.failed_open.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_closed(&self) {
        self.inner.failed_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_error(&self) {
        self.inner.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reaped(&self, count: usize) {
        self.inner
            .counters_reaped
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn allowed(&self) -> u64 {
        self.inner.allowed.load(Ordering::Relaxed)
    }

    pub fn denied(&self) -> u64 {
        self.inner.denied.load(Ordering::Relaxed)
    }

    pub fn unlimited(&self) -> u64 {
        self.inner.unlimited.load(Ordering::Relaxed)
    }

    pub fn failed_open(&self) -> u64 {
        self.inner.failed_open.load(Ordering::Relaxed)
    }

    pub fn failed_closed(&self) -> u64 {
        self.inner.failed_closed.load(Ordering::Relaxed)
    }

    pub fn store_errors(&self) -> u64 {
        self.inner.store_errors.load(Ordering::Relaxed)
    }

    pub fn counters_reaped(&self) -> u64 {
        self.inner.counters_reaped.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allowed: self.allowed(),
            denied: self.denied(),
            unlimited: self.unlimited(),
            failed_open: self.failed_open(),
            failed_closed: self.failed_closed(),
            store_errors: self.store_errors(),
            counters_reaped: self.counters_reaped(),
        }
    }
}

/// Serializable snapshot of [`GateMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub unlimited: u64,
    pub failed_open: u64,
    pub failed_closed: u64,
    pub store_errors: u64,
    pub counters_reaped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = GateMetrics::new();
        let clone = metrics.clone();

        clone.record_allowed();
        clone.record_denied();
        clone.record_denied();
        clone.record_reaped(7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.allowed, 1);
        assert_eq!(snapshot.denied, 2);
        assert_eq!(snapshot.counters_reaped, 7);
        assert_eq!(snapshot.failed_open, 0);
    }
}
