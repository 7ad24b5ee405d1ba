//! Process-wide metrics registry (spec §5: "metrics counters (thread-safe)... a
//! process-wide registry protected by a lock").
//!
//! A plain atomic-counter registry rather than a full metrics crate: AsyncGate's
//! Non-goals exclude an external metrics/observability pipeline, so this stays an
//! in-process snapshot exposed via `GET /v1/system/metrics`, following the
//! `RwLock`-guarded shared-state pattern the teacher uses for its span collector
//! (`server/app.rs`'s `SpanCollector`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use serde::Serialize;

/// Snapshot of every counter, serializable directly as the `GET
/// /v1/system/metrics` response body.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_created: u64,
    pub tasks_claimed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_canceled: u64,
    pub leases_expired: u64,
    pub sweep_ticks: u64,
    pub last_sweep_tick_millis: u64,
}

#[derive(Default)]
struct Counters {
    tasks_created: AtomicU64,
    tasks_claimed: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_canceled: AtomicU64,
    leases_expired: AtomicU64,
    sweep_ticks: AtomicU64,
    last_sweep_tick_millis: AtomicU64,
}

/// Shared, clonable handle onto the process's counters.
///
/// Individual fields are plain atomics (no contention on the hot path); the
/// `RwLock` only guards the rare case of swapping the whole registry out (e.g. in
/// tests that want a fresh one).
#[derive(Clone, Default)]
pub struct Metrics {
    inner: std::sync::Arc<RwLock<Counters>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_task_created(&self) {
        self.inner.read().unwrap().tasks_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_claimed(&self) {
        self.inner.read().unwrap().tasks_claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_completed(&self) {
        self.inner.read().unwrap().tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_failed(&self) {
        self.inner.read().unwrap().tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_canceled(&self) {
        self.inner.read().unwrap().tasks_canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leases_expired(&self, count: u64) {
        self.inner.read().unwrap().leases_expired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_sweep_tick(&self, duration: Duration) {
        let counters = self.inner.read().unwrap();
        counters.sweep_ticks.fetch_add(1, Ordering::Relaxed);
        counters
            .last_sweep_tick_millis
            .store(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.inner.read().unwrap();
        MetricsSnapshot {
            tasks_created: counters.tasks_created.load(Ordering::Relaxed),
            tasks_claimed: counters.tasks_claimed.load(Ordering::Relaxed),
            tasks_completed: counters.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: counters.tasks_failed.load(Ordering::Relaxed),
            tasks_canceled: counters.tasks_canceled.load(Ordering::Relaxed),
            leases_expired: counters.leases_expired.load(Ordering::Relaxed),
            sweep_ticks: counters.sweep_ticks.load(Ordering::Relaxed),
            last_sweep_tick_millis: counters.last_sweep_tick_millis.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = Metrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.tasks_created, 0);
        assert_eq!(snap.sweep_ticks, 0);
    }

    #[test]
    fn record_task_created_increments() {
        let metrics = Metrics::new();
        metrics.record_task_created();
        metrics.record_task_created();
        assert_eq!(metrics.snapshot().tasks_created, 2);
    }

    #[test]
    fn record_sweep_tick_updates_count_and_duration() {
        let metrics = Metrics::new();
        metrics.record_sweep_tick(Duration::from_millis(42));
        let snap = metrics.snapshot();
        assert_eq!(snap.sweep_ticks, 1);
        assert_eq!(snap.last_sweep_tick_millis, 42);
    }

    #[test]
    fn clone_shares_the_same_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        metrics.record_task_claimed();
        assert_eq!(clone.snapshot().tasks_claimed, 1);
    }
}
