//! Worker pool counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use taskmill_models::WorkerStatsSnapshot;

/// Live counters for one manager's worker pool, shared by `Arc`.
/// Carried explicitly so the engine holds no process-wide state.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    busy_workers: AtomicUsize,
    processed_total: AtomicU64,
    failed_total: AtomicU64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A worker began executing a task.
    pub fn task_started(&self) {
        self.busy_workers.fetch_add(1, Ordering::Relaxed);
    }

    /// A worker settled a task, whatever the outcome.
    pub fn task_finished(&self) {
        self.busy_workers.fetch_sub(1, Ordering::Relaxed);
    }

    /// An attempt completed successfully.
    pub fn record_processed(&self) {
        self.processed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// An attempt failed (retried or terminal).
    pub fn record_failed(&self) {
        self.failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, worker_count: usize) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            worker_count,
            busy_workers: self.busy_workers.load(Ordering::Relaxed),
            processed_total: self.processed_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
        }
    }
}
