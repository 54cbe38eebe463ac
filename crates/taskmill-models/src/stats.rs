//! Statistics snapshots.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::task::TaskStatus;

/// Aggregate queue and throughput statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    /// Tasks waiting on the high-priority queue
    pub queued_high: u64,
    /// Tasks waiting on the normal-priority queue
    pub queued_normal: u64,
    /// Tasks waiting on the low-priority queue
    pub queued_low: u64,
    /// Tasks scheduled for a future retry
    pub retry_scheduled: u64,
    /// Dead-letter list length
    pub dlq_len: u64,
    /// Store row counts per status
    pub status_counts: HashMap<TaskStatus, u64>,
    /// Tasks completed in the last 24 hours
    pub completed_24h: u64,
    /// Tasks terminally failed in the last 24 hours
    pub failed_24h: u64,
    /// Average handler wall-clock time in milliseconds
    pub avg_processing_ms: f64,
    /// Average queue-wait time in milliseconds
    pub avg_queue_ms: f64,
    /// Completed tasks per hour, derived from the 24h window
    pub tasks_per_hour: f64,
}

impl TaskStats {
    /// Total backlog across all priority tiers.
    pub fn total_queued(&self) -> u64 {
        self.queued_high + self.queued_normal + self.queued_low
    }
}

/// Live worker-pool counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStatsSnapshot {
    /// Configured pool size
    pub worker_count: usize,
    /// Workers currently executing a handler
    pub busy_workers: usize,
    /// Tasks settled successfully since start
    pub processed_total: u64,
    /// Failed attempts (including retried ones) since start
    pub failed_total: u64,
}
