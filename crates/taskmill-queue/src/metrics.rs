//! Queue metrics collection.
//!
//! Standardized metrics for monitoring the queue engine:
//! - Submission and settlement counters by tier and outcome
//! - Processing and queue-wait histograms
//! - Lock contention and DLQ depth

use metrics::{counter, gauge, histogram};

// =============================================================================
// Metric Names
// =============================================================================

/// Metric name constants for consistency.
pub mod names {
    /// Total tasks submitted, by priority tier.
    pub const TASKS_SUBMITTED_TOTAL: &str = "taskmill_tasks_submitted_total";

    /// Total settled execution attempts, by outcome.
    pub const TASKS_SETTLED_TOTAL: &str = "taskmill_tasks_settled_total";

    /// Handler wall-clock time in seconds.
    pub const PROCESSING_SECONDS: &str = "taskmill_task_processing_seconds";

    /// Time between queueing and execution start, in seconds.
    pub const QUEUE_WAIT_SECONDS: &str = "taskmill_task_queue_wait_seconds";

    /// Lock acquisitions that lost to another worker.
    pub const LOCK_CONTENTION_TOTAL: &str = "taskmill_lock_contention_total";

    /// Current dead-letter list depth.
    pub const DLQ_DEPTH: &str = "taskmill_dlq_depth";
}

// =============================================================================
// Recording Functions
// =============================================================================

/// Record a task submission.
pub fn record_submit(tier: &str) {
    counter!(
        names::TASKS_SUBMITTED_TOTAL,
        "tier" => tier.to_string()
    )
    .increment(1);
}

/// Record a settled execution attempt. Outcome is one of
/// `completed`, `retry`, `dlq`.
pub fn record_settle(outcome: &str, processing_ms: f64, queue_ms: f64) {
    counter!(
        names::TASKS_SETTLED_TOTAL,
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(names::PROCESSING_SECONDS).record(processing_ms / 1000.0);
    histogram!(names::QUEUE_WAIT_SECONDS).record(queue_ms / 1000.0);
}

/// Record a lost lock acquisition.
pub fn record_lock_contention() {
    counter!(names::LOCK_CONTENTION_TOTAL).increment(1);
}

/// Record the observed dead-letter list depth.
pub fn record_dlq_depth(depth: u64) {
    gauge!(names::DLQ_DEPTH).set(depth as f64);
}

// =============================================================================
// Tests
// =============================================================================
