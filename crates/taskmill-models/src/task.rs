//! Task records and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::payload::Payload;

/// Unique identifier for a task.
///
/// This is the only identifier ever placed on queues or lock keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Row created, not yet on a queue
    #[default]
    Pending,
    /// Waiting on a priority queue (or scheduled for retry)
    Queued,
    /// A worker holds the lock and is executing the handler
    Processing,
    /// Handler succeeded; result stored
    Completed,
    /// Retries exhausted or unrecoverable; terminal
    Failed,
    /// Canceled before a worker claimed it
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    /// Check if this is a terminal state (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// Check if the task can still be canceled.
    ///
    /// Only Pending and Queued tasks are cancelable; once a worker holds
    /// the lock, cancellation is rejected.
    pub fn is_cancelable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Queued)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The persisted unit of work.
///
/// One row per submitted task. Mutated exclusively by the worker holding
/// the task's distributed lock while Processing, and by the retry
/// scheduler / orphan recovery when no worker holds it. Never physically
/// deleted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task ID
    pub id: TaskId,

    /// Owning account
    pub account_id: String,

    /// Lifecycle status
    #[serde(default)]
    pub status: TaskStatus,

    /// Priority value; mapped to a physical queue via configured thresholds
    #[serde(default)]
    pub priority: i32,

    /// Failed execution attempts consumed so far
    #[serde(default)]
    pub attempts: u32,

    /// Maximum retries allowed (copied from config at submission)
    #[serde(default)]
    pub max_retries: u32,

    /// Opaque request payload, stored verbatim
    pub request_data: Payload,

    /// Opaque result payload, stored verbatim on completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_data: Option<Payload>,

    /// Error message from the last failed attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Worker currently (or last) holding the task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    /// Last liveness signal while Processing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// When the task last entered the Queued state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,

    /// When the current/last execution attempt started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Completion timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Terminal failure timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    /// Wall-clock handler time, recorded at settlement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_ms: Option<u64>,

    /// Time spent waiting on the queue, recorded at settlement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_ms: Option<u64>,
}

impl TaskRecord {
    /// Create a new pending task row.
    pub fn new(
        account_id: impl Into<String>,
        request_data: Payload,
        priority: i32,
        max_retries: u32,
    ) -> Self {
        Self {
            id: TaskId::new(),
            account_id: account_id.into(),
            status: TaskStatus::Pending,
            priority,
            attempts: 0,
            max_retries,
            request_data,
            result_data: None,
            error_message: None,
            worker_id: None,
            last_heartbeat_at: None,
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            processing_ms: None,
            queue_ms: None,
        }
    }

    /// Check if another retry is available after a failed attempt.
    pub fn retries_remaining(&self) -> bool {
        self.attempts < self.max_retries
    }

    /// Mark the task queued (submission or retry re-queue).
    pub fn mark_queued(&mut self) {
        self.status = TaskStatus::Queued;
        self.queued_at = Some(Utc::now());
    }

    /// Mark the task claimed by a worker.
    pub fn mark_processing(&mut self, worker_id: impl Into<String>) {
        let now = Utc::now();
        self.status = TaskStatus::Processing;
        self.worker_id = Some(worker_id.into());
        self.started_at = Some(now);
        self.last_heartbeat_at = Some(now);
    }

    /// Mark the task completed with its result.
    pub fn mark_completed(&mut self, result: Payload) {
        self.status = TaskStatus::Completed;
        self.result_data = Some(result);
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task terminally failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error_message = Some(error.into());
        self.failed_at = Some(Utc::now());
    }

    /// Reset the row for a manual retry of a failed task.
    pub fn reset_for_retry(&mut self) {
        self.attempts = 0;
        self.error_message = None;
        self.failed_at = None;
        self.result_data = None;
        self.mark_queued();
    }
}

/// Filter for task-history queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Restrict to one account
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Restrict to one status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    /// Maximum rows returned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl TaskFilter {
    /// Filter for one account's tasks.
    pub fn for_account(account_id: impl Into<String>) -> Self {
        Self {
            account_id: Some(account_id.into()),
            ..Default::default()
        }
    }

    /// Restrict to one status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Cap the number of rows returned.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
