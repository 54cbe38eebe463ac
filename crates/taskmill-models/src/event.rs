//! Queue event envelopes.
//!
//! Every lifecycle transition publishes one event on the engine's
//! pub/sub channel. Consumers are external; the engine never subscribes
//! to its own events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{TaskId, TaskStatus};

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    /// Task accepted and pushed onto a priority queue
    TaskQueued,
    /// A worker claimed the task and began execution
    TaskStarted,
    /// Handler succeeded
    TaskCompleted,
    /// Terminal failure (retries exhausted or unrecoverable)
    TaskFailed,
    /// Attempt failed; retry scheduled with backoff
    TaskRetry,
    /// Canceled before execution
    TaskCanceled,
    /// Pushed to the dead-letter list
    TaskDlq,
}

impl TaskEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventKind::TaskQueued => "task_queued",
            TaskEventKind::TaskStarted => "task_started",
            TaskEventKind::TaskCompleted => "task_completed",
            TaskEventKind::TaskFailed => "task_failed",
            TaskEventKind::TaskRetry => "task_retry",
            TaskEventKind::TaskCanceled => "task_canceled",
            TaskEventKind::TaskDlq => "task_dlq",
        }
    }
}

impl std::fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event record published on the queue's event channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// What happened
    pub event_type: TaskEventKind,
    /// Which task
    pub task_id: TaskId,
    /// Task status after the transition
    pub status: TaskStatus,
    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
    /// Kind-specific extras (attempt counts, error text, schedule time)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl TaskEvent {
    /// Build an event stamped now.
    pub fn new(event_type: TaskEventKind, task_id: TaskId, status: TaskStatus) -> Self {
        Self {
            event_type,
            task_id,
            status,
            timestamp: Utc::now(),
            data: None,
        }
    }

    /// Attach kind-specific data.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}
