//! Lifecycle events via broker pub/sub.

use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use tracing::debug;

use taskmill_models::{TaskEvent, TaskEventKind, TaskId, TaskStatus};

use crate::broker::Broker;
use crate::error::QueueResult;
use crate::keys::QueueKeys;

/// Stream of decoded lifecycle events from a subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = TaskEvent> + Send>>;

/// Channel for publishing and subscribing to task lifecycle events.
///
/// All events travel on the single derived events channel. The engine
/// only publishes; consumers are external.
#[derive(Clone)]
pub struct EventChannel {
    broker: Arc<dyn Broker>,
    channel: String,
}

impl EventChannel {
    pub fn new(broker: Arc<dyn Broker>, keys: &QueueKeys) -> Self {
        Self {
            broker,
            channel: keys.events_channel(),
        }
    }

    /// Publish an event.
    pub async fn publish(&self, event: &TaskEvent) -> QueueResult<()> {
        let payload = serde_json::to_string(event)?;
        debug!(task_id = %event.task_id, event = %event.event_type, "Publishing event");
        self.broker.publish(&self.channel, &payload).await
    }

    /// Publish a task-queued event.
    pub async fn queued(&self, task_id: &TaskId) -> QueueResult<()> {
        self.publish(&TaskEvent::new(
            TaskEventKind::TaskQueued,
            task_id.clone(),
            TaskStatus::Queued,
        ))
        .await
    }

    /// Publish a task-started event.
    pub async fn started(&self, task_id: &TaskId, worker_id: &str) -> QueueResult<()> {
        self.publish(
            &TaskEvent::new(
                TaskEventKind::TaskStarted,
                task_id.clone(),
                TaskStatus::Processing,
            )
            .with_data(json!({ "worker_id": worker_id })),
        )
        .await
    }

    /// Publish a task-completed event.
    pub async fn completed(&self, task_id: &TaskId) -> QueueResult<()> {
        self.publish(&TaskEvent::new(
            TaskEventKind::TaskCompleted,
            task_id.clone(),
            TaskStatus::Completed,
        ))
        .await
    }

    /// Publish a terminal-failure event.
    pub async fn failed(&self, task_id: &TaskId, error: &str) -> QueueResult<()> {
        self.publish(
            &TaskEvent::new(
                TaskEventKind::TaskFailed,
                task_id.clone(),
                TaskStatus::Failed,
            )
            .with_data(json!({ "error": error })),
        )
        .await
    }

    /// Publish a retry-scheduled event.
    pub async fn retry(
        &self,
        task_id: &TaskId,
        attempt: u32,
        retry_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.publish(
            &TaskEvent::new(
                TaskEventKind::TaskRetry,
                task_id.clone(),
                TaskStatus::Queued,
            )
            .with_data(json!({ "attempt": attempt, "retry_at": retry_at.to_rfc3339() })),
        )
        .await
    }

    /// Publish a task-canceled event.
    pub async fn canceled(&self, task_id: &TaskId) -> QueueResult<()> {
        self.publish(&TaskEvent::new(
            TaskEventKind::TaskCanceled,
            task_id.clone(),
            TaskStatus::Canceled,
        ))
        .await
    }

    /// Publish a dead-letter event.
    pub async fn dead_lettered(&self, task_id: &TaskId, error: &str) -> QueueResult<()> {
        self.publish(
            &TaskEvent::new(TaskEventKind::TaskDlq, task_id.clone(), TaskStatus::Failed)
                .with_data(json!({ "error": error })),
        )
        .await
    }

    /// Subscribe to the event stream. Malformed payloads are skipped.
    pub async fn subscribe(&self) -> QueueResult<EventStream> {
        let raw = self.broker.subscribe(&self.channel).await?;
        let stream = raw.filter_map(|payload| async move {
            serde_json::from_str::<TaskEvent>(&payload).ok()
        });
        Ok(Box::pin(stream))
    }
}
