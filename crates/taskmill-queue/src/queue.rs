//! Priority queue topology.
//!
//! Three FIFO tier lists, the retry-schedule sorted set, the dead-letter
//! list, and the task locks, all addressed through [`QueueKeys`] and a
//! shared [`Broker`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use taskmill_models::{PriorityTier, TaskId};

use crate::broker::Broker;
use crate::error::QueueResult;
use crate::keys::QueueKeys;

/// Queue-side view of the task topology.
#[derive(Clone)]
pub struct TaskQueue {
    broker: Arc<dyn Broker>,
    keys: QueueKeys,
}

impl TaskQueue {
    pub fn new(broker: Arc<dyn Broker>, keys: QueueKeys) -> Self {
        Self { broker, keys }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Enqueue a task id on its tier. New ids enter at the head and are
    /// popped at the tail, so each tier drains in submission order.
    pub async fn push(&self, tier: PriorityTier, task_id: &TaskId) -> QueueResult<()> {
        self.broker
            .push_front(&self.keys.priority_queue(tier), task_id.as_str())
            .await?;
        debug!(task_id = %task_id, tier = %tier, "Task pushed to queue");
        Ok(())
    }

    /// Pop the next task id, draining high before normal before low.
    /// Returns the origin tier so a contended id can go back where it
    /// came from.
    pub async fn pop_next(&self) -> QueueResult<Option<(TaskId, PriorityTier)>> {
        for tier in PriorityTier::DRAIN_ORDER {
            if let Some(id) = self
                .broker
                .pop_back(&self.keys.priority_queue(tier))
                .await?
            {
                return Ok(Some((TaskId::from_string(id), tier)));
            }
        }
        Ok(None)
    }

    /// Remove a task id from every tier list. Returns how many entries
    /// were removed; zero means the id was not queued (already popped).
    pub async fn remove_from_all_tiers(&self, task_id: &TaskId) -> QueueResult<u64> {
        let mut removed = 0;
        for tier in PriorityTier::DRAIN_ORDER {
            removed += self
                .broker
                .remove_from_list(&self.keys.priority_queue(tier), task_id.as_str())
                .await?;
        }
        Ok(removed)
    }

    pub async fn tier_len(&self, tier: PriorityTier) -> QueueResult<u64> {
        self.broker.list_len(&self.keys.priority_queue(tier)).await
    }

    /// Take the distributed lock for a task. Returns `false` when another
    /// worker already holds it. The TTL bounds how long a crashed holder
    /// can block the task.
    pub async fn acquire_lock(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        ttl: Duration,
    ) -> QueueResult<bool> {
        self.broker
            .set_nx_with_ttl(&self.keys.task_lock(task_id), worker_id, ttl)
            .await
    }

    pub async fn release_lock(&self, task_id: &TaskId) -> QueueResult<()> {
        self.broker.delete(&self.keys.task_lock(task_id)).await
    }

    /// Record which task a worker is currently processing. Bookkeeping
    /// only; the TTL clears it if the worker dies mid-task.
    pub async fn record_claim(
        &self,
        worker_id: &str,
        task_id: &TaskId,
        ttl: Duration,
    ) -> QueueResult<()> {
        self.broker
            .set_nx_with_ttl(&self.keys.processing(worker_id), task_id.as_str(), ttl)
            .await?;
        Ok(())
    }

    pub async fn clear_claim(&self, worker_id: &str) -> QueueResult<()> {
        self.broker.delete(&self.keys.processing(worker_id)).await
    }

    /// Schedule a task id for requeue at `retry_at`. The score is unix
    /// time in fractional seconds.
    pub async fn schedule_retry(&self, task_id: &TaskId, retry_at: DateTime<Utc>) -> QueueResult<()> {
        let score = retry_at.timestamp_millis() as f64 / 1000.0;
        self.broker
            .zadd(&self.keys.retry_scheduled(), task_id.as_str(), score)
            .await?;
        debug!(task_id = %task_id, retry_at = %retry_at, "Retry scheduled");
        Ok(())
    }

    /// Task ids whose scheduled retry time is at or before `now`.
    pub async fn due_retries(&self, now: DateTime<Utc>) -> QueueResult<Vec<TaskId>> {
        let score = now.timestamp_millis() as f64 / 1000.0;
        let members = self
            .broker
            .zrange_by_score_upto(&self.keys.retry_scheduled(), score)
            .await?;
        Ok(members.into_iter().map(TaskId::from_string).collect())
    }

    /// Drop a task id from the retry schedule. Returns `false` when it
    /// was not scheduled.
    pub async fn unschedule_retry(&self, task_id: &TaskId) -> QueueResult<bool> {
        self.broker
            .zrem(&self.keys.retry_scheduled(), task_id.as_str())
            .await
    }

    /// Number of tasks currently waiting on the retry schedule.
    pub async fn retry_scheduled_len(&self) -> QueueResult<u64> {
        let members = self
            .broker
            .zrange_by_score_upto(&self.keys.retry_scheduled(), f64::MAX)
            .await?;
        Ok(members.len() as u64)
    }

    pub async fn push_dlq(&self, task_id: &TaskId) -> QueueResult<()> {
        self.broker
            .push_front(&self.keys.dlq(), task_id.as_str())
            .await
    }

    pub async fn remove_from_dlq(&self, task_id: &TaskId) -> QueueResult<u64> {
        self.broker
            .remove_from_list(&self.keys.dlq(), task_id.as_str())
            .await
    }

    pub async fn dlq_len(&self) -> QueueResult<u64> {
        self.broker.list_len(&self.keys.dlq()).await
    }
}
