//! Background loops: the retry sweep and the dead-letter watch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use taskmill_models::{TaskId, TaskStatus};
use taskmill_queue::{metrics as queue_metrics, EventChannel, TaskQueue};

use crate::config::Config;
use crate::error::EngineResult;
use crate::store::TaskStore;

/// How often due retries are swept back onto the priority queues.
pub const RETRY_SCHEDULER_INTERVAL: Duration = Duration::from_secs(10);

/// How often the dead-letter queue depth is checked.
pub const DLQ_WATCH_INTERVAL: Duration = Duration::from_secs(300);

/// Moves tasks whose retry time has arrived from the schedule back onto
/// the priority queue matching their stored priority.
pub struct RetryScheduler {
    config: Config,
    store: Arc<dyn TaskStore>,
    queue: TaskQueue,
    events: EventChannel,
}

impl RetryScheduler {
    pub fn new(
        config: Config,
        store: Arc<dyn TaskStore>,
        queue: TaskQueue,
        events: EventChannel,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            events,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = RETRY_SCHEDULER_INTERVAL.as_secs(),
            "Retry scheduler started"
        );
        let mut ticker = tokio::time::interval(RETRY_SCHEDULER_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.requeue_due().await {
                        Ok(0) => {}
                        Ok(n) => info!("Requeued {} due retries", n),
                        Err(e) => error!("Retry sweep failed: {}", e),
                    }
                }
            }
        }

        info!("Retry scheduler stopped");
    }

    /// One sweep over the retry schedule. Returns how many tasks were
    /// moved back onto a priority queue.
    pub async fn requeue_due(&self) -> EngineResult<usize> {
        let due = self.queue.due_retries(Utc::now()).await?;
        let mut moved = 0;

        for task_id in due {
            // Remove the schedule entry before pushing. Overlapping
            // sweeps both see the same due set; only the remover may
            // queue the id.
            match self.queue.unschedule_retry(&task_id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(task_id = %task_id, "Failed to unschedule retry: {}", e);
                    continue;
                }
            }

            match self.store.get_by_task_id(&task_id).await {
                Ok(Some(task)) if task.status == TaskStatus::Queued => {
                    let tier = self.config.tier_for_priority(task.priority);
                    if let Err(e) = self.queue.push(tier, &task_id).await {
                        error!(task_id = %task_id, "Failed to requeue due retry, dead-lettering: {}", e);
                        self.dead_letter(&task_id, format!("requeue failed: {}", e))
                            .await;
                        continue;
                    }
                    moved += 1;
                }
                Ok(Some(task)) => {
                    // Canceled while waiting, or otherwise settled out of
                    // band. Terminal states stay terminal.
                    warn!(
                        task_id = %task_id,
                        status = %task.status,
                        "Due retry no longer queued, dropping"
                    );
                }
                Ok(None) => {
                    warn!(task_id = %task_id, "Due retry has no store row, dropping");
                }
                Err(e) => {
                    error!(task_id = %task_id, "Store error during retry sweep: {}", e);
                }
            }
        }

        Ok(moved)
    }

    /// Last resort for a due task whose id could not go back on a
    /// queue. Its schedule entry is already consumed, so left Queued
    /// the row would be unreachable; fail it and dead-letter it so a
    /// manual retry can revive it.
    async fn dead_letter(&self, task_id: &TaskId, reason: String) {
        if let Err(e) = self
            .store
            .update_status(task_id, TaskStatus::Failed, Some(reason.clone()))
            .await
        {
            error!(task_id = %task_id, "Failed to fail stranded task: {}", e);
            return;
        }
        self.queue.push_dlq(task_id).await.ok();
        self.events.dead_lettered(task_id, &reason).await.ok();
    }
}

/// Periodically reports the dead-letter queue depth and warns once it
/// crosses the configured alert threshold.
pub struct DlqWatch {
    config: Config,
    queue: TaskQueue,
}

impl DlqWatch {
    pub fn new(config: Config, queue: TaskQueue) -> Self {
        Self { config, queue }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = DLQ_WATCH_INTERVAL.as_secs(),
            "DLQ watch started"
        );
        let mut ticker = tokio::time::interval(DLQ_WATCH_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.check_depth().await {
                        error!("DLQ depth check failed: {}", e);
                    }
                }
            }
        }

        info!("DLQ watch stopped");
    }

    /// Report the current DLQ depth.
    pub async fn check_depth(&self) -> EngineResult<u64> {
        let depth = self.queue.dlq_len().await?;
        queue_metrics::record_dlq_depth(depth);

        if depth >= self.config.dlq_alert_threshold {
            warn!(
                depth,
                threshold = self.config.dlq_alert_threshold,
                "Dead-letter queue depth above alert threshold"
            );
        }

        Ok(depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use taskmill_models::{Payload, PriorityTier, TaskId, TaskRecord};
    use taskmill_queue::{Broker, MemoryBroker, MessageStream, QueueError, QueueResult};

    use crate::store::MemoryStore;

    fn test_parts() -> (Config, TaskQueue, Arc<MemoryStore>) {
        let config = Config {
            key_prefix: "test".to_string(),
            ..Default::default()
        };
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let queue = TaskQueue::new(broker, config.queue_keys());
        let store = Arc::new(MemoryStore::new());
        (config, queue, store)
    }

    fn scheduler(config: &Config, queue: &TaskQueue, store: &Arc<MemoryStore>) -> RetryScheduler {
        let events = EventChannel::new(Arc::clone(queue.broker()), queue.keys());
        RetryScheduler::new(
            config.clone(),
            Arc::clone(store) as Arc<dyn TaskStore>,
            queue.clone(),
            events,
        )
    }

    /// Delegates to a memory broker but refuses pushes onto the
    /// priority tier lists.
    struct TierPushFailBroker {
        inner: MemoryBroker,
    }

    #[async_trait]
    impl Broker for TierPushFailBroker {
        async fn push_front(&self, list: &str, value: &str) -> QueueResult<()> {
            if list.contains(":queue:priority:") {
                return Err(QueueError::broker("list push refused"));
            }
            self.inner.push_front(list, value).await
        }

        async fn pop_back(&self, list: &str) -> QueueResult<Option<String>> {
            self.inner.pop_back(list).await
        }

        async fn remove_from_list(&self, list: &str, value: &str) -> QueueResult<u64> {
            self.inner.remove_from_list(list, value).await
        }

        async fn list_len(&self, list: &str) -> QueueResult<u64> {
            self.inner.list_len(list).await
        }

        async fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<bool> {
            self.inner.set_nx_with_ttl(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> QueueResult<()> {
            self.inner.delete(key).await
        }

        async fn zadd(&self, set: &str, member: &str, score: f64) -> QueueResult<()> {
            self.inner.zadd(set, member, score).await
        }

        async fn zrange_by_score_upto(&self, set: &str, max_score: f64) -> QueueResult<Vec<String>> {
            self.inner.zrange_by_score_upto(set, max_score).await
        }

        async fn zrem(&self, set: &str, member: &str) -> QueueResult<bool> {
            self.inner.zrem(set, member).await
        }

        async fn publish(&self, channel: &str, payload: &str) -> QueueResult<()> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> QueueResult<MessageStream> {
            self.inner.subscribe(channel).await
        }
    }

    #[tokio::test]
    async fn test_requeue_due_moves_task_onto_priority_tier() {
        let (config, queue, store) = test_parts();
        let mut task = TaskRecord::new("acct-1", Payload::empty(), 15, 3);
        task.mark_queued();
        store.create(&task).await.unwrap();
        queue
            .schedule_retry(&task.id, Utc::now() - ChronoDuration::seconds(1))
            .await
            .unwrap();

        let moved = scheduler(&config, &queue, &store).requeue_due().await.unwrap();

        assert_eq!(moved, 1);
        // Priority 15 maps above the high threshold.
        assert_eq!(queue.tier_len(PriorityTier::High).await.unwrap(), 1);
        assert!(queue.due_retries(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_due_leaves_future_retries_scheduled() {
        let (config, queue, store) = test_parts();
        let mut task = TaskRecord::new("acct-1", Payload::empty(), 5, 3);
        task.mark_queued();
        store.create(&task).await.unwrap();
        queue
            .schedule_retry(&task.id, Utc::now() + ChronoDuration::seconds(60))
            .await
            .unwrap();

        let moved = scheduler(&config, &queue, &store).requeue_due().await.unwrap();

        assert_eq!(moved, 0);
        assert_eq!(queue.tier_len(PriorityTier::Normal).await.unwrap(), 0);
        assert!(queue
            .due_retries(Utc::now() + ChronoDuration::seconds(120))
            .await
            .unwrap()
            .contains(&task.id));
    }

    #[tokio::test]
    async fn test_requeue_due_drops_canceled_row() {
        let (config, queue, store) = test_parts();
        let mut task = TaskRecord::new("acct-1", Payload::empty(), 5, 3);
        task.mark_queued();
        store.create(&task).await.unwrap();
        queue
            .schedule_retry(&task.id, Utc::now() - ChronoDuration::seconds(1))
            .await
            .unwrap();
        store
            .update_status(&task.id, TaskStatus::Canceled, None)
            .await
            .unwrap();

        let moved = scheduler(&config, &queue, &store).requeue_due().await.unwrap();

        assert_eq!(moved, 0);
        assert_eq!(queue.tier_len(PriorityTier::Normal).await.unwrap(), 0);
        // The schedule entry is consumed, not left to fire again.
        assert!(queue.due_retries(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_due_drops_entry_without_store_row() {
        let (config, queue, store) = test_parts();
        let orphan_id = TaskId::new();
        queue
            .schedule_retry(&orphan_id, Utc::now() - ChronoDuration::seconds(1))
            .await
            .unwrap();

        let moved = scheduler(&config, &queue, &store).requeue_due().await.unwrap();

        assert_eq!(moved, 0);
        for tier in PriorityTier::DRAIN_ORDER {
            assert_eq!(queue.tier_len(tier).await.unwrap(), 0);
        }
        assert!(queue.due_retries(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_due_dead_letters_unplaceable_task() {
        let config = Config {
            key_prefix: "test".to_string(),
            ..Default::default()
        };
        let broker: Arc<dyn Broker> = Arc::new(TierPushFailBroker {
            inner: MemoryBroker::new(),
        });
        let queue = TaskQueue::new(broker, config.queue_keys());
        let store = Arc::new(MemoryStore::new());

        let mut task = TaskRecord::new("acct-1", Payload::empty(), 5, 3);
        task.mark_queued();
        store.create(&task).await.unwrap();
        queue
            .schedule_retry(&task.id, Utc::now() - ChronoDuration::seconds(1))
            .await
            .unwrap();

        let moved = scheduler(&config, &queue, &store).requeue_due().await.unwrap();

        // The schedule entry was consumed and the push refused; the row
        // must not stay Queued where nothing would ever find it.
        assert_eq!(moved, 0);
        let row = store.get_by_task_id(&task.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
        assert!(row.error_message.unwrap().contains("requeue failed"));
        assert_eq!(queue.dlq_len().await.unwrap(), 1);
        assert!(queue.due_retries(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dlq_watch_reports_depth() {
        let (config, queue, _store) = test_parts();
        queue.push_dlq(&TaskId::new()).await.unwrap();
        queue.push_dlq(&TaskId::new()).await.unwrap();

        let watch = DlqWatch::new(config, queue);
        assert_eq!(watch.check_depth().await.unwrap(), 2);
    }
}
