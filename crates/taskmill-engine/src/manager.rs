//! Engine façade.
//!
//! `TaskManager` wires the store, the broker, and the handler together,
//! owns the worker pool and the background loops, and exposes every
//! caller-facing operation: submit, query, cancel, manual retry,
//! statistics, lifecycle, and orphan recovery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use taskmill_models::{
    Payload, PriorityTier, TaskFilter, TaskId, TaskRecord, TaskStats, TaskStatus,
    WorkerStatsSnapshot,
};
use taskmill_queue::{metrics as queue_metrics, Broker, EventChannel, EventStream, TaskQueue};

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::handler::JobHandler;
use crate::metrics::WorkerMetrics;
use crate::scheduler::{DlqWatch, RetryScheduler};
use crate::store::TaskStore;
use crate::worker::Worker;

/// History queries without an explicit limit return this many rows.
const DEFAULT_HISTORY_LIMIT: usize = 100;

pub struct TaskManager {
    config: Config,
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,
    queue: TaskQueue,
    events: EventChannel,
    handler: Arc<dyn JobHandler>,
    metrics: Arc<WorkerMetrics>,
    shutdown: watch::Sender<bool>,
    join_handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl TaskManager {
    /// Build a manager over a store, a broker, and the job handler every
    /// execution attempt will invoke. Fails if the config is invalid.
    pub fn new(
        config: Config,
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn Broker>,
        handler: Arc<dyn JobHandler>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let keys = config.queue_keys();
        let events = EventChannel::new(Arc::clone(&broker), &keys);
        let queue = TaskQueue::new(Arc::clone(&broker), keys);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            broker,
            queue,
            events,
            handler,
            metrics: Arc::new(WorkerMetrics::new()),
            shutdown,
            join_handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Submit a task at the configured default priority.
    pub async fn submit_task(
        &self,
        account_id: impl Into<String>,
        payload: Payload,
    ) -> EngineResult<TaskId> {
        self.submit_task_with_priority(account_id, payload, self.config.default_priority)
            .await
    }

    /// Submit a task: persist the row, queue the id on the tier the
    /// priority maps to, mark it Queued, and announce it.
    pub async fn submit_task_with_priority(
        &self,
        account_id: impl Into<String>,
        payload: Payload,
        priority: i32,
    ) -> EngineResult<TaskId> {
        let task = TaskRecord::new(account_id, payload, priority, self.config.max_retries);
        self.store.create(&task).await?;

        let tier = self.config.tier_for_priority(priority);
        if let Err(e) = self.queue.push(tier, &task.id).await {
            // No Pending row may outlive a broker failure; fail it in
            // place and surface the push error.
            self.store
                .update_status(
                    &task.id,
                    TaskStatus::Failed,
                    Some(format!("enqueue failed: {}", e)),
                )
                .await
                .ok();
            return Err(e.into());
        }

        self.store
            .update_status(&task.id, TaskStatus::Queued, None)
            .await?;
        queue_metrics::record_submit(tier.as_str());
        if let Err(e) = self.events.queued(&task.id).await {
            warn!(task_id = %task.id, "Failed to publish queued event: {}", e);
        }

        info!(task_id = %task.id, priority, tier = %tier, "Task submitted");
        Ok(task.id)
    }

    pub async fn get_task(&self, task_id: &TaskId) -> EngineResult<TaskRecord> {
        self.store
            .get_by_task_id(task_id)
            .await?
            .ok_or_else(|| EngineError::task_not_found(task_id.as_str()))
    }

    pub async fn get_tasks_by_account(&self, account_id: &str) -> EngineResult<Vec<TaskRecord>> {
        Ok(self.store.get_by_account_id(account_id).await?)
    }

    /// Query past tasks by optional account and status, newest first.
    pub async fn get_task_history(&self, filter: TaskFilter) -> EngineResult<Vec<TaskRecord>> {
        let limit = filter.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        let mut tasks = match (&filter.account_id, filter.status) {
            (Some(account_id), _) => self.store.get_by_account_id(account_id).await?,
            (None, Some(status)) => self.store.get_by_status(status).await?,
            (None, None) => self.store.get_recent_tasks(limit).await?,
        };
        if let Some(status) = filter.status {
            tasks.retain(|task| task.status == status);
        }
        tasks.truncate(limit);
        Ok(tasks)
    }

    /// Cancel a Pending or Queued task. A task already claimed by a
    /// worker cannot be canceled; if the claim happened between this
    /// call's status read and the queue removal, the in-flight attempt
    /// still runs to completion.
    pub async fn cancel_task(&self, task_id: &TaskId) -> EngineResult<TaskRecord> {
        let task = self.get_task(task_id).await?;
        if !task.status.is_cancelable() {
            return Err(EngineError::invalid_state(
                task_id.as_str(),
                task.status,
                "cancel",
            ));
        }

        let removed = self.queue.remove_from_all_tiers(task_id).await?;
        if removed == 0 {
            // Pending, parked on the retry schedule, or popped by a
            // worker just before this call.
            warn!(task_id = %task_id, "Cancel found no queued entry");
        }

        self.store
            .update_status(task_id, TaskStatus::Canceled, None)
            .await?;
        if let Err(e) = self.events.canceled(task_id).await {
            warn!(task_id = %task_id, "Failed to publish canceled event: {}", e);
        }

        info!(task_id = %task_id, "Task canceled");
        self.get_task(task_id).await
    }

    /// Re-run a Failed task from scratch: attempts reset to zero, error
    /// cleared, the id pulled off the DLQ and pushed back onto its tier.
    pub async fn retry_task(&self, task_id: &TaskId) -> EngineResult<TaskRecord> {
        let mut task = self.get_task(task_id).await?;
        if task.status != TaskStatus::Failed {
            return Err(EngineError::invalid_state(
                task_id.as_str(),
                task.status,
                "retry",
            ));
        }

        task.reset_for_retry();
        self.store.update(&task).await?;
        if let Err(e) = self.queue.remove_from_dlq(task_id).await {
            warn!(task_id = %task_id, "Failed to remove from DLQ: {}", e);
        }

        let tier = self.config.tier_for_priority(task.priority);
        if let Err(e) = self.queue.push(tier, task_id).await {
            self.store
                .update_status(
                    task_id,
                    TaskStatus::Failed,
                    Some(format!("requeue failed: {}", e)),
                )
                .await
                .ok();
            return Err(e.into());
        }

        queue_metrics::record_submit(tier.as_str());
        if let Err(e) = self.events.queued(task_id).await {
            warn!(task_id = %task_id, "Failed to publish queued event: {}", e);
        }

        info!(task_id = %task_id, tier = %tier, "Task requeued for manual retry");
        Ok(task)
    }

    /// Aggregate queue depths and store counts into one snapshot.
    pub async fn get_stats(&self) -> EngineResult<TaskStats> {
        let queued_high = self.queue.tier_len(PriorityTier::High).await?;
        let queued_normal = self.queue.tier_len(PriorityTier::Normal).await?;
        let queued_low = self.queue.tier_len(PriorityTier::Low).await?;
        let retry_scheduled = self.queue.retry_scheduled_len().await?;
        let dlq_len = self.queue.dlq_len().await?;

        let mut status_counts = HashMap::new();
        for status in [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Canceled,
        ] {
            status_counts.insert(status, self.store.count_by_status(status).await?);
        }

        let since = Utc::now() - chrono::Duration::hours(24);
        let completed_24h = self.store.count_completed_since(since).await?;
        let failed_24h = self.store.count_failed_since(since).await?;

        Ok(TaskStats {
            queued_high,
            queued_normal,
            queued_low,
            retry_scheduled,
            dlq_len,
            status_counts,
            completed_24h,
            failed_24h,
            avg_processing_ms: self.store.get_average_processing_time().await?,
            avg_queue_ms: self.store.get_average_queue_time().await?,
            tasks_per_hour: completed_24h as f64 / 24.0,
        })
    }

    pub fn get_worker_stats(&self) -> WorkerStatsSnapshot {
        self.metrics.snapshot(self.config.worker_count)
    }

    /// Subscribe to the engine's event stream.
    pub async fn subscribe_events(&self) -> EngineResult<EventStream> {
        Ok(self.events.subscribe().await?)
    }

    /// Spawn the worker pool, the retry scheduler, and the DLQ watch.
    /// Calling `start` twice is a warning no-op.
    pub async fn start(&self) -> EngineResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Engine already started");
            return Ok(());
        }

        let mut handles = self.join_handles.lock().await;

        for _ in 0..self.config.worker_count {
            let worker = Worker::new(
                self.config.clone(),
                Arc::clone(&self.store),
                self.queue.clone(),
                self.events.clone(),
                Arc::clone(&self.handler),
                Arc::clone(&self.metrics),
            );
            handles.push(tokio::spawn(worker.run(self.shutdown.subscribe())));
        }

        let scheduler = RetryScheduler::new(
            self.config.clone(),
            Arc::clone(&self.store),
            self.queue.clone(),
            self.events.clone(),
        );
        handles.push(tokio::spawn(scheduler.run(self.shutdown.subscribe())));

        let dlq_watch = DlqWatch::new(self.config.clone(), self.queue.clone());
        handles.push(tokio::spawn(dlq_watch.run(self.shutdown.subscribe())));

        info!(worker_count = self.config.worker_count, "Engine started");
        Ok(())
    }

    /// Signal every loop to stop and wait for them, bounded by
    /// `shutdown_timeout`. On a clean drain the broker is closed; on
    /// timeout it is left open, since abandoned workers may still be
    /// settling against it.
    pub async fn shutdown(&self) -> EngineResult<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        info!("Engine shutting down");
        self.shutdown.send(true).ok();

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.join_handles.lock().await;
            guard.drain(..).collect()
        };
        let drain = async move {
            for handle in handles {
                handle.await.ok();
            }
        };

        match tokio::time::timeout(self.config.shutdown_timeout, drain).await {
            Ok(()) => {
                if let Err(e) = self.broker.close().await {
                    warn!("Broker close failed: {}", e);
                }
                info!("Engine stopped");
                Ok(())
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.shutdown_timeout.as_secs(),
                    "Shutdown timed out with loops still running"
                );
                Err(EngineError::shutdown(format!(
                    "loops did not stop within {}s",
                    self.config.shutdown_timeout.as_secs()
                )))
            }
        }
    }

    /// Requeue or fail Processing tasks whose heartbeat went stale.
    /// Run at startup or on demand; per-task failures are logged and the
    /// batch continues. Returns the number of orphans handled.
    pub async fn recover_orphaned_tasks(&self) -> EngineResult<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(self.config.orphan_timeout.as_millis() as i64);
        let orphans = self.store.find_orphaned_tasks(cutoff).await?;
        if orphans.is_empty() {
            return Ok(0);
        }
        warn!(count = orphans.len(), "Recovering orphaned tasks");

        let mut handled = 0;
        for mut task in orphans {
            let task_id = task.id.clone();
            if task.retries_remaining() {
                // The interrupted run consumes an attempt.
                task.attempts += 1;
                task.mark_queued();
                if let Err(e) = self.store.update(&task).await {
                    error!(task_id = %task_id, "Failed to persist orphan requeue: {}", e);
                    continue;
                }
                let tier = self.config.tier_for_priority(task.priority);
                if let Err(e) = self.queue.push(tier, &task_id).await {
                    // The row is Queued but on no queue now, beyond the
                    // reach of every sweep; dead-letter it instead.
                    error!(task_id = %task_id, "Failed to requeue orphan, dead-lettering: {}", e);
                    let reason = format!("requeue failed: {}", e);
                    match self
                        .store
                        .update_status(&task_id, TaskStatus::Failed, Some(reason.clone()))
                        .await
                    {
                        Ok(()) => {
                            self.queue.push_dlq(&task_id).await.ok();
                            self.events.dead_lettered(&task_id, &reason).await.ok();
                            handled += 1;
                        }
                        Err(store_err) => {
                            error!(task_id = %task_id, "Failed to fail stranded orphan: {}", store_err);
                        }
                    }
                    continue;
                }
                self.events.queued(&task_id).await.ok();
                warn!(
                    task_id = %task_id,
                    attempts = task.attempts,
                    "Orphaned task requeued"
                );
            } else {
                let message = "orphaned after max retries";
                if let Err(e) = self
                    .store
                    .update_status(&task_id, TaskStatus::Failed, Some(message.to_string()))
                    .await
                {
                    error!(task_id = %task_id, "Failed to mark orphan failed: {}", e);
                    continue;
                }
                self.events.failed(&task_id, message).await.ok();
                error!(
                    task_id = %task_id,
                    attempts = task.attempts,
                    "Orphaned task exhausted retries, marked failed"
                );
            }
            handled += 1;
        }

        Ok(handled)
    }

    /// One retry-scheduler pass, on demand.
    pub async fn requeue_due_retries(&self) -> EngineResult<usize> {
        self.retry_scheduler().requeue_due().await
    }

    fn retry_scheduler(&self) -> RetryScheduler {
        RetryScheduler::new(
            self.config.clone(),
            Arc::clone(&self.store),
            self.queue.clone(),
            self.events.clone(),
        )
    }
}
