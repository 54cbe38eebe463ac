//! Worker loop.
//!
//! Each worker independently drains the priority queues: pop an id,
//! take its distributed lock, run the handler, settle the row. The
//! queues are the only coordination point; workers never talk to each
//! other.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use taskmill_models::{Payload, PriorityTier, TaskId, TaskRecord, TaskStatus};
use taskmill_queue::{metrics as queue_metrics, EventChannel, TaskQueue};

use crate::config::Config;
use crate::error::EngineResult;
use crate::handler::{JobContext, JobHandler};
use crate::metrics::WorkerMetrics;
use crate::store::TaskStore;

/// Empty-queue poll delay bounds. Starts at the minimum, doubles per
/// empty pass, and resets on any successful pop.
const POLL_BACKOFF_MIN: Duration = Duration::from_millis(100);
const POLL_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Pause after losing a lock race, so a held task is not busy-spun.
const CONTENTION_YIELD: Duration = Duration::from_millis(100);

/// One fetch pass over the priority queues.
#[derive(Debug)]
enum FetchOutcome {
    /// Popped an id, loaded its row, and took its lock.
    Claimed { task: TaskRecord, tier: PriorityTier },
    /// All three queues were empty.
    Empty,
    /// Popped an id but could not claim it; it was requeued or dropped.
    Skipped,
}

/// Everything one execution attempt carries: the claimed row, the tier
/// it was popped from, and the heartbeat task keeping the row fresh.
/// Holding a lease means holding the task's distributed lock; settling
/// the lease releases it.
struct TaskLease {
    task: TaskRecord,
    origin_tier: PriorityTier,
    heartbeat: JoinHandle<()>,
}

/// Outcome of running the handler once.
struct Execution {
    result: Result<Payload, String>,
    processing_ms: u64,
    queue_ms: u64,
}

struct PollBackoff {
    current: Duration,
}

impl PollBackoff {
    fn new() -> Self {
        Self {
            current: POLL_BACKOFF_MIN,
        }
    }

    fn reset(&mut self) {
        self.current = POLL_BACKOFF_MIN;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(POLL_BACKOFF_MAX);
        delay
    }
}

pub struct Worker {
    id: String,
    config: Config,
    store: Arc<dyn TaskStore>,
    queue: TaskQueue,
    events: EventChannel,
    handler: Arc<dyn JobHandler>,
    metrics: Arc<WorkerMetrics>,
}

impl Worker {
    pub fn new(
        config: Config,
        store: Arc<dyn TaskStore>,
        queue: TaskQueue,
        events: EventChannel,
        handler: Arc<dyn JobHandler>,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            config,
            store,
            queue,
            events,
            handler,
            metrics,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until the shutdown signal flips. A task in flight when the
    /// signal arrives is settled before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, "Worker started");
        let mut backoff = PollBackoff::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.fetch().await {
                Ok(FetchOutcome::Claimed { task, tier }) => {
                    backoff.reset();
                    self.process(task, tier).await;
                }
                Ok(FetchOutcome::Skipped) => {
                    backoff.reset();
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(CONTENTION_YIELD) => {}
                    }
                }
                Ok(FetchOutcome::Empty) => {
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(worker_id = %self.id, "Fetch error: {}", e);
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// One pass over the queues, high before normal before low.
    async fn fetch(&self) -> EngineResult<FetchOutcome> {
        let Some((task_id, tier)) = self.queue.pop_next().await? else {
            return Ok(FetchOutcome::Empty);
        };

        let task = match self.store.get_by_task_id(&task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id = %task_id, "Popped id has no store row, dropping");
                return Ok(FetchOutcome::Skipped);
            }
            Err(e) => {
                // Store fault; give the id back rather than lose it.
                warn!(task_id = %task_id, "Store error on fetch, requeueing: {}", e);
                self.requeue_or_dead_letter(tier, &task_id).await;
                return Ok(FetchOutcome::Skipped);
            }
        };

        match self
            .queue
            .acquire_lock(&task_id, &self.id, self.config.task_timeout)
            .await
        {
            Ok(true) => Ok(FetchOutcome::Claimed { task, tier }),
            Ok(false) => {
                queue_metrics::record_lock_contention();
                debug!(task_id = %task_id, "Lock held elsewhere, requeueing");
                // The lock holder settles the row either way, so a failed
                // push here loses only the extra list entry.
                if let Err(e) = self.queue.push(tier, &task_id).await {
                    warn!(task_id = %task_id, "Failed to requeue contested id: {}", e);
                }
                Ok(FetchOutcome::Skipped)
            }
            Err(e) => {
                warn!(task_id = %task_id, "Lock attempt failed, requeueing: {}", e);
                self.requeue_or_dead_letter(tier, &task_id).await;
                Ok(FetchOutcome::Skipped)
            }
        }
    }

    /// Return an unclaimed id to the tier it was popped from. If the
    /// push fails, the id is on no queue while its row stays Queued, a
    /// state neither the retry sweep nor orphan recovery can see; fail
    /// the row and dead-letter it so a manual retry can revive it.
    async fn requeue_or_dead_letter(&self, tier: PriorityTier, task_id: &TaskId) {
        let Err(push_err) = self.queue.push(tier, task_id).await else {
            return;
        };
        error!(task_id = %task_id, "Failed to requeue, dead-lettering: {}", push_err);

        let reason = format!("requeue failed: {}", push_err);
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

    /// Claim, execute, and settle one locked task.
    async fn process(&self, task: TaskRecord, origin_tier: PriorityTier) {
        let task_id = task.id.clone();
        self.metrics.task_started();

        let lease = match self.claim(task, origin_tier).await {
            Ok(lease) => lease,
            Err(e) => {
                error!(worker_id = %self.id, task_id = %task_id, "Claim failed: {}", e);
                // The row is still Queued; hand the id back for another worker.
                self.queue.release_lock(&task_id).await.ok();
                self.requeue_or_dead_letter(origin_tier, &task_id).await;
                self.metrics.task_finished();
                return;
            }
        };

        let execution = self.execute(&lease).await;
        self.settle(lease, execution).await;
        self.metrics.task_finished();
    }

    /// Move the locked task into Processing and start its heartbeat.
    async fn claim(&self, mut task: TaskRecord, origin_tier: PriorityTier) -> EngineResult<TaskLease> {
        let task_id = task.id.clone();

        self.store.update_worker_info(&task_id, &self.id).await?;
        self.store
            .update_status(&task_id, TaskStatus::Processing, None)
            .await?;
        task.mark_processing(&self.id);

        // Bookkeeping and the started event are best-effort.
        self.queue
            .record_claim(&self.id, &task_id, self.config.task_timeout)
            .await
            .ok();
        self.events.started(&task_id, &self.id).await.ok();

        let heartbeat = self.spawn_heartbeat(task_id.clone());

        info!(
            worker_id = %self.id,
            task_id = %task_id,
            attempt = task.attempts + 1,
            "Executing task"
        );

        Ok(TaskLease {
            task,
            origin_tier,
            heartbeat,
        })
    }

    /// Refresh the row heartbeat every interval until aborted at settle.
    fn spawn_heartbeat(&self, task_id: TaskId) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let period = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if let Err(e) = store.update_heartbeat(&task_id).await {
                    warn!(task_id = %task_id, "Heartbeat update failed: {}", e);
                }
            }
        })
    }

    /// Run the handler once, bounded by the task timeout.
    ///
    /// The handler runs in its own spawned task so a panic surfaces as a
    /// join error instead of taking the worker down. On timeout the
    /// handle is dropped and the handler keeps running detached;
    /// cancellation is cooperative only, and the lock TTL makes the task
    /// recoverable if this worker never settles.
    async fn execute(&self, lease: &TaskLease) -> Execution {
        let task = &lease.task;
        let ctx = JobContext {
            task_id: task.id.clone(),
            account_id: task.account_id.clone(),
            attempt: task.attempts + 1,
            worker_id: self.id.clone(),
            timeout: self.config.task_timeout,
        };
        let payload = task.request_data.clone();
        let handler = Arc::clone(&self.handler);

        let started = Instant::now();
        let attempt = tokio::spawn(async move { handler.handle(ctx, payload).await });

        let result = match tokio::time::timeout(self.config.task_timeout, attempt).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(join_err)) => Err(format!("handler panicked: {}", join_err)),
            Err(_) => Err(format!(
                "timed out after {}s",
                self.config.task_timeout.as_secs()
            )),
        };

        let processing_ms = started.elapsed().as_millis() as u64;
        let queue_ms = match (task.started_at, task.queued_at) {
            (Some(started_at), Some(queued_at)) => {
                (started_at - queued_at).num_milliseconds().max(0) as u64
            }
            _ => 0,
        };

        Execution {
            result,
            processing_ms,
            queue_ms,
        }
    }

    /// Settle the attempt: stop the heartbeat, release the lock, record
    /// metrics, then take the completed / retry / dead-letter branch.
    /// Lock release is unconditional; it never depends on the outcome.
    /// A retry that cannot be scheduled is dead-lettered rather than
    /// left as a Queued row no queue refers to.
    async fn settle(&self, lease: TaskLease, execution: Execution) {
        let TaskLease {
            mut task,
            origin_tier,
            heartbeat,
        } = lease;
        let task_id = task.id.clone();

        heartbeat.abort();
        if let Err(e) = self.queue.release_lock(&task_id).await {
            error!(task_id = %task_id, "Failed to release lock: {}", e);
        }
        self.queue.clear_claim(&self.id).await.ok();

        if let Err(e) = self
            .store
            .update_metrics(&task_id, execution.processing_ms, execution.queue_ms)
            .await
        {
            warn!(task_id = %task_id, "Failed to record metrics: {}", e);
        }
        task.processing_ms = Some(execution.processing_ms);
        task.queue_ms = Some(execution.queue_ms);

        match execution.result {
            Ok(result) => {
                task.mark_completed(result);
                if let Err(e) = self.store.update(&task).await {
                    error!(task_id = %task_id, "Failed to persist completion: {}", e);
                }
                self.metrics.record_processed();
                queue_metrics::record_settle(
                    "completed",
                    execution.processing_ms as f64,
                    execution.queue_ms as f64,
                );
                self.events.completed(&task_id).await.ok();
                info!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    tier = %origin_tier,
                    processing_ms = execution.processing_ms,
                    "Task completed"
                );
            }
            Err(error) => {
                self.metrics.record_failed();
                let mut scheduled = false;

                if task.retries_remaining() {
                    task.attempts += 1;
                    let delay = self.config.retry_delay(task.attempts);
                    let retry_at =
                        Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                    task.error_message = Some(error.clone());
                    task.mark_queued();

                    if let Err(e) = self.store.update(&task).await {
                        error!(task_id = %task_id, "Failed to persist retry state: {}", e);
                    }
                    match self.queue.schedule_retry(&task_id, retry_at).await {
                        Ok(()) => {
                            scheduled = true;
                            queue_metrics::record_settle(
                                "retry",
                                execution.processing_ms as f64,
                                execution.queue_ms as f64,
                            );
                            self.events.retry(&task_id, task.attempts, retry_at).await.ok();
                            warn!(
                                worker_id = %self.id,
                                task_id = %task_id,
                                attempt = task.attempts,
                                retry_at = %retry_at,
                                "Task failed, retry scheduled: {}",
                                error
                            );
                        }
                        Err(e) => {
                            // A Queued row on no queue and no schedule is
                            // invisible to the retry sweep and to orphan
                            // recovery; fall through to the dead-letter
                            // branch so a manual retry can revive it.
                            error!(task_id = %task_id, "Failed to schedule retry, dead-lettering: {}", e);
                        }
                    }
                }

                if !scheduled {
                    task.mark_failed(&error);
                    if let Err(e) = self.store.update(&task).await {
                        error!(task_id = %task_id, "Failed to persist terminal failure: {}", e);
                    }
                    match self.queue.push_dlq(&task_id).await {
                        Ok(()) => {
                            self.events.dead_lettered(&task_id, &error).await.ok();
                        }
                        Err(e) => {
                            error!(task_id = %task_id, "Failed to push to DLQ: {}", e);
                        }
                    }
                    queue_metrics::record_settle(
                        "dlq",
                        execution.processing_ms as f64,
                        execution.queue_ms as f64,
                    );
                    error!(
                        worker_id = %self.id,
                        task_id = %task_id,
                        tier = %origin_tier,
                        attempts = task.attempts,
                        "Task failed terminally, dead-lettered: {}",
                        error
                    );
                }
            }
        }
    }
}
