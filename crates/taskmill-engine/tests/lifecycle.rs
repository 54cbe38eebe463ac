//! End-to-end engine behavior over the in-memory broker and store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;

use taskmill_engine::{
    Config, JobContext, JobHandler, MemoryStore, TaskManager, TaskStore,
};
use taskmill_models::{Payload, PriorityTier, TaskEventKind, TaskId, TaskRecord, TaskStatus};
use taskmill_queue::{Broker, MemoryBroker, MessageStream, QueueError, QueueResult, TaskQueue};

/// Counts executions per task id and echoes the payload back.
#[derive(Default)]
struct CountingHandler {
    executions: Mutex<HashMap<String, u32>>,
}

impl CountingHandler {
    fn executions_for(&self, id: &TaskId) -> u32 {
        self.executions
            .lock()
            .unwrap()
            .get(id.as_str())
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn handle(&self, ctx: JobContext, payload: Payload) -> anyhow::Result<Payload> {
        *self
            .executions
            .lock()
            .unwrap()
            .entry(ctx.task_id.as_str().to_string())
            .or_insert(0) += 1;
        Ok(payload)
    }
}

/// Fails every attempt.
struct FailingHandler {
    executions: AtomicU32,
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn handle(&self, _ctx: JobContext, _payload: Payload) -> anyhow::Result<Payload> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("simulated handler failure"))
    }
}

/// Sleeps before succeeding.
struct SlowHandler {
    delay: Duration,
}

#[async_trait]
impl JobHandler for SlowHandler {
    async fn handle(&self, _ctx: JobContext, payload: Payload) -> anyhow::Result<Payload> {
        tokio::time::sleep(self.delay).await;
        Ok(payload)
    }
}

/// Delegates to a memory broker but refuses sorted-set writes, so retry
/// scheduling fails while everything else stays healthy.
struct SortedSetFailBroker {
    inner: MemoryBroker,
}

#[async_trait]
impl Broker for SortedSetFailBroker {
    async fn push_front(&self, list: &str, value: &str) -> QueueResult<()> {
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

    async fn zadd(&self, _set: &str, _member: &str, _score: f64) -> QueueResult<()> {
        Err(QueueError::broker("sorted-set write refused"))
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

fn test_config() -> Config {
    Config {
        worker_count: 2,
        initial_retry_delay: Duration::from_millis(5),
        max_retry_delay: Duration::from_millis(20),
        key_prefix: "lifecycle".to_string(),
        ..Default::default()
    }
}

fn build_manager(
    config: Config,
    handler: Arc<dyn JobHandler>,
) -> (TaskManager, Arc<MemoryStore>, TaskQueue) {
    let store = Arc::new(MemoryStore::new());
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let queue_view = TaskQueue::new(Arc::clone(&broker), config.queue_keys());
    let manager = TaskManager::new(
        config,
        Arc::clone(&store) as Arc<dyn TaskStore>,
        broker,
        handler,
    )
    .unwrap();
    (manager, store, queue_view)
}

async fn wait_for_status(
    manager: &TaskManager,
    id: &TaskId,
    status: TaskStatus,
    deadline: Duration,
) -> TaskRecord {
    let start = Instant::now();
    loop {
        let task = manager.get_task(id).await.unwrap();
        if task.status == status {
            return task;
        }
        if start.elapsed() > deadline {
            panic!(
                "task {} stuck in {} while waiting for {}",
                id, task.status, status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_submitted_task_executes_to_completion() {
    let handler = Arc::new(CountingHandler::default());
    let (manager, _store, _queue) =
        build_manager(test_config(), Arc::clone(&handler) as Arc<dyn JobHandler>);

    let mut events = manager.subscribe_events().await.unwrap();

    let payload = Payload::from_json(&serde_json::json!({ "source": "clip-42" })).unwrap();
    let id = manager.submit_task("acct-1", payload.clone()).await.unwrap();
    manager.start().await.unwrap();

    let task = wait_for_status(&manager, &id, TaskStatus::Completed, Duration::from_secs(5)).await;
    assert_eq!(
        task.result_data.as_ref().map(|p| p.as_bytes()),
        Some(payload.as_bytes())
    );
    assert_eq!(task.attempts, 0);
    assert!(task.worker_id.is_some());
    assert!(task.processing_ms.is_some());
    assert_eq!(handler.executions_for(&id), 1);

    // Lifecycle events for the id arrive in state-machine order.
    let mut kinds = Vec::new();
    while kinds.len() < 3 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .expect("event stream stalled")
            .expect("event stream closed");
        if event.task_id == id {
            kinds.push(event.event_type);
        }
    }
    assert_eq!(
        kinds,
        vec![
            TaskEventKind::TaskQueued,
            TaskEventKind::TaskStarted,
            TaskEventKind::TaskCompleted,
        ]
    );

    let stats = manager.get_stats().await.unwrap();
    assert_eq!(stats.completed_24h, 1);
    assert_eq!(stats.status_counts[&TaskStatus::Completed], 1);
    assert!(stats.avg_processing_ms >= 0.0);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failing_task_walks_retries_into_dlq() {
    let config = Config {
        worker_count: 1,
        max_retries: 2,
        ..test_config()
    };
    let handler = Arc::new(FailingHandler {
        executions: AtomicU32::new(0),
    });
    let (manager, _store, queue) =
        build_manager(config, Arc::clone(&handler) as Arc<dyn JobHandler>);
    manager.start().await.unwrap();

    let id = manager.submit_task("acct-1", Payload::empty()).await.unwrap();

    // Retry delays are a few ms; sweep the schedule by hand instead of
    // waiting out the background interval.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        manager.requeue_due_retries().await.unwrap();
        let task = manager.get_task(&id).await.unwrap();
        if task.status == TaskStatus::Failed {
            break;
        }
        if Instant::now() > deadline {
            panic!("task never reached Failed, still {}", task.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let task = manager.get_task(&id).await.unwrap();
    assert_eq!(task.attempts, 2);
    assert_eq!(handler.executions.load(Ordering::SeqCst), 3);
    assert!(task
        .error_message
        .as_deref()
        .unwrap()
        .contains("simulated handler failure"));
    assert!(task.failed_at.is_some());
    assert_eq!(queue.dlq_len().await.unwrap(), 1);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unschedulable_retry_is_dead_lettered_and_manually_retryable() {
    let config = Config {
        worker_count: 1,
        ..test_config()
    };
    let handler = Arc::new(FailingHandler {
        executions: AtomicU32::new(0),
    });
    let store = Arc::new(MemoryStore::new());
    let broker: Arc<dyn Broker> = Arc::new(SortedSetFailBroker {
        inner: MemoryBroker::new(),
    });
    let queue = TaskQueue::new(Arc::clone(&broker), config.queue_keys());
    let manager = TaskManager::new(
        config,
        Arc::clone(&store) as Arc<dyn TaskStore>,
        broker,
        Arc::clone(&handler) as Arc<dyn JobHandler>,
    )
    .unwrap();
    manager.start().await.unwrap();

    let id = manager.submit_task("acct-1", Payload::empty()).await.unwrap();

    // Retries remained, but the schedule write failed. The row must not
    // linger Queued with no queue entry and no schedule entry, where
    // neither the sweep nor orphan recovery would ever find it; it goes
    // to the DLQ instead.
    let task = wait_for_status(&manager, &id, TaskStatus::Failed, Duration::from_secs(5)).await;
    manager.shutdown().await.unwrap();

    assert_eq!(task.attempts, 1);
    assert_eq!(handler.executions.load(Ordering::SeqCst), 1);
    assert!(task
        .error_message
        .as_deref()
        .unwrap()
        .contains("simulated handler failure"));
    assert_eq!(queue.dlq_len().await.unwrap(), 1);
    assert_eq!(queue.retry_scheduled_len().await.unwrap(), 0);
    assert_eq!(queue.tier_len(PriorityTier::Normal).await.unwrap(), 0);

    // Failed is a state manual retry accepts, unlike stranded-Queued.
    let retried = manager.retry_task(&id).await.unwrap();
    assert_eq!(retried.status, TaskStatus::Queued);
    assert_eq!(retried.attempts, 0);
    assert!(retried.error_message.is_none());
    assert_eq!(queue.dlq_len().await.unwrap(), 0);
    assert_eq!(queue.tier_len(PriorityTier::Normal).await.unwrap(), 1);
}

#[tokio::test]
async fn test_canceled_task_is_never_executed() {
    let handler = Arc::new(CountingHandler::default());
    let (manager, _store, queue) =
        build_manager(test_config(), Arc::clone(&handler) as Arc<dyn JobHandler>);

    let id = manager.submit_task("acct-1", Payload::empty()).await.unwrap();
    manager.cancel_task(&id).await.unwrap();
    assert_eq!(queue.tier_len(PriorityTier::Normal).await.unwrap(), 0);

    // Workers coming up afterwards find nothing to claim.
    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let task = manager.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);
    assert_eq!(handler.executions_for(&id), 0);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_recovered_orphan_executes_again() {
    let handler = Arc::new(CountingHandler::default());
    let (manager, store, _queue) =
        build_manager(test_config(), Arc::clone(&handler) as Arc<dyn JobHandler>);

    // A row left Processing by a worker that died without a trace.
    let mut orphan = TaskRecord::new("acct-1", Payload::empty(), 5, 3);
    orphan.mark_queued();
    orphan.mark_processing("worker-gone");
    orphan.last_heartbeat_at = Some(chrono::Utc::now() - chrono::Duration::seconds(600));
    store.create(&orphan).await.unwrap();

    manager.start().await.unwrap();
    assert_eq!(manager.recover_orphaned_tasks().await.unwrap(), 1);

    let task = wait_for_status(
        &manager,
        &orphan.id,
        TaskStatus::Completed,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(task.attempts, 1);
    assert_eq!(handler.executions_for(&orphan.id), 1);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_submissions_execute_exactly_once() {
    let config = Config {
        worker_count: 4,
        ..test_config()
    };
    let handler = Arc::new(CountingHandler::default());
    let (manager, _store, _queue) =
        build_manager(config, Arc::clone(&handler) as Arc<dyn JobHandler>);
    manager.start().await.unwrap();

    let mut ids = Vec::new();
    for i in 0..20 {
        let priority = if i % 3 == 0 { 15 } else { 5 };
        let id = manager
            .submit_task_with_priority("acct-1", Payload::empty(), priority)
            .await
            .unwrap();
        ids.push(id);
    }

    for id in &ids {
        wait_for_status(&manager, id, TaskStatus::Completed, Duration::from_secs(5)).await;
    }
    for id in &ids {
        assert_eq!(handler.executions_for(id), 1, "task {} ran more than once", id);
    }

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_task() {
    let config = Config {
        worker_count: 1,
        ..test_config()
    };
    let handler = Arc::new(SlowHandler {
        delay: Duration::from_millis(300),
    });
    let (manager, _store, _queue) = build_manager(config, handler);
    manager.start().await.unwrap();

    let id = manager.submit_task("acct-1", Payload::empty()).await.unwrap();
    wait_for_status(&manager, &id, TaskStatus::Processing, Duration::from_secs(2)).await;

    manager.shutdown().await.unwrap();

    let task = manager.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_timed_out_task_is_dead_lettered() {
    let config = Config {
        worker_count: 1,
        max_retries: 0,
        task_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let handler = Arc::new(SlowHandler {
        delay: Duration::from_secs(30),
    });
    let (manager, _store, queue) = build_manager(config, handler);
    manager.start().await.unwrap();

    let id = manager.submit_task("acct-1", Payload::empty()).await.unwrap();

    let task = wait_for_status(&manager, &id, TaskStatus::Failed, Duration::from_secs(5)).await;
    assert!(task.error_message.as_deref().unwrap().contains("timed out"));
    assert_eq!(queue.dlq_len().await.unwrap(), 1);

    manager.shutdown().await.unwrap();
}
