//! Engine walkthrough over the in-memory broker and store.
//!
//! Run with `cargo run --example demo`. Submits a high-priority task and
//! a flaky one, sweeps the retry schedule by hand, and prints the final
//! states and stats.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use taskmill_engine::{Config, JobContext, JobHandler, MemoryStore, TaskManager, TaskStatus};
use taskmill_models::Payload;
use taskmill_queue::MemoryBroker;

struct DemoHandler;

#[async_trait]
impl JobHandler for DemoHandler {
    async fn handle(&self, ctx: JobContext, payload: Payload) -> anyhow::Result<Payload> {
        let request: serde_json::Value = payload.to_json()?;
        info!(task_id = %ctx.task_id, attempt = ctx.attempt, "Handling {}", request);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let flaky = request
            .get("flaky")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if flaky && ctx.attempt == 1 {
            anyhow::bail!("transient failure on first attempt");
        }

        Payload::from_json(&serde_json::json!({
            "handled": request,
            "worker": ctx.worker_id,
        }))
        .map_err(Into::into)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter =
        EnvFilter::from_default_env().add_directive("taskmill=info".parse().unwrap());
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(true).with_target(true))
        .with(env_filter)
        .init();

    info!("Starting taskmill demo");

    let config = Config {
        worker_count: 2,
        initial_retry_delay: Duration::from_secs(1),
        ..Config::from_env()
    };

    let manager = TaskManager::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryBroker::new()),
        Arc::new(DemoHandler),
    )?;
    manager.start().await?;

    let fast = manager
        .submit_task_with_priority(
            "acct-demo",
            Payload::from_json(&serde_json::json!({ "n": 1 }))?,
            15,
        )
        .await?;
    let flaky = manager
        .submit_task(
            "acct-demo",
            Payload::from_json(&serde_json::json!({ "n": 2, "flaky": true }))?,
        )
        .await?;
    info!(%fast, %flaky, "Submitted demo tasks");

    // The flaky task schedules a retry 1s out; sweep it by hand rather
    // than waiting on the background interval.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let swept = manager.requeue_due_retries().await?;
    info!(swept, "Swept retry schedule");
    tokio::time::sleep(Duration::from_millis(500)).await;

    for id in [&fast, &flaky] {
        let task = manager.get_task(id).await?;
        info!(
            task_id = %task.id,
            status = %task.status,
            attempts = task.attempts,
            "Final state"
        );
    }

    let stats = manager.get_stats().await?;
    info!(
        completed = stats
            .status_counts
            .get(&TaskStatus::Completed)
            .copied()
            .unwrap_or(0),
        queued = stats.total_queued(),
        dlq = stats.dlq_len,
        "Engine stats"
    );
    let workers = manager.get_worker_stats();
    info!(
        processed = workers.processed_total,
        failed = workers.failed_total,
        "Worker stats"
    );

    manager.shutdown().await?;
    info!("Demo complete");
    Ok(())
}
