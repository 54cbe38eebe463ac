//! Durable task store boundary.
//!
//! The engine persists every task state change through this trait. The
//! broker lock serializes writers per task id, so implementations only
//! need to tolerate concurrent writes to different rows.

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use taskmill_models::{TaskId, TaskRecord, TaskStatus};

pub use self::memory::MemoryStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task row.
    async fn create(&self, task: &TaskRecord) -> StoreResult<()>;

    /// Replace an existing row. Fails with `NotFound` if it was never created.
    async fn update(&self, task: &TaskRecord) -> StoreResult<()>;

    /// Set the status, stamping the timestamp that status owns. The error
    /// message is overwritten only when one is supplied.
    async fn update_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        error_message: Option<String>,
    ) -> StoreResult<()>;

    /// Record the claiming worker and its first heartbeat.
    async fn update_worker_info(&self, id: &TaskId, worker_id: &str) -> StoreResult<()>;

    /// Refresh the liveness heartbeat.
    async fn update_heartbeat(&self, id: &TaskId) -> StoreResult<()>;

    /// Record settlement metrics.
    async fn update_metrics(&self, id: &TaskId, processing_ms: u64, queue_ms: u64)
        -> StoreResult<()>;

    async fn get_by_task_id(&self, id: &TaskId) -> StoreResult<Option<TaskRecord>>;

    async fn get_by_account_id(&self, account_id: &str) -> StoreResult<Vec<TaskRecord>>;

    async fn get_by_status(&self, status: TaskStatus) -> StoreResult<Vec<TaskRecord>>;

    /// Most recently created rows, newest first.
    async fn get_recent_tasks(&self, limit: usize) -> StoreResult<Vec<TaskRecord>>;

    async fn count_by_status(&self, status: TaskStatus) -> StoreResult<u64>;

    async fn count_completed_since(&self, since: DateTime<Utc>) -> StoreResult<u64>;

    async fn count_failed_since(&self, since: DateTime<Utc>) -> StoreResult<u64>;

    /// Mean `processing_ms` across settled rows, in milliseconds.
    async fn get_average_processing_time(&self) -> StoreResult<f64>;

    /// Mean `queue_ms` across settled rows, in milliseconds.
    async fn get_average_queue_time(&self) -> StoreResult<f64>;

    /// Processing rows whose heartbeat is older than the cutoff. A
    /// Processing row with no heartbeat at all counts as orphaned.
    async fn find_orphaned_tasks(&self, older_than: DateTime<Utc>) -> StoreResult<Vec<TaskRecord>>;
}
