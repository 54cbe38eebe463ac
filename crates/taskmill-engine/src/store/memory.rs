//! In-memory task store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use taskmill_models::{TaskId, TaskRecord, TaskStatus};

use super::{StoreError, StoreResult, TaskStore};

/// Store over a process-local map, for tests and single-node runs.
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows held. Test hook.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create(&self, task: &TaskRecord) -> StoreResult<()> {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update(&self, task: &TaskRecord) -> StoreResult<()> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(&task.id) {
            return Err(StoreError::not_found(task.id.as_str()));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        error_message: Option<String>,
    ) -> StoreResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(id.as_str()))?;

        let now = Utc::now();
        task.status = status;
        match status {
            TaskStatus::Queued => task.queued_at = Some(now),
            TaskStatus::Processing => task.started_at = Some(now),
            TaskStatus::Completed => task.completed_at = Some(now),
            TaskStatus::Failed => task.failed_at = Some(now),
            TaskStatus::Pending | TaskStatus::Canceled => {}
        }
        if let Some(msg) = error_message {
            task.error_message = Some(msg);
        }
        Ok(())
    }

    async fn update_worker_info(&self, id: &TaskId, worker_id: &str) -> StoreResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(id.as_str()))?;
        task.worker_id = Some(worker_id.to_string());
        task.last_heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn update_heartbeat(&self, id: &TaskId) -> StoreResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(id.as_str()))?;
        task.last_heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn update_metrics(
        &self,
        id: &TaskId,
        processing_ms: u64,
        queue_ms: u64,
    ) -> StoreResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(id.as_str()))?;
        task.processing_ms = Some(processing_ms);
        task.queue_ms = Some(queue_ms);
        Ok(())
    }

    async fn get_by_task_id(&self, id: &TaskId) -> StoreResult<Option<TaskRecord>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(id).cloned())
    }

    async fn get_by_account_id(&self, account_id: &str) -> StoreResult<Vec<TaskRecord>> {
        let tasks = self.tasks.read().await;
        let mut rows: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn get_by_status(&self, status: TaskStatus) -> StoreResult<Vec<TaskRecord>> {
        let tasks = self.tasks.read().await;
        let mut rows: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn get_recent_tasks(&self, limit: usize) -> StoreResult<Vec<TaskRecord>> {
        let tasks = self.tasks.read().await;
        let mut rows: Vec<TaskRecord> = tasks.values().cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn count_by_status(&self, status: TaskStatus) -> StoreResult<u64> {
        let tasks = self.tasks.read().await;
        Ok(tasks.values().filter(|t| t.status == status).count() as u64)
    }

    async fn count_completed_since(&self, since: DateTime<Utc>) -> StoreResult<u64> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.completed_at.map(|at| at >= since).unwrap_or(false))
            .count() as u64)
    }

    async fn count_failed_since(&self, since: DateTime<Utc>) -> StoreResult<u64> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.failed_at.map(|at| at >= since).unwrap_or(false))
            .count() as u64)
    }

    async fn get_average_processing_time(&self) -> StoreResult<f64> {
        let tasks = self.tasks.read().await;
        let samples: Vec<u64> = tasks.values().filter_map(|t| t.processing_ms).collect();
        if samples.is_empty() {
            return Ok(0.0);
        }
        Ok(samples.iter().sum::<u64>() as f64 / samples.len() as f64)
    }

    async fn get_average_queue_time(&self) -> StoreResult<f64> {
        let tasks = self.tasks.read().await;
        let samples: Vec<u64> = tasks.values().filter_map(|t| t.queue_ms).collect();
        if samples.is_empty() {
            return Ok(0.0);
        }
        Ok(samples.iter().sum::<u64>() as f64 / samples.len() as f64)
    }

    async fn find_orphaned_tasks(&self, older_than: DateTime<Utc>) -> StoreResult<Vec<TaskRecord>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Processing
                    && t.last_heartbeat_at
                        .map(|at| at < older_than)
                        .unwrap_or(true)
            })
            .cloned()
            .collect())
    }
}
