//! Engine error types.

use thiserror::Error;

use taskmill_models::TaskStatus;
use taskmill_queue::QueueError;

use crate::store::StoreError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Cannot {operation} task {task_id} in state {status}")]
    InvalidState {
        task_id: String,
        status: TaskStatus,
        operation: String,
    },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn task_not_found(id: impl Into<String>) -> Self {
        Self::TaskNotFound(id.into())
    }

    pub fn invalid_state(
        task_id: impl Into<String>,
        status: TaskStatus,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            task_id: task_id.into(),
            status,
            operation: operation.into(),
        }
    }

    pub fn shutdown(msg: impl Into<String>) -> Self {
        Self::Shutdown(msg.into())
    }
}
