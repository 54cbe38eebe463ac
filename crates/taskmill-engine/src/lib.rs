//! Priority-aware, retrying, crash-recoverable task queue engine.
//!
//! This crate provides:
//! - `TaskManager`: submission, query, cancel, manual retry, stats,
//!   lifecycle, and orphan recovery over a store + broker pair
//! - A polling worker pool with distributed locks, heartbeats, and
//!   per-attempt timeouts
//! - Background loops for retry requeueing and DLQ depth watching
//! - The `TaskStore` trait with an in-memory implementation
//! - The `JobHandler` trait callers implement with the actual work

pub mod config;
pub mod error;
pub mod handler;
pub mod manager;
pub mod metrics;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use config::Config;
pub use error::{EngineError, EngineResult};
pub use handler::{JobContext, JobHandler};
pub use manager::TaskManager;
pub use metrics::WorkerMetrics;
pub use scheduler::{DlqWatch, RetryScheduler, DLQ_WATCH_INTERVAL, RETRY_SCHEDULER_INTERVAL};
pub use store::{MemoryStore, StoreError, StoreResult, TaskStore};
pub use worker::Worker;

// Re-export the surface types so engine callers need not name the
// sibling crates for common use.
pub use taskmill_models::{
    Payload, PriorityTier, TaskEvent, TaskEventKind, TaskFilter, TaskId, TaskRecord, TaskStats,
    TaskStatus, WorkerStatsSnapshot,
};
pub use taskmill_queue::{Broker, EventStream, MemoryBroker, RedisBroker};
