//! Shared data models for the Taskmill queue engine.
//!
//! This crate provides Serde-serializable types for:
//! - Task records and their lifecycle statuses
//! - Priority tiers
//! - Opaque request/result payloads
//! - Queue event envelopes
//! - Statistics snapshots and query filters

pub mod event;
pub mod payload;
pub mod priority;
pub mod stats;
pub mod task;

// Re-export common types
pub use event::{TaskEvent, TaskEventKind};
pub use payload::{Payload, PayloadError};
pub use priority::PriorityTier;
pub use stats::{TaskStats, WorkerStatsSnapshot};
pub use task::{TaskFilter, TaskId, TaskRecord, TaskStatus};
