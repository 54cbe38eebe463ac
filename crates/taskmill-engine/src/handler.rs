//! Job handler boundary.

use std::time::Duration;

use async_trait::async_trait;

use taskmill_models::{Payload, TaskId};

/// What a handler may know about the attempt it is serving.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Task being executed
    pub task_id: TaskId,
    /// Owning account
    pub account_id: String,
    /// Execution attempt number, 1-based
    pub attempt: u32,
    /// Worker running this attempt
    pub worker_id: String,
    /// Deadline for this attempt
    pub timeout: Duration,
}

/// The work itself, supplied once at manager construction.
///
/// Invoked once per execution attempt. Delivery is at-least-once: the
/// same logical task can be handed to a handler more than once (retry,
/// orphan recovery, timeout overlap), so handlers must be idempotent.
/// The engine stores and returns the request and result payloads
/// verbatim and never looks inside them.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, payload: Payload) -> anyhow::Result<Payload>;
}
