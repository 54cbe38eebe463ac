//! Broker key namespace.
//!
//! Every key the engine touches is derived here from the configured
//! prefix. No other module may hardcode a key string.

use taskmill_models::{PriorityTier, TaskId};

/// Derives all broker keys from a single configured prefix.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// FIFO list for one priority tier.
    pub fn priority_queue(&self, tier: PriorityTier) -> String {
        format!("{}:queue:priority:{}", self.prefix, tier.as_str())
    }

    /// Dead-letter list.
    pub fn dlq(&self) -> String {
        format!("{}:dlq", self.prefix)
    }

    /// Pub/sub channel for lifecycle events.
    pub fn events_channel(&self) -> String {
        format!("{}:events", self.prefix)
    }

    /// Sorted set of task ids scheduled for retry, scored by unix retry time.
    pub fn retry_scheduled(&self) -> String {
        format!("{}:retry:scheduled", self.prefix)
    }

    /// TTL-bounded exclusivity marker for one task.
    pub fn task_lock(&self, task_id: &TaskId) -> String {
        format!("{}:task:{}:lock", self.prefix, task_id)
    }

    /// Worker-local bookkeeping key holding the task currently claimed.
    pub fn processing(&self, worker_id: &str) -> String {
        format!("{}:processing:{}", self.prefix, worker_id)
    }
}
