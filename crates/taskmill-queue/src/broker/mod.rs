//! Volatile broker abstraction.
//!
//! The engine talks to its queue substrate through this trait only. Five
//! primitive families are required: FIFO lists, set-if-absent with TTL,
//! sorted sets, publish/subscribe, and key deletion. [`RedisBroker`] is the
//! production implementation; [`MemoryBroker`] backs tests and local runs.
//!
//! FIFO is a contract of this trait, not an accident of the backend:
//! `push_front` adds at the head, `pop_back` removes at the tail, so ids
//! come off a queue in submission order. Both implementations are tested
//! against that ordering.

mod memory;
mod redis;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::QueueResult;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// Stream of raw payloads from a subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Push a value at the head of a list.
    async fn push_front(&self, list: &str, value: &str) -> QueueResult<()>;

    /// Pop the value at the tail of a list, if any.
    async fn pop_back(&self, list: &str) -> QueueResult<Option<String>>;

    /// Remove all occurrences of a value from a list. Returns the number
    /// of entries removed (zero when the value was not present).
    async fn remove_from_list(&self, list: &str, value: &str) -> QueueResult<u64>;

    /// Current length of a list.
    async fn list_len(&self, list: &str) -> QueueResult<u64>;

    /// Set a key only if it does not exist, with a TTL. Returns `true`
    /// when the key was set, `false` when it was already held.
    async fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<bool>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> QueueResult<()>;

    /// Add a member to a sorted set with the given score, replacing any
    /// previous score for that member.
    async fn zadd(&self, set: &str, member: &str, score: f64) -> QueueResult<()>;

    /// Members with score at most `max_score`, ascending by score.
    async fn zrange_by_score_upto(&self, set: &str, max_score: f64) -> QueueResult<Vec<String>>;

    /// Remove a member from a sorted set. Returns `true` when it was present.
    async fn zrem(&self, set: &str, member: &str) -> QueueResult<bool>;

    /// Publish a payload on a channel. Fire-and-forget.
    async fn publish(&self, channel: &str, payload: &str) -> QueueResult<()>;

    /// Subscribe to a channel, receiving payloads published after the call.
    async fn subscribe(&self, channel: &str) -> QueueResult<MessageStream>;

    /// Release broker resources. Called once on clean shutdown.
    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }
}
