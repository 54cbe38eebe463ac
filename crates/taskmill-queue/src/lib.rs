//! Priority queue topology over a volatile broker.
//!
//! This crate provides:
//! - The `Broker` trait with Redis and in-memory implementations
//! - The derived key namespace for queues, locks, and channels
//! - Tiered FIFO queues, retry scheduling, and the dead-letter list
//! - Lifecycle events via broker pub/sub

pub mod broker;
pub mod error;
pub mod events;
pub mod keys;
pub mod metrics;
pub mod queue;

pub use broker::{Broker, MemoryBroker, MessageStream, RedisBroker};
pub use error::{QueueError, QueueResult};
pub use events::{EventChannel, EventStream};
pub use keys::QueueKeys;
pub use queue::TaskQueue;
