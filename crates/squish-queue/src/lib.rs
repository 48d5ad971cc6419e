//! Work queue and realtime events for Squish.
//!
//! This crate provides:
//! - The [`WorkQueue`] contract: priority ordering, leases with a visibility
//!   timeout, redelivery with backoff and dead-lettering
//! - In-process and Redis implementations
//! - A pure [`BackoffPolicy`] and an async retry helper
//! - The realtime [`Notifier`] with in-process and Redis pub/sub transports

pub mod backoff;
pub mod error;
pub mod item;
pub mod memory;
pub mod metrics;
pub mod notifier;
pub mod queue;
pub mod redis_queue;
pub mod retry;

pub use backoff::BackoffPolicy;
pub use error::{QueueError, QueueResult};
pub use item::{Lease, Priority, QueueStats, Redelivery, Released};
pub use memory::MemoryQueue;
pub use notifier::{EventHub, EventSink, EventSource, EventStream, Notifier, RedisEventBus};
pub use queue::{QueueConfig, WorkQueue};
pub use redis_queue::RedisQueue;
pub use retry::{retry_async, FailureTracker, RetryConfig, RetryResult};
