//! Work queue contract and configuration.

use std::time::Duration;

use async_trait::async_trait;

use squish_models::JobId;

use crate::backoff::BackoffPolicy;
use crate::error::QueueResult;
use crate::item::{Lease, Priority, QueueStats, Released};

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Key prefix for queue structures
    pub prefix: String,
    /// Deliveries per job reference before it is dead-lettered
    pub max_attempts: u32,
    /// Lease visibility timeout
    pub visibility_timeout: Duration,
    /// Redelivery backoff
    pub backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            prefix: "squish:queue".to_string(),
            max_attempts: 5,
            visibility_timeout: Duration::from_secs(300), // 5 minutes
            backoff: BackoffPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            prefix: std::env::var("QUEUE_PREFIX").unwrap_or_else(|_| "squish:queue".to_string()),
            max_attempts: std::env::var("QUEUE_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            visibility_timeout: Duration::from_secs(
                std::env::var("QUEUE_VISIBILITY_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            backoff: BackoffPolicy::new(
                Duration::from_millis(
                    std::env::var("QUEUE_BACKOFF_BASE_MS")
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(1000),
                ),
                Duration::from_millis(
                    std::env::var("QUEUE_BACKOFF_MAX_MS")
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(60_000),
                ),
            ),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Priority queue of job references with at-least-once, leased delivery.
///
/// The queue only carries job ids. At most one lease per job id is active at
/// any time; a reference enqueued while its job still has an active lease
/// waits until that lease is released.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Add a job reference. Returns `false` if it is already waiting.
    async fn enqueue(&self, job_id: &JobId, priority: Priority) -> QueueResult<bool>;

    /// Lease up to `max` ready items, highest priority first, FIFO within a priority.
    async fn lease(&self, worker: &str, max: usize) -> QueueResult<Vec<Lease>>;

    /// Complete a lease. Returns `false` if the lease was already lost.
    async fn ack(&self, lease: &Lease) -> QueueResult<bool>;

    /// Give a lease back for redelivery with backoff. `None` if it was already lost.
    async fn nack(&self, lease: &Lease) -> QueueResult<Option<Released>>;

    /// Push the lease deadline out by one visibility timeout. `false` if lost.
    async fn extend(&self, lease: &Lease) -> QueueResult<bool>;

    /// Redeliver or dead-letter every lease whose deadline has passed.
    async fn reclaim_expired(&self) -> QueueResult<Vec<Released>>;

    /// Drop any waiting, delayed or failed reference to `job_id`.
    async fn remove(&self, job_id: &JobId) -> QueueResult<()>;

    /// 0-based rank among waiting items, if waiting.
    async fn position(&self, job_id: &JobId) -> QueueResult<Option<u64>>;

    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Wait until work may be available, or `timeout` elapses.
    async fn wait_for_work(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}
