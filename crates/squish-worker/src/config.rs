//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent leases
    pub max_concurrent_jobs: usize,
    /// Wall-clock limit for one delegate run
    pub job_timeout: Duration,
    /// Idle wait between lease attempts
    pub poll_interval: Duration,
    /// Lease extension and cancellation checkpoint interval
    pub heartbeat_interval: Duration,
    /// How often expired leases are reclaimed
    pub reclaim_interval: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Root for source files
    pub upload_root: PathBuf,
    /// Root for processed output
    pub output_root: PathBuf,
    /// Name used as lease owner
    pub worker_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            job_timeout: Duration::from_secs(1800), // 30 minutes
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(100),
            reclaim_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            upload_root: PathBuf::from("./data/uploads"),
            output_root: PathBuf::from("./data/output"),
            worker_name: format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    ///
    /// The heartbeat defaults to a third of `QUEUE_VISIBILITY_TIMEOUT`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let visibility_secs: u64 = std::env::var("QUEUE_VISIBILITY_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        Self {
            max_concurrent_jobs: std::env::var("WORKER_MAX_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_concurrent_jobs),
            job_timeout: Duration::from_secs(
                std::env::var("WORKER_JOB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1800),
            ),
            poll_interval: Duration::from_millis(
                std::env::var("WORKER_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(500),
            ),
            heartbeat_interval: Duration::from_secs(
                std::env::var("WORKER_HEARTBEAT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or((visibility_secs / 3).max(1)),
            ),
            reclaim_interval: Duration::from_secs(
                std::env::var("WORKER_RECLAIM_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            upload_root: std::env::var("UPLOAD_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_root),
            output_root: std::env::var("OUTPUT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_root),
            worker_name: std::env::var("WORKER_NAME").unwrap_or(defaults.worker_name),
        }
    }
}
