//! Service configuration.

use std::path::PathBuf;
use std::time::Duration;

use squish_queue::Priority;

/// Job service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root that every ingested source file must resolve under
    pub upload_root: PathBuf,
    /// Root for processed outputs
    pub output_root: PathBuf,
    /// Retention window applied to new jobs
    pub job_retention: Duration,
    /// Interval between retention sweeps
    pub sweep_interval: Duration,
    /// Records purged per sweep batch
    pub sweep_batch_size: usize,
    /// Priority used by `enqueue`/`resume` when the caller passes none
    pub default_priority: Priority,
    /// Largest accepted upload in bytes
    pub max_upload_bytes: u64,
    /// Enqueue attempts before compensating
    pub enqueue_retries: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            upload_root: PathBuf::from("./data/uploads"),
            output_root: PathBuf::from("./data/output"),
            job_retention: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(300),
            sweep_batch_size: 100,
            default_priority: Priority::default(),
            max_upload_bytes: 2 * 1024 * 1024 * 1024, // 2 GiB
            enqueue_retries: 3,
        }
    }
}

impl ServiceConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            upload_root: std::env::var("UPLOAD_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_root),
            output_root: std::env::var("OUTPUT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_root),
            job_retention: retention_hours(
                std::env::var("JOB_RETENTION_HOURS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(24),
            ),
            sweep_interval: Duration::from_secs(
                std::env::var("RETENTION_SWEEP_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            sweep_batch_size: defaults.sweep_batch_size,
            default_priority: std::env::var("DEFAULT_PRIORITY")
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .map(Priority::saturating)
                .unwrap_or_default(),
            max_upload_bytes: std::env::var("MAX_UPLOAD_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_upload_bytes),
            enqueue_retries: defaults.enqueue_retries,
        }
    }

    pub fn with_roots(mut self, upload_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        self.upload_root = upload_root.into();
        self.output_root = output_root.into();
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.job_retention = retention;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_max_upload_bytes(mut self, max: u64) -> Self {
        self.max_upload_bytes = max;
        self
    }

    pub fn with_enqueue_retries(mut self, retries: u32) -> Self {
        self.enqueue_retries = retries;
        self
    }

    /// Retention as a chrono duration for record timestamps.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.job_retention.min(MAX_RETENTION))
            .unwrap_or(chrono::Duration::hours(24))
    }
}

/// Longest retention a job record can carry.
const MAX_RETENTION: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn retention_hours(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(3600)).min(MAX_RETENTION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.job_retention, Duration::from_secs(86_400));
        assert_eq!(config.default_priority.get(), 5);
        assert_eq!(config.retention(), chrono::Duration::hours(24));
    }

    #[test]
    fn test_zero_retention_converts() {
        let config = ServiceConfig::default().with_retention(Duration::ZERO);
        assert_eq!(config.retention(), chrono::Duration::zero());
    }

    #[test]
    fn test_huge_retention_is_capped() {
        assert_eq!(retention_hours(48), Duration::from_secs(48 * 3600));
        assert_eq!(retention_hours(u64::MAX), MAX_RETENTION);

        let config = ServiceConfig::default().with_retention(Duration::MAX);
        assert_eq!(
            config.retention(),
            chrono::Duration::from_std(MAX_RETENTION).unwrap()
        );
    }
}
