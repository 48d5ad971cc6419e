//! Worker metrics and the Prometheus exporter.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_TOTAL: &str = "squish_worker_jobs_total";
    pub const JOB_DURATION_SECONDS: &str = "squish_worker_job_duration_seconds";
    pub const JOBS_ACTIVE: &str = "squish_worker_jobs_active";
    pub const COMPRESSION_RATIO: &str = "squish_worker_compression_ratio";
    pub const JOBS_ABANDONED_TOTAL: &str = "squish_worker_jobs_abandoned_total";
}

/// Serve `/metrics` on `addr` and install the global recorder.
pub fn install_exporter(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()
}

/// Record the end of one lease.
pub fn record_outcome(outcome: &str, elapsed: Duration) {
    let labels = [("outcome", outcome.to_string())];
    counter!(names::JOBS_TOTAL, &labels).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, &labels).record(elapsed.as_secs_f64());
}

pub fn record_compression(file_type: &str, ratio: i64) {
    histogram!(names::COMPRESSION_RATIO, "file_type" => file_type.to_string()).record(ratio as f64);
}

pub fn record_abandoned() {
    counter!(names::JOBS_ABANDONED_TOTAL).increment(1);
}

pub fn set_active_jobs(count: usize) {
    gauge!(names::JOBS_ACTIVE).set(count as f64);
}
