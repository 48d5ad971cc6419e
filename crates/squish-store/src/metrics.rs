//! Store metrics collection.

use std::time::Duration;

use metrics::{counter, histogram};

/// Metric name constants for consistency.
pub mod names {
    /// Total store operations by operation and outcome.
    pub const OPERATIONS_TOTAL: &str = "squish_store_operations_total";

    /// Operation latency in seconds by operation.
    pub const LATENCY_SECONDS: &str = "squish_store_latency_seconds";

    /// Compare-and-swap retries caused by concurrent writers.
    pub const CONFLICTS_TOTAL: &str = "squish_store_conflicts_total";
}

/// Record a completed store operation.
pub fn record_operation(operation: &'static str, success: bool, elapsed: Duration) {
    counter!(
        names::OPERATIONS_TOTAL,
        "operation" => operation,
        "outcome" => if success { "ok" } else { "error" }
    )
    .increment(1);

    histogram!(names::LATENCY_SECONDS, "operation" => operation).record(elapsed.as_secs_f64());
}

/// Record a lost compare-and-swap race.
pub fn record_conflict(operation: &'static str) {
    counter!(names::CONFLICTS_TOTAL, "operation" => operation).increment(1);
}
