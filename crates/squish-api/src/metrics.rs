//! Service metrics.

use metrics::counter;

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_INGESTED_TOTAL: &str = "squish_api_jobs_ingested_total";
    pub const TRANSITIONS_TOTAL: &str = "squish_api_transitions_total";
    pub const SECURITY_VIOLATIONS_TOTAL: &str = "squish_api_security_violations_total";
    pub const JOBS_PURGED_TOTAL: &str = "squish_api_jobs_purged_total";
}

pub fn record_ingested(file_type: &str) {
    counter!(names::JOBS_INGESTED_TOTAL, "file_type" => file_type.to_string()).increment(1);
}

/// Record a control action and whether it was applied.
pub fn record_transition(action: &str, outcome: &str) {
    counter!(
        names::TRANSITIONS_TOTAL,
        "action" => action.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_security_violation(operation: &'static str) {
    counter!(names::SECURITY_VIOLATIONS_TOTAL, "operation" => operation).increment(1);
}

/// Record purged jobs by reason (`deleted` or `expired`).
pub fn record_purged(reason: &'static str, count: u64) {
    counter!(names::JOBS_PURGED_TOTAL, "reason" => reason).increment(count);
}
