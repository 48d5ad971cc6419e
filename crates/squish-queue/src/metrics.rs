//! Queue and notifier metrics.

use metrics::{counter, gauge};

use crate::item::QueueStats;

/// Metric name constants for consistency.
pub mod names {
    pub const ENQUEUED_TOTAL: &str = "squish_queue_enqueued_total";
    pub const LEASED_TOTAL: &str = "squish_queue_leased_total";
    pub const ACKED_TOTAL: &str = "squish_queue_acked_total";
    /// Redeliveries after nack or lease expiry.
    pub const REDELIVERED_TOTAL: &str = "squish_queue_redelivered_total";
    pub const DEAD_LETTERED_TOTAL: &str = "squish_queue_dead_lettered_total";
    /// Queue depth by state.
    pub const DEPTH: &str = "squish_queue_depth";
    /// Events dropped because the notifier channel was full.
    pub const EVENTS_DROPPED_TOTAL: &str = "squish_events_dropped_total";
}

pub fn record_enqueued() {
    counter!(names::ENQUEUED_TOTAL).increment(1);
}

pub fn record_leased(count: usize) {
    counter!(names::LEASED_TOTAL).increment(count as u64);
}

pub fn record_acked() {
    counter!(names::ACKED_TOTAL).increment(1);
}

pub fn record_redelivered(reason: &'static str) {
    counter!(names::REDELIVERED_TOTAL, "reason" => reason).increment(1);
}

pub fn record_dead_lettered() {
    counter!(names::DEAD_LETTERED_TOTAL).increment(1);
}

pub fn record_event_dropped() {
    counter!(names::EVENTS_DROPPED_TOTAL).increment(1);
}

/// Publish queue depth gauges.
pub fn record_stats(stats: &QueueStats) {
    gauge!(names::DEPTH, "state" => "waiting").set(stats.waiting as f64);
    gauge!(names::DEPTH, "state" => "active").set(stats.active as f64);
    gauge!(names::DEPTH, "state" => "delayed").set(stats.delayed as f64);
    gauge!(names::DEPTH, "state" => "failed").set(stats.failed as f64);
}
