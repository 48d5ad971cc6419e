//! Shared data models for the Squish job lifecycle manager.
//!
//! This crate provides Serde-serializable types for:
//! - Job records and partial updates
//! - The lifecycle state machine (statuses, transitions, control actions)
//! - Realtime notifier events
//! - User-visible job snapshots

pub mod event;
pub mod job;
pub mod job_status;
pub mod view;

// Re-export common types
pub use event::JobEvent;
pub use job::{
    compression_ratio, FileType, Job, JobId, JobPatch, JobSettings, NewJob, ProgressOutcome,
    TransitionRejected,
};
pub use job_status::{JobAction, JobStatus, Transition, TransitionError};
pub use view::JobView;
