//! Realtime notifier events.
//!
//! Events are best-effort hints. Observers that miss one re-fetch the job
//! record, which stays authoritative.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::job_status::JobStatus;

/// Event envelope published per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// Progress update (0-100)
    Progress {
        #[serde(rename = "jobId")]
        job_id: JobId,
        value: u8,
        timestamp: DateTime<Utc>,
    },

    /// Status transition applied to the record
    StatusChanged {
        #[serde(rename = "jobId")]
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Record and files removed
    Deleted {
        #[serde(rename = "jobId")]
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Create a progress event.
    pub fn progress(job_id: JobId, value: u8) -> Self {
        JobEvent::Progress {
            job_id,
            value: value.min(100),
            timestamp: Utc::now(),
        }
    }

    /// Create a status change event.
    pub fn status_changed(job_id: JobId, from: JobStatus, to: JobStatus) -> Self {
        JobEvent::StatusChanged {
            job_id,
            from,
            to,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach an error summary to a status change.
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        if let JobEvent::StatusChanged { error, .. } = &mut self {
            *error = Some(message.into());
        }
        self
    }

    /// Create a deletion event.
    pub fn deleted(job_id: JobId) -> Self {
        JobEvent::Deleted {
            job_id,
            timestamp: Utc::now(),
        }
    }

    /// When the event was raised, always after the store write it reports.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::Progress { timestamp, .. }
            | JobEvent::StatusChanged { timestamp, .. }
            | JobEvent::Deleted { timestamp, .. } => *timestamp,
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::Progress { job_id, .. }
            | JobEvent::StatusChanged { job_id, .. }
            | JobEvent::Deleted { job_id, .. } => job_id,
        }
    }
}
