//! Job lifecycle state machine.
//!
//! Every status change goes through [`Transition::apply`]. The table encoded
//! here is the only mutation path for [`JobStatus`]; anything else is rejected
//! with a [`TransitionError`] naming both the current and requested states.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Job processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// File ingested, not yet scheduled
    #[default]
    Uploaded,
    /// Waiting in the work queue
    Queued,
    /// A worker holds the lease and the delegate is running
    Processing,
    /// Paused by request; resuming restarts from scratch
    Paused,
    /// Output produced successfully
    Completed,
    /// Delegate failed; may be retried
    Error,
    /// Cancelled by request
    Cancelled,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Uploaded,
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Paused,
        JobStatus::Completed,
        JobStatus::Error,
        JobStatus::Cancelled,
    ];

    /// Get string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Uploaded => "uploaded",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Check if this is a terminal state (no worker activity expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled
        )
    }

    /// Check if the status accepts no further transition at all.
    pub fn is_final(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// Control actions that are currently legal from this status.
    pub fn legal_actions(&self) -> Vec<JobAction> {
        JobAction::ALL
            .into_iter()
            .filter(|action| Transition::from(*action).allowed_from().contains(self))
            .collect()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// Control actions exposed to external callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Enqueue,
    Pause,
    Resume,
    Cancel,
    Retry,
}

impl JobAction {
    pub const ALL: [JobAction; 5] = [
        JobAction::Enqueue,
        JobAction::Pause,
        JobAction::Resume,
        JobAction::Cancel,
        JobAction::Retry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Enqueue => "enqueue",
            JobAction::Pause => "pause",
            JobAction::Resume => "resume",
            JobAction::Cancel => "cancel",
            JobAction::Retry => "retry",
        }
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobAction::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| format!("unknown job action: {s}"))
    }
}

/// Every edge of the lifecycle graph, external and internal.
///
/// `Start`, `Complete` and `Fail` are driven by the dispatcher. `Reclaim`
/// re-acquires a `processing` job whose previous lease expired, and `Abandon`
/// records a job whose queue attempts were exhausted; both are worker-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Enqueue,
    Start,
    Reclaim,
    Complete,
    Fail,
    Abandon,
    Pause,
    Resume,
    Retry,
    Cancel,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Enqueue => "enqueue",
            Transition::Start => "start",
            Transition::Reclaim => "reclaim",
            Transition::Complete => "complete",
            Transition::Fail => "fail",
            Transition::Abandon => "abandon",
            Transition::Pause => "pause",
            Transition::Resume => "resume",
            Transition::Retry => "retry",
            Transition::Cancel => "cancel",
        }
    }

    /// Statuses this transition may be applied from.
    pub fn allowed_from(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Transition::Enqueue => &[Uploaded],
            Transition::Start => &[Queued],
            Transition::Reclaim => &[Processing],
            Transition::Complete | Transition::Fail | Transition::Pause => &[Processing],
            Transition::Abandon => &[Queued, Processing],
            Transition::Resume => &[Paused],
            Transition::Retry => &[Error],
            Transition::Cancel => &[Uploaded, Queued, Processing, Paused, Error],
        }
    }

    /// Status reached by this transition.
    ///
    /// `Retry` lands on `uploaded`; the caller then applies `Enqueue`.
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Enqueue | Transition::Resume => JobStatus::Queued,
            Transition::Start | Transition::Reclaim => JobStatus::Processing,
            Transition::Complete => JobStatus::Completed,
            Transition::Fail | Transition::Abandon => JobStatus::Error,
            Transition::Pause => JobStatus::Paused,
            Transition::Retry => JobStatus::Uploaded,
            Transition::Cancel => JobStatus::Cancelled,
        }
    }

    /// Whether progress is reset to 0 in the same update.
    pub fn resets_progress(&self) -> bool {
        matches!(
            self,
            Transition::Enqueue
                | Transition::Start
                | Transition::Reclaim
                | Transition::Resume
                | Transition::Retry
        )
    }

    /// Whether this transition opens a new processing attempt.
    pub fn opens_attempt(&self) -> bool {
        matches!(self, Transition::Start | Transition::Reclaim)
    }

    /// Whether this transition discards previous output and error fields.
    pub fn clears_outcome(&self) -> bool {
        matches!(self, Transition::Retry)
    }

    /// Validate the edge and return the resulting status.
    pub fn apply(&self, current: JobStatus) -> Result<JobStatus, TransitionError> {
        if self.allowed_from().contains(&current) {
            Ok(self.target())
        } else {
            Err(TransitionError {
                current,
                requested: *self,
            })
        }
    }
}

impl From<JobAction> for Transition {
    fn from(action: JobAction) -> Self {
        match action {
            JobAction::Enqueue => Transition::Enqueue,
            JobAction::Pause => Transition::Pause,
            JobAction::Resume => Transition::Resume,
            JobAction::Cancel => Transition::Cancel,
            JobAction::Retry => Transition::Retry,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An edge that is not part of the lifecycle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {requested} a job that is {current}")]
pub struct TransitionError {
    pub current: JobStatus,
    pub requested: Transition,
}
