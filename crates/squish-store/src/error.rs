//! Store error types.

use squish_models::{JobId, JobStatus, TransitionError, TransitionRejected};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job already exists: {0}")]
    AlreadyExists(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(#[from] TransitionError),

    #[error("Stale attempt {expected} for job {job_id} (current attempt {actual}, status {status})")]
    StaleAttempt {
        job_id: String,
        expected: u32,
        actual: u32,
        status: JobStatus,
    },

    #[error("Write contention on job {0}")]
    Contention(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn already_exists(id: &JobId) -> Self {
        Self::AlreadyExists(id.to_string())
    }

    pub fn not_found(id: &JobId) -> Self {
        Self::NotFound(id.to_string())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn rejected(id: &JobId, rejection: TransitionRejected) -> Self {
        match rejection {
            TransitionRejected::Illegal(err) => Self::InvalidTransition(err),
            TransitionRejected::StaleAttempt {
                expected,
                actual,
                status,
            } => Self::StaleAttempt {
                job_id: id.to_string(),
                expected,
                actual,
                status,
            },
        }
    }

    /// Check if the caller may retry the operation.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Contention(_) => true,
            StoreError::Redis(e) => {
                e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
            }
            _ => false,
        }
    }

    /// Check if the error is a lifecycle conflict (illegal edge or duplicate create).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyExists(_) | StoreError::InvalidTransition(_)
        )
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, StoreError::StaleAttempt { .. })
    }
}
