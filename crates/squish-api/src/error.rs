//! Service error types and the caller-facing failure shape.

use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use squish_models::{JobAction, JobStatus};
use squish_queue::QueueError;
use squish_storage::StorageError;
use squish_store::StoreError;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors returned by the job service.
///
/// Messages are written for external callers. Infrastructure details are
/// logged where the error is converted and never carried in the message.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        current: Option<JobStatus>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {message}")]
    Conflict {
        message: String,
        current: Option<JobStatus>,
    },

    #[error("Security violation: {0}")]
    SecurityViolation(String),

    #[error("Service temporarily unavailable: {0}")]
    TransientInfra(String),

    #[error("Processing error: {message}")]
    Processing {
        message: String,
        current: Option<JobStatus>,
    },
}

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            current: None,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
            current: None,
        }
    }

    pub fn security_violation(msg: impl Into<String>) -> Self {
        Self::SecurityViolation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientInfra(msg.into())
    }

    pub fn processing(msg: impl Into<String>) -> Self {
        Self::Processing {
            message: msg.into(),
            current: None,
        }
    }

    /// Attach the job's current status, for variants that report it.
    pub fn at(mut self, status: JobStatus) -> Self {
        match &mut self {
            Self::Validation { current, .. }
            | Self::Conflict { current, .. }
            | Self::Processing { current, .. } => *current = Some(status),
            _ => {}
        }
        self
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Validation { .. } => FailureKind::Validation,
            Self::NotFound(_) => FailureKind::NotFound,
            Self::Conflict { .. } => FailureKind::Conflict,
            Self::SecurityViolation(_) => FailureKind::SecurityViolation,
            Self::TransientInfra(_) => FailureKind::TransientInfra,
            Self::Processing { .. } => FailureKind::Processing,
        }
    }

    /// Current job status, when known.
    pub fn current(&self) -> Option<JobStatus> {
        match self {
            Self::Validation { current, .. }
            | Self::Conflict { current, .. }
            | Self::Processing { current, .. } => *current,
            _ => None,
        }
    }

    /// Check if the caller should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientInfra(_))
    }

    fn message(&self) -> &str {
        match self {
            Self::Validation { message, .. }
            | Self::Conflict { message, .. }
            | Self::Processing { message, .. } => message,
            Self::NotFound(message) | Self::SecurityViolation(message) | Self::TransientInfra(message) => {
                message
            }
        }
    }

    /// Caller-facing summary with the actions legal from the current status.
    pub fn to_failure(&self) -> Failure {
        let status = self.current();
        Failure {
            kind: self.kind(),
            message: self.message().to_string(),
            status,
            legal_actions: status.map(|s| s.legal_actions()).unwrap_or_default(),
        }
    }
}

// ============================================================================
// Failure
// ============================================================================

/// Error classes exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    NotFound,
    Conflict,
    SecurityViolation,
    TransientInfra,
    Processing,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::NotFound => "not_found",
            FailureKind::Conflict => "conflict",
            FailureKind::SecurityViolation => "security_violation",
            FailureKind::TransientInfra => "transient_infra",
            FailureKind::Processing => "processing",
        }
    }

    /// HTTP status code for a routing layer.
    pub fn status_code(&self) -> u16 {
        match self {
            FailureKind::Validation => 400,
            FailureKind::SecurityViolation => 403,
            FailureKind::NotFound => 404,
            FailureKind::Conflict => 409,
            FailureKind::Processing => 422,
            FailureKind::TransientInfra => 503,
        }
    }
}

/// A typed failure as returned to external callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    pub legal_actions: Vec<JobAction>,
}

// ============================================================================
// Conversions
// ============================================================================

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::not_found(format!("job {id}")),
            StoreError::AlreadyExists(id) => Self::conflict(format!("job {id} already exists")),
            StoreError::InvalidTransition(e) => Self::conflict(e.to_string()).at(e.current),
            StoreError::StaleAttempt { status, .. } => {
                Self::conflict("job was modified concurrently").at(status)
            }
            StoreError::Contention(_) => {
                warn!(error = %err, "Job store contention");
                Self::transient("job store is busy")
            }
            other => {
                warn!(error = %other, "Job store failure");
                Self::transient("job store is unavailable")
            }
        }
    }
}

impl From<QueueError> for ServiceError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::InvalidPriority(p) => Self::validation(format!("priority {p} is outside 1..=10")),
            other => {
                warn!(error = %other, "Work queue failure");
                Self::transient("work queue is unavailable")
            }
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::SecurityViolation(reason) => {
                error!(reason = %reason, "Security violation at storage boundary");
                Self::security_violation("path rejected by storage boundary")
            }
            StorageError::NotFound(_) => Self::validation("file does not exist"),
            StorageError::NotAFile(_) => Self::validation("path is not a regular file"),
            StorageError::Io(e) => {
                warn!(error = %e, "File storage failure");
                Self::transient("file storage is unavailable")
            }
        }
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::validation(errors.to_string())
    }
}
