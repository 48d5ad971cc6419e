//! Worker error types.

use thiserror::Error;

use crate::processor::ProcessorError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Store error: {0}")]
    Store(#[from] squish_store::StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] squish_queue::QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] squish_storage::StorageError),

    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Store(e) => e.is_transient(),
            WorkerError::Queue(e) => e.is_transient(),
            _ => false,
        }
    }
}
