//! Delegate processor capability.
//!
//! A [`Processor`] turns one validated input file into one output file. The
//! dispatcher owns everything else: it picks the processor by file type,
//! resolves both paths, persists progress and decides the job's fate from the
//! returned result.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use squish_models::JobSettings;
use squish_storage::SafePath;

/// Errors raised by delegate processors.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Unsupported input: {0}")]
    Unsupported(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("{0} not found in PATH")]
    ToolMissing(&'static str),

    #[error("Processing failed: {message}")]
    Failed {
        message: String,
        detail: Option<String>,
    },

    #[error("Processing cancelled")]
    Cancelled,

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessorError {
    pub fn invalid_settings(msg: impl Into<String>) -> Self {
        Self::InvalidSettings(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed {
            message: msg.into(),
            detail: None,
        }
    }

    pub fn failed_with_detail(msg: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Failed {
            message: msg.into(),
            detail: Some(detail.into()),
        }
    }
}

/// Input and output for one delegate run.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub input: SafePath,
    pub output: SafePath,
    pub settings: JobSettings,
    /// Source size recorded at ingestion
    pub original_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutput {
    pub output_size: u64,
}

/// Monotonic progress handle given to delegates.
///
/// Values are clamped to 0-100 and lower values than the last report are
/// ignored. Reports never block; the dispatcher only sees the latest value.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<u8>>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, watch::Receiver<u8>) {
        let (tx, rx) = watch::channel(0);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn report(&self, value: u8) {
        let value = value.min(100);
        self.tx.send_if_modified(|current| {
            if value > *current {
                *current = value;
                true
            } else {
                false
            }
        });
    }

    /// Report `done` out of `total` units of work.
    pub fn report_fraction(&self, done: u64, total: u64) {
        if total == 0 {
            return;
        }
        let percent = (done.min(total) as f64 / total as f64 * 100.0).floor() as u8;
        self.report(percent);
    }

    pub fn current(&self) -> u8 {
        *self.tx.borrow()
    }
}

/// Runtime handles for one delegate run.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    pub progress: ProgressReporter,
    /// Flips to `true` when the job was cancelled, paused or timed out
    pub cancel: watch::Receiver<bool>,
}

impl ProcessContext {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&mut self) {
        while !*self.cancel.borrow_and_update() {
            if self.cancel.changed().await.is_err() {
                // Sender gone without a cancel: never resolve
                std::future::pending::<()>().await;
            }
        }
    }
}

/// A type-specific transformation.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Extension of the output file for these settings.
    ///
    /// Settings are validated here so bad input fails before any work starts.
    fn output_extension(&self, settings: &JobSettings) -> Result<String, ProcessorError>;

    /// Run the transformation. Implementations should report progress and
    /// return [`ProcessorError::Cancelled`] promptly once `ctx.cancel` flips.
    async fn process(
        &self,
        request: ProcessRequest,
        ctx: ProcessContext,
    ) -> Result<ProcessOutput, ProcessorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_monotonic() {
        let (reporter, rx) = ProgressReporter::channel();
        reporter.report(40);
        reporter.report(10);
        assert_eq!(*rx.borrow(), 40);
        reporter.report(250);
        assert_eq!(reporter.current(), 100);
    }

    #[test]
    fn test_report_fraction() {
        let (reporter, _rx) = ProgressReporter::channel();
        reporter.report_fraction(1, 3);
        assert_eq!(reporter.current(), 33);
        reporter.report_fraction(5, 0);
        assert_eq!(reporter.current(), 33);
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_flag() {
        let (reporter, _rx) = ProgressReporter::channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut ctx = ProcessContext {
            progress: reporter,
            cancel: cancel_rx,
        };
        assert!(!ctx.is_cancelled());

        cancel_tx.send(true).unwrap();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }
}
