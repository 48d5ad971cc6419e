//! Processing worker for Squish.
//!
//! This crate provides:
//! - The [`Dispatcher`]: leases work, re-checks the job record, runs the
//!   delegate and records the outcome with fenced transitions
//! - The [`Processor`] capability and a [`ProcessorRegistry`] keyed by file type
//! - Bundled image, FFmpeg media and gzip document delegates
//! - Worker configuration, structured job logging and metrics

pub mod config;
pub mod delegates;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod registry;

pub use config::WorkerConfig;
pub use delegates::{DocumentProcessor, FfmpegProcessor, ImageProcessor, MediaKind};
pub use dispatcher::{Dispatcher, LeaseOutcome};
pub use error::{WorkerError, WorkerResult};
pub use logging::JobLogger;
pub use processor::{
    ProcessContext, ProcessOutput, ProcessRequest, Processor, ProcessorError, ProgressReporter,
};
pub use registry::ProcessorRegistry;
