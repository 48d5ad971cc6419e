//! Job control surface for Squish.
//!
//! This crate provides:
//! - [`JobService`]: ingestion, queries, control actions, event subscription
//!   and download paths
//! - Typed caller-facing failures ([`ServiceError`], [`Failure`])
//! - The retention sweeper that purges expired jobs
//!
//! Routing and transports live outside this crate; they call the service and
//! render [`Failure`] values.

pub mod config;
pub mod error;
pub mod metrics;
pub mod retention;
pub mod service;

pub use config::ServiceConfig;
pub use error::{Failure, FailureKind, ServiceError, ServiceResult};
pub use retention::{RetentionSweeper, SweeperHandle};
pub use service::{
    IngestReceipt, IngestRequest, JobListing, JobService, QueuePosition, Subscription,
};
