//! The job store contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use squish_models::{Job, JobId, JobPatch, JobStatus, ProgressOutcome, Transition};

use crate::error::StoreResult;
use crate::query::{JobPage, JobQuery};

/// A lifecycle transition plus the fields that change with it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub transition: Transition,
    /// Required processing attempt, for worker-driven transitions.
    pub fence: Option<u32>,
    pub patch: JobPatch,
}

impl TransitionRequest {
    pub fn new(transition: Transition) -> Self {
        Self {
            transition,
            fence: None,
            patch: JobPatch::default(),
        }
    }

    pub fn fenced(mut self, attempt: u32) -> Self {
        self.fence = Some(attempt);
        self
    }

    pub fn with_patch(mut self, patch: JobPatch) -> Self {
        self.patch = patch;
        self
    }
}

/// An applied transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transitioned {
    pub previous: JobStatus,
    pub job: Job,
}

/// Durable job records.
///
/// Expected absences are values, not errors: `get` returns `None` for unknown
/// and expired ids, `update` returns `None` instead of resurrecting a record.
/// Every status change goes through [`JobStore::transition`], which applies
/// the edge and its patch in one atomic step.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, job: &Job) -> StoreResult<()>;

    async fn get(&self, id: &JobId) -> StoreResult<Option<Job>>;

    /// Merge non-status fields and bump `updated_at`. No-op for unknown ids.
    async fn update(&self, id: &JobId, patch: &JobPatch) -> StoreResult<Option<Job>>;

    /// Remove a record. Returns whether one existed.
    async fn delete(&self, id: &JobId) -> StoreResult<bool>;

    async fn list(&self, query: &JobQuery) -> StoreResult<JobPage>;

    /// Apply a lifecycle edge atomically.
    ///
    /// Errors: `NotFound`, `InvalidTransition` (record untouched) and
    /// `StaleAttempt` when the fence no longer matches.
    async fn transition(&self, id: &JobId, request: &TransitionRequest) -> StoreResult<Transitioned>;

    /// Write delegate progress for `attempt`, refusing stale attempts.
    async fn record_progress(&self, id: &JobId, attempt: u32, progress: u8) -> StoreResult<ProgressOutcome>;

    /// Records whose retention window ended at or before `now`, oldest first.
    async fn expired(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>>;
}
