//! In-process job store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use squish_models::{Job, JobId, JobPatch, ProgressOutcome};

use crate::error::{StoreError, StoreResult};
use crate::query::{JobPage, JobQuery};
use crate::repo::{JobStore, TransitionRequest, Transitioned};

/// Job store backed by a `HashMap` behind an async `RwLock`.
///
/// Each operation takes the write lock for its whole read-check-write, which
/// gives the same atomicity the Redis store gets from compare-and-swap.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> StoreResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::already_exists(&job.id));
        }
        jobs.insert(job.id.clone(), job.clone());
        debug!(job_id = %job.id, "Created job record");
        Ok(())
    }

    async fn get(&self, id: &JobId) -> StoreResult<Option<Job>> {
        let now = Utc::now();
        let jobs = self.jobs.read().await;
        Ok(jobs.get(id).filter(|job| !job.is_expired(now)).cloned())
    }

    async fn update(&self, id: &JobId, patch: &JobPatch) -> StoreResult<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id).filter(|job| !job.is_expired(now)) {
            Some(job) => {
                job.apply_patch(patch, now);
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &JobId) -> StoreResult<bool> {
        Ok(self.jobs.write().await.remove(id).is_some())
    }

    async fn list(&self, query: &JobQuery) -> StoreResult<JobPage> {
        let now = Utc::now();
        let jobs = self.jobs.read().await;
        let live = jobs.values().filter(|job| !job.is_expired(now)).cloned();
        Ok(query.apply(live))
    }

    async fn transition(&self, id: &JobId, request: &TransitionRequest) -> StoreResult<Transitioned> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .filter(|job| !job.is_expired(now))
            .ok_or_else(|| StoreError::not_found(id))?;

        let previous = job.status;
        job.apply_transition(request.transition, request.fence, &request.patch, now)
            .map_err(|rejection| StoreError::rejected(id, rejection))?;

        Ok(Transitioned {
            previous,
            job: job.clone(),
        })
    }

    async fn record_progress(&self, id: &JobId, attempt: u32, progress: u8) -> StoreResult<ProgressOutcome> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .filter(|job| !job.is_expired(now))
            .ok_or_else(|| StoreError::not_found(id))?;
        Ok(job.record_progress(attempt, progress, now))
    }

    async fn expired(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut expired: Vec<Job> = jobs
            .values()
            .filter(|job| job.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.id.cmp(&b.id)));
        expired.truncate(limit);
        Ok(expired)
    }
}
