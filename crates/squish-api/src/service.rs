//! The job service: ingestion, queries and control actions.
//!
//! One explicit object owns the store, queue, notifier and storage layout.
//! Callers construct it once, call [`JobService::init`] and pass it by
//! reference; nothing here is global.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{future, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use validator::Validate;

use squish_models::{
    FileType, Job, JobAction, JobEvent, JobId, JobPatch, JobSettings, JobStatus, JobView, NewJob,
    Transition,
};
use squish_queue::{
    retry_async, EventSource, EventStream, Notifier, Priority, QueueError, RetryConfig, RetryResult,
    WorkQueue,
};
use squish_storage::{
    display_name, file_size, sha256_file, storage_name, PathCheck, SafePath, StorageLayout,
};
use squish_store::{JobFilter, JobPage, JobQuery, JobStore, TransitionRequest, Transitioned};

use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::metrics;
use crate::retention::{purge_job, RetentionSweeper, SweeperHandle};

// ============================================================================
// Request / response types
// ============================================================================

/// A stored upload handed over by the ingestion collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    /// Location of the stored file; must resolve under the upload root
    pub file_path: PathBuf,
    /// Display name only
    #[validate(length(min = 1, max = 255, message = "originalName must be 1-255 characters"))]
    pub original_name: String,
    /// Declared size in bytes
    pub size: u64,
    pub file_type: FileType,
    #[serde(default)]
    pub settings: JobSettings,
    /// Optional hex SHA-256 of the upload
    #[serde(default)]
    #[validate(length(equal = 64, message = "sha256 must be 64 hex characters"))]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// One page of job snapshots.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListing {
    pub jobs: Vec<JobView>,
    pub total: usize,
    pub offset: usize,
    pub has_more: bool,
}

impl From<JobPage> for JobListing {
    fn from(page: JobPage) -> Self {
        Self {
            jobs: page.jobs.iter().map(JobView::from).collect(),
            total: page.total,
            offset: page.offset,
            has_more: page.has_more,
        }
    }
}

/// Queue position estimate for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePosition {
    pub status: JobStatus,
    /// 0-based rank among waiting items, only while `queued`
    pub position: Option<u64>,
    pub waiting: u64,
    pub active: u64,
}

/// A live event stream plus the state it starts from.
///
/// Subscribing happens before the snapshot is read, so no change between
/// the two is lost; reconnecting clients always take a new subscription.
pub struct Subscription {
    pub snapshot: JobView,
    pub events: EventStream,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct JobService {
    config: ServiceConfig,
    layout: StorageLayout,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    events: Arc<dyn EventSource>,
    notifier: Notifier,
    enqueue_retry: RetryConfig,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl JobService {
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        events: Arc<dyn EventSource>,
        notifier: Notifier,
    ) -> Self {
        let layout = StorageLayout::new(&config.upload_root, &config.output_root);
        let enqueue_retry = RetryConfig::new("enqueue").with_max_retries(config.enqueue_retries);
        Self {
            config,
            layout,
            store,
            queue,
            events,
            notifier,
            enqueue_retry,
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Create the storage roots and start the retention sweeper.
    pub async fn init(&self) -> ServiceResult<()> {
        self.layout.init().await?;

        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_none() {
            *sweeper = Some(self.retention_sweeper().spawn());
        }
        info!("Job service initialized");
        Ok(())
    }

    /// Stop background work started by [`init`](Self::init).
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().await.take() {
            sweeper.stop().await;
        }
        info!("Job service stopped");
    }

    /// A sweeper sharing this service's store, queue and layout.
    pub fn retention_sweeper(&self) -> RetentionSweeper {
        RetentionSweeper::new(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            self.layout.clone(),
            self.notifier.clone(),
            &self.config,
        )
    }

    // ------------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------------

    /// A fresh upload location for the ingestion collaborator to write to.
    ///
    /// The file name is generated; `original_name` only contributes its
    /// extension.
    pub fn upload_target(&self, original_name: &str) -> ServiceResult<SafePath> {
        if original_name.is_empty() || original_name.chars().count() > 255 {
            return Err(ServiceError::validation("originalName must be 1-255 characters"));
        }
        self.layout
            .resolve_upload(storage_name(original_name))
            .into_result()
            .map_err(|reason| refuse("upload_target", reason, "upload location is not accessible"))
    }

    /// Register a stored upload as a new job in `uploaded`.
    pub async fn ingest(&self, request: IngestRequest) -> ServiceResult<IngestReceipt> {
        request.validate()?;

        if request.size == 0 {
            return Err(ServiceError::validation("file is empty"));
        }
        if request.size > self.config.max_upload_bytes {
            return Err(ServiceError::validation(format!(
                "file exceeds the {} byte limit",
                self.config.max_upload_bytes
            )));
        }

        let source = match self.layout.resolve_upload(&request.file_path) {
            PathCheck::Valid(path) => path,
            PathCheck::Invalid(reason) => {
                error!(
                    requested = %request.file_path.display(),
                    reason = %reason,
                    "Security violation: ingest path rejected"
                );
                metrics::record_security_violation("ingest");
                return Err(ServiceError::security_violation(
                    "file path is outside the upload area",
                ));
            }
        };

        let actual_size = file_size(&source)
            .await?
            .ok_or_else(|| ServiceError::validation("uploaded file does not exist"))?;
        if actual_size != request.size {
            return Err(refuse(
                "ingest",
                format!("declared size {} but stored file has {}", request.size, actual_size),
                "declared size does not match the stored file",
            ));
        }

        if let Some(expected) = &request.sha256 {
            let actual = sha256_file(&source).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(refuse(
                    "ingest",
                    "sha256 mismatch",
                    "checksum does not match the stored file",
                ));
            }
        }

        // Deleting a job removes its source, so a file has at most one owner.
        let owners = self
            .store
            .list(&JobQuery::new().filter(JobFilter::default().source(source.as_path())))
            .await?;
        if owners.total > 0 {
            warn!(file = %display_name(&source), "Uploaded file already belongs to a job");
            return Err(ServiceError::conflict("uploaded file already belongs to another job"));
        }

        let job = Job::new(
            NewJob {
                original_name: request.original_name,
                storage_name: display_name(&source),
                file_path: source.into_path_buf(),
                size: actual_size,
                file_type: request.file_type,
                settings: request.settings,
            },
            self.config.retention(),
        );
        self.store.create(&job).await?;

        metrics::record_ingested(job.file_type.as_str());
        info!(
            job_id = %job.id,
            file_type = %job.file_type,
            size = job.size,
            "Job created"
        );

        Ok(IngestReceipt {
            job_id: job.id,
            status: job.status,
        })
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn get_job(&self, id: &JobId) -> ServiceResult<JobView> {
        Ok(JobView::from(&self.load(id).await?))
    }

    pub async fn list_jobs(&self, query: &JobQuery) -> ServiceResult<JobListing> {
        Ok(self.store.list(query).await?.into())
    }

    pub async fn queue_position(&self, id: &JobId) -> ServiceResult<QueuePosition> {
        let job = self.load(id).await?;
        let position = if job.status == JobStatus::Queued {
            self.queue.position(id).await?
        } else {
            None
        };
        let stats = self.queue.stats().await?;

        Ok(QueuePosition {
            status: job.status,
            position,
            waiting: stats.waiting + stats.delayed,
            active: stats.active,
        })
    }

    /// Subscribe to a job's events and read its current state.
    ///
    /// Events stamped before the subscription, or before the change the
    /// snapshot already reflects, are dropped: publishing is asynchronous, so
    /// they can still be in flight when the subscription opens.
    pub async fn subscribe(&self, id: &JobId) -> ServiceResult<Subscription> {
        let subscribed_at = Utc::now();
        let events = self.events.subscribe(id).await?;
        let snapshot = self.get_job(id).await?;

        let cutoff = subscribed_at.max(snapshot.updated_at);
        let events: EventStream = Box::pin(
            events.filter(move |event| future::ready(event.timestamp() >= cutoff)),
        );
        Ok(Subscription { snapshot, events })
    }

    /// Freshly validated output location of a completed job.
    pub async fn download_path(&self, id: &JobId) -> ServiceResult<SafePath> {
        let job = self.load(id).await?;
        if job.status != JobStatus::Completed {
            return Err(ServiceError::conflict(format!(
                "output is only available for completed jobs (job is {})",
                job.status
            ))
            .at(job.status));
        }

        let output = job
            .output_path
            .as_ref()
            .ok_or_else(|| ServiceError::not_found("output file"))?;
        let path = self
            .layout
            .resolve_output(output)
            .into_result()
            .map_err(|reason| refuse("download", reason, "output file is not accessible"))?;

        match file_size(&path).await? {
            Some(_) => Ok(path),
            None => Err(ServiceError::not_found("output file")),
        }
    }

    // ------------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------------

    /// Remove a job, its queue reference and its files.
    pub async fn delete_job(&self, id: &JobId) -> ServiceResult<()> {
        let job = self.load(id).await?;
        purge_job(
            self.store.as_ref(),
            self.queue.as_ref(),
            &self.layout,
            &self.notifier,
            &job,
        )
        .await?;

        metrics::record_purged("deleted", 1);
        info!(job_id = %id, status = %job.status, "Job deleted");
        Ok(())
    }

    /// Apply a control action with the default priority.
    pub async fn request_transition(&self, id: &JobId, action: JobAction) -> ServiceResult<JobView> {
        self.request_transition_with_priority(id, action, None).await
    }

    /// Apply a control action. `priority` is used when the action queues the job.
    pub async fn request_transition_with_priority(
        &self,
        id: &JobId,
        action: JobAction,
        priority: Option<Priority>,
    ) -> ServiceResult<JobView> {
        let result = self.dispatch_action(id, action, priority).await;

        let outcome = match &result {
            Ok(_) => "applied",
            Err(e) => e.kind().as_str(),
        };
        metrics::record_transition(action.as_str(), outcome);

        result.map(|job| JobView::from(&job))
    }

    async fn dispatch_action(
        &self,
        id: &JobId,
        action: JobAction,
        priority: Option<Priority>,
    ) -> ServiceResult<Job> {
        let job = self.load(id).await?;
        let transition = Transition::from(action);

        // Refuse illegal edges before touching the filesystem or the queue.
        if let Err(e) = transition.apply(job.status) {
            debug!(job_id = %id, error = %e, "Control action rejected");
            return Err(ServiceError::conflict(e.to_string()).at(job.status));
        }

        match action {
            JobAction::Enqueue | JobAction::Resume => {
                let job = self.apply(id, TransitionRequest::new(transition)).await?;
                self.push(job, priority).await
            }
            JobAction::Retry => {
                self.check_source(&job).await?;
                self.apply(id, TransitionRequest::new(Transition::Retry)).await?;
                let job = self.apply(id, TransitionRequest::new(Transition::Enqueue)).await?;
                self.push(job, priority).await
            }
            JobAction::Cancel => {
                let job = self.apply(id, TransitionRequest::new(transition)).await?;
                if let Err(e) = self.queue.remove(id).await {
                    warn!(job_id = %id, error = %e, "Failed to drop queue reference of cancelled job");
                }
                Ok(job)
            }
            JobAction::Pause => self.apply(id, TransitionRequest::new(transition)).await,
        }
    }

    /// Put a `queued` job on the work queue.
    ///
    /// Transient queue failures are retried with backoff. If the queue stays
    /// unreachable the job is moved to `error` so it is never left `queued`
    /// without a queue reference, and the caller gets `TransientInfra`.
    async fn push(&self, job: Job, priority: Option<Priority>) -> ServiceResult<Job> {
        let priority = priority.unwrap_or(self.config.default_priority);
        let queue = self.queue.as_ref();
        let id = &job.id;

        let result = retry_async(&self.enqueue_retry, QueueError::is_transient, move || {
            queue.enqueue(id, priority)
        })
        .await;

        match result {
            RetryResult::Success(_) => {
                debug!(job_id = %id, priority = %priority, "Job queued");
                Ok(job)
            }
            RetryResult::Failed { error, attempts } => {
                warn!(job_id = %id, attempts, error = %error, "Enqueue failed, moving job to error");
                let rollback = TransitionRequest::new(Transition::Abandon)
                    .with_patch(JobPatch::new().error("could not be queued, work queue unavailable"));
                match self.apply(id, rollback).await {
                    Ok(_) => {}
                    Err(e) => error!(job_id = %id, error = %e, "Failed to roll back unqueued job"),
                }
                Err(error.into())
            }
        }
    }

    /// The source of a failed job must still exist before it is retried.
    async fn check_source(&self, job: &Job) -> ServiceResult<()> {
        let source = self
            .layout
            .resolve_upload(&job.file_path)
            .into_result()
            .map_err(|reason| refuse("retry", reason, "source file is not accessible"))?;

        match file_size(&source).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(ServiceError::validation("source file no longer exists").at(job.status)),
            Err(e) => Err(ServiceError::from(e).at(job.status)),
        }
    }

    async fn apply(&self, id: &JobId, request: TransitionRequest) -> ServiceResult<Job> {
        let Transitioned { previous, job } = self.store.transition(id, &request).await?;

        let event = JobEvent::status_changed(id.clone(), previous, job.status);
        let event = match &job.error {
            Some(message) if job.status == JobStatus::Error => event.with_error(message.clone()),
            _ => event,
        };
        self.notifier.publish(event);

        info!(
            job_id = %id,
            from = %previous,
            to = %job.status,
            transition = %request.transition,
            "Job transitioned"
        );
        Ok(job)
    }

    async fn load(&self, id: &JobId) -> ServiceResult<Job> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("job {id}")))
    }
}

/// Log a refused operation at elevated severity and build the caller-facing error.
fn refuse(operation: &'static str, reason: impl fmt::Display, public: &str) -> ServiceError {
    error!(operation, reason = %reason, "Security violation");
    metrics::record_security_violation(operation);
    ServiceError::security_violation(public)
}
