//! Processing dispatcher.
//!
//! For every lease the dispatcher re-reads the job record, which is the only
//! authority on what should happen next:
//!
//! - `queued` is started, `processing` found on a redelivery is reclaimed
//!   under a new attempt, anything else is acknowledged and discarded.
//! - While the delegate runs, progress is written fenced on the attempt. A
//!   refused write, or a heartbeat that finds the record changed, stops the
//!   delegate and leaves the external change in place.
//! - Success and failure are recorded with fenced transitions, so a worker
//!   whose lease was taken over can never overwrite a newer attempt.
//!
//! Infrastructure errors hand the lease back to the queue, which redelivers
//! it with backoff or dead-letters it; dead-lettered jobs are marked `error`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::sync::{watch, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

use squish_models::{
    compression_ratio, Job, JobEvent, JobId, JobPatch, JobStatus, ProgressOutcome, Transition,
};
use squish_queue::{FailureTracker, Lease, Notifier, Redelivery, Released, WorkQueue};
use squish_storage::{display_name, file_size, remove_file, SafePath, StorageLayout};
use squish_store::{JobStore, StoreError, TransitionRequest};

use crate::config::WorkerConfig;
use crate::error::WorkerResult;
use crate::logging::{lease_span, JobLogger};
use crate::metrics;
use crate::processor::{ProcessContext, ProcessRequest, Processor, ProcessorError, ProgressReporter};
use crate::registry::ProcessorRegistry;

/// How long a stopped delegate gets to wind down before it is dropped.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// What happened to one lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Completed { compression_ratio: i64 },
    Failed { message: String },
    /// The job was not runnable; acknowledged without side effects.
    Discarded { status: JobStatus },
    /// The record no longer exists.
    Missing,
    /// Another attempt owns the job, or an external change won the race.
    Superseded { status: Option<JobStatus> },
    /// Infrastructure failure; the lease went back to the queue.
    Released,
}

impl LeaseOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            LeaseOutcome::Completed { .. } => "completed",
            LeaseOutcome::Failed { .. } => "failed",
            LeaseOutcome::Discarded { .. } => "discarded",
            LeaseOutcome::Missing => "missing",
            LeaseOutcome::Superseded { .. } => "superseded",
            LeaseOutcome::Released => "released",
        }
    }
}

/// Why a running delegate was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    Deleted,
    /// Cancelled, paused or otherwise moved out of `processing`.
    StatusChanged(JobStatus),
    /// A newer attempt holds the job; the output path belongs to it now.
    TakenOver(JobStatus),
}

impl Interruption {
    fn status(&self) -> Option<JobStatus> {
        match self {
            Interruption::Deleted => None,
            Interruption::StatusChanged(status) | Interruption::TakenOver(status) => Some(*status),
        }
    }

    fn owns_output(&self) -> bool {
        !matches!(self, Interruption::TakenOver(_))
    }

    fn from_store_error(err: &StoreError) -> Option<Self> {
        match err {
            StoreError::StaleAttempt { status, .. } => Some(Interruption::TakenOver(*status)),
            StoreError::InvalidTransition(e) => Some(Interruption::StatusChanged(e.current)),
            StoreError::NotFound(_) => Some(Interruption::Deleted),
            _ => None,
        }
    }
}

enum Run {
    Finished(Result<crate::processor::ProcessOutput, ProcessorError>),
    TimedOut,
    Interrupted(Interruption),
}

/// Everything resolved before a delegate may start.
struct Prepared {
    processor: Arc<dyn Processor>,
    input: SafePath,
    output: SafePath,
}

/// Leases work from the queue and drives delegates.
#[derive(Clone)]
pub struct Dispatcher {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    registry: Arc<ProcessorRegistry>,
    layout: StorageLayout,
    notifier: Notifier,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Dispatcher {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        registry: Arc<ProcessorRegistry>,
        layout: StorageLayout,
        notifier: Notifier,
    ) -> Self {
        let capacity = config.max_concurrent_jobs.max(1);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store,
            queue,
            registry,
            layout,
            notifier,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    /// Run until [`shutdown`](Self::shutdown) is called, then wait for
    /// in-flight leases up to the shutdown timeout.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            worker = %self.config.worker_name,
            max_jobs = self.capacity,
            "Starting dispatcher"
        );

        let reclaimer = {
            let this = self.clone();
            tokio::spawn(async move { this.reclaim_loop().await })
        };

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut failures = FailureTracker::new(5);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let available = self.semaphore.available_permits();
            if available == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    _ = shutdown_rx.changed() => {}
                }
                continue;
            }

            match self.queue.lease(&self.config.worker_name, available).await {
                Ok(leases) if leases.is_empty() => {
                    failures.record_success();
                    tokio::select! {
                        _ = self.queue.wait_for_work(self.config.poll_interval) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                Ok(leases) => {
                    failures.record_success();
                    for lease in leases {
                        let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                            break;
                        };
                        let this = self.clone();
                        tokio::spawn(async move {
                            metrics::set_active_jobs(this.active_jobs());
                            this.process_lease(lease).await;
                            drop(permit);
                            metrics::set_active_jobs(this.active_jobs());
                        });
                    }
                }
                Err(e) => {
                    if failures.record_failure() {
                        warn!(error = %e, failures = failures.failure_count(), "Failed to lease work");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
        }

        info!("Waiting for in-flight jobs to finish");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached; unfinished leases will expire and be redelivered");
        }
        let _ = reclaimer.await;

        info!("Dispatcher stopped");
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn active_jobs(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    async fn wait_for_jobs(&self) {
        while self.semaphore.available_permits() < self.capacity {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Lease up to the configured concurrency and process everything leased.
    pub async fn run_once(&self) -> WorkerResult<Vec<LeaseOutcome>> {
        let leases = self
            .queue
            .lease(&self.config.worker_name, self.capacity)
            .await?;
        Ok(join_all(leases.into_iter().map(|lease| self.process_lease(lease))).await)
    }

    // ========================================================================
    // Expired leases
    // ========================================================================

    async fn reclaim_loop(&self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(self.config.reclaim_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = FailureTracker::new(3);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.reclaim_once().await {
                        Ok(_) => failures.record_success(),
                        Err(e) => {
                            if failures.record_failure() {
                                warn!(error = %e, "Failed to reclaim expired leases");
                            }
                        }
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
            if *shutdown_rx.borrow() {
                break;
            }
        }
    }

    /// Return expired leases to the queue and mark dead-lettered jobs failed.
    pub async fn reclaim_once(&self) -> WorkerResult<Vec<Released>> {
        let released = self.queue.reclaim_expired().await?;
        for item in &released {
            if let Redelivery::DeadLettered { attempts } = item.outcome {
                if let Err(e) = self.abandon(&item.job_id, attempts).await {
                    warn!(job_id = %item.job_id, error = %e, "Failed to mark abandoned job");
                }
            }
        }
        Ok(released)
    }

    /// Move a job whose queue attempts are exhausted to `error`.
    ///
    /// Returns `false` when the job was gone or no longer waiting for work.
    pub async fn abandon(&self, job_id: &JobId, attempts: u32) -> WorkerResult<bool> {
        let Some(job) = self.store.get(job_id).await? else {
            return Ok(false);
        };
        if !matches!(job.status, JobStatus::Queued | JobStatus::Processing) {
            debug!(job_id = %job_id, status = %job.status, "Dead-lettered job already settled");
            return Ok(false);
        }

        let message = format!("processing abandoned after {attempts} attempts");
        let request = TransitionRequest::new(Transition::Abandon)
            .with_patch(JobPatch::new().error(message.clone()));
        match self.store.transition(job_id, &request).await {
            Ok(done) => {
                warn!(job_id = %job_id, attempts, "Job abandoned");
                metrics::record_abandoned();
                if let Some(output) = self.output_for(&done.job) {
                    self.discard_output(&output).await;
                }
                self.notifier.publish(
                    JobEvent::status_changed(job_id.clone(), done.previous, JobStatus::Error)
                        .with_error(message),
                );
                Ok(true)
            }
            Err(e) if e.is_conflict() || matches!(e, StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn output_for(&self, job: &Job) -> Option<SafePath> {
        let processor = self.registry.get(job.file_type)?;
        let extension = processor.output_extension(&job.settings).ok()?;
        self.layout
            .output_path_for(job.id.as_str(), &extension)
            .into_safe()
    }

    // ========================================================================
    // One lease
    // ========================================================================

    /// Handle one lease end to end. Never fails: infrastructure errors return
    /// the lease to the queue.
    pub async fn process_lease(&self, lease: Lease) -> LeaseOutcome {
        let span = lease_span(&lease.job_id, lease.attempt, &lease.worker);
        async {
            let started = Instant::now();
            let outcome = match self.handle_lease(&lease).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "Lease handling failed, returning it to the queue");
                    self.release(&lease).await
                }
            };
            metrics::record_outcome(outcome.label(), started.elapsed());
            outcome
        }
        .instrument(span)
        .await
    }

    async fn handle_lease(&self, lease: &Lease) -> WorkerResult<LeaseOutcome> {
        let Some(job) = self.store.get(&lease.job_id).await? else {
            debug!("Job no longer exists, discarding lease");
            self.ack(lease).await;
            return Ok(LeaseOutcome::Missing);
        };

        let transition = match job.status {
            JobStatus::Queued => Transition::Start,
            // A redelivery finding `processing` means the previous lease expired
            JobStatus::Processing if lease.attempt > 1 => Transition::Reclaim,
            JobStatus::Processing => {
                debug!("Job is already processing under another lease");
                self.ack(lease).await;
                return Ok(LeaseOutcome::Superseded {
                    status: Some(JobStatus::Processing),
                });
            }
            status => {
                info!(status = %status, "Job is not runnable, discarding lease");
                self.ack(lease).await;
                return Ok(LeaseOutcome::Discarded { status });
            }
        };

        let started = match self
            .store
            .transition(&job.id, &TransitionRequest::new(transition))
            .await
        {
            Ok(started) => started,
            Err(e) => match Interruption::from_store_error(&e) {
                Some(interruption) => {
                    debug!(error = %e, "Lost the race to start the job");
                    self.ack(lease).await;
                    return Ok(match interruption {
                        Interruption::Deleted => LeaseOutcome::Missing,
                        other => LeaseOutcome::Superseded {
                            status: other.status(),
                        },
                    });
                }
                None => return Err(e.into()),
            },
        };

        if started.previous == JobStatus::Processing {
            info!(attempt = started.job.attempt, "Reclaimed job from an expired lease");
            self.notifier.publish(JobEvent::progress(job.id.clone(), 0));
        } else {
            self.notifier.publish(JobEvent::status_changed(
                job.id.clone(),
                started.previous,
                JobStatus::Processing,
            ));
        }

        self.run_job(lease, &started.job).await
    }

    async fn prepare(&self, job: &Job) -> Result<Prepared, String> {
        let processor = self
            .registry
            .get(job.file_type)
            .ok_or_else(|| format!("no processor registered for {} files", job.file_type))?;

        let input = match self.layout.resolve_upload(&job.file_path).into_result() {
            Ok(input) => input,
            Err(reason) => {
                error!(job_id = %job.id, reason = %reason, "Security violation: source path rejected");
                return Err("source file is not accessible".to_string());
            }
        };
        match file_size(&input).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err("source file is missing".to_string()),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Source file is not readable");
                return Err("source file is not readable".to_string());
            }
        }

        let extension = processor
            .output_extension(&job.settings)
            .map_err(|e| e.to_string())?;
        let output = match self
            .layout
            .output_path_for(job.id.as_str(), &extension)
            .into_result()
        {
            Ok(output) => output,
            Err(reason) => {
                error!(job_id = %job.id, reason = %reason, "Security violation: output path rejected");
                return Err("output location is not accessible".to_string());
            }
        };

        Ok(Prepared {
            processor,
            input,
            output,
        })
    }

    async fn run_job(&self, lease: &Lease, job: &Job) -> WorkerResult<LeaseOutcome> {
        let logger = JobLogger::new(&job.id, job.file_type, job.attempt);

        let Prepared {
            processor,
            input,
            output,
        } = match self.prepare(job).await {
            Ok(prepared) => prepared,
            Err(message) => return self.fail(lease, job, None, message, &logger).await,
        };

        logger.log_start(&format!(
            "{} processor, delivery {}",
            processor.name(),
            lease.attempt
        ));

        let (progress, mut progress_rx) = ProgressReporter::channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let request = ProcessRequest {
            input: input.clone(),
            output: output.clone(),
            settings: job.settings.clone(),
            original_size: job.size,
        };
        let delegate = processor.process(
            request,
            ProcessContext {
                progress,
                cancel: cancel_rx,
            },
        );
        tokio::pin!(delegate);

        let deadline = tokio::time::sleep(self.config.job_timeout);
        tokio::pin!(deadline);

        let beat = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + beat, beat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut progress_open = true;

        let run = loop {
            tokio::select! {
                result = &mut delegate => break Run::Finished(result),
                _ = &mut deadline => break Run::TimedOut,
                changed = progress_rx.changed(), if progress_open => {
                    if changed.is_err() {
                        progress_open = false;
                        continue;
                    }
                    let value = *progress_rx.borrow_and_update();
                    if let Some(stop) = self.checkpoint_progress(&job.id, job.attempt, value).await {
                        break Run::Interrupted(stop);
                    }
                }
                _ = heartbeat.tick() => {
                    if let Some(stop) = self.checkpoint_heartbeat(lease, &job.id, job.attempt).await {
                        break Run::Interrupted(stop);
                    }
                }
            }
        };

        match run {
            Run::Finished(Ok(result)) => {
                debug!(reported_size = result.output_size, "Delegate finished");
                self.complete(lease, job, &output, &logger).await
            }
            Run::Finished(Err(e)) => {
                if let ProcessorError::Failed {
                    detail: Some(detail),
                    ..
                } = &e
                {
                    logger.log_warning(&redact(detail, &[&input, &output]));
                }
                let message = redact(&e.to_string(), &[&input, &output]);
                self.fail(lease, job, Some(&output), message, &logger).await
            }
            Run::TimedOut => {
                let _ = cancel_tx.send(true);
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut delegate).await;
                let message = format!("processing timed out after {:?}", self.config.job_timeout);
                self.fail(lease, job, Some(&output), message, &logger).await
            }
            Run::Interrupted(interruption) => {
                let _ = cancel_tx.send(true);
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut delegate).await;
                self.interrupted(lease, &output, interruption, &logger).await
            }
        }
    }

    // ========================================================================
    // Checkpoints
    // ========================================================================

    async fn checkpoint_progress(&self, id: &JobId, attempt: u32, value: u8) -> Option<Interruption> {
        match self.store.record_progress(id, attempt, value).await {
            Ok(ProgressOutcome::Applied) => {
                self.notifier.publish(JobEvent::progress(id.clone(), value));
                None
            }
            Ok(ProgressOutcome::Regressed { .. }) => None,
            Ok(ProgressOutcome::Stale {
                status,
                attempt: current,
            }) => Some(if current != attempt {
                Interruption::TakenOver(status)
            } else {
                Interruption::StatusChanged(status)
            }),
            Err(StoreError::NotFound(_)) => Some(Interruption::Deleted),
            Err(e) => {
                warn!(job_id = %id, error = %e, "Failed to record progress");
                None
            }
        }
    }

    async fn checkpoint_heartbeat(&self, lease: &Lease, id: &JobId, attempt: u32) -> Option<Interruption> {
        match self.queue.extend(lease).await {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %id, "Lease is no longer held; the job may be redelivered"),
            Err(e) => warn!(job_id = %id, error = %e, "Failed to extend lease"),
        }

        match self.store.get(id).await {
            Ok(Some(job)) if job.attempt != attempt => Some(Interruption::TakenOver(job.status)),
            Ok(Some(job)) if job.status != JobStatus::Processing => {
                Some(Interruption::StatusChanged(job.status))
            }
            Ok(Some(_)) => None,
            Ok(None) => Some(Interruption::Deleted),
            Err(e) => {
                warn!(job_id = %id, error = %e, "Heartbeat could not read the job");
                None
            }
        }
    }

    // ========================================================================
    // Outcomes
    // ========================================================================

    async fn complete(&self, lease: &Lease, job: &Job, output: &SafePath, logger: &JobLogger) -> WorkerResult<LeaseOutcome> {
        // The delegate may have replaced the file; validate it again
        let verified = match self.layout.resolve_output(output.as_path()).into_result() {
            Ok(verified) => verified,
            Err(reason) => {
                error!(job_id = %job.id, reason = %reason, "Security violation: output rejected after processing");
                let message = "output file failed validation".to_string();
                return self.fail(lease, job, Some(output), message, logger).await;
            }
        };
        let size = match file_size(&verified).await {
            Ok(Some(size)) if size > 0 => size,
            Ok(_) => {
                let message = "processor produced no output".to_string();
                return self.fail(lease, job, Some(output), message, logger).await;
            }
            Err(e) => {
                logger.log_warning(&format!("output unreadable: {e}"));
                let message = "output file is not readable".to_string();
                return self.fail(lease, job, Some(output), message, logger).await;
            }
        };

        let ratio = compression_ratio(job.size, size);
        let request = TransitionRequest::new(Transition::Complete)
            .fenced(job.attempt)
            .with_patch(
                JobPatch::new()
                    .progress(100)
                    .output(verified.clone().into_path_buf(), size, ratio),
            );

        match self.store.transition(&job.id, &request).await {
            Ok(done) => {
                self.notifier.publish(JobEvent::progress(job.id.clone(), 100));
                self.notifier.publish(JobEvent::status_changed(
                    job.id.clone(),
                    done.previous,
                    JobStatus::Completed,
                ));
                metrics::record_compression(job.file_type.as_str(), ratio);
                logger.log_completion(&format!("{} -> {} bytes ({}%)", job.size, size, ratio));
                self.ack(lease).await;
                Ok(LeaseOutcome::Completed {
                    compression_ratio: ratio,
                })
            }
            Err(e) => match Interruption::from_store_error(&e) {
                Some(interruption) => {
                    logger.log_warning(&format!("result discarded: {e}"));
                    self.interrupted(lease, output, interruption, logger).await
                }
                None => Err(e.into()),
            },
        }
    }

    async fn fail(
        &self,
        lease: &Lease,
        job: &Job,
        output: Option<&SafePath>,
        message: String,
        logger: &JobLogger,
    ) -> WorkerResult<LeaseOutcome> {
        logger.log_error(&message);
        let request = TransitionRequest::new(Transition::Fail)
            .fenced(job.attempt)
            .with_patch(JobPatch::new().error(message.clone()));

        match self.store.transition(&job.id, &request).await {
            Ok(done) => {
                if let Some(output) = output {
                    self.discard_output(output).await;
                }
                self.notifier.publish(
                    JobEvent::status_changed(job.id.clone(), done.previous, JobStatus::Error)
                        .with_error(message.clone()),
                );
                self.ack(lease).await;
                Ok(LeaseOutcome::Failed { message })
            }
            Err(e) => match Interruption::from_store_error(&e) {
                Some(interruption) => {
                    logger.log_warning(&format!("failure not recorded: {e}"));
                    if let (Some(output), true) = (output, interruption.owns_output()) {
                        self.discard_output(output).await;
                    }
                    self.ack(lease).await;
                    Ok(LeaseOutcome::Superseded {
                        status: interruption.status(),
                    })
                }
                None => Err(e.into()),
            },
        }
    }

    async fn interrupted(
        &self,
        lease: &Lease,
        output: &SafePath,
        interruption: Interruption,
        logger: &JobLogger,
    ) -> WorkerResult<LeaseOutcome> {
        match interruption {
            Interruption::TakenOver(_) => {
                logger.log_warning("a newer attempt took over the job, stopping");
            }
            Interruption::StatusChanged(status) => {
                logger.log_progress(&format!("stopped, job is now {status}"));
            }
            Interruption::Deleted => logger.log_progress("stopped, job was deleted"),
        }
        if interruption.owns_output() {
            self.discard_output(output).await;
        }
        self.ack(lease).await;
        Ok(LeaseOutcome::Superseded {
            status: interruption.status(),
        })
    }

    /// Remove partial or orphaned output, re-validated against the output root.
    async fn discard_output(&self, output: &SafePath) {
        let Some(path) = self.layout.resolve_output(output.as_path()).into_safe() else {
            warn!(file = %display_name(output), "Output path no longer validates, not removing");
            return;
        };
        match remove_file(&path).await {
            Ok(true) => debug!(file = %display_name(&path), "Removed partial output"),
            Ok(false) => {}
            Err(e) => warn!(file = %display_name(&path), error = %e, "Failed to remove partial output"),
        }
    }

    // ========================================================================
    // Queue acknowledgements
    // ========================================================================

    async fn ack(&self, lease: &Lease) {
        match self.queue.ack(lease).await {
            Ok(true) => {}
            Ok(false) => debug!("Lease was no longer active at ack"),
            Err(e) => warn!(error = %e, "Failed to ack lease; it will expire and be discarded on redelivery"),
        }
    }

    async fn release(&self, lease: &Lease) -> LeaseOutcome {
        match self.queue.nack(lease).await {
            Ok(Some(Released {
                job_id,
                outcome: Redelivery::DeadLettered { attempts },
            })) => {
                if let Err(e) = self.abandon(&job_id, attempts).await {
                    warn!(error = %e, "Failed to mark abandoned job");
                }
            }
            Ok(Some(released)) => debug!(outcome = ?released.outcome, "Lease returned to the queue"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to release lease; it will expire"),
        }
        LeaseOutcome::Released
    }
}

/// Replace resolved paths in user-visible text with bare file names.
fn redact(text: &str, paths: &[&SafePath]) -> String {
    let mut text = text.to_string();
    for path in paths {
        text = text.replace(&path.to_string(), &display_name(path));
        if let Some(parent) = path.as_path().parent() {
            let parent = parent.display().to_string();
            if !parent.is_empty() && parent != "/" {
                text = text.replace(&parent, "<storage>");
            }
        }
    }
    text
}
