//! Retention sweeper.
//!
//! Jobs carry an `expires_at` deadline. The store already hides expired
//! records from `get`; the sweeper removes them for good, together with
//! their files and any queue reference left behind.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use squish_models::{Job, JobEvent};
use squish_queue::{FailureTracker, Notifier, WorkQueue};
use squish_storage::{display_name, remove_file, PathCheck, StorageLayout};
use squish_store::JobStore;

use crate::config::ServiceConfig;
use crate::error::ServiceResult;
use crate::metrics;

/// Remove a job everywhere: record, queue reference, files.
///
/// The record goes first so a worker still running the job observes the
/// deletion at its next checkpoint and drops its own output. File removal
/// failures are logged, not returned.
pub(crate) async fn purge_job(
    store: &dyn JobStore,
    queue: &dyn WorkQueue,
    layout: &StorageLayout,
    notifier: &Notifier,
    job: &Job,
) -> ServiceResult<bool> {
    let existed = store.delete(&job.id).await?;

    if let Err(e) = queue.remove(&job.id).await {
        warn!(job_id = %job.id, error = %e, "Failed to remove queue reference");
    }

    remove_job_files(layout, job).await;
    notifier.publish(JobEvent::deleted(job.id.clone()));
    Ok(existed)
}

/// Remove the source and output files of a job through the resolver.
pub(crate) async fn remove_job_files(layout: &StorageLayout, job: &Job) -> usize {
    let mut removed = 0;

    let mut targets = vec![("source", layout.resolve_upload(&job.file_path))];
    if let Some(output) = &job.output_path {
        targets.push(("output", layout.resolve_output(output)));
    }

    for (kind, check) in targets {
        match check {
            PathCheck::Valid(path) => match remove_file(&path).await {
                Ok(true) => removed += 1,
                Ok(false) => debug!(job_id = %job.id, kind, "File already gone"),
                Err(e) => warn!(
                    job_id = %job.id,
                    kind,
                    file = %display_name(&path),
                    error = %e,
                    "Failed to remove file"
                ),
            },
            PathCheck::Invalid(reason) => {
                error!(
                    job_id = %job.id,
                    kind,
                    reason = %reason,
                    "Security violation: stored path failed validation, file left in place"
                );
                metrics::record_security_violation("purge");
            }
        }
    }

    removed
}

// ============================================================================
// Sweeper
// ============================================================================

/// Periodically purges expired jobs.
pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    layout: StorageLayout,
    notifier: Notifier,
    interval: Duration,
    batch_size: usize,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        layout: StorageLayout,
        notifier: Notifier,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            store,
            queue,
            layout,
            notifier,
            interval: config.sweep_interval,
            batch_size: config.sweep_batch_size.max(1),
        }
    }

    /// Purge every job expired as of now. Returns how many were removed.
    pub async fn sweep_once(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let mut purged = 0;

        loop {
            let batch = self
                .store
                .expired(now, self.batch_size)
                .await
                .context("failed to list expired jobs")?;
            let full = batch.len() == self.batch_size;

            for job in &batch {
                purge_job(
                    self.store.as_ref(),
                    self.queue.as_ref(),
                    &self.layout,
                    &self.notifier,
                    job,
                )
                .await
                .with_context(|| format!("failed to purge expired job {}", job.id))?;
                debug!(job_id = %job.id, status = %job.status, "Purged expired job");
                purged += 1;
            }

            if !full {
                break;
            }
        }

        if purged > 0 {
            metrics::record_purged("expired", purged as u64);
            info!(purged, "Retention sweep complete");
        }
        Ok(purged)
    }

    /// Run `sweep_once` on the configured interval until stopped.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut failures = FailureTracker::new(3);
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_secs = self.interval.as_secs(), "Retention sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.sweep_once().await {
                            Ok(_) => failures.record_success(),
                            Err(e) => {
                                if failures.record_failure() {
                                    warn!(
                                        error = ?e,
                                        failures = failures.failure_count(),
                                        "Retention sweep failed"
                                    );
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            info!("Retention sweeper stopped");
        });

        SweeperHandle { shutdown, handle }
    }
}

/// Handle to a running sweeper.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper and wait for it to exit.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Retention sweeper task ended abnormally");
        }
    }
}
