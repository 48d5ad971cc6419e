//! End-to-end dispatcher scenarios against the in-memory store and queue.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tempfile::TempDir;
use tokio_test::assert_err;

use squish_models::{FileType, Job, JobEvent, JobId, JobSettings, JobStatus, NewJob, ProgressOutcome, Transition};
use squish_queue::{
    BackoffPolicy, EventHub, EventSource, MemoryQueue, Notifier, Priority, QueueConfig, Redelivery,
    WorkQueue,
};
use squish_storage::StorageLayout;
use squish_store::{JobStore, MemoryJobStore, TransitionRequest};
use squish_worker::{
    Dispatcher, LeaseOutcome, ProcessContext, ProcessOutput, ProcessRequest, Processor, ProcessorError,
    ProcessorRegistry, WorkerConfig,
};

// ============================================================================
// Scripted processor
// ============================================================================

#[derive(Debug, Clone)]
enum Behavior {
    /// Write `output_bytes` bytes and succeed.
    Shrink { output_bytes: usize },
    /// Write partial output, then fail.
    FailMidway,
    /// Keep reporting progress until told to stop.
    RunUntilCancelled,
}

/// Plays its behaviors in order; the last one repeats.
struct ScriptedProcessor {
    script: Mutex<VecDeque<Behavior>>,
}

impl ScriptedProcessor {
    fn new(script: Vec<Behavior>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
        })
    }

    fn next(&self) -> Behavior {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap()
        }
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn output_extension(&self, _settings: &JobSettings) -> Result<String, ProcessorError> {
        Ok("out".to_string())
    }

    async fn process(
        &self,
        request: ProcessRequest,
        ctx: ProcessContext,
    ) -> Result<ProcessOutput, ProcessorError> {
        match self.next() {
            Behavior::Shrink { output_bytes } => {
                ctx.progress.report(50);
                tokio::fs::write(request.output.as_path(), vec![b'z'; output_bytes]).await?;
                ctx.progress.report(90);
                Ok(ProcessOutput {
                    output_size: output_bytes as u64,
                })
            }
            Behavior::FailMidway => {
                tokio::fs::write(request.output.as_path(), b"partial").await?;
                ctx.progress.report(40);
                Err(ProcessorError::failed(format!(
                    "encoder crashed reading {}",
                    request.input
                )))
            }
            Behavior::RunUntilCancelled => {
                tokio::fs::write(request.output.as_path(), b"partial").await?;
                let mut step: u8 = 1;
                loop {
                    ctx.progress.report(step.min(99));
                    if ctx.is_cancelled() {
                        return Err(ProcessorError::Cancelled);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    step = step.saturating_add(1);
                }
            }
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    _dir: TempDir,
    layout: StorageLayout,
    store: Arc<MemoryJobStore>,
    queue: Arc<MemoryQueue>,
    hub: Arc<EventHub>,
    config: WorkerConfig,
    registry: Arc<ProcessorRegistry>,
    dispatcher: Dispatcher,
}

impl Harness {
    fn new(processor: Arc<dyn Processor>) -> Self {
        Self::with(processor, QueueConfig::default(), |_| {})
    }

    fn with(
        processor: Arc<dyn Processor>,
        queue_config: QueueConfig,
        tweak: impl FnOnce(&mut WorkerConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let upload_root = dir.path().join("uploads");
        let output_root = dir.path().join("output");
        std::fs::create_dir_all(&upload_root).unwrap();
        std::fs::create_dir_all(&output_root).unwrap();

        let mut config = WorkerConfig {
            max_concurrent_jobs: 2,
            job_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(50),
            reclaim_interval: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(1),
            upload_root: upload_root.clone(),
            output_root: output_root.clone(),
            worker_name: "worker-a".to_string(),
        };
        tweak(&mut config);

        let layout = StorageLayout::new(upload_root, output_root);
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryQueue::new(queue_config));
        let hub = Arc::new(EventHub::default());
        let registry = Arc::new(ProcessorRegistry::new().with(FileType::Document, processor));

        let dispatcher = build(&config, &store, &queue, &hub, &registry, &layout);

        Self {
            _dir: dir,
            layout,
            store,
            queue,
            hub,
            config,
            registry,
            dispatcher,
        }
    }

    /// A second dispatcher sharing the same store, queue and roots.
    fn second_dispatcher(&self) -> Dispatcher {
        let mut config = self.config.clone();
        config.worker_name = "worker-b".to_string();
        build(&config, &self.store, &self.queue, &self.hub, &self.registry, &self.layout)
    }

    /// Ingest a source file of `size` bytes and enqueue it.
    async fn enqueue_job(&self, size: usize) -> Job {
        let storage_name = format!("{}-src.txt", JobId::new());
        let file_path = self.layout.upload_root().join(&storage_name);
        std::fs::write(&file_path, vec![b'a'; size]).unwrap();

        let job = Job::new(
            NewJob {
                original_name: "report.txt".to_string(),
                storage_name,
                file_path,
                size: size as u64,
                file_type: FileType::Document,
                settings: JobSettings::new().with("level", 9),
            },
            chrono::Duration::hours(1),
        );
        self.store.create(&job).await.unwrap();
        self.store
            .transition(&job.id, &TransitionRequest::new(Transition::Enqueue))
            .await
            .unwrap();
        assert!(self.queue.enqueue(&job.id, Priority::default()).await.unwrap());
        self.get(&job.id).await
    }

    async fn get(&self, id: &JobId) -> Job {
        self.store.get(id).await.unwrap().expect("job exists")
    }

    fn output_path(&self, job: &Job) -> PathBuf {
        self.layout.output_root().join(format!("{}.out", job.id))
    }

    async fn wait_for_progress(&self, id: &JobId) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let job = self.get(id).await;
                if job.status == JobStatus::Processing && job.progress > 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("processing started");
    }
}

fn build(
    config: &WorkerConfig,
    store: &Arc<MemoryJobStore>,
    queue: &Arc<MemoryQueue>,
    hub: &Arc<EventHub>,
    registry: &Arc<ProcessorRegistry>,
    layout: &StorageLayout,
) -> Dispatcher {
    let (notifier, _pump) = Notifier::spawn(hub.clone(), 64);
    Dispatcher::new(
        config.clone(),
        store.clone(),
        queue.clone(),
        registry.clone(),
        layout.clone(),
        notifier,
    )
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_success_path_records_output_and_ratio() {
    let h = Harness::new(ScriptedProcessor::new(vec![Behavior::Shrink { output_bytes: 250 }]));
    let job = h.enqueue_job(1000).await;
    assert_eq!(job.status, JobStatus::Queued);
    let mut events = h.hub.subscribe(&job.id).await.unwrap();

    let outcomes = h.dispatcher.run_once().await.unwrap();
    assert_eq!(
        outcomes,
        vec![LeaseOutcome::Completed {
            compression_ratio: 75
        }]
    );

    let done = h.get(&job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.attempt, 1);
    assert_eq!(done.compressed_size, Some(250));
    assert_eq!(done.compression_ratio, Some(75));
    let output = done.output_path.clone().expect("output recorded");
    assert!(output.starts_with(h.layout.output_root().canonicalize().unwrap()));
    assert_eq!(std::fs::metadata(&output).unwrap().len(), 250);

    let first = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        first,
        JobEvent::StatusChanged {
            from: JobStatus::Queued,
            to: JobStatus::Processing,
            ..
        }
    ));
    let mut saw_completed = false;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), events.next()).await {
        if let JobEvent::StatusChanged {
            to: JobStatus::Completed,
            ..
        } = event
        {
            saw_completed = true;
        }
    }
    assert!(saw_completed);

    let stats = h.queue.stats().await.unwrap();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_delegate_failure_cleans_partial_output() {
    let h = Harness::new(ScriptedProcessor::new(vec![Behavior::FailMidway]));
    let job = h.enqueue_job(1000).await;

    let outcomes = h.dispatcher.run_once().await.unwrap();
    assert!(matches!(outcomes.as_slice(), [LeaseOutcome::Failed { .. }]));

    let failed = h.get(&job.id).await;
    assert_eq!(failed.status, JobStatus::Error);
    let message = failed.error.expect("error recorded");
    assert!(message.contains("encoder crashed"));
    // No resolved paths leak into the message
    assert!(!message.contains(&h.layout.upload_root().canonicalize().unwrap().display().to_string()));
    assert!(failed.output_path.is_none());

    assert!(!h.output_path(&job).exists());
    assert!(h.layout.resolve_upload(&job.file_path).is_valid());
    assert!(job.file_path.exists());
}

#[tokio::test]
async fn test_terminal_job_is_discarded() {
    let h = Harness::new(ScriptedProcessor::new(vec![Behavior::Shrink { output_bytes: 10 }]));
    let job = h.enqueue_job(100).await;
    h.store
        .transition(&job.id, &TransitionRequest::new(Transition::Cancel))
        .await
        .unwrap();

    let outcomes = h.dispatcher.run_once().await.unwrap();
    assert_eq!(
        outcomes,
        vec![LeaseOutcome::Discarded {
            status: JobStatus::Cancelled
        }]
    );
    assert_eq!(h.get(&job.id).await.status, JobStatus::Cancelled);
    assert!(!h.output_path(&job).exists());
    assert_eq!(h.queue.stats().await.unwrap().active, 0);
}

#[tokio::test]
async fn test_deleted_job_is_discarded() {
    let h = Harness::new(ScriptedProcessor::new(vec![Behavior::Shrink { output_bytes: 10 }]));
    let job = h.enqueue_job(100).await;
    h.store.delete(&job.id).await.unwrap();

    let outcomes = h.dispatcher.run_once().await.unwrap();
    assert_eq!(outcomes, vec![LeaseOutcome::Missing]);
}

#[tokio::test]
async fn test_cancel_during_run_wins() {
    let h = Harness::new(ScriptedProcessor::new(vec![Behavior::RunUntilCancelled]));
    let job = h.enqueue_job(1000).await;

    let dispatcher = h.dispatcher.clone();
    let running = tokio::spawn(async move { dispatcher.run_once().await });

    h.wait_for_progress(&job.id).await;
    h.store
        .transition(&job.id, &TransitionRequest::new(Transition::Cancel))
        .await
        .unwrap();

    let outcomes = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        outcomes,
        vec![LeaseOutcome::Superseded {
            status: Some(JobStatus::Cancelled)
        }]
    );

    let cancelled = h.get(&job.id).await;
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.output_path.is_none());
    assert!(!h.output_path(&job).exists());
}

#[tokio::test]
async fn test_pause_stops_run_and_resume_restarts() {
    let h = Harness::new(ScriptedProcessor::new(vec![
        Behavior::RunUntilCancelled,
        Behavior::Shrink { output_bytes: 400 },
    ]));
    let job = h.enqueue_job(1000).await;

    let dispatcher = h.dispatcher.clone();
    let running = tokio::spawn(async move { dispatcher.run_once().await });
    h.wait_for_progress(&job.id).await;
    h.store
        .transition(&job.id, &TransitionRequest::new(Transition::Pause))
        .await
        .unwrap();

    let outcomes = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        outcomes,
        vec![LeaseOutcome::Superseded {
            status: Some(JobStatus::Paused)
        }]
    );
    assert!(!h.output_path(&job).exists());

    let resumed = h
        .store
        .transition(&job.id, &TransitionRequest::new(Transition::Resume))
        .await
        .unwrap();
    assert_eq!(resumed.job.status, JobStatus::Queued);
    assert_eq!(resumed.job.progress, 0);
    h.queue.enqueue(&job.id, Priority::default()).await.unwrap();

    let outcomes = h.dispatcher.run_once().await.unwrap();
    assert_eq!(
        outcomes,
        vec![LeaseOutcome::Completed {
            compression_ratio: 60
        }]
    );
    assert_eq!(h.get(&job.id).await.attempt, 2);
}

#[tokio::test]
async fn test_concurrent_leases_process_once() {
    let h = Harness::new(ScriptedProcessor::new(vec![Behavior::Shrink { output_bytes: 100 }]));
    let job = h.enqueue_job(1000).await;

    let lease = h.queue.lease("worker-a", 1).await.unwrap().remove(0);
    let duplicate = squish_queue::Lease {
        token: "duplicate-delivery".to_string(),
        worker: "worker-b".to_string(),
        ..lease.clone()
    };
    let other = h.second_dispatcher();

    let (a, b) = tokio::join!(h.dispatcher.process_lease(lease), other.process_lease(duplicate));
    let completed = [&a, &b]
        .iter()
        .filter(|o| matches!(o, LeaseOutcome::Completed { .. }))
        .count();
    assert_eq!(completed, 1, "outcomes: {a:?} / {b:?}");
    for outcome in [&a, &b] {
        assert!(matches!(
            outcome,
            LeaseOutcome::Completed { .. }
                | LeaseOutcome::Superseded { .. }
                | LeaseOutcome::Discarded { .. }
        ));
    }

    let done = h.get(&job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempt, 1);
}

#[tokio::test]
async fn test_crashed_worker_lease_is_reclaimed() {
    let queue_config = QueueConfig::default()
        .with_visibility_timeout(Duration::from_millis(100))
        .with_backoff(BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5)));
    let h = Harness::with(
        ScriptedProcessor::new(vec![Behavior::Shrink { output_bytes: 500 }]),
        queue_config,
        |_| {},
    );
    let job = h.enqueue_job(1000).await;

    // A worker leases and starts the job, then dies
    let crashed = h.queue.lease("worker-crashed", 1).await.unwrap();
    assert_eq!(crashed.len(), 1);
    h.store
        .transition(&job.id, &TransitionRequest::new(Transition::Start))
        .await
        .unwrap();
    assert_eq!(
        h.store.record_progress(&job.id, 1, 30).await.unwrap(),
        ProgressOutcome::Applied
    );

    tokio::time::sleep(Duration::from_millis(150)).await;
    let released = h.dispatcher.reclaim_once().await.unwrap();
    assert_eq!(released.len(), 1);
    assert!(matches!(released[0].outcome, Redelivery::Retrying { attempt: 1, .. }));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let outcomes = h.dispatcher.run_once().await.unwrap();
    assert_eq!(
        outcomes,
        vec![LeaseOutcome::Completed {
            compression_ratio: 50
        }]
    );

    let done = h.get(&job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempt, 2);

    // The crashed worker's writes are fenced off
    assert!(h.store.record_progress(&job.id, 1, 80).await.unwrap().is_stale());
    let err = assert_err!(
        h.store
            .transition(&job.id, &TransitionRequest::new(Transition::Complete).fenced(1))
            .await
    );
    assert!(err.is_stale());
}

#[tokio::test]
async fn test_exhausted_attempts_abandon_job() {
    let queue_config = QueueConfig::default()
        .with_max_attempts(1)
        .with_visibility_timeout(Duration::from_millis(50));
    let h = Harness::with(
        ScriptedProcessor::new(vec![Behavior::Shrink { output_bytes: 10 }]),
        queue_config,
        |_| {},
    );
    let job = h.enqueue_job(100).await;

    let _crashed = h.queue.lease("worker-crashed", 1).await.unwrap();
    h.store
        .transition(&job.id, &TransitionRequest::new(Transition::Start))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let released = h.dispatcher.reclaim_once().await.unwrap();
    assert!(matches!(
        released[0].outcome,
        Redelivery::DeadLettered { attempts: 1 }
    ));

    let abandoned = h.get(&job.id).await;
    assert_eq!(abandoned.status, JobStatus::Error);
    assert_eq!(
        abandoned.error.as_deref(),
        Some("processing abandoned after 1 attempts")
    );
    assert_eq!(h.queue.stats().await.unwrap().failed, 1);
}

#[tokio::test]
async fn test_job_timeout_fails_job() {
    let h = Harness::with(
        ScriptedProcessor::new(vec![Behavior::RunUntilCancelled]),
        QueueConfig::default(),
        |config| config.job_timeout = Duration::from_millis(200),
    );
    let job = h.enqueue_job(100).await;

    let outcomes = tokio::time::timeout(Duration::from_secs(5), h.dispatcher.run_once())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcomes.as_slice(), [LeaseOutcome::Failed { .. }]));

    let failed = h.get(&job.id).await;
    assert_eq!(failed.status, JobStatus::Error);
    assert!(failed.error.unwrap().contains("timed out"));
    assert!(!h.output_path(&job).exists());
}

#[tokio::test]
async fn test_missing_source_fails_without_running() {
    let h = Harness::new(ScriptedProcessor::new(vec![Behavior::Shrink { output_bytes: 10 }]));
    let job = h.enqueue_job(100).await;
    std::fs::remove_file(&job.file_path).unwrap();

    let outcomes = h.dispatcher.run_once().await.unwrap();
    assert_eq!(
        outcomes,
        vec![LeaseOutcome::Failed {
            message: "source file is missing".to_string()
        }]
    );
    assert_eq!(h.get(&job.id).await.status, JobStatus::Error);
}

#[tokio::test]
async fn test_unregistered_type_fails() {
    let h = Harness::new(ScriptedProcessor::new(vec![Behavior::Shrink { output_bytes: 10 }]));
    let file_path = h.layout.upload_root().join("clip.mp4");
    std::fs::write(&file_path, b"frames").unwrap();
    let job = Job::new(
        NewJob {
            original_name: "clip.mp4".to_string(),
            storage_name: "clip.mp4".to_string(),
            file_path,
            size: 6,
            file_type: FileType::Video,
            settings: JobSettings::new(),
        },
        chrono::Duration::hours(1),
    );
    h.store.create(&job).await.unwrap();
    h.store
        .transition(&job.id, &TransitionRequest::new(Transition::Enqueue))
        .await
        .unwrap();
    h.queue.enqueue(&job.id, Priority::default()).await.unwrap();

    let outcomes = h.dispatcher.run_once().await.unwrap();
    assert_eq!(
        outcomes,
        vec![LeaseOutcome::Failed {
            message: "no processor registered for video files".to_string()
        }]
    );
}

#[tokio::test]
async fn test_run_loop_drains_queue_and_stops() {
    let h = Harness::new(ScriptedProcessor::new(vec![Behavior::Shrink { output_bytes: 10 }]));
    let jobs = vec![
        h.enqueue_job(100).await,
        h.enqueue_job(100).await,
        h.enqueue_job(100).await,
    ];

    let dispatcher = h.dispatcher.clone();
    let handle = tokio::spawn(async move { dispatcher.run().await });

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let mut done = 0;
            for job in &jobs {
                if h.get(&job.id).await.status == JobStatus::Completed {
                    done += 1;
                }
            }
            if done == jobs.len() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all jobs completed");

    h.dispatcher.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
