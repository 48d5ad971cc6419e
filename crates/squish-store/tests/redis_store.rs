//! Redis job store integration tests.
//!
//! Run with `cargo test -- --ignored` against a local Redis (`REDIS_URL`).

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;

use squish_models::{FileType, Job, JobId, JobSettings, JobStatus, NewJob, ProgressOutcome, Transition};
use squish_store::{JobQuery, JobStore, RedisJobStore, StoreConfig, TransitionRequest};

fn test_store() -> RedisJobStore {
    let config = StoreConfig {
        prefix: format!("squish-test-{}", JobId::new()),
        ..StoreConfig::from_env()
    };
    RedisJobStore::new(config).expect("redis client")
}

fn new_job() -> Job {
    Job::new(
        NewJob {
            original_name: "clip.mp4".to_string(),
            storage_name: "1700000000000-abcd.mp4".to_string(),
            file_path: PathBuf::from("/uploads/1700000000000-abcd.mp4"),
            size: 4096,
            file_type: FileType::Video,
            settings: JobSettings::new().with("crf", 28),
        },
        Duration::hours(1),
    )
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_round_trip_and_delete() {
    let store = test_store();
    let job = new_job();
    store.create(&job).await.unwrap();

    let fetched = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(fetched.settings, job.settings);
    assert!(store.create(&job).await.is_err());

    assert_eq!(store.list(&JobQuery::new()).await.unwrap().total, 1);
    assert!(store.delete(&job.id).await.unwrap());
    assert!(!store.delete(&job.id).await.unwrap());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_concurrent_progress_and_cancel() {
    let store = Arc::new(test_store());
    let job = new_job();
    store.create(&job).await.unwrap();
    store
        .transition(&job.id, &TransitionRequest::new(Transition::Enqueue))
        .await
        .unwrap();
    let attempt = store
        .transition(&job.id, &TransitionRequest::new(Transition::Start))
        .await
        .unwrap()
        .job
        .attempt;

    let mut handles = Vec::new();
    for value in 1..=20u8 {
        let store = Arc::clone(&store);
        let id = job.id.clone();
        handles.push(tokio::spawn(async move {
            store.record_progress(&id, attempt, value * 5).await
        }));
    }
    store
        .transition(&job.id, &TransitionRequest::new(Transition::Cancel))
        .await
        .unwrap();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            ProgressOutcome::Applied | ProgressOutcome::Regressed { .. } | ProgressOutcome::Stale { .. }
        ));
    }

    let current = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Cancelled);
    store.delete(&job.id).await.unwrap();
}
