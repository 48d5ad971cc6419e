//! Job store behaviour against the in-process implementation.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_test::{assert_err, assert_ok};

use squish_models::{
    FileType, Job, JobId, JobPatch, JobSettings, JobStatus, NewJob, ProgressOutcome, Transition,
};
use squish_store::{
    JobFilter, JobQuery, JobStore, MemoryJobStore, SortConfig, SortDirection, SortField,
    StoreError, TransitionRequest,
};

fn new_job(name: &str, size: u64) -> Job {
    Job::new(
        NewJob {
            original_name: name.to_string(),
            storage_name: format!("1700000000000-{name}"),
            file_path: PathBuf::from(format!("/uploads/{name}")),
            size,
            file_type: FileType::Image,
            settings: JobSettings::new().with("quality", 80).with("format", "webp"),
        },
        Duration::hours(24),
    )
}

async fn processing(store: &MemoryJobStore) -> Job {
    let job = new_job("a.png", 1000);
    store.create(&job).await.unwrap();
    store
        .transition(&job.id, &TransitionRequest::new(Transition::Enqueue))
        .await
        .unwrap();
    store
        .transition(&job.id, &TransitionRequest::new(Transition::Start))
        .await
        .unwrap()
        .job
}

#[tokio::test]
async fn test_create_get_round_trip() {
    let store = MemoryJobStore::new();
    let job = new_job("a.png", 1000);
    store.create(&job).await.unwrap();

    let fetched = store.get(&job.id).await.unwrap().expect("job exists");
    assert_eq!(fetched.settings, job.settings);
    assert_eq!(fetched.created_at, job.created_at);
    assert_eq!(fetched.status, JobStatus::Uploaded);
}

#[tokio::test]
async fn test_duplicate_create_conflicts() {
    let store = MemoryJobStore::new();
    let job = new_job("a.png", 1000);
    assert_ok!(store.create(&job).await);

    let err = assert_err!(store.create(&job).await);
    assert!(matches!(err, StoreError::AlreadyExists(_)));
    assert!(err.is_conflict());
}

#[tokio::test]
async fn test_update_does_not_resurrect() {
    let store = MemoryJobStore::new();
    let id = JobId::new();
    let updated = store.update(&id, &JobPatch::new().progress(10)).await.unwrap();
    assert!(updated.is_none());
    assert!(store.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_update_bumps_updated_at_only() {
    let store = MemoryJobStore::new();
    let job = new_job("a.png", 1000);
    store.create(&job).await.unwrap();

    let updated = store
        .update(&job.id, &JobPatch::new().error("note"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.status, JobStatus::Uploaded);
    assert_eq!(updated.created_at, job.created_at);
    assert!(updated.updated_at >= job.updated_at);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let store = MemoryJobStore::new();
    let job = new_job("a.png", 1000);
    store.create(&job).await.unwrap();

    assert!(store.delete(&job.id).await.unwrap());
    assert!(!store.delete(&job.id).await.unwrap());
    assert!(store.get(&job.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_illegal_transition_leaves_record_unchanged() {
    let store = MemoryJobStore::new();
    let job = new_job("a.png", 1000);
    store.create(&job).await.unwrap();

    let err = store
        .transition(&job.id, &TransitionRequest::new(Transition::Resume))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition(_)));
    assert_eq!(store.get(&job.id).await.unwrap().unwrap(), job);
}

#[tokio::test]
async fn test_transition_unknown_job() {
    let store = MemoryJobStore::new();
    let err = store
        .transition(&JobId::new(), &TransitionRequest::new(Transition::Cancel))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn test_concurrent_start_has_one_winner() {
    let store = Arc::new(MemoryJobStore::new());
    let job = new_job("a.png", 1000);
    store.create(&job).await.unwrap();
    store
        .transition(&job.id, &TransitionRequest::new(Transition::Enqueue))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let id = job.id.clone();
        handles.push(tokio::spawn(async move {
            store
                .transition(&id, &TransitionRequest::new(Transition::Start))
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(err) => assert!(err.is_conflict()),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.get(&job.id).await.unwrap().unwrap().attempt, 1);
}

#[tokio::test]
async fn test_cancel_beats_progress_and_completion() {
    let store = MemoryJobStore::new();
    let job = processing(&store).await;

    assert_eq!(
        store.record_progress(&job.id, job.attempt, 30).await.unwrap(),
        ProgressOutcome::Applied
    );
    store
        .transition(&job.id, &TransitionRequest::new(Transition::Cancel))
        .await
        .unwrap();

    let outcome = store.record_progress(&job.id, job.attempt, 60).await.unwrap();
    assert!(outcome.is_stale());

    let err = store
        .transition(
            &job.id,
            &TransitionRequest::new(Transition::Complete)
                .fenced(job.attempt)
                .with_patch(JobPatch::new().progress(100)),
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let current = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Cancelled);
    assert_eq!(current.progress, 30);
}

#[tokio::test]
async fn test_reclaim_fences_previous_attempt() {
    let store = MemoryJobStore::new();
    let job = processing(&store).await;

    let reclaimed = store
        .transition(&job.id, &TransitionRequest::new(Transition::Reclaim))
        .await
        .unwrap();
    assert_eq!(reclaimed.previous, JobStatus::Processing);
    assert_eq!(reclaimed.job.attempt, job.attempt + 1);

    let err = store
        .transition(
            &job.id,
            &TransitionRequest::new(Transition::Complete).fenced(job.attempt),
        )
        .await
        .unwrap_err();
    assert!(err.is_stale());
}

#[tokio::test]
async fn test_expired_records_are_hidden_but_sweepable() {
    let store = MemoryJobStore::new();
    let job = new_job("a.png", 1000);
    store.create(&job).await.unwrap();
    store
        .update(&job.id, &JobPatch::new().expires_at(Utc::now() - Duration::seconds(1)))
        .await
        .unwrap();

    assert!(store.get(&job.id).await.unwrap().is_none());
    assert_eq!(store.list(&JobQuery::new()).await.unwrap().total, 0);

    let expired = store.expired(Utc::now(), 10).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, job.id);
}

#[tokio::test]
async fn test_list_filters_and_orders() {
    let store = MemoryJobStore::new();
    for (name, size) in [("small.png", 10), ("large.png", 10_000), ("mid.png", 500)] {
        store.create(&new_job(name, size)).await.unwrap();
    }

    let page = store
        .list(
            &JobQuery::new()
                .filter(JobFilter::default().status(JobStatus::Uploaded))
                .sort(SortConfig::new(SortField::Size, SortDirection::Descending)),
        )
        .await
        .unwrap();

    let names: Vec<&str> = page.jobs.iter().map(|j| j.original_name.as_str()).collect();
    assert_eq!(names, vec!["large.png", "mid.png", "small.png"]);
    assert_eq!(page.total, 3);
}
