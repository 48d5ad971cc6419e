//! Job record and partial updates.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job_status::{JobStatus, Transition, TransitionError};

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of uploaded file; selects the delegate processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Image,
    Video,
    Audio,
    Document,
}

impl FileType {
    pub const ALL: [FileType; 4] = [
        FileType::Image,
        FileType::Video,
        FileType::Audio,
        FileType::Document,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Image => "image",
            FileType::Video => "video",
            FileType::Audio => "audio",
            FileType::Document => "document",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown file type: {s}"))
    }
}

/// Type-specific processing settings, opaque to the lifecycle core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobSettings(pub BTreeMap<String, serde_json::Value>);

impl JobSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a setting (builder style).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(|v| v.as_u64())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Ingestion input: everything the upload collaborator hands over.
///
/// Server-controlled fields (id, timestamps, status) are absent on purpose.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub original_name: String,
    pub storage_name: String,
    pub file_path: PathBuf,
    pub size: u64,
    pub file_type: FileType,
    pub settings: JobSettings,
}

/// A file transformation request and its tracked lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Name supplied by the uploader; display only
    pub original_name: String,
    /// Server-generated on-disk name
    pub storage_name: String,
    /// Source file location under the upload root
    pub file_path: PathBuf,
    /// Source size in bytes
    pub size: u64,
    #[serde(rename = "type")]
    pub file_type: FileType,
    #[serde(default)]
    pub settings: JobSettings,
    #[serde(default)]
    pub status: JobStatus,
    /// Progress (0-100)
    #[serde(default)]
    pub progress: u8,
    /// Processing attempt counter, used to fence stale workers
    #[serde(default)]
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// End of the retention window
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<i64>,
}

/// Why a transition request was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionRejected {
    /// The edge is not in the lifecycle table.
    Illegal(TransitionError),
    /// The caller's attempt number no longer matches the record.
    StaleAttempt { expected: u32, actual: u32, status: JobStatus },
}

/// Result of a fenced progress write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    Applied,
    /// Lower than the current value; ignored.
    Regressed { current: u8 },
    /// The job left `processing` or moved to a newer attempt.
    Stale { status: JobStatus, attempt: u32 },
}

impl ProgressOutcome {
    pub fn is_stale(&self) -> bool {
        matches!(self, ProgressOutcome::Stale { .. })
    }
}

impl Job {
    /// Create a freshly ingested job. Timestamps come from the server clock.
    pub fn new(new: NewJob, retention: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            original_name: new.original_name,
            storage_name: new.storage_name,
            file_path: new.file_path,
            size: new.size,
            file_type: new.file_type,
            settings: new.settings,
            status: JobStatus::Uploaded,
            progress: 0,
            attempt: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + retention,
            error: None,
            output_path: None,
            compressed_size: None,
            compression_ratio: None,
        }
    }

    /// Whether the retention window has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Merge a partial update and bump `updated_at`.
    pub fn apply_patch(&mut self, patch: &JobPatch, now: DateTime<Utc>) {
        if let Some(progress) = patch.progress {
            self.progress = progress.min(100);
        }
        if let Some(error) = &patch.error {
            self.error = error.clone();
        }
        if let Some(output_path) = &patch.output_path {
            self.output_path = output_path.clone();
        }
        if let Some(size) = patch.compressed_size {
            self.compressed_size = size;
        }
        if let Some(ratio) = patch.compression_ratio {
            self.compression_ratio = ratio;
        }
        if let Some(settings) = &patch.settings {
            self.settings = settings.clone();
        }
        if let Some(expires_at) = patch.expires_at {
            self.expires_at = expires_at;
        }
        self.updated_at = now;
    }

    /// Apply a lifecycle transition together with its patch, all or nothing.
    ///
    /// When `fence` is set, the record's attempt must match it. On rejection the
    /// record is left untouched, timestamps included.
    pub fn apply_transition(
        &mut self,
        transition: Transition,
        fence: Option<u32>,
        patch: &JobPatch,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionRejected> {
        if let Some(expected) = fence {
            if expected != self.attempt {
                return Err(TransitionRejected::StaleAttempt {
                    expected,
                    actual: self.attempt,
                    status: self.status,
                });
            }
        }

        let next = transition
            .apply(self.status)
            .map_err(TransitionRejected::Illegal)?;

        if transition.clears_outcome() {
            self.error = None;
            self.output_path = None;
            self.compressed_size = None;
            self.compression_ratio = None;
        }
        if transition.resets_progress() {
            self.progress = 0;
        }
        if transition.opens_attempt() {
            self.attempt += 1;
        }
        self.status = next;
        self.apply_patch(patch, now);
        Ok(())
    }

    /// Record delegate progress for a specific attempt.
    ///
    /// Progress never decreases within an attempt, and writes from an attempt
    /// that is no longer current are refused.
    pub fn record_progress(&mut self, attempt: u32, progress: u8, now: DateTime<Utc>) -> ProgressOutcome {
        if self.status != JobStatus::Processing || self.attempt != attempt {
            return ProgressOutcome::Stale {
                status: self.status,
                attempt: self.attempt,
            };
        }
        let progress = progress.min(100);
        if progress < self.progress {
            return ProgressOutcome::Regressed {
                current: self.progress,
            };
        }
        self.progress = progress;
        self.updated_at = now;
        ProgressOutcome::Applied
    }
}

/// Partial update of non-status fields.
///
/// `Option<Option<T>>` fields distinguish "leave alone" (`None`) from
/// "clear" (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<Option<PathBuf>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<Option<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<Option<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<JobSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(Some(message.into()));
        self
    }

    /// Set output metadata after a successful run.
    pub fn output(mut self, path: PathBuf, compressed_size: u64, ratio: i64) -> Self {
        self.output_path = Some(Some(path));
        self.compressed_size = Some(Some(compressed_size));
        self.compression_ratio = Some(Some(ratio));
        self
    }

    pub fn settings(mut self, settings: JobSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// `round((original - output) / original * 100)`; 0 for an empty source.
pub fn compression_ratio(original_size: u64, output_size: u64) -> i64 {
    if original_size == 0 {
        return 0;
    }
    let saved = original_size as f64 - output_size as f64;
    (saved / original_size as f64 * 100.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::new(
            NewJob {
                original_name: "holiday.jpg".to_string(),
                storage_name: "1700000000000-abcd.jpg".to_string(),
                file_path: PathBuf::from("/uploads/1700000000000-abcd.jpg"),
                size: 1000,
                file_type: FileType::Image,
                settings: JobSettings::new().with("quality", 80).with("format", "webp"),
            },
            Duration::hours(24),
        )
    }

    #[test]
    fn test_job_creation() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Uploaded);
        assert_eq!(job.progress, 0);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.created_at, job.updated_at);
        assert_eq!(job.expires_at - job.created_at, Duration::hours(24));
    }

    #[test]
    fn test_settings_serde_structural_equality() {
        let job = sample_job();
        let json = serde_json::to_string(&job).expect("serialize job");
        let decoded: Job = serde_json::from_str(&json).expect("deserialize job");
        assert_eq!(decoded.settings, job.settings);
        assert_eq!(decoded.settings.get_u64("quality"), Some(80));
        assert_eq!(decoded.settings.get_str("format"), Some("webp"));
    }

    #[test]
    fn test_rejected_transition_leaves_record_untouched() {
        let mut job = sample_job();
        let before = job.clone();
        let later = job.updated_at + Duration::seconds(5);

        let err = job
            .apply_transition(Transition::Complete, None, &JobPatch::new().progress(100), later)
            .unwrap_err();

        assert!(matches!(err, TransitionRejected::Illegal(_)));
        assert_eq!(job, before);
    }

    #[test]
    fn test_start_opens_attempt_and_resets_progress() {
        let mut job = sample_job();
        let now = Utc::now();
        job.apply_transition(Transition::Enqueue, None, &JobPatch::new(), now).unwrap();
        job.apply_transition(Transition::Start, None, &JobPatch::new(), now).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempt, 1);

        assert_eq!(job.record_progress(1, 40, now), ProgressOutcome::Applied);
        assert_eq!(
            job.record_progress(1, 20, now),
            ProgressOutcome::Regressed { current: 40 }
        );

        job.apply_transition(Transition::Reclaim, None, &JobPatch::new(), now).unwrap();
        assert_eq!(job.attempt, 2);
        assert_eq!(job.progress, 0);
        assert!(job.record_progress(1, 90, now).is_stale());
    }

    #[test]
    fn test_fenced_transition_rejects_old_attempt() {
        let mut job = sample_job();
        let now = Utc::now();
        job.apply_transition(Transition::Enqueue, None, &JobPatch::new(), now).unwrap();
        job.apply_transition(Transition::Start, None, &JobPatch::new(), now).unwrap();

        let err = job
            .apply_transition(Transition::Complete, Some(0), &JobPatch::new(), now)
            .unwrap_err();
        assert_eq!(
            err,
            TransitionRejected::StaleAttempt {
                expected: 0,
                actual: 1,
                status: JobStatus::Processing
            }
        );
    }

    #[test]
    fn test_retry_clears_outcome() {
        let mut job = sample_job();
        let now = Utc::now();
        job.status = JobStatus::Error;
        job.progress = 55;
        job.error = Some("delegate crashed".to_string());

        job.apply_transition(Transition::Retry, None, &JobPatch::new(), now).unwrap();
        assert_eq!(job.status, JobStatus::Uploaded);
        assert_eq!(job.progress, 0);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_progress_refused_outside_processing() {
        let mut job = sample_job();
        job.status = JobStatus::Cancelled;
        assert_eq!(
            job.record_progress(0, 10, Utc::now()),
            ProgressOutcome::Stale {
                status: JobStatus::Cancelled,
                attempt: 0
            }
        );
        assert_eq!(job.progress, 0);
    }

    #[test]
    fn test_compression_ratio() {
        assert_eq!(compression_ratio(1000, 250), 75);
        assert_eq!(compression_ratio(3, 2), 33);
        assert_eq!(compression_ratio(1000, 1500), -50);
        assert_eq!(compression_ratio(0, 10), 0);
    }
}
