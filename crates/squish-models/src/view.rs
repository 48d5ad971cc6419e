//! User-visible job snapshot.
//!
//! Never carries filesystem paths: callers that need the output file ask for
//! a freshly validated path through the service.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::{FileType, Job, JobId, JobSettings};
use crate::job_status::{JobAction, JobStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub original_name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub settings: JobSettings,
    pub status: JobStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<i64>,
    /// Control actions currently legal for this job
    pub actions: Vec<JobAction>,
    /// Whether a download can be requested
    pub download_ready: bool,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            original_name: job.original_name.clone(),
            size: job.size,
            file_type: job.file_type,
            settings: job.settings.clone(),
            status: job.status,
            progress: job.progress,
            created_at: job.created_at,
            updated_at: job.updated_at,
            expires_at: job.expires_at,
            error: job.error.clone(),
            compressed_size: job.compressed_size,
            compression_ratio: job.compression_ratio,
            actions: job.status.legal_actions(),
            download_ready: job.status == JobStatus::Completed && job.output_path.is_some(),
        }
    }
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        JobView::from(&job)
    }
}
