//! Structured per-job logging.

use tracing::{error, info, warn, Span};

use squish_models::{FileType, JobId};

/// Logger carrying the job id, file type and processing attempt.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    file_type: &'static str,
    attempt: u32,
}

impl JobLogger {
    pub fn new(job_id: &JobId, file_type: FileType, attempt: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            file_type: file_type.as_str(),
            attempt,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            file_type = self.file_type,
            attempt = self.attempt,
            "Job started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            file_type = self.file_type,
            attempt = self.attempt,
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            file_type = self.file_type,
            attempt = self.attempt,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            file_type = self.file_type,
            attempt = self.attempt,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            file_type = self.file_type,
            attempt = self.attempt,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Span for everything done under one lease.
pub fn lease_span(job_id: &JobId, delivery: u32, worker: &str) -> Span {
    tracing::info_span!("job", job_id = %job_id, delivery, worker = %worker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_fields() {
        let job_id = JobId::from("job-42");
        let logger = JobLogger::new(&job_id, FileType::Video, 3);
        assert_eq!(logger.job_id(), "job-42");
        assert_eq!(logger.attempt(), 3);
    }
}
