//! Upload and output roots.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::StorageResult;
use crate::naming::output_name;
use crate::resolver::{validate, PathCheck, Rejection};

/// The two directories the core is allowed to touch.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    upload_root: PathBuf,
    output_root: PathBuf,
}

impl StorageLayout {
    pub fn new(upload_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            upload_root: upload_root.into(),
            output_root: output_root.into(),
        }
    }

    /// Create both roots if they are missing.
    pub async fn init(&self) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.upload_root).await?;
        tokio::fs::create_dir_all(&self.output_root).await?;
        info!(
            upload_root = %self.upload_root.display(),
            output_root = %self.output_root.display(),
            "Storage roots ready"
        );
        Ok(())
    }

    pub fn upload_root(&self) -> &Path {
        &self.upload_root
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Validate a source path against the upload root.
    pub fn resolve_upload(&self, path: impl AsRef<Path>) -> PathCheck {
        validate(path, &self.upload_root)
    }

    /// Validate an output path against the output root.
    pub fn resolve_output(&self, path: impl AsRef<Path>) -> PathCheck {
        validate(path, &self.output_root)
    }

    /// Output location for a job, named after the job key only.
    pub fn output_path_for(&self, job_key: &str, extension: &str) -> PathCheck {
        match output_name(job_key, extension) {
            Some(file_name) => validate(Path::new(&file_name), &self.output_root),
            None => PathCheck::Invalid(Rejection::UnsafeName),
        }
    }
}
