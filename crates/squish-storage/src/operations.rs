//! File operations gated on [`SafePath`].

use std::io;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::resolver::SafePath;

/// Size of a regular file, or `None` when it does not exist.
pub async fn file_size(path: &SafePath) -> StorageResult<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Err(StorageError::NotAFile(display_name(path))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Whether a regular file exists at `path`.
pub async fn file_exists(path: &SafePath) -> StorageResult<bool> {
    Ok(file_size(path).await?.is_some())
}

/// Remove a file. Missing files are not an error; returns whether one was removed.
pub async fn remove_file(path: &SafePath) -> StorageResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(file = %display_name(path), "Removed file");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Hex-encoded SHA-256 of a file's contents.
pub async fn sha256_file(path: &SafePath) -> StorageResult<String> {
    let path = path.clone();
    let digest = tokio::task::spawn_blocking(move || -> io::Result<String> {
        let mut file = std::fs::File::open(path.as_path())?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| StorageError::Io(io::Error::other(e)))??;
    Ok(digest)
}

/// File name only, for logs and messages that must not leak directories.
pub fn display_name(path: &SafePath) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
