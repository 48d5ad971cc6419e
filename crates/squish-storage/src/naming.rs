//! Collision-resistant storage names.
//!
//! The on-disk identity of an upload is `<unix millis>-<128-bit random hex>`
//! plus a sanitized extension. Nothing from the uploader's file name reaches
//! the filesystem except an allow-listed extension.

use chrono::Utc;

/// Longest extension carried over from the original name.
const MAX_EXTENSION_LEN: usize = 8;

/// Generate a storage file name for an upload.
pub fn storage_name(original_name: &str) -> String {
    let token: u128 = rand::random();
    let stamp = Utc::now().timestamp_millis();
    match safe_extension(original_name) {
        Some(ext) => format!("{stamp}-{token:032x}.{ext}"),
        None => format!("{stamp}-{token:032x}"),
    }
}

/// Lower-cased ASCII alphanumeric extension of `name`, if it has a usable one.
pub fn safe_extension(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > MAX_EXTENSION_LEN {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Output file name for a job: `<job key>.<extension>`.
///
/// The key must be a plain identifier (ASCII alphanumerics, `-`, `_`), so
/// two jobs never share an output file and no user text reaches the name.
pub fn output_name(job_key: &str, extension: &str) -> Option<String> {
    if job_key.is_empty()
        || !job_key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return None;
    }
    match safe_extension(&format!("out.{extension}")) {
        Some(ext) => Some(format!("{job_key}.{ext}")),
        None => Some(job_key.to_string()),
    }
}
