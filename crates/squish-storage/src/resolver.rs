//! Secure path resolution.
//!
//! Every filesystem operation in the workspace takes a [`SafePath`], and the
//! only way to obtain one is [`validate`]: both operands are canonicalized
//! (`.`, `..` and symlinks resolved) and the result must be the allowed root
//! itself or a strict descendant of it. Failures are reported as
//! [`PathCheck::Invalid`], never as an error, so callers have to branch.

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use unicode_normalization::UnicodeNormalization;

/// A canonical path proven to sit inside an allowed root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SafePath(PathBuf);

impl SafePath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    pub fn file_name(&self) -> Option<&OsStr> {
        self.0.file_name()
    }
}

impl AsRef<Path> for SafePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for SafePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Why a path was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    NullByte,
    /// The NFKC form of the path escapes the root.
    UnicodeEscape,
    /// The allowed root does not exist or cannot be canonicalized.
    RootUnavailable,
    /// A component could not be resolved (dangling or looping symlink).
    Unresolvable,
    OutsideRoot,
    /// A generated file name was built from an unusable key.
    UnsafeName,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::Empty => "empty path",
            Rejection::NullByte => "path contains null bytes",
            Rejection::UnicodeEscape => "path normalizes outside the allowed root",
            Rejection::RootUnavailable => "allowed root is unavailable",
            Rejection::Unresolvable => "path cannot be resolved",
            Rejection::OutsideRoot => "path is outside the allowed root",
            Rejection::UnsafeName => "file name key is not a plain identifier",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of [`validate`].
#[must_use = "an invalid path must never be used for I/O"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathCheck {
    Valid(SafePath),
    Invalid(Rejection),
}

impl PathCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, PathCheck::Valid(_))
    }

    /// The resolved path, only when valid.
    pub fn resolved(&self) -> Option<&Path> {
        match self {
            PathCheck::Valid(safe) => Some(safe.as_path()),
            PathCheck::Invalid(_) => None,
        }
    }

    pub fn into_safe(self) -> Option<SafePath> {
        match self {
            PathCheck::Valid(safe) => Some(safe),
            PathCheck::Invalid(_) => None,
        }
    }

    pub fn into_result(self) -> Result<SafePath, Rejection> {
        match self {
            PathCheck::Valid(safe) => Ok(safe),
            PathCheck::Invalid(reason) => Err(reason),
        }
    }
}

/// Validate `requested` against `allowed_root`.
///
/// Relative paths are interpreted against the root. The NFKC-normalized form
/// of the path must also stay inside the root, so look-alike characters such
/// as fullwidth dots cannot be turned into traversal by a later normalizer.
pub fn validate(requested: impl AsRef<Path>, allowed_root: impl AsRef<Path>) -> PathCheck {
    let requested = requested.as_ref();

    if requested.as_os_str().is_empty() {
        return PathCheck::Invalid(Rejection::Empty);
    }
    if requested.as_os_str().as_encoded_bytes().contains(&0) {
        return PathCheck::Invalid(Rejection::NullByte);
    }

    let root = match fs::canonicalize(allowed_root.as_ref()) {
        Ok(root) => root,
        Err(_) => return PathCheck::Invalid(Rejection::RootUnavailable),
    };

    let resolved = match contain(requested, &root) {
        Ok(resolved) => resolved,
        Err(reason) => return PathCheck::Invalid(reason),
    };

    if let Some(raw) = requested.to_str() {
        let normalized: String = raw.nfkc().collect();
        if normalized != raw && contain(Path::new(&normalized), &root).is_err() {
            return PathCheck::Invalid(Rejection::UnicodeEscape);
        }
    }

    PathCheck::Valid(SafePath(resolved))
}

fn contain(requested: &Path, root: &Path) -> Result<PathBuf, Rejection> {
    let resolved = resolve(&root.join(requested))?;
    if resolved.starts_with(root) {
        Ok(resolved)
    } else {
        Err(Rejection::OutsideRoot)
    }
}

/// Resolve an absolute path component by component.
///
/// The prefix built so far is always canonical, so `..` can be applied by
/// popping. Components that do not exist yet are appended lexically.
fn resolve(path: &Path) -> Result<PathBuf, Rejection> {
    let mut current = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => current.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                current.pop();
            }
            Component::Normal(name) => {
                current.push(name);
                if fs::symlink_metadata(&current).is_ok() {
                    current = fs::canonicalize(&current).map_err(|_| Rejection::Unresolvable)?;
                }
            }
        }
    }

    Ok(current)
}
