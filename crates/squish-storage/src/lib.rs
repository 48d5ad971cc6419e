//! Secure filesystem boundary for Squish.
//!
//! This crate provides:
//! - Path canonicalization and containment checks ([`validate`])
//! - Collision-resistant storage names decoupled from user input
//! - The upload/output root layout
//! - File operations that only accept validated paths

pub mod error;
pub mod layout;
pub mod naming;
pub mod operations;
pub mod resolver;

pub use error::{StorageError, StorageResult};
pub use layout::StorageLayout;
pub use naming::{output_name, safe_extension, storage_name};
pub use operations::{display_name, file_exists, file_size, remove_file, sha256_file};
pub use resolver::{validate, PathCheck, Rejection, SafePath};
