//! Durable job records for Squish.
//!
//! This crate provides:
//! - The [`JobStore`] contract with atomic lifecycle transitions
//! - An in-process implementation for tests and single-node use
//! - A Redis implementation using compare-and-swap writes
//! - Listing filters, sorting and pagination

pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod query;
pub mod redis_store;
pub mod repo;

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryJobStore;
pub use query::{
    normalize_page_size, JobFilter, JobPage, JobQuery, PageRequest, SortConfig, SortDirection,
    SortField,
};
pub use redis_store::RedisJobStore;
pub use repo::{JobStore, TransitionRequest, Transitioned};
