//! Job listing: filters, sorting and pagination.
//!
//! Both store implementations load the live records and hand them to
//! [`JobQuery::apply`], so ordering is identical everywhere: the requested
//! sort key first, then the job id as a deterministic tie-breaker.

use std::cmp::Ordering;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use squish_models::{FileType, Job, JobStatus};

// ============================================================================
// Filter
// ============================================================================

/// Filter for job listings. Empty vectors and `None` bounds match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub statuses: Vec<JobStatus>,
    #[serde(default)]
    pub file_types: Vec<FileType>,
    /// Inclusive lower bound on `created_at`
    pub created_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`
    pub created_until: Option<DateTime<Utc>>,
    /// Inclusive size bounds in bytes
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    /// Exact source path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
}

impl JobFilter {
    pub fn status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn file_type(mut self, file_type: FileType) -> Self {
        self.file_types.push(file_type);
        self
    }

    pub fn created_between(mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.created_from = Some(from);
        self.created_until = Some(until);
        self
    }

    pub fn size_between(mut self, min: u64, max: u64) -> Self {
        self.min_size = Some(min);
        self.max_size = Some(max);
        self
    }

    pub fn source(mut self, file_path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
            return false;
        }
        if !self.file_types.is_empty() && !self.file_types.contains(&job.file_type) {
            return false;
        }
        if self.created_from.is_some_and(|from| job.created_at < from) {
            return false;
        }
        if self.created_until.is_some_and(|until| job.created_at >= until) {
            return false;
        }
        if self.min_size.is_some_and(|min| job.size < min) {
            return false;
        }
        if self.max_size.is_some_and(|max| job.size > max) {
            return false;
        }
        if self.file_path.as_ref().is_some_and(|path| &job.file_path != path) {
            return false;
        }
        true
    }
}

// ============================================================================
// Sort Configuration
// ============================================================================

/// Supported sort fields for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    /// Sort by creation date (default)
    #[default]
    CreatedAt,
    UpdatedAt,
    /// Sort by original file name (case-sensitive)
    Name,
    Size,
    Status,
}

impl SortField {
    /// Parse from string, returning default if invalid.
    pub fn from_str_or_default(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "date" | "created_at" | "createdat" => Self::CreatedAt,
            "updated" | "updated_at" | "updatedat" => Self::UpdatedAt,
            "name" | "original_name" | "originalname" => Self::Name,
            "size" => Self::Size,
            "status" => Self::Status,
            _ => Self::CreatedAt,
        }
    }

    fn compare(&self, a: &Job, b: &Job) -> Ordering {
        match self {
            Self::CreatedAt => a.created_at.cmp(&b.created_at),
            Self::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            Self::Name => a.original_name.cmp(&b.original_name),
            Self::Size => a.size.cmp(&b.size),
            Self::Status => a.status.as_str().cmp(b.status.as_str()),
        }
    }
}

/// Sort direction for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    #[default]
    Descending,
}

impl SortDirection {
    /// Parse from string, returning default if invalid.
    pub fn from_str_or_default(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "asc" | "ascending" => Self::Ascending,
            _ => Self::Descending,
        }
    }
}

/// Complete sort configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortConfig {
    pub field: SortField,
    pub direction: SortDirection,
}

impl SortConfig {
    pub fn new(field: SortField, direction: SortDirection) -> Self {
        Self { field, direction }
    }

    /// Create from string parameters with validation.
    pub fn from_params(field: Option<&str>, direction: Option<&str>) -> Self {
        Self {
            field: field.map(SortField::from_str_or_default).unwrap_or_default(),
            direction: direction
                .map(SortDirection::from_str_or_default)
                .unwrap_or_default(),
        }
    }

    /// Total order over jobs. Ties on the sort key fall back to the id, ascending.
    pub fn compare(&self, a: &Job, b: &Job) -> Ordering {
        let primary = match self.direction {
            SortDirection::Ascending => self.field.compare(a, b),
            SortDirection::Descending => self.field.compare(b, a),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

// ============================================================================
// Pagination
// ============================================================================

/// Pagination limits.
pub const DEFAULT_PAGE_SIZE: u32 = 25;
pub const MIN_PAGE_SIZE: u32 = 1;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Normalize page size to valid range.
pub fn normalize_page_size(limit: Option<u32>) -> u32 {
    limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(offset: usize, limit: Option<u32>) -> Self {
        Self {
            offset,
            limit: normalize_page_size(limit),
        }
    }
}

/// A full listing request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobQuery {
    #[serde(default)]
    pub filter: JobFilter,
    #[serde(default)]
    pub sort: SortConfig,
    #[serde(default)]
    pub page: PageRequest,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: JobFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn sort(mut self, sort: SortConfig) -> Self {
        self.sort = sort;
        self
    }

    pub fn page(mut self, page: PageRequest) -> Self {
        self.page = page;
        self
    }

    /// Filter, sort and slice a set of live records.
    pub fn apply(&self, jobs: impl IntoIterator<Item = Job>) -> JobPage {
        let mut matching: Vec<Job> = jobs
            .into_iter()
            .filter(|job| self.filter.matches(job))
            .collect();
        matching.sort_by(|a, b| self.sort.compare(a, b));

        let total = matching.len();
        let limit = normalize_page_size(Some(self.page.limit)) as usize;
        let jobs: Vec<Job> = matching
            .into_iter()
            .skip(self.page.offset)
            .take(limit)
            .collect();
        let has_more = self.page.offset + jobs.len() < total;

        JobPage {
            jobs,
            total,
            offset: self.page.offset,
            has_more,
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Number of matching jobs across all pages
    pub total: usize,
    pub offset: usize,
    pub has_more: bool,
}

// =============================================================================
// Tests
// =============================================================================
