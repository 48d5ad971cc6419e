//! Queue items, leases and statistics.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use squish_models::JobId;

use crate::error::{QueueError, QueueResult};

/// Bounded scheduling priority. Higher is serviced first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;
    pub const DEFAULT: u8 = 5;

    pub fn new(value: i64) -> QueueResult<Self> {
        if (Self::MIN as i64..=Self::MAX as i64).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(QueueError::InvalidPriority(value))
        }
    }

    /// Clamp any integer into range.
    pub fn saturating(value: i64) -> Self {
        Self(value.clamp(Self::MIN as i64, Self::MAX as i64) as u8)
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    /// Rank used by ordered structures: lower ranks are leased first.
    pub(crate) fn rank(&self) -> u8 {
        Self::MAX - self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for Priority {
    type Error = QueueError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for i64 {
    fn from(priority: Priority) -> Self {
        priority.0 as i64
    }
}

/// Time-bounded ownership of one queued job reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    /// Opaque token identifying this delivery
    pub token: String,
    /// Delivery count for this job reference, starting at 1
    pub attempt: u32,
    pub priority: Priority,
    pub worker: String,
}

/// What happened to a released lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redelivery {
    /// Back in the queue after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Attempts exhausted; moved to the failed set.
    DeadLettered { attempts: u32 },
    /// The job was already waiting again; the expired delivery is dropped.
    Superseded,
}

/// A lease that ran out of time or was released with `nack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub job_id: JobId,
    pub outcome: Redelivery,
}

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_bounds() {
        assert!(Priority::new(0).is_err());
        assert!(Priority::new(11).is_err());
        assert_eq!(Priority::new(10).unwrap().get(), 10);
        assert_eq!(Priority::saturating(-3).get(), Priority::MIN);
        assert_eq!(Priority::saturating(99).get(), Priority::MAX);
        assert_eq!(Priority::default().get(), 5);
    }

    #[test]
    fn test_priority_rank_orders_high_first() {
        assert!(Priority::new(9).unwrap().rank() < Priority::new(2).unwrap().rank());
    }

    #[test]
    fn test_priority_serde_rejects_out_of_range() {
        assert!(serde_json::from_str::<Priority>("7").is_ok());
        assert!(serde_json::from_str::<Priority>("42").is_err());
    }
}
