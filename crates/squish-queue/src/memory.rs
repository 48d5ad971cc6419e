//! In-process work queue.
//!
//! Timing uses `tokio::time::Instant`, so lease expiry and backoff can be
//! driven deterministically with a paused clock in tests.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use squish_models::JobId;

use crate::error::QueueResult;
use crate::item::{Lease, Priority, QueueStats, Redelivery, Released};
use crate::metrics;
use crate::queue::{QueueConfig, WorkQueue};

#[derive(Debug)]
struct Waiting {
    priority: Priority,
    /// Deliveries so far
    attempts: u32,
    rank: u8,
    seq: u64,
}

#[derive(Debug)]
struct Delayed {
    priority: Priority,
    attempts: u32,
    ready_at: Instant,
}

#[derive(Debug)]
struct Active {
    lease: Lease,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    seq: u64,
    /// (rank, seq, id): iteration order is lease order
    order: BTreeSet<(u8, u64, JobId)>,
    waiting: HashMap<JobId, Waiting>,
    delayed: HashMap<JobId, Delayed>,
    active: HashMap<String, Active>,
    active_jobs: HashMap<JobId, String>,
    failed: HashMap<JobId, u32>,
    completed: u64,
}

impl State {
    fn push_waiting(&mut self, job_id: JobId, priority: Priority, attempts: u32) {
        self.seq += 1;
        let rank = priority.rank();
        self.order.insert((rank, self.seq, job_id.clone()));
        self.waiting.insert(
            job_id,
            Waiting {
                priority,
                attempts,
                rank,
                seq: self.seq,
            },
        );
    }

    fn take_waiting(&mut self, job_id: &JobId) -> Option<Waiting> {
        let waiting = self.waiting.remove(job_id)?;
        self.order.remove(&(waiting.rank, waiting.seq, job_id.clone()));
        Some(waiting)
    }

    fn promote_due(&mut self, now: Instant) {
        let mut due: Vec<(Instant, JobId)> = self
            .delayed
            .iter()
            .filter(|(_, delayed)| delayed.ready_at <= now)
            .map(|(id, delayed)| (delayed.ready_at, id.clone()))
            .collect();
        due.sort();

        for (_, job_id) in due {
            if let Some(delayed) = self.delayed.remove(&job_id) {
                self.push_waiting(job_id, delayed.priority, delayed.attempts);
            }
        }
    }

    fn release(&mut self, token: &str, now: Instant, config: &QueueConfig) -> Option<Released> {
        let Active { lease, .. } = self.active.remove(token)?;
        if self.active_jobs.get(&lease.job_id) == Some(&lease.token) {
            self.active_jobs.remove(&lease.job_id);
        }

        let outcome = if self.waiting.contains_key(&lease.job_id)
            || self.delayed.contains_key(&lease.job_id)
        {
            Redelivery::Superseded
        } else if lease.attempt >= config.max_attempts {
            self.failed.insert(lease.job_id.clone(), lease.attempt);
            Redelivery::DeadLettered {
                attempts: lease.attempt,
            }
        } else {
            let delay = config.backoff.delay(lease.attempt);
            self.delayed.insert(
                lease.job_id.clone(),
                Delayed {
                    priority: lease.priority,
                    attempts: lease.attempt,
                    ready_at: now + delay,
                },
            );
            Redelivery::Retrying {
                attempt: lease.attempt,
                delay,
            }
        };

        Some(Released {
            job_id: lease.job_id,
            outcome,
        })
    }
}

/// Work queue held in process memory.
#[derive(Debug)]
pub struct MemoryQueue {
    config: QueueConfig,
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

fn record_release(released: &Released) {
    match released.outcome {
        Redelivery::Retrying { .. } => metrics::record_redelivered("retry"),
        Redelivery::DeadLettered { .. } => metrics::record_dead_lettered(),
        Redelivery::Superseded => {}
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, job_id: &JobId, priority: Priority) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        if state.waiting.contains_key(job_id) || state.delayed.contains_key(job_id) {
            debug!(job_id = %job_id, "Job already waiting, enqueue ignored");
            return Ok(false);
        }
        state.failed.remove(job_id);
        state.push_waiting(job_id.clone(), priority, 0);
        drop(state);

        metrics::record_enqueued();
        self.notify.notify_waiters();
        debug!(job_id = %job_id, priority = %priority, "Enqueued job");
        Ok(true)
    }

    async fn lease(&self, worker: &str, max: usize) -> QueueResult<Vec<Lease>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.promote_due(now);

        let candidates: Vec<JobId> = state
            .order
            .iter()
            .filter(|(_, _, id)| !state.active_jobs.contains_key(id))
            .take(max)
            .map(|(_, _, id)| id.clone())
            .collect();

        let mut leases = Vec::with_capacity(candidates.len());
        for job_id in candidates {
            let Some(waiting) = state.take_waiting(&job_id) else {
                continue;
            };
            let lease = Lease {
                job_id: job_id.clone(),
                token: Uuid::new_v4().to_string(),
                attempt: waiting.attempts + 1,
                priority: waiting.priority,
                worker: worker.to_string(),
            };
            state.active_jobs.insert(job_id, lease.token.clone());
            state.active.insert(
                lease.token.clone(),
                Active {
                    lease: lease.clone(),
                    deadline: now + self.config.visibility_timeout,
                },
            );
            leases.push(lease);
        }

        if !leases.is_empty() {
            metrics::record_leased(leases.len());
        }
        Ok(leases)
    }

    async fn ack(&self, lease: &Lease) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        if state.active.remove(&lease.token).is_none() {
            return Ok(false);
        }
        if state.active_jobs.get(&lease.job_id) == Some(&lease.token) {
            state.active_jobs.remove(&lease.job_id);
        }
        state.completed += 1;
        drop(state);

        metrics::record_acked();
        // A reference enqueued during the lease may be ready now
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn nack(&self, lease: &Lease) -> QueueResult<Option<Released>> {
        let now = Instant::now();
        let released = self
            .state
            .lock()
            .await
            .release(&lease.token, now, &self.config);
        if let Some(released) = &released {
            record_release(released);
            self.notify.notify_waiters();
        }
        Ok(released)
    }

    async fn extend(&self, lease: &Lease) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        match state.active.get_mut(&lease.token) {
            Some(active) => {
                active.deadline = Instant::now() + self.config.visibility_timeout;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reclaim_expired(&self) -> QueueResult<Vec<Released>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .active
            .iter()
            .filter(|(_, active)| active.deadline <= now)
            .map(|(token, _)| token.clone())
            .collect();

        let mut released = Vec::with_capacity(expired.len());
        for token in expired {
            if let Some(item) = state.release(&token, now, &self.config) {
                match item.outcome {
                    Redelivery::DeadLettered { attempts } => {
                        warn!(job_id = %item.job_id, attempts, "Lease expired, attempts exhausted")
                    }
                    _ => info!(job_id = %item.job_id, "Lease expired, job will be redelivered"),
                }
                record_release(&item);
                released.push(item);
            }
        }
        drop(state);

        if !released.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(released)
    }

    async fn remove(&self, job_id: &JobId) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.take_waiting(job_id);
        state.delayed.remove(job_id);
        state.failed.remove(job_id);
        Ok(())
    }

    async fn position(&self, job_id: &JobId) -> QueueResult<Option<u64>> {
        let state = self.state.lock().await;
        Ok(state
            .order
            .iter()
            .position(|(_, _, id)| id == job_id)
            .map(|rank| rank as u64))
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            waiting: state.waiting.len() as u64,
            active: state.active.len() as u64,
            completed: state.completed,
            failed: state.failed.len() as u64,
            delayed: state.delayed.len() as u64,
        })
    }

    async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}
