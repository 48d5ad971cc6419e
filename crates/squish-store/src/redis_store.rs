//! Redis-backed job store.
//!
//! Layout:
//! - `{prefix}:job:{id}`: hash with `data` (JSON record) and `version`
//! - `{prefix}:jobs`: sorted set of live ids scored by `expires_at` millis
//!
//! Writes are compare-and-swap on `version` through a Lua script, so a
//! progress update racing a cancel can never overwrite it: the loser re-reads
//! the record and re-applies its change against the new state.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use tracing::{debug, warn};

use squish_models::{Job, JobId, JobPatch, ProgressOutcome};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::metrics;
use crate::query::{JobPage, JobQuery};
use crate::repo::{JobStore, TransitionRequest, Transitioned};

/// Attempts before a contended write gives up.
const MAX_CAS_ATTEMPTS: usize = 16;

const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'data', ARGV[1], 'version', 1)
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current then
  return -1
end
if current ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'data', ARGV[2], 'version', tonumber(ARGV[1]) + 1)
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[4])
return 1
"#;

/// Job store client.
pub struct RedisJobStore {
    client: redis::Client,
    config: StoreConfig,
    create_script: Script,
    cas_script: Script,
}

impl RedisJobStore {
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            create_script: Script::new(CREATE_SCRIPT),
            cas_script: Script::new(CAS_SCRIPT),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> StoreResult<Self> {
        Self::new(StoreConfig::from_env())
    }

    /// Check connectivity.
    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn conn(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::unavailable(e.to_string()))
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.config.prefix, id)
    }

    fn index_key(&self) -> String {
        format!("{}:jobs", self.config.prefix)
    }

    /// Fetch records by id, skipping ids whose hash vanished in between.
    async fn fetch_many(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        ids: &[String],
    ) -> StoreResult<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in ids {
            pipe.cmd("HGET").arg(self.job_key(&JobId::from(id.as_str()))).arg("data");
        }
        let payloads: Vec<Option<String>> = pipe.query_async(conn).await?;

        let mut jobs = Vec::with_capacity(payloads.len());
        for (id, payload) in ids.iter().zip(payloads) {
            let Some(payload) = payload else { continue };
            match serde_json::from_str::<Job>(&payload) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(job_id = %id, error = %e, "Skipping corrupt job record"),
            }
        }
        Ok(jobs)
    }

    /// Read-modify-CAS loop.
    ///
    /// `apply` returns its value and whether the record changed; unchanged
    /// records are not written. Returns `None` for unknown or expired ids.
    async fn mutate<T, F>(&self, operation: &'static str, id: &JobId, mut apply: F) -> StoreResult<Option<(Job, T)>>
    where
        F: FnMut(&mut Job, DateTime<Utc>) -> StoreResult<(T, bool)> + Send,
        T: Send,
    {
        let key = self.job_key(id);
        let index = self.index_key();
        let mut conn = self.conn().await?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let (data, version): (Option<String>, Option<String>) = redis::cmd("HMGET")
                .arg(&key)
                .arg("data")
                .arg("version")
                .query_async(&mut conn)
                .await?;
            let (Some(data), Some(version)) = (data, version) else {
                return Ok(None);
            };

            let mut job: Job = serde_json::from_str(&data)?;
            let now = Utc::now();
            if job.is_expired(now) {
                return Ok(None);
            }

            let (value, changed) = apply(&mut job, now)?;
            if !changed {
                return Ok(Some((job, value)));
            }

            let payload = serde_json::to_string(&job)?;
            let applied: i64 = self
                .cas_script
                .key(&key)
                .key(&index)
                .arg(&version)
                .arg(payload)
                .arg(job.expires_at.timestamp_millis())
                .arg(job.id.as_str())
                .invoke_async(&mut conn)
                .await?;

            match applied {
                1 => return Ok(Some((job, value))),
                -1 => return Ok(None),
                _ => {
                    debug!(job_id = %id, operation, "Lost compare-and-swap race, retrying");
                    metrics::record_conflict(operation);
                }
            }
        }

        Err(StoreError::Contention(id.to_string()))
    }
}

fn observe<T>(operation: &'static str, start: Instant, result: StoreResult<T>) -> StoreResult<T> {
    metrics::record_operation(operation, result.is_ok(), start.elapsed());
    result
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create(&self, job: &Job) -> StoreResult<()> {
        let start = Instant::now();
        let result = async {
            let mut conn = self.conn().await?;
            let payload = serde_json::to_string(job)?;
            let created: i64 = self
                .create_script
                .key(self.job_key(&job.id))
                .key(self.index_key())
                .arg(payload)
                .arg(job.expires_at.timestamp_millis())
                .arg(job.id.as_str())
                .invoke_async(&mut conn)
                .await?;
            if created == 0 {
                return Err(StoreError::already_exists(&job.id));
            }
            debug!(job_id = %job.id, "Created job record");
            Ok::<_, StoreError>(())
        }
        .await;
        observe("create", start, result)
    }

    async fn get(&self, id: &JobId) -> StoreResult<Option<Job>> {
        let start = Instant::now();
        let result = async {
            let mut conn = self.conn().await?;
            let data: Option<String> = redis::cmd("HGET")
                .arg(self.job_key(id))
                .arg("data")
                .query_async(&mut conn)
                .await?;
            let Some(data) = data else {
                return Ok(None);
            };
            let job: Job = serde_json::from_str(&data)?;
            Ok::<_, StoreError>((!job.is_expired(Utc::now())).then_some(job))
        }
        .await;
        observe("get", start, result)
    }

    async fn update(&self, id: &JobId, patch: &JobPatch) -> StoreResult<Option<Job>> {
        let start = Instant::now();
        let result = self
            .mutate("update", id, |job, now| {
                job.apply_patch(patch, now);
                Ok(((), true))
            })
            .await
            .map(|updated| updated.map(|(job, ())| job));
        observe("update", start, result)
    }

    async fn delete(&self, id: &JobId) -> StoreResult<bool> {
        let start = Instant::now();
        let result = async {
            let mut conn = self.conn().await?;
            let (deleted, _removed): (i64, i64) = redis::pipe()
                .atomic()
                .cmd("DEL")
                .arg(self.job_key(id))
                .cmd("ZREM")
                .arg(self.index_key())
                .arg(id.as_str())
                .query_async(&mut conn)
                .await?;
            Ok::<_, StoreError>(deleted > 0)
        }
        .await;
        observe("delete", start, result)
    }

    async fn list(&self, query: &JobQuery) -> StoreResult<JobPage> {
        let start = Instant::now();
        let result = async {
            let mut conn = self.conn().await?;
            let now = Utc::now();
            let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(self.index_key())
                .arg(format!("({}", now.timestamp_millis()))
                .arg("+inf")
                .query_async(&mut conn)
                .await?;
            let jobs = self.fetch_many(&mut conn, &ids).await?;
            Ok::<_, StoreError>(query.apply(jobs.into_iter().filter(|job| !job.is_expired(now))))
        }
        .await;
        observe("list", start, result)
    }

    async fn transition(&self, id: &JobId, request: &TransitionRequest) -> StoreResult<Transitioned> {
        let start = Instant::now();
        let result = self
            .mutate("transition", id, |job, now| {
                let previous = job.status;
                job.apply_transition(request.transition, request.fence, &request.patch, now)
                    .map_err(|rejection| StoreError::rejected(id, rejection))?;
                Ok((previous, true))
            })
            .await
            .and_then(|applied| {
                applied
                    .map(|(job, previous)| Transitioned { previous, job })
                    .ok_or_else(|| StoreError::not_found(id))
            });
        observe("transition", start, result)
    }

    async fn record_progress(&self, id: &JobId, attempt: u32, progress: u8) -> StoreResult<ProgressOutcome> {
        let start = Instant::now();
        let result = self
            .mutate("progress", id, |job, now| {
                let outcome = job.record_progress(attempt, progress, now);
                Ok((outcome, outcome == ProgressOutcome::Applied))
            })
            .await
            .and_then(|applied| {
                applied
                    .map(|(_, outcome)| outcome)
                    .ok_or_else(|| StoreError::not_found(id))
            });
        observe("progress", start, result)
    }

    async fn expired(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        let start = Instant::now();
        let result = async {
            let mut conn = self.conn().await?;
            let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(self.index_key())
                .arg("-inf")
                .arg(now.timestamp_millis())
                .arg("LIMIT")
                .arg(0)
                .arg(limit)
                .query_async(&mut conn)
                .await?;
            let mut jobs = self.fetch_many(&mut conn, &ids).await?;
            jobs.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.id.cmp(&b.id)));
            Ok::<_, StoreError>(jobs)
        }
        .await;
        observe("expired", start, result)
    }
}
