//! Redis-backed work queue.
//!
//! Keys under `{prefix}`:
//! - `waiting`: sorted set of job ids scored by `rank * 1e12 + seq`
//! - `delayed`: sorted set of job ids scored by ready time (ms)
//! - `active`: sorted set of lease tokens scored by deadline (ms)
//! - `leases` / `active_jobs`: token -> job id and job id -> token
//! - `priority` / `attempts`: per-job hashes
//! - `failed`: dead-lettered job ids; `completed`: ack counter; `seq`: counter
//!
//! Every multi-key step is a Lua script, so leasing a job and recording its
//! active lease cannot be observed half-done by another worker.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::Script;
use tracing::{debug, info, warn};

use squish_models::JobId;

use crate::error::{QueueError, QueueResult};
use crate::item::{Lease, Priority, QueueStats, Redelivery, Released};
use crate::metrics;
use crate::queue::{QueueConfig, WorkQueue};

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) or redis.call('ZSCORE', KEYS[2], ARGV[1]) then
  return 0
end
local seq = redis.call('INCR', KEYS[5])
redis.call('ZADD', KEYS[1], tonumber(ARGV[3]) * 1000000000000 + seq, ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[4], ARGV[1], 0)
redis.call('ZREM', KEYS[6], ARGV[1])
return 1
"#;

const LEASE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  local rank = tonumber(ARGV[5]) - tonumber(redis.call('HGET', KEYS[3], id) or ARGV[6])
  local seq = redis.call('INCR', KEYS[5])
  redis.call('ZADD', KEYS[1], rank * 1000000000000 + seq, id)
end
local max = tonumber(ARGV[3])
local leased = {}
local count = 0
for _, id in ipairs(redis.call('ZRANGE', KEYS[1], 0, -1)) do
  if count >= max then
    break
  end
  if redis.call('HEXISTS', KEYS[8], id) == 0 then
    redis.call('ZREM', KEYS[1], id)
    local attempt = redis.call('HINCRBY', KEYS[4], id, 1)
    local token = ARGV[4] .. ':' .. redis.call('INCR', KEYS[5])
    redis.call('ZADD', KEYS[6], ARGV[2], token)
    redis.call('HSET', KEYS[7], token, id)
    redis.call('HSET', KEYS[8], id, token)
    table.insert(leased, id)
    table.insert(leased, token)
    table.insert(leased, tostring(attempt))
    table.insert(leased, redis.call('HGET', KEYS[3], id) or ARGV[6])
    count = count + 1
  end
end
return leased
"#;

const RELEASE_SCRIPT: &str = r#"
local tokens = {}
if ARGV[3] == '' then
  tokens = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
elseif redis.call('ZSCORE', KEYS[1], ARGV[3]) then
  tokens = { ARGV[3] }
end
local released = {}
for _, token in ipairs(tokens) do
  local id = redis.call('HGET', KEYS[2], token)
  redis.call('ZREM', KEYS[1], token)
  redis.call('HDEL', KEYS[2], token)
  if id then
    if redis.call('HGET', KEYS[3], id) == token then
      redis.call('HDEL', KEYS[3], id)
    end
    local attempts = tonumber(redis.call('HGET', KEYS[4], id) or '1')
    local outcome = 'retry'
    local delay = 0
    if redis.call('ZSCORE', KEYS[7], id) or redis.call('ZSCORE', KEYS[5], id) then
      outcome = 'superseded'
    elseif attempts >= tonumber(ARGV[2]) then
      outcome = 'dead'
      redis.call('ZADD', KEYS[6], ARGV[1], id)
    else
      delay = tonumber(ARGV[3 + attempts] or ARGV[#ARGV])
      redis.call('ZADD', KEYS[5], tonumber(ARGV[1]) + delay, id)
    end
    table.insert(released, id)
    table.insert(released, outcome)
    table.insert(released, tostring(attempts))
    table.insert(released, tostring(delay))
  end
end
return released
"#;

const ACK_SCRIPT: &str = r#"
local id = redis.call('HGET', KEYS[2], ARGV[1])
if not id then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
if redis.call('HGET', KEYS[3], id) == ARGV[1] then
  redis.call('HDEL', KEYS[3], id)
end
if not redis.call('ZSCORE', KEYS[5], id) and not redis.call('ZSCORE', KEYS[6], id) then
  redis.call('HDEL', KEYS[7], id)
  redis.call('HDEL', KEYS[8], id)
end
redis.call('INCR', KEYS[4])
return 1
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  redis.call('ZADD', KEYS[1], 'XX', ARGV[2], ARGV[1])
  return 1
end
return 0
"#;

const REMOVE_SCRIPT: &str = r#"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
if redis.call('HEXISTS', KEYS[6], ARGV[1]) == 0 then
  redis.call('HDEL', KEYS[4], ARGV[1])
  redis.call('HDEL', KEYS[5], ARGV[1])
end
return 1
"#;

struct Keys {
    waiting: String,
    delayed: String,
    active: String,
    leases: String,
    active_jobs: String,
    priority: String,
    attempts: String,
    failed: String,
    completed: String,
    seq: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        let key = |name: &str| format!("{prefix}:{name}");
        Self {
            waiting: key("waiting"),
            delayed: key("delayed"),
            active: key("active"),
            leases: key("leases"),
            active_jobs: key("active_jobs"),
            priority: key("priority"),
            attempts: key("attempts"),
            failed: key("failed"),
            completed: key("completed"),
            seq: key("seq"),
        }
    }
}

/// Work queue client.
pub struct RedisQueue {
    client: redis::Client,
    config: QueueConfig,
    keys: Keys,
    enqueue_script: Script,
    lease_script: Script,
    release_script: Script,
    ack_script: Script,
    extend_script: Script,
    remove_script: Script,
}

impl RedisQueue {
    /// Create a new queue client.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let keys = Keys::new(&config.prefix);
        Ok(Self {
            client,
            config,
            keys,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            lease_script: Script::new(LEASE_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
            remove_script: Script::new(REMOVE_SCRIPT),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    fn deadline_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.config.visibility_timeout.as_millis() as i64
    }

    /// Release one token, or every expired token when `token` is empty.
    async fn release(&self, token: &str) -> QueueResult<Vec<Released>> {
        let mut conn = self.conn().await?;
        let mut invocation = self.release_script.prepare_invoke();
        invocation
            .key(&self.keys.active)
            .key(&self.keys.leases)
            .key(&self.keys.active_jobs)
            .key(&self.keys.attempts)
            .key(&self.keys.delayed)
            .key(&self.keys.failed)
            .key(&self.keys.waiting)
            .arg(Utc::now().timestamp_millis())
            .arg(self.config.max_attempts)
            .arg(token);
        for delay in self.config.backoff.schedule_ms(self.config.max_attempts) {
            invocation.arg(delay);
        }
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;

        reply
            .chunks(4)
            .map(|chunk| match chunk {
                [id, outcome, attempts, delay] => {
                    let attempts: u32 = attempts
                        .parse()
                        .map_err(|_| QueueError::malformed(format!("attempts {attempts}")))?;
                    let outcome = match outcome.as_str() {
                        "retry" => Redelivery::Retrying {
                            attempt: attempts,
                            delay: Duration::from_millis(delay.parse().unwrap_or(0)),
                        },
                        "dead" => Redelivery::DeadLettered { attempts },
                        "superseded" => Redelivery::Superseded,
                        other => return Err(QueueError::malformed(format!("outcome {other}"))),
                    };
                    Ok(Released {
                        job_id: JobId::from(id.as_str()),
                        outcome,
                    })
                }
                _ => Err(QueueError::malformed("release reply")),
            })
            .collect()
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
impl WorkQueue for RedisQueue {
    async fn enqueue(&self, job_id: &JobId, priority: Priority) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let added: i64 = self
            .enqueue_script
            .key(&self.keys.waiting)
            .key(&self.keys.delayed)
            .key(&self.keys.priority)
            .key(&self.keys.attempts)
            .key(&self.keys.seq)
            .key(&self.keys.failed)
            .arg(job_id.as_str())
            .arg(priority.get())
            .arg(priority.rank())
            .invoke_async(&mut conn)
            .await?;

        if added == 1 {
            metrics::record_enqueued();
            info!(job_id = %job_id, priority = %priority, "Enqueued job");
        } else {
            debug!(job_id = %job_id, "Job already waiting, enqueue ignored");
        }
        Ok(added == 1)
    }

    async fn lease(&self, worker: &str, max: usize) -> QueueResult<Vec<Lease>> {
        let mut conn = self.conn().await?;
        let reply: Vec<String> = self
            .lease_script
            .key(&self.keys.waiting)
            .key(&self.keys.delayed)
            .key(&self.keys.priority)
            .key(&self.keys.attempts)
            .key(&self.keys.seq)
            .key(&self.keys.active)
            .key(&self.keys.leases)
            .key(&self.keys.active_jobs)
            .arg(Utc::now().timestamp_millis())
            .arg(self.deadline_ms())
            .arg(max)
            .arg(worker)
            .arg(Priority::MAX)
            .arg(Priority::DEFAULT)
            .invoke_async(&mut conn)
            .await?;

        let leases = reply
            .chunks(4)
            .map(|chunk| match chunk {
                [id, token, attempt, priority] => Ok(Lease {
                    job_id: JobId::from(id.as_str()),
                    token: token.clone(),
                    attempt: attempt
                        .parse()
                        .map_err(|_| QueueError::malformed(format!("attempt {attempt}")))?,
                    priority: Priority::saturating(priority.parse().unwrap_or(Priority::DEFAULT as i64)),
                    worker: worker.to_string(),
                }),
                _ => Err(QueueError::malformed("lease reply")),
            })
            .collect::<QueueResult<Vec<_>>>()?;

        if !leases.is_empty() {
            metrics::record_leased(leases.len());
        }
        Ok(leases)
    }

    async fn ack(&self, lease: &Lease) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let acked: i64 = self
            .ack_script
            .key(&self.keys.active)
            .key(&self.keys.leases)
            .key(&self.keys.active_jobs)
            .key(&self.keys.completed)
            .key(&self.keys.waiting)
            .key(&self.keys.delayed)
            .key(&self.keys.priority)
            .key(&self.keys.attempts)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;

        if acked == 1 {
            metrics::record_acked();
            debug!(job_id = %lease.job_id, "Acknowledged lease");
        }
        Ok(acked == 1)
    }

    async fn nack(&self, lease: &Lease) -> QueueResult<Option<Released>> {
        let released = self.release(&lease.token).await?.into_iter().next();
        if let Some(released) = &released {
            record_release(released);
        }
        Ok(released)
    }

    async fn extend(&self, lease: &Lease) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let extended: i64 = self
            .extend_script
            .key(&self.keys.active)
            .arg(&lease.token)
            .arg(self.deadline_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn reclaim_expired(&self) -> QueueResult<Vec<Released>> {
        let released = self.release("").await?;
        for item in &released {
            match item.outcome {
                Redelivery::DeadLettered { attempts } => {
                    warn!(job_id = %item.job_id, attempts, "Lease expired, attempts exhausted")
                }
                _ => info!(job_id = %item.job_id, "Lease expired, job will be redelivered"),
            }
            record_release(item);
        }
        Ok(released)
    }

    async fn remove(&self, job_id: &JobId) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        self.remove_script
            .key(&self.keys.waiting)
            .key(&self.keys.delayed)
            .key(&self.keys.failed)
            .key(&self.keys.priority)
            .key(&self.keys.attempts)
            .key(&self.keys.active_jobs)
            .arg(job_id.as_str())
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn position(&self, job_id: &JobId) -> QueueResult<Option<u64>> {
        let mut conn = self.conn().await?;
        let rank: Option<u64> = redis::cmd("ZRANK")
            .arg(&self.keys.waiting)
            .arg(job_id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(rank)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.conn().await?;
        let (waiting, active, completed, failed, delayed): (u64, u64, Option<u64>, u64, u64) =
            redis::pipe()
                .cmd("ZCARD")
                .arg(&self.keys.waiting)
                .cmd("ZCARD")
                .arg(&self.keys.active)
                .cmd("GET")
                .arg(&self.keys.completed)
                .cmd("ZCARD")
                .arg(&self.keys.failed)
                .cmd("ZCARD")
                .arg(&self.keys.delayed)
                .query_async(&mut conn)
                .await?;

        Ok(QueueStats {
            waiting,
            active,
            completed: completed.unwrap_or(0),
            failed,
            delayed,
        })
    }
}
