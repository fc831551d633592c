//! Redis queue backend.
//!
//! ## Key layout
//!
//! ```text
//! {name}:schedule   ZSET  job_id -> visible_at (epoch ms)
//! {name}:jobs       HASH  job_id -> JSON body
//! {name}:leases     HASH  job_id -> lease generation
//! {name}:inflight   ZSET  job_id -> lease expiry (epoch ms), while leased
//! ```
//!
//! Leasing, acking and nacking run as Lua scripts so the generation check and
//! the schedule update are atomic. Durability follows the server's persistence
//! settings (enable AOF for crash safety).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{QueueError, QueueResult};
use crate::queue::{AckHandle, Delivery, DispatchQueue, QueueDepth, QueueJob, QueueProbe};

const LEASE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'LIMIT', 0, 1)
if #ids == 0 then
  return false
end
local id = ids[1]
local body = redis.call('HGET', KEYS[2], id)
if not body then
  redis.call('ZREM', KEYS[1], id)
  return false
end
local lease = redis.call('HINCRBY', KEYS[3], id, 1)
local expiry = now + tonumber(ARGV[2])
redis.call('ZADD', KEYS[1], expiry, id)
redis.call('ZADD', KEYS[4], expiry, id)
return {id, body, lease}
"#;

const ENQUEUE_SCRIPT: &str = r#"
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('HINCRBY', KEYS[3], ARGV[1], 1)
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
return 1
"#;

const ACK_SCRIPT: &str = r#"
local lease = redis.call('HGET', KEYS[3], ARGV[1])
if not lease or tonumber(lease) ~= tonumber(ARGV[2]) then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
return 1
"#;

const NACK_SCRIPT: &str = r#"
local lease = redis.call('HGET', KEYS[2], ARGV[1])
if not lease or tonumber(lease) ~= tonumber(ARGV[2]) then
  return 0
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
return 1
"#;

/// Redis-backed [`DispatchQueue`].
pub struct RedisQueue<J> {
    redis: ConnectionManager,
    name: String,
    schedule_key: String,
    jobs_key: String,
    leases_key: String,
    inflight_key: String,
    visibility_timeout: Duration,
    lease_script: Script,
    enqueue_script: Script,
    ack_script: Script,
    nack_script: Script,
    _phantom: PhantomData<fn() -> J>,
}

impl<J: QueueJob> RedisQueue<J> {
    /// Create a queue named `name` whose leases expire after `visibility_timeout`.
    pub fn new(redis: ConnectionManager, name: impl Into<String>, visibility_timeout: Duration) -> Self {
        let name = name.into();
        Self {
            redis,
            schedule_key: format!("{}:schedule", name),
            jobs_key: format!("{}:jobs", name),
            leases_key: format!("{}:leases", name),
            inflight_key: format!("{}:inflight", name),
            name,
            visibility_timeout,
            lease_script: Script::new(LEASE_SCRIPT),
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            nack_script: Script::new(NACK_SCRIPT),
            _phantom: PhantomData,
        }
    }

    /// Get a clone of the Redis connection manager.
    pub fn redis(&self) -> ConnectionManager {
        self.redis.clone()
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl<J: QueueJob> DispatchQueue<J> for RedisQueue<J> {
    async fn enqueue(&self, job: &J, not_before: DateTime<Utc>) -> QueueResult<()> {
        let mut conn = self.redis.clone();
        let job_id = job.job_id();
        let body = serde_json::to_string(job)?;

        let _: i64 = self
            .enqueue_script
            .key(&self.schedule_key)
            .key(&self.jobs_key)
            .key(&self.leases_key)
            .key(&self.inflight_key)
            .arg(&job_id)
            .arg(body)
            .arg(not_before.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        debug!(queue = %self.name, job_id = %job_id, not_before = %not_before, "Enqueued job");
        Ok(())
    }

    async fn dequeue(&self) -> QueueResult<Option<Delivery<J>>> {
        let mut conn = self.redis.clone();
        let leased: Option<(String, String, u64)> = self
            .lease_script
            .key(&self.schedule_key)
            .key(&self.jobs_key)
            .key(&self.leases_key)
            .key(&self.inflight_key)
            .arg(Utc::now().timestamp_millis())
            .arg(millis(self.visibility_timeout))
            .invoke_async(&mut conn)
            .await?;

        let Some((job_id, body, lease)) = leased else {
            return Ok(None);
        };

        let handle = AckHandle { job_id, lease };
        match serde_json::from_str::<J>(&body) {
            Ok(job) => Ok(Some(Delivery { job, handle })),
            Err(e) => {
                // An undecodable body can never succeed; drop it rather than redeliver forever.
                warn!(queue = %self.name, job_id = %handle.job_id, error = %e, "Dropping undecodable job");
                self.ack(&handle).await?;
                Err(e.into())
            }
        }
    }

    async fn ack(&self, handle: &AckHandle) -> QueueResult<()> {
        let mut conn = self.redis.clone();
        let settled: i64 = self
            .ack_script
            .key(&self.schedule_key)
            .key(&self.jobs_key)
            .key(&self.leases_key)
            .key(&self.inflight_key)
            .arg(&handle.job_id)
            .arg(handle.lease)
            .invoke_async(&mut conn)
            .await?;

        if settled == 1 {
            Ok(())
        } else {
            Err(QueueError::lease_lost(&handle.job_id))
        }
    }

    async fn nack(&self, handle: &AckHandle, delay: Duration) -> QueueResult<()> {
        let mut conn = self.redis.clone();
        let visible_at = Utc::now().timestamp_millis().saturating_add(millis(delay));
        let settled: i64 = self
            .nack_script
            .key(&self.schedule_key)
            .key(&self.leases_key)
            .key(&self.inflight_key)
            .arg(&handle.job_id)
            .arg(handle.lease)
            .arg(visible_at)
            .invoke_async(&mut conn)
            .await?;

        if settled == 1 {
            Ok(())
        } else {
            Err(QueueError::lease_lost(&handle.job_id))
        }
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let mut conn = self.redis.clone();
        let now = Utc::now().timestamp_millis();
        let (total, due, leased): (u64, u64, u64) = redis::pipe()
            .cmd("ZCARD")
            .arg(&self.schedule_key)
            .cmd("ZCOUNT")
            .arg(&self.schedule_key)
            .arg("-inf")
            .arg(now)
            .cmd("ZCOUNT")
            .arg(&self.inflight_key)
            .arg(format!("({}", now))
            .arg("+inf")
            .query_async(&mut conn)
            .await?;

        Ok(QueueDepth { total, due, leased })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl<J: QueueJob> QueueProbe for RedisQueue<J> {
    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.redis.clone();
        let response: String = redis::cmd("PING").query_async(&mut conn).await?;
        if response == "PONG" {
            Ok(())
        } else {
            Err(QueueError::Internal(format!("unexpected PING response: {}", response)))
        }
    }

    async fn probe_depth(&self) -> QueueResult<QueueDepth> {
        self.depth().await
    }

    fn probe_name(&self) -> &str {
        &self.name
    }
}
