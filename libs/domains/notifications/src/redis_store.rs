//! Redis request and delivery store.
//!
//! ## Key layout
//!
//! ```text
//! {prefix}:request:{id}          HASH  record (JSON), state, created_at, last_enqueued_at
//! {prefix}:idempotency:{key}     STRING request id
//! {prefix}:requests:pending      SET   ids in PENDING
//! {prefix}:requests:all          ZSET  id -> created_at (ms)
//! {prefix}:recipient:{recipient} SET   request ids
//! {prefix}:attempts:{id}         LIST  attempt rows (JSON), append order
//! {prefix}:lease:{id}            STRING owner, with PX expiry
//! ```
//!
//! The idempotent insert reads the request hash named by the idempotency key,
//! so its script builds that key itself. This assumes a single Redis node
//! (or a cluster hash tag on the prefix).

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{NotificationError, NotificationResult};
use crate::models::{DeliveryAttemptRecord, DeliveryFilter, RequestRecord, RequestState};
use crate::repository::{DeliveryReportStore, InsertOutcome, RequestStore};

const INSERT_SCRIPT: &str = r#"
local existing = redis.call('GET', KEYS[1])
if existing then
  local state = redis.call('HGET', ARGV[4] .. existing, 'state')
  if state == 'PENDING' then
    return existing
  end
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[2], 'record', ARGV[2], 'state', 'PENDING', 'created_at', ARGV[3])
redis.call('SADD', KEYS[3], ARGV[1])
redis.call('ZADD', KEYS[4], ARGV[3], ARGV[1])
redis.call('SADD', KEYS[5], ARGV[1])
return ARGV[1]
"#;

const TRANSITION_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'state', ARGV[2])
if ARGV[2] ~= 'PENDING' then
  redis.call('SREM', KEYS[2], ARGV[3])
end
return 1
"#;

const TOUCH_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
local current = tonumber(redis.call('HGET', KEYS[1], 'last_enqueued_at') or '0')
if tonumber(ARGV[1]) > current then
  redis.call('HSET', KEYS[1], 'last_enqueued_at', ARGV[1])
end
return 1
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed [`RequestStore`] and [`DeliveryReportStore`].
pub struct RedisDeliveryStore {
    redis: ConnectionManager,
    prefix: String,
    insert_script: Script,
    transition_script: Script,
    touch_script: Script,
    release_script: Script,
}

impl RedisDeliveryStore {
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            insert_script: Script::new(INSERT_SCRIPT),
            transition_script: Script::new(TRANSITION_SCRIPT),
            touch_script: Script::new(TOUCH_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    fn request_prefix(&self) -> String {
        format!("{}:request:", self.prefix)
    }

    fn request_key(&self, id: Uuid) -> String {
        format!("{}{}", self.request_prefix(), id)
    }

    fn idempotency_key(&self, key: &str) -> String {
        format!("{}:idempotency:{}", self.prefix, key)
    }

    fn pending_key(&self) -> String {
        format!("{}:requests:pending", self.prefix)
    }

    fn all_key(&self) -> String {
        format!("{}:requests:all", self.prefix)
    }

    fn recipient_key(&self, recipient: &str) -> String {
        format!("{}:recipient:{}", self.prefix, recipient)
    }

    fn attempts_key(&self, id: Uuid) -> String {
        format!("{}:attempts:{}", self.prefix, id)
    }

    fn lease_key(&self, id: Uuid) -> String {
        format!("{}:lease:{}", self.prefix, id)
    }

    fn decode_request(fields: HashMap<String, String>) -> NotificationResult<Option<RequestRecord>> {
        let Some(json) = fields.get("record") else {
            return Ok(None);
        };
        let mut record: RequestRecord = serde_json::from_str(json)?;

        if let Some(state) = fields.get("state") {
            record.state = state
                .parse()
                .map_err(|_| NotificationError::Store(format!("invalid request state '{}'", state)))?;
        }
        record.last_enqueued_at = fields
            .get("last_enqueued_at")
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Ok(Some(record))
    }

    async fn attempts_for(&self, id: Uuid) -> NotificationResult<Vec<DeliveryAttemptRecord>> {
        let mut conn = self.redis.clone();
        let rows: Vec<String> = conn.lrange(self.attempts_key(id), 0, -1).await?;
        rows.iter()
            .map(|row| serde_json::from_str(row).map_err(NotificationError::from))
            .collect()
    }

    /// Request ids a filter could match, narrowest index first.
    async fn candidate_ids(&self, filter: &DeliveryFilter) -> NotificationResult<Vec<Uuid>> {
        if let Some(id) = filter.request_id {
            return Ok(vec![id]);
        }

        let mut conn = self.redis.clone();
        let raw: Vec<String> = match &filter.recipient {
            Some(recipient) => conn.smembers(self.recipient_key(recipient)).await?,
            None => conn.zrange(self.all_key(), 0, -1).await?,
        };

        Ok(raw
            .iter()
            .filter_map(|id| match Uuid::parse_str(id) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(id = %id, error = %e, "Skipping malformed request id in index");
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl DeliveryReportStore for RedisDeliveryStore {
    async fn append(&self, record: &DeliveryAttemptRecord) -> NotificationResult<()> {
        let mut conn = self.redis.clone();
        let row = serde_json::to_string(record)?;

        redis::pipe()
            .atomic()
            .rpush(self.attempts_key(record.request_id), row)
            .sadd(self.recipient_key(&record.recipient), record.request_id.to_string())
            .query_async::<()>(&mut conn)
            .await?;

        debug!(
            request_id = %record.request_id,
            channel = %record.channel,
            attempt = %record.attempt,
            outcome = %record.outcome,
            "Appended delivery attempt"
        );
        Ok(())
    }

    async fn query(&self, filter: &DeliveryFilter) -> NotificationResult<Vec<DeliveryAttemptRecord>> {
        let mut matched = Vec::new();
        for id in self.candidate_ids(filter).await? {
            matched.extend(
                self.attempts_for(id)
                    .await?
                    .into_iter()
                    .filter(|a| filter.matches(a)),
            );
        }
        if filter.request_id.is_none() {
            matched.sort_by_key(|a| a.started_at);
        }
        Ok(matched)
    }
}

#[async_trait]
impl RequestStore for RedisDeliveryStore {
    async fn insert_if_absent(&self, record: RequestRecord) -> NotificationResult<InsertOutcome> {
        let mut conn = self.redis.clone();
        let id = record.id;
        let json = serde_json::to_string(&record)?;

        let owner: String = self
            .insert_script
            .key(self.idempotency_key(&record.idempotency_key))
            .key(self.request_key(id))
            .key(self.pending_key())
            .key(self.all_key())
            .key(self.recipient_key(&record.recipient))
            .arg(id.to_string())
            .arg(json)
            .arg(record.created_at.timestamp_millis())
            .arg(self.request_prefix())
            .invoke_async(&mut conn)
            .await?;

        if owner == id.to_string() {
            Ok(InsertOutcome::Inserted)
        } else {
            let existing = Uuid::parse_str(&owner)
                .map_err(|e| NotificationError::Store(format!("invalid request id '{}': {}", owner, e)))?;
            Ok(InsertOutcome::Duplicate(existing))
        }
    }

    async fn get_request(&self, id: Uuid) -> NotificationResult<Option<RequestRecord>> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.request_key(id)).await?;
        Self::decode_request(fields)
    }

    async fn transition(&self, id: Uuid, from: RequestState, to: RequestState) -> NotificationResult<bool> {
        let mut conn = self.redis.clone();
        let changed: i64 = self
            .transition_script
            .key(self.request_key(id))
            .key(self.pending_key())
            .arg(from.to_string())
            .arg(to.to_string())
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(changed == 1)
    }

    async fn touch_enqueued(&self, id: Uuid, at: DateTime<Utc>) -> NotificationResult<()> {
        let mut conn = self.redis.clone();
        let _: i64 = self
            .touch_script
            .key(self.request_key(id))
            .arg(at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pending_requests(&self) -> NotificationResult<Vec<RequestRecord>> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.smembers(self.pending_key()).await?;

        let mut pending = Vec::with_capacity(ids.len());
        for raw in ids {
            let Ok(id) = Uuid::parse_str(&raw) else {
                warn!(id = %raw, "Skipping malformed pending request id");
                continue;
            };
            if let Some(record) = self.get_request(id).await? {
                pending.push(record);
            }
        }
        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }

    async fn try_acquire_lease(&self, id: Uuid, owner: &str, ttl: Duration) -> NotificationResult<bool> {
        let mut conn = self.redis.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.lease_key(id))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn release_lease(&self, id: Uuid, owner: &str) -> NotificationResult<()> {
        let mut conn = self.redis.clone();
        let _: i64 = self
            .release_script
            .key(self.lease_key(id))
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
