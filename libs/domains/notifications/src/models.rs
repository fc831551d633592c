//! Data models for the notifications domain.

use chrono::{DateTime, Utc};
use job_queue::QueueJob;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use strum::{Display, EnumString};
use uuid::Uuid;

// ============================================================================
// Channels
// ============================================================================

/// Identifier of a delivery channel (`email`, `sms`, `push`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Exponential backoff: `base * multiplier^(attempt-1)`, capped.
///
/// No jitter, so successive delays never decrease.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl BackoffPolicy {
    /// Multipliers below 1 (or NaN) are raised to 1.
    pub fn new(base: Duration, multiplier: f64, cap: Duration) -> Self {
        let multiplier = if multiplier >= 1.0 { multiplier } else { 1.0 };
        Self {
            base,
            multiplier,
            cap: cap.max(base),
        }
    }

    /// Delay before retrying after the given (1-based) attempt failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(60))
    }
}

/// Channel Registry entry. Built at startup, immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDescriptor {
    pub id: ChannelId,
    /// Transient failures may be retried on this channel.
    pub retryable: bool,
    /// Attempt ceiling per channel, at least 1.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Upper bound for one `send` call.
    pub timeout: Duration,
}

impl ChannelDescriptor {
    pub fn new(id: impl Into<ChannelId>) -> Self {
        Self {
            id: id.into(),
            retryable: true,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl From<String> for ChannelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Rendered notification content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Subject or title, where the channel has one.
    pub subject: Option<String>,
    /// Rendered body.
    pub body: String,
    /// Opaque metadata passed through to adapters.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Payload {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A request to notify one recipient over an ordered list of channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Collapses duplicate submissions. Derived from the content when absent.
    pub idempotency_key: Option<String>,
    /// Address, phone number, device token or user id.
    pub recipient: String,
    /// Primary channel first, then fallbacks in order.
    pub channels: Vec<ChannelId>,
    pub payload: Payload,
    /// Not dispatched before this time.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NotificationRequest {
    pub fn new(recipient: impl Into<String>, channels: Vec<ChannelId>, payload: Payload) -> Self {
        Self {
            idempotency_key: None,
            recipient: recipient.into(),
            channels,
            payload,
            scheduled_at: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// The caller's key, or a SHA-256 digest over recipient, channels,
    /// schedule and payload.
    pub fn effective_idempotency_key(&self) -> String {
        if let Some(key) = &self.idempotency_key {
            return key.clone();
        }

        let mut hasher = Sha256::new();
        hasher.update(self.recipient.as_bytes());
        for channel in &self.channels {
            hasher.update([0u8]);
            hasher.update(channel.as_str().as_bytes());
        }
        hasher.update([1u8]);
        if let Some(at) = self.scheduled_at {
            hasher.update(at.timestamp_millis().to_be_bytes());
        }
        hasher.update([2u8]);
        if let Some(subject) = &self.payload.subject {
            hasher.update(subject.as_bytes());
        }
        hasher.update([3u8]);
        hasher.update(self.payload.body.as_bytes());
        for (key, value) in &self.payload.metadata {
            hasher.update([4u8]);
            hasher.update(key.as_bytes());
            hasher.update([5u8]);
            hasher.update(value.as_bytes());
        }
        format!("sha256:{:x}", hasher.finalize())
    }
}

/// Lifecycle of an accepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    /// Somewhere in its channel chain.
    Pending,
    /// One channel succeeded.
    Delivered,
    /// Every channel was tried without success.
    Exhausted,
    /// Cancelled before delivery.
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestState::Pending)
    }
}

/// Stored form of an accepted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: Uuid,
    pub idempotency_key: String,
    pub recipient: String,
    pub channels: Vec<ChannelId>,
    pub payload: Payload,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
    /// When a job for this request was last put on the queue.
    pub last_enqueued_at: Option<DateTime<Utc>>,
}

impl RequestRecord {
    /// New pending record for a validated request.
    pub fn accept(request: NotificationRequest) -> Self {
        let idempotency_key = request.effective_idempotency_key();
        Self {
            id: Uuid::now_v7(),
            idempotency_key,
            recipient: request.recipient,
            channels: request.channels,
            payload: request.payload,
            scheduled_at: request.scheduled_at,
            state: RequestState::Pending,
            created_at: Utc::now(),
            last_enqueued_at: None,
        }
    }

    /// Channel after `current` in the request's list, if any.
    pub fn next_channel(&self, current: &ChannelId) -> Option<&ChannelId> {
        let position = self.channels.iter().position(|c| c == current)?;
        self.channels.get(position + 1)
    }
}

// ============================================================================
// Jobs (queue payload)
// ============================================================================

/// One channel attempt waiting on the dispatch queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub job_id: String,
    pub request_id: Uuid,
    pub channel: ChannelId,
    /// 1-based attempt number on `channel`.
    pub attempt: u32,
    pub max_attempts: u32,
    pub not_before: DateTime<Utc>,
    pub payload: Payload,
}

impl NotificationJob {
    /// Job for `attempt` on `channel`.
    ///
    /// The id is derived from `(request, channel, attempt)`, so re-creating
    /// the same logical job replaces the queued copy instead of doubling it.
    pub fn new(
        request: &RequestRecord,
        channel: ChannelId,
        attempt: u32,
        max_attempts: u32,
        not_before: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: Self::job_key(request.id, &channel, attempt),
            request_id: request.id,
            channel,
            attempt,
            max_attempts: max_attempts.max(1),
            not_before,
            payload: request.payload.clone(),
        }
    }

    pub fn job_key(request_id: Uuid, channel: &ChannelId, attempt: u32) -> String {
        format!("{}:{}:{}", request_id, channel, attempt)
    }
}

impl QueueJob for NotificationJob {
    fn job_id(&self) -> String {
        self.job_id.clone()
    }
}

// ============================================================================
// Attempts and reports
// ============================================================================

/// Classified result of one `send` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// May succeed on retry (timeout, throttling, 5xx).
    TransientFailure(String),
    /// Retrying this channel cannot help (bad recipient, rejected payload).
    PermanentFailure(String),
}

impl Outcome {
    pub fn kind(&self) -> AttemptOutcome {
        match self {
            Outcome::Success => AttemptOutcome::Success,
            Outcome::TransientFailure(_) => AttemptOutcome::TransientFailure,
            Outcome::PermanentFailure(_) => AttemptOutcome::PermanentFailure,
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Outcome::Success => None,
            Outcome::TransientFailure(detail) | Outcome::PermanentFailure(detail) => Some(detail),
        }
    }
}

/// Stored outcome of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

/// One immutable row per adapter invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttemptRecord {
    pub request_id: Uuid,
    pub recipient: String,
    pub channel: ChannelId,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error_detail: Option<String>,
    pub latency_ms: u64,
}

impl DeliveryAttemptRecord {
    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

/// Filter for delivery report queries. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryFilter {
    pub request_id: Option<Uuid>,
    pub recipient: Option<String>,
    pub channel: Option<ChannelId>,
    pub status: Option<AttemptOutcome>,
    pub since: Option<DateTime<Utc>>,
}

impl DeliveryFilter {
    pub fn for_request(request_id: Uuid) -> Self {
        Self {
            request_id: Some(request_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &DeliveryAttemptRecord) -> bool {
        self.request_id.is_none_or(|id| id == record.request_id)
            && self
                .recipient
                .as_deref()
                .is_none_or(|r| r == record.recipient)
            && self.channel.as_ref().is_none_or(|c| *c == record.channel)
            && self.status.is_none_or(|s| s == record.outcome)
            && self.since.is_none_or(|since| record.started_at >= since)
    }
}

/// All attempts for one request plus its final status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub request_id: Uuid,
    pub recipient: String,
    pub status: RequestState,
    pub attempts: Vec<DeliveryAttemptRecord>,
}

impl DeliveryReport {
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    pub fn success_count(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_success()).count()
    }
}

/// Answer to `submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub accepted: bool,
    pub request_id: Option<Uuid>,
    pub reason: Option<String>,
}

impl SubmitResponse {
    pub fn accepted(request_id: Uuid) -> Self {
        Self {
            accepted: true,
            request_id: Some(request_id),
            reason: None,
        }
    }

    /// Accepted earlier under the same idempotency key.
    pub fn duplicate(request_id: Uuid) -> Self {
        Self {
            accepted: true,
            request_id: Some(request_id),
            reason: Some("duplicate idempotency key".to_string()),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            request_id: None,
            reason: Some(reason.into()),
        }
    }
}
