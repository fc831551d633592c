use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::NotificationResult;
use crate::models::{DeliveryAttemptRecord, DeliveryFilter, RequestRecord, RequestState};

/// Append-only store of delivery attempts.
///
/// Rows are never updated, so concurrent writers need no read-modify-write
/// coordination.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryReportStore: Send + Sync {
    /// Persist one attempt row
    async fn append(&self, record: &DeliveryAttemptRecord) -> NotificationResult<()>;

    /// Attempts matching `filter`, oldest first
    async fn query(&self, filter: &DeliveryFilter) -> NotificationResult<Vec<DeliveryAttemptRecord>>;
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A pending request already holds the key.
    Duplicate(Uuid),
}

/// Accepted requests, their state and the enqueue watermark.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert unless a pending request already owns the idempotency key
    async fn insert_if_absent(&self, record: RequestRecord) -> NotificationResult<InsertOutcome>;

    /// Get a request by ID
    async fn get_request(&self, id: Uuid) -> NotificationResult<Option<RequestRecord>>;

    /// Compare-and-set the request state; false if the current state is not `from`
    async fn transition(&self, id: Uuid, from: RequestState, to: RequestState) -> NotificationResult<bool>;

    /// Record that a job for this request was just enqueued
    async fn touch_enqueued(&self, id: Uuid, at: DateTime<Utc>) -> NotificationResult<()>;

    /// All requests still in `Pending`
    async fn pending_requests(&self) -> NotificationResult<Vec<RequestRecord>>;

    /// Take the per-request processing lease; false if someone else holds it
    async fn try_acquire_lease(&self, id: Uuid, owner: &str, ttl: Duration) -> NotificationResult<bool>;

    /// Give the lease back if `owner` still holds it
    async fn release_lease(&self, id: Uuid, owner: &str) -> NotificationResult<()>;
}
