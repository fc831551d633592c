//! Queue traits shared by every backend.
//!
//! A job is *leased* when dequeued: it stays in the queue but becomes
//! invisible for the visibility timeout. `ack` removes it, `nack` makes it
//! visible again after a delay, and a lease that is never settled simply
//! expires so the job is handed to another worker (at-least-once delivery).
//!
//! Every lease carries a generation number. Settling with a stale generation
//! fails with [`QueueError::LeaseLost`](crate::QueueError::LeaseLost) and
//! leaves the queue untouched.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use crate::error::QueueResult;

/// Trait for queue payloads.
///
/// `job_id` doubles as the queue key: enqueueing a job whose id is already
/// queued replaces the existing entry instead of adding a second one.
pub trait QueueJob: Serialize + DeserializeOwned + Send + Sync + Clone + 'static {
    /// Returns the job ID for logging, tracking and de-duplication.
    fn job_id(&self) -> String;
}

/// Receipt for a leased job, required to settle it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckHandle {
    pub job_id: String,
    pub lease: u64,
}

/// A job handed to a worker together with its ack handle.
#[derive(Debug, Clone)]
pub struct Delivery<J> {
    pub job: J,
    pub handle: AckHandle,
}

/// Snapshot of queue size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    /// All entries, including delayed and currently leased ones.
    pub total: u64,
    /// Entries visible right now.
    pub due: u64,
    /// Entries held by a worker under an unexpired lease.
    pub leased: u64,
}

impl QueueDepth {
    /// Nothing is due and no worker holds a lease. Delayed entries may remain.
    pub fn is_idle(&self) -> bool {
        self.due == 0 && self.leased == 0
    }
}

/// Durable delayed work queue with leased delivery.
#[async_trait]
pub trait DispatchQueue<J: QueueJob>: Send + Sync {
    /// Durably store `job`, invisible until `not_before`.
    async fn enqueue(&self, job: &J, not_before: DateTime<Utc>) -> QueueResult<()>;

    /// Lease the earliest due job, if any.
    async fn dequeue(&self) -> QueueResult<Option<Delivery<J>>>;

    /// Permanently remove a leased job.
    async fn ack(&self, handle: &AckHandle) -> QueueResult<()>;

    /// Return a leased job to the queue, invisible for `delay`.
    async fn nack(&self, handle: &AckHandle, delay: Duration) -> QueueResult<()>;

    /// Current queue size.
    async fn depth(&self) -> QueueResult<QueueDepth>;

    /// Queue name used for logs and metric labels.
    fn name(&self) -> &str;
}

/// Readiness probe used by the health router.
#[async_trait]
pub trait QueueProbe: Send + Sync {
    /// Check the backing store is reachable.
    async fn ping(&self) -> QueueResult<()>;

    /// Current queue size.
    async fn probe_depth(&self) -> QueueResult<QueueDepth>;

    /// Queue name.
    fn probe_name(&self) -> &str;
}

/// `now + delay`, saturating instead of overflowing.
pub fn deadline(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
