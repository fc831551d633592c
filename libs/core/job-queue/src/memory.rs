//! In-process queue backend.
//!
//! Same lease semantics as the Redis backend, without durability across
//! restarts. Used by tests and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{QueueError, QueueResult};
use crate::queue::{deadline, AckHandle, Delivery, DispatchQueue, QueueDepth, QueueJob, QueueProbe};

struct Entry<J> {
    job: J,
    visible_at: DateTime<Utc>,
    lease: u64,
    /// Handed to a worker and not yet settled.
    leased: bool,
    /// Insertion order, breaks ties between equally due entries.
    seq: u64,
}

struct Inner<J> {
    entries: HashMap<String, Entry<J>>,
    next_seq: u64,
}

/// Visibility-timeout queue held in memory.
pub struct MemoryQueue<J> {
    name: String,
    visibility_timeout: Duration,
    inner: Mutex<Inner<J>>,
}

impl<J: QueueJob> MemoryQueue<J> {
    /// Create a queue whose leases expire after `visibility_timeout`.
    pub fn new(name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            visibility_timeout,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Jobs currently held, in no particular order. Includes leased jobs.
    pub async fn snapshot(&self) -> Vec<J> {
        let inner = self.inner.lock().await;
        inner.entries.values().map(|e| e.job.clone()).collect()
    }

    /// Visibility time of a queued job.
    pub async fn visible_at(&self, job_id: &str) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().await;
        inner.entries.get(job_id).map(|e| e.visible_at)
    }

    fn settle<F>(inner: &mut Inner<J>, handle: &AckHandle, apply: F) -> QueueResult<()>
    where
        F: FnOnce(&mut Inner<J>),
    {
        let current = inner
            .entries
            .get(&handle.job_id)
            .is_some_and(|e| e.lease == handle.lease);
        if !current {
            return Err(QueueError::lease_lost(&handle.job_id));
        }
        apply(inner);
        Ok(())
    }
}

#[async_trait]
impl<J: QueueJob> DispatchQueue<J> for MemoryQueue<J> {
    async fn enqueue(&self, job: &J, not_before: DateTime<Utc>) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        let job_id = job.job_id();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        // Re-enqueueing bumps the generation so an older lease can no longer settle it.
        let lease = inner.entries.get(&job_id).map_or(0, |e| e.lease + 1);
        inner.entries.insert(
            job_id.clone(),
            Entry {
                job: job.clone(),
                visible_at: not_before,
                lease,
                leased: false,
                seq,
            },
        );

        debug!(queue = %self.name, job_id = %job_id, not_before = %not_before, "Enqueued job");
        Ok(())
    }

    async fn dequeue(&self) -> QueueResult<Option<Delivery<J>>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let next = inner
            .entries
            .iter()
            .filter(|(_, e)| e.visible_at <= now)
            .min_by_key(|(_, e)| (e.visible_at, e.seq))
            .map(|(id, _)| id.clone());

        let Some(job_id) = next else {
            return Ok(None);
        };

        let Some(entry) = inner.entries.get_mut(&job_id) else {
            return Ok(None);
        };
        entry.lease += 1;
        entry.leased = true;
        entry.visible_at = deadline(now, self.visibility_timeout);

        Ok(Some(Delivery {
            job: entry.job.clone(),
            handle: AckHandle {
                job_id,
                lease: entry.lease,
            },
        }))
    }

    async fn ack(&self, handle: &AckHandle) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        Self::settle(&mut inner, handle, |inner| {
            inner.entries.remove(&handle.job_id);
        })
    }

    async fn nack(&self, handle: &AckHandle, delay: Duration) -> QueueResult<()> {
        let visible_at = deadline(Utc::now(), delay);
        let mut inner = self.inner.lock().await;
        Self::settle(&mut inner, handle, |inner| {
            if let Some(entry) = inner.entries.get_mut(&handle.job_id) {
                entry.visible_at = visible_at;
                entry.leased = false;
            }
        })
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        let due = inner.entries.values().filter(|e| e.visible_at <= now).count();
        // An expired lease is due again, not in flight.
        let leased = inner
            .entries
            .values()
            .filter(|e| e.leased && e.visible_at > now)
            .count();
        Ok(QueueDepth {
            total: inner.entries.len() as u64,
            due: due as u64,
            leased: leased as u64,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl<J: QueueJob> QueueProbe for MemoryQueue<J> {
    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn probe_depth(&self) -> QueueResult<QueueDepth> {
        self.depth().await
    }

    fn probe_name(&self) -> &str {
        &self.name
    }
}
