//! In-memory request and delivery store.
//!
//! Implements both store traits behind one lock. Suitable for tests and
//! single-process runs; nothing survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::NotificationResult;
use crate::models::{DeliveryAttemptRecord, DeliveryFilter, RequestRecord, RequestState};
use crate::repository::{DeliveryReportStore, InsertOutcome, RequestStore};

struct Lease {
    owner: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    requests: HashMap<Uuid, RequestRecord>,
    keys: HashMap<String, Uuid>,
    attempts: Vec<DeliveryAttemptRecord>,
    leases: HashMap<Uuid, Lease>,
}

#[derive(Default)]
pub struct InMemoryDeliveryStore {
    inner: RwLock<Inner>,
}

impl InMemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored request. Lets tests stage crash states.
    pub async fn put_request(&self, record: RequestRecord) {
        let mut inner = self.inner.write().await;
        inner.keys.insert(record.idempotency_key.clone(), record.id);
        inner.requests.insert(record.id, record);
    }
}

#[async_trait]
impl DeliveryReportStore for InMemoryDeliveryStore {
    async fn append(&self, record: &DeliveryAttemptRecord) -> NotificationResult<()> {
        let mut inner = self.inner.write().await;
        inner.attempts.push(record.clone());
        Ok(())
    }

    async fn query(&self, filter: &DeliveryFilter) -> NotificationResult<Vec<DeliveryAttemptRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .attempts
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RequestStore for InMemoryDeliveryStore {
    async fn insert_if_absent(&self, record: RequestRecord) -> NotificationResult<InsertOutcome> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.keys.get(&record.idempotency_key) {
            let pending = inner
                .requests
                .get(existing)
                .is_some_and(|r| r.state == RequestState::Pending);
            if pending {
                return Ok(InsertOutcome::Duplicate(*existing));
            }
        }

        inner.keys.insert(record.idempotency_key.clone(), record.id);
        inner.requests.insert(record.id, record);
        Ok(InsertOutcome::Inserted)
    }

    async fn get_request(&self, id: Uuid) -> NotificationResult<Option<RequestRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.requests.get(&id).cloned())
    }

    async fn transition(&self, id: Uuid, from: RequestState, to: RequestState) -> NotificationResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.requests.get_mut(&id) {
            Some(record) if record.state == from => {
                record.state = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_enqueued(&self, id: Uuid, at: DateTime<Utc>) -> NotificationResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.requests.get_mut(&id) {
            record.last_enqueued_at = Some(record.last_enqueued_at.map_or(at, |prev| prev.max(at)));
        }
        Ok(())
    }

    async fn pending_requests(&self) -> NotificationResult<Vec<RequestRecord>> {
        let inner = self.inner.read().await;
        let mut pending: Vec<_> = inner
            .requests
            .values()
            .filter(|r| r.state == RequestState::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }

    async fn try_acquire_lease(&self, id: Uuid, owner: &str, ttl: Duration) -> NotificationResult<bool> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();

        let held = inner
            .leases
            .get(&id)
            .is_some_and(|lease| lease.expires_at > now && lease.owner != owner);
        if held {
            return Ok(false);
        }

        inner.leases.insert(
            id,
            Lease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, id: Uuid, owner: &str) -> NotificationResult<()> {
        let mut inner = self.inner.write().await;
        if inner.leases.get(&id).is_some_and(|lease| lease.owner == owner) {
            inner.leases.remove(&id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttemptOutcome, NotificationRequest, Payload};

    fn record(key: &str) -> RequestRecord {
        RequestRecord::accept(
            NotificationRequest::new("alice@example.com", vec!["email".into()], Payload::new("hi"))
                .with_idempotency_key(key),
        )
    }

    fn attempt(request_id: Uuid, outcome: AttemptOutcome) -> DeliveryAttemptRecord {
        DeliveryAttemptRecord {
            request_id,
            recipient: "alice@example.com".into(),
            channel: "email".into(),
            attempt: 1,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcome,
            error_detail: None,
            latency_ms: 3,
        }
    }

    #[tokio::test]
    async fn test_insert_dedupes_pending_key() {
        let store = InMemoryDeliveryStore::new();
        let first = record("k1");
        let first_id = first.id;

        assert_eq!(store.insert_if_absent(first).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            store.insert_if_absent(record("k1")).await.unwrap(),
            InsertOutcome::Duplicate(first_id)
        );
    }

    #[tokio::test]
    async fn test_insert_after_terminal_creates_new_request() {
        let store = InMemoryDeliveryStore::new();
        let first = record("k1");
        let first_id = first.id;
        store.insert_if_absent(first).await.unwrap();
        assert!(store
            .transition(first_id, RequestState::Pending, RequestState::Delivered)
            .await
            .unwrap());

        let second = record("k1");
        assert_eq!(store.insert_if_absent(second).await.unwrap(), InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = InMemoryDeliveryStore::new();
        let r = record("k1");
        let id = r.id;
        store.insert_if_absent(r).await.unwrap();

        assert!(store.transition(id, RequestState::Pending, RequestState::Cancelled).await.unwrap());
        assert!(!store.transition(id, RequestState::Pending, RequestState::Delivered).await.unwrap());
        assert_eq!(
            store.get_request(id).await.unwrap().unwrap().state,
            RequestState::Cancelled
        );
        assert!(store.pending_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lease_excludes_other_owners() {
        let store = InMemoryDeliveryStore::new();
        let id = Uuid::now_v7();
        let ttl = Duration::from_secs(30);

        assert!(store.try_acquire_lease(id, "w1", ttl).await.unwrap());
        assert!(!store.try_acquire_lease(id, "w2", ttl).await.unwrap());

        store.release_lease(id, "w2").await.unwrap();
        assert!(!store.try_acquire_lease(id, "w2", ttl).await.unwrap());

        store.release_lease(id, "w1").await.unwrap();
        assert!(store.try_acquire_lease(id, "w2", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires() {
        let store = InMemoryDeliveryStore::new();
        let id = Uuid::now_v7();

        assert!(store.try_acquire_lease(id, "w1", Duration::from_secs(5)).await.unwrap());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.try_acquire_lease(id, "w2", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_query_filters_attempts() {
        let store = InMemoryDeliveryStore::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        store.append(&attempt(a, AttemptOutcome::TransientFailure)).await.unwrap();
        store.append(&attempt(a, AttemptOutcome::Success)).await.unwrap();
        store.append(&attempt(b, AttemptOutcome::Success)).await.unwrap();

        assert_eq!(store.query(&DeliveryFilter::for_request(a)).await.unwrap().len(), 2);

        let successes = store
            .query(&DeliveryFilter {
                status: Some(AttemptOutcome::Success),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(successes.len(), 2);
    }

    #[tokio::test]
    async fn test_touch_enqueued_keeps_latest() {
        let store = InMemoryDeliveryStore::new();
        let r = record("k1");
        let id = r.id;
        store.insert_if_absent(r).await.unwrap();

        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(10);
        store.touch_enqueued(id, later).await.unwrap();
        store.touch_enqueued(id, earlier).await.unwrap();

        assert_eq!(store.get_request(id).await.unwrap().unwrap().last_enqueued_at, Some(later));
    }
}
