//! Redis request and delivery store against a real server.

use chrono::{TimeDelta, Utc};
use domain_notifications::{
    AttemptOutcome, DeliveryAttemptRecord, DeliveryFilter, DeliveryReportStore, InsertOutcome,
    NotificationRequest, Payload, RedisDeliveryStore, RequestRecord, RequestState, RequestStore,
};
use std::time::Duration;
use test_utils::{TestDataBuilder, TestRedis};

async fn store(redis: &TestRedis, test: &str) -> (RedisDeliveryStore, TestDataBuilder) {
    let data = TestDataBuilder::from_test_name(test);
    let store = RedisDeliveryStore::new(redis.connection_manager().await, data.namespace("notify"));
    (store, data)
}

fn record(data: &TestDataBuilder, key: &str) -> RequestRecord {
    RequestRecord::accept(
        NotificationRequest::new(
            data.recipient("alice"),
            vec!["email".into(), "sms".into()],
            Payload::new("hello").with_subject("Hi"),
        )
        .with_idempotency_key(data.idempotency_key(key)),
    )
}

fn attempt(record: &RequestRecord, channel: &str, outcome: AttemptOutcome) -> DeliveryAttemptRecord {
    let now = Utc::now();
    DeliveryAttemptRecord {
        request_id: record.id,
        recipient: record.recipient.clone(),
        channel: channel.into(),
        attempt: 1,
        started_at: now,
        finished_at: now + TimeDelta::milliseconds(12),
        outcome,
        error_detail: None,
        latency_ms: 12,
    }
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_insert_round_trips_and_dedupes() {
    let redis = TestRedis::new().await;
    let (store, data) = store(&redis, "insert").await;

    let first = record(&data, "order-1");
    assert_eq!(store.insert_if_absent(first.clone()).await.unwrap(), InsertOutcome::Inserted);
    assert_eq!(
        store.insert_if_absent(record(&data, "order-1")).await.unwrap(),
        InsertOutcome::Duplicate(first.id)
    );

    let loaded = store.get_request(first.id).await.unwrap().unwrap();
    assert_eq!(loaded.recipient, first.recipient);
    assert_eq!(loaded.channels, first.channels);
    assert_eq!(loaded.state, RequestState::Pending);
    assert_eq!(store.pending_requests().await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_terminal_request_frees_idempotency_key() {
    let redis = TestRedis::new().await;
    let (store, data) = store(&redis, "terminal").await;

    let first = record(&data, "order-2");
    store.insert_if_absent(first.clone()).await.unwrap();
    assert!(store
        .transition(first.id, RequestState::Pending, RequestState::Delivered)
        .await
        .unwrap());
    assert!(!store
        .transition(first.id, RequestState::Pending, RequestState::Cancelled)
        .await
        .unwrap());
    assert!(store.pending_requests().await.unwrap().is_empty());

    let second = record(&data, "order-2");
    assert_eq!(store.insert_if_absent(second).await.unwrap(), InsertOutcome::Inserted);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_watermark_only_moves_forward() {
    let redis = TestRedis::new().await;
    let (store, data) = store(&redis, "watermark").await;

    let r = record(&data, "order-3");
    store.insert_if_absent(r.clone()).await.unwrap();

    let later = Utc::now();
    store.touch_enqueued(r.id, later).await.unwrap();
    store.touch_enqueued(r.id, later - TimeDelta::seconds(30)).await.unwrap();

    let loaded = store.get_request(r.id).await.unwrap().unwrap();
    assert_eq!(
        loaded.last_enqueued_at.map(|t| t.timestamp_millis()),
        Some(later.timestamp_millis())
    );
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_attempts_query_by_request_recipient_and_status() {
    let redis = TestRedis::new().await;
    let (store, data) = store(&redis, "attempts").await;

    let r = record(&data, "order-4");
    store.insert_if_absent(r.clone()).await.unwrap();
    store
        .append(&attempt(&r, "email", AttemptOutcome::TransientFailure))
        .await
        .unwrap();
    store
        .append(&attempt(&r, "sms", AttemptOutcome::Success))
        .await
        .unwrap();

    let all = store.query(&DeliveryFilter::for_request(r.id)).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].channel.as_str(), "email");

    let by_recipient = store
        .query(&DeliveryFilter {
            recipient: Some(r.recipient.clone()),
            status: Some(AttemptOutcome::Success),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_recipient.len(), 1);
    assert_eq!(by_recipient[0].channel.as_str(), "sms");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_lease_is_exclusive_and_expires() {
    let redis = TestRedis::new().await;
    let (store, data) = store(&redis, "lease").await;
    let r = record(&data, "order-5");

    assert!(store.try_acquire_lease(r.id, "w1", Duration::from_millis(100)).await.unwrap());
    assert!(!store.try_acquire_lease(r.id, "w2", Duration::from_millis(100)).await.unwrap());

    // Only the holder can release.
    store.release_lease(r.id, "w2").await.unwrap();
    assert!(!store.try_acquire_lease(r.id, "w2", Duration::from_millis(100)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(store.try_acquire_lease(r.id, "w2", Duration::from_secs(5)).await.unwrap());
}
