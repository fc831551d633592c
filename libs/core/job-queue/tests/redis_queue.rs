//! Redis queue backend against a real server.

use chrono::{Duration as ChronoDuration, Utc};
use job_queue::{DispatchQueue, QueueDepth, QueueJob, QueueProbe, RedisQueue};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use test_utils::{TestDataBuilder, TestRedis};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PingJob {
    id: String,
    body: String,
}

impl QueueJob for PingJob {
    fn job_id(&self) -> String {
        self.id.clone()
    }
}

async fn queue(redis: &TestRedis, test: &str, visibility: Duration) -> RedisQueue<PingJob> {
    let name = TestDataBuilder::from_test_name(test).namespace("queue");
    RedisQueue::new(redis.connection_manager().await, name, visibility)
}

fn job(id: &str) -> PingJob {
    PingJob {
        id: id.to_string(),
        body: format!("body-{}", id),
    }
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_delayed_job_is_invisible_until_due() {
    let redis = TestRedis::new().await;
    let q = queue(&redis, "delayed", Duration::from_secs(30)).await;

    q.enqueue(&job("later"), Utc::now() + ChronoDuration::hours(1))
        .await
        .unwrap();
    q.enqueue(&job("now"), Utc::now()).await.unwrap();

    let delivery = q.dequeue().await.unwrap().unwrap();
    assert_eq!(delivery.job, job("now"));
    assert!(q.dequeue().await.unwrap().is_none());
    assert_eq!(q.depth().await.unwrap(), QueueDepth { total: 2, due: 0, leased: 1 });
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_ack_and_stale_lease() {
    let redis = TestRedis::new().await;
    let q = queue(&redis, "stale", Duration::from_millis(50)).await;

    q.enqueue(&job("a"), Utc::now()).await.unwrap();
    let first = q.dequeue().await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    let second = q.dequeue().await.unwrap().unwrap();
    assert_eq!(second.handle.job_id, "a");
    assert!(second.handle.lease > first.handle.lease);

    assert!(q.ack(&first.handle).await.unwrap_err().is_lease_lost());
    q.ack(&second.handle).await.unwrap();
    assert_eq!(q.depth().await.unwrap().total, 0);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_nack_hides_job_for_delay() {
    let redis = TestRedis::new().await;
    let q = queue(&redis, "nack", Duration::from_secs(30)).await;

    q.enqueue(&job("a"), Utc::now()).await.unwrap();
    let delivery = q.dequeue().await.unwrap().unwrap();
    q.nack(&delivery.handle, Duration::from_millis(100)).await.unwrap();

    assert!(q.dequeue().await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(q.dequeue().await.unwrap().is_some());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_reenqueue_collapses_to_one_entry() {
    let redis = TestRedis::new().await;
    let q = queue(&redis, "collapse", Duration::from_secs(30)).await;

    q.enqueue(&job("a"), Utc::now()).await.unwrap();
    q.enqueue(&job("a"), Utc::now()).await.unwrap();

    assert_eq!(q.depth().await.unwrap().total, 1);
    q.ping().await.unwrap();
}
