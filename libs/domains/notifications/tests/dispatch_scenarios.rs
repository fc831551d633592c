//! End-to-end dispatch scenarios over the in-memory queue and store.

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use domain_notifications::{
    AttemptOutcome, BackoffPolicy, ChannelAdapter, ChannelDescriptor, ChannelRegistry,
    DeliveryFilter, DeliveryReportStore, Dispatcher, DispatcherConfig, InMemoryDeliveryStore,
    NotificationJob, NotificationRequest, NotificationService, Outcome, Payload, RequestState,
    RetrySweeper, SweeperConfig,
};
use job_queue::{DispatchQueue, MemoryQueue, QueueWorker, Settle, WorkerConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::TestDataBuilder;
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Adapter that plays back a script, then repeats a fallback outcome.
struct Scripted {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    delay: Duration,
    calls: AtomicUsize,
}

impl Scripted {
    fn always(outcome: Outcome) -> Arc<Self> {
        Self::script(vec![], outcome)
    }

    fn script(script: Vec<Outcome>, fallback: Outcome) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    fn slow(outcome: Outcome, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: outcome,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelAdapter for Scripted {
    async fn send(&self, _target: &str, _payload: &Payload, _timeout: Duration) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

fn transient() -> Outcome {
    Outcome::TransientFailure("503 from provider".into())
}

fn permanent() -> Outcome {
    Outcome::PermanentFailure("invalid recipient".into())
}

fn descriptor(id: &str, max_attempts: u32) -> ChannelDescriptor {
    ChannelDescriptor::new(id)
        .with_max_attempts(max_attempts)
        .with_backoff(BackoffPolicy::new(
            Duration::from_millis(1),
            2.0,
            Duration::from_millis(4),
        ))
        .with_timeout(Duration::from_secs(2))
}

struct Harness {
    store: Arc<InMemoryDeliveryStore>,
    queue: Arc<MemoryQueue<NotificationJob>>,
    dispatcher: Arc<Dispatcher>,
    service: NotificationService,
    data: TestDataBuilder,
}

impl Harness {
    fn new(test: &str, channels: Vec<(ChannelDescriptor, Arc<Scripted>)>) -> Self {
        let mut builder = ChannelRegistry::builder();
        for (descriptor, adapter) in channels {
            builder = builder.register(descriptor, adapter).unwrap();
        }
        let registry = Arc::new(builder.build());

        let store = Arc::new(InMemoryDeliveryStore::new());
        let queue = Arc::new(MemoryQueue::<NotificationJob>::new("test:jobs", Duration::from_secs(5)));
        let dispatcher = Arc::new(
            Dispatcher::new(registry.clone(), store.clone(), store.clone(), queue.clone()).with_config(
                DispatcherConfig::default().with_lease_busy_delay(Duration::from_millis(5)),
            ),
        );
        let service = NotificationService::new(registry, store.clone(), store.clone(), queue.clone());

        Self {
            store,
            queue,
            dispatcher,
            service,
            data: TestDataBuilder::from_test_name(test),
        }
    }

    fn request(&self, channels: &[&str]) -> NotificationRequest {
        NotificationRequest::new(
            self.data.recipient("alice"),
            channels.iter().map(|c| (*c).into()).collect(),
            Payload::new("Your order shipped").with_subject("Order update"),
        )
    }

    async fn submit(&self, request: NotificationRequest) -> Uuid {
        let response = self.service.submit(request).await.unwrap();
        assert!(response.accepted, "rejected: {:?}", response.reason);
        response.request_id.unwrap()
    }

    /// Run drain passes until the queue is empty.
    ///
    /// A single pass stops as soon as nothing is due, so backoff delays need
    /// another pass once they come due.
    async fn drain(&self) {
        let config = WorkerConfig::new()
            .with_concurrency(2)
            .with_poll_interval_ms(2)
            .with_failure_requeue_ms(5)
            .with_drain(true);
        let worker = QueueWorker::new(self.queue.clone(), self.dispatcher.clone(), config);
        let (_tx, rx) = watch::channel(false);

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                worker.run(rx.clone()).await.unwrap();
                if self.queue.depth().await.unwrap().total == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("queue should drain");
    }

    /// Process exactly one due job by hand.
    async fn step(&self) -> NotificationJob {
        let delivery = self.queue.dequeue().await.unwrap().expect("a due job");
        match self.dispatcher.process_job(&delivery.job).await.unwrap() {
            Settle::Ack => self.queue.ack(&delivery.handle).await.unwrap(),
            Settle::Requeue(delay) => self.queue.nack(&delivery.handle, delay).await.unwrap(),
        }
        delivery.job
    }

    async fn channels_tried(&self, request_id: Uuid) -> Vec<(String, u32, AttemptOutcome)> {
        self.store
            .query(&DeliveryFilter::for_request(request_id))
            .await
            .unwrap()
            .into_iter()
            .map(|a| (a.channel.to_string(), a.attempt, a.outcome))
            .collect()
    }
}

#[tokio::test]
async fn test_transient_failures_exhaust_single_channel() {
    let email = Scripted::always(transient());
    let h = Harness::new("scenario_a", vec![(descriptor("email", 3), email.clone())]);

    let id = h.submit(h.request(&["email"])).await;
    h.drain().await;

    let report = h.service.report(id).await.unwrap();
    assert_eq!(report.status, RequestState::Exhausted);
    assert_eq!(report.attempt_count(), 3);
    assert!(report
        .attempts
        .iter()
        .all(|a| a.outcome == AttemptOutcome::TransientFailure));
    assert_eq!(
        report.attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(email.calls(), 3);
}

#[tokio::test]
async fn test_permanent_failure_fails_over_immediately() {
    let sms = Scripted::always(permanent());
    let email = Scripted::always(Outcome::Success);
    let h = Harness::new(
        "scenario_b",
        vec![(descriptor("sms", 3), sms.clone()), (descriptor("email", 3), email.clone())],
    );

    let id = h.submit(h.request(&["sms", "email"])).await;
    h.drain().await;

    assert_eq!(
        h.channels_tried(id).await,
        vec![
            ("sms".to_string(), 1, AttemptOutcome::PermanentFailure),
            ("email".to_string(), 1, AttemptOutcome::Success),
        ]
    );
    assert_eq!(sms.calls(), 1);
    assert_eq!(h.service.report(id).await.unwrap().status, RequestState::Delivered);
}

#[tokio::test]
async fn test_duplicate_submit_during_retry_returns_existing_request() {
    let email = Scripted::script(vec![transient()], Outcome::Success);
    let h = Harness::new("scenario_c", vec![(descriptor("email", 3), email.clone())]);
    let request = h.request(&["email"]).with_idempotency_key("order-7-shipped");

    let id = h.submit(request.clone()).await;
    h.step().await;
    assert_eq!(h.channels_tried(id).await.len(), 1);

    let duplicate = h.service.submit(request).await.unwrap();
    assert!(duplicate.accepted);
    assert_eq!(duplicate.request_id, Some(id));

    // Only the retry of the original chain is queued.
    let queued = h.queue.snapshot().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].attempt, 2);

    h.drain().await;
    let report = h.service.report(id).await.unwrap();
    assert_eq!(report.status, RequestState::Delivered);
    assert_eq!(report.attempt_count(), 2);
    assert_eq!(email.calls(), 2);
}

#[tokio::test]
async fn test_success_after_retry_abandons_fallbacks() {
    let email = Scripted::script(vec![transient()], Outcome::Success);
    let sms = Scripted::always(Outcome::Success);
    let h = Harness::new(
        "scenario_d",
        vec![(descriptor("email", 3), email.clone()), (descriptor("sms", 3), sms.clone())],
    );

    let id = h.submit(h.request(&["email", "sms"])).await;
    h.drain().await;

    let report = h.service.report(id).await.unwrap();
    assert_eq!(report.status, RequestState::Delivered);
    assert_eq!(
        h.channels_tried(id).await,
        vec![
            ("email".to_string(), 1, AttemptOutcome::TransientFailure),
            ("email".to_string(), 2, AttemptOutcome::Success),
        ]
    );
    assert_eq!(sms.calls(), 0);
}

#[tokio::test]
async fn test_sweeper_recreates_job_lost_in_crash() {
    let email = Scripted::script(vec![], Outcome::Success);
    let h = Harness::new("scenario_e", vec![(descriptor("email", 3), email.clone())]);
    let sweeper = RetrySweeper::new(
        h.dispatcher.clone(),
        SweeperConfig::default().with_stale_after(Duration::ZERO),
    );

    let id = h.submit(h.request(&["email"])).await;
    tokio::time::sleep(Duration::from_millis(2)).await;

    // The worker recorded a transient failure, then died before enqueueing
    // the retry. The queue's own lease expiry would normally bring the job
    // back; here it is acked to model the lost follow-up.
    let delivery = h.queue.dequeue().await.unwrap().unwrap();
    let now = Utc::now();
    h.store
        .append(&domain_notifications::DeliveryAttemptRecord {
            request_id: id,
            recipient: h.data.recipient("alice"),
            channel: "email".into(),
            attempt: 1,
            started_at: now - TimeDelta::milliseconds(1),
            finished_at: now,
            outcome: AttemptOutcome::TransientFailure,
            error_detail: Some("connection reset".into()),
            latency_ms: 1,
        })
        .await
        .unwrap();
    h.queue.ack(&delivery.handle).await.unwrap();
    assert!(h.queue.snapshot().await.is_empty());

    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.requeued, 1);
    let queued = h.queue.snapshot().await;
    assert_eq!(queued.len(), 1);
    assert_eq!((queued[0].channel.as_str(), queued[0].attempt), ("email", 2));

    let again = sweeper.sweep_once().await.unwrap();
    assert_eq!(again.repairs(), 0);
    assert_eq!(h.queue.snapshot().await.len(), 1);

    h.drain().await;
    assert_eq!(h.service.report(id).await.unwrap().status, RequestState::Delivered);
    assert_eq!(email.calls(), 1);
}

#[tokio::test]
async fn test_sweeper_leaves_live_follow_up_alone() {
    let email = Scripted::always(transient());
    let h = Harness::new("sweeper_live", vec![(descriptor("email", 3), email)]);
    let sweeper = RetrySweeper::new(
        h.dispatcher.clone(),
        SweeperConfig::default().with_stale_after(Duration::ZERO),
    );

    h.submit(h.request(&["email"])).await;
    h.step().await;
    assert_eq!(h.queue.snapshot().await.len(), 1);

    assert_eq!(sweeper.sweep_once().await.unwrap().repairs(), 0);
    assert_eq!(h.queue.snapshot().await.len(), 1);
}

#[tokio::test]
async fn test_at_most_one_success_under_concurrent_redelivery() {
    let email = Scripted::slow(Outcome::Success, Duration::from_millis(30));
    let h = Harness::new("at_most_one", vec![(descriptor("email", 3), email.clone())]);

    let id = h.submit(h.request(&["email"])).await;
    let job = h.queue.snapshot().await.remove(0);

    let mut redeliveries = JoinSet::new();
    for _ in 0..8 {
        let dispatcher = h.dispatcher.clone();
        let job = job.clone();
        redeliveries.spawn(async move { dispatcher.process_job(&job).await.unwrap() });
    }
    while let Some(settle) = redeliveries.join_next().await {
        settle.unwrap();
    }

    // A late redelivery after the request finished.
    assert_eq!(h.dispatcher.process_job(&job).await.unwrap(), Settle::Ack);

    let successes = h
        .store
        .query(&DeliveryFilter {
            request_id: Some(id),
            status: Some(AttemptOutcome::Success),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(successes.len(), 1);
    assert_eq!(email.calls(), 1);
}

#[tokio::test]
async fn test_failover_follows_channel_order() {
    let a = Scripted::always(transient());
    let b = Scripted::always(permanent());
    let c = Scripted::always(Outcome::Success);
    let h = Harness::new(
        "failover_order",
        vec![
            (descriptor("a", 2), a),
            (descriptor("b", 3), b),
            (descriptor("c", 3), c),
        ],
    );

    let id = h.submit(h.request(&["a", "b", "c"])).await;
    h.drain().await;

    let tried: Vec<_> = h
        .channels_tried(id)
        .await
        .into_iter()
        .map(|(channel, attempt, _)| (channel, attempt))
        .collect();
    assert_eq!(
        tried,
        vec![
            ("a".to_string(), 1),
            ("a".to_string(), 2),
            ("b".to_string(), 1),
            ("c".to_string(), 1),
        ]
    );
}

#[tokio::test]
async fn test_terminates_within_sum_of_ceilings() {
    let h = Harness::new(
        "termination",
        vec![
            (descriptor("email", 3), Scripted::always(transient())),
            (descriptor("sms", 2), Scripted::always(transient())),
            (descriptor("push", 1), Scripted::always(transient())),
        ],
    );

    let id = h.submit(h.request(&["email", "sms", "push"])).await;
    h.drain().await;

    let report = h.service.report(id).await.unwrap();
    assert_eq!(report.status, RequestState::Exhausted);
    assert_eq!(report.attempt_count(), 3 + 2 + 1);
    assert_eq!(report.success_count(), 0);
}

#[tokio::test]
async fn test_cancel_stops_chain_before_next_attempt() {
    let email = Scripted::always(transient());
    let sms = Scripted::always(Outcome::Success);
    let h = Harness::new(
        "cancel",
        vec![(descriptor("email", 3), email.clone()), (descriptor("sms", 3), sms.clone())],
    );

    let id = h.submit(h.request(&["email", "sms"])).await;
    h.step().await;
    assert!(h.service.cancel(id).await.unwrap());

    h.drain().await;
    let report = h.service.report(id).await.unwrap();
    assert_eq!(report.status, RequestState::Cancelled);
    assert_eq!(report.attempt_count(), 1);
    assert_eq!(email.calls(), 1);
    assert_eq!(sms.calls(), 0);
}

#[tokio::test]
async fn test_scheduled_request_waits_until_due() {
    let email = Scripted::always(Outcome::Success);
    let h = Harness::new("scheduled", vec![(descriptor("email", 3), email)]);

    let at = Utc::now() + TimeDelta::milliseconds(80);
    let id = h.submit(h.request(&["email"]).with_scheduled_at(at)).await;
    assert!(h.queue.dequeue().await.unwrap().is_none());

    h.drain().await;
    let attempts = h.store.query(&DeliveryFilter::for_request(id)).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].started_at >= at);
}
