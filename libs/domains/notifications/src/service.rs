//! Scheduler-facing API: submit, cancel and report.

use chrono::Utc;
use job_queue::DispatchQueue;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::channels::ChannelRegistry;
use crate::error::{NotificationError, NotificationResult};
use crate::metrics;
use crate::models::{
    DeliveryAttemptRecord, DeliveryFilter, DeliveryReport, NotificationJob, NotificationRequest,
    RequestRecord, RequestState, SubmitResponse,
};
use crate::repository::{DeliveryReportStore, InsertOutcome, RequestStore};

/// Entry point for producers.
#[derive(Clone)]
pub struct NotificationService {
    registry: Arc<ChannelRegistry>,
    requests: Arc<dyn RequestStore>,
    reports: Arc<dyn DeliveryReportStore>,
    queue: Arc<dyn DispatchQueue<NotificationJob>>,
}

impl NotificationService {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        requests: Arc<dyn RequestStore>,
        reports: Arc<dyn DeliveryReportStore>,
        queue: Arc<dyn DispatchQueue<NotificationJob>>,
    ) -> Self {
        Self {
            registry,
            requests,
            reports,
            queue,
        }
    }

    /// Accept a request and enqueue its first job.
    ///
    /// Invalid requests come back as `accepted: false` with a reason. A
    /// request whose idempotency key is held by a pending request returns
    /// that request's id and creates nothing.
    #[instrument(skip(self, request), fields(recipient = %request.recipient))]
    pub async fn submit(&self, request: NotificationRequest) -> NotificationResult<SubmitResponse> {
        if let Err(e) = self.validate(&request) {
            info!(error = %e, "Rejected notification request");
            return Ok(SubmitResponse::rejected(e.to_string()));
        }

        let record = RequestRecord::accept(request);
        let request_id = record.id;

        if let InsertOutcome::Duplicate(existing) = self.requests.insert_if_absent(record.clone()).await? {
            info!(request_id = %existing, idempotency_key = %record.idempotency_key, "Duplicate submission");
            return Ok(SubmitResponse::duplicate(existing));
        }

        let channel = record.channels[0].clone();
        let max_attempts = self
            .registry
            .descriptor(&channel)
            .map_or(1, |d| d.max_attempts);
        let not_before = record.scheduled_at.unwrap_or_else(Utc::now);
        let job = NotificationJob::new(&record, channel, 1, max_attempts, not_before);

        self.queue.enqueue(&job, not_before).await?;
        self.requests.touch_enqueued(request_id, Utc::now()).await?;

        info!(
            request_id = %request_id,
            job_id = %job.job_id,
            channel = %job.channel,
            not_before = %not_before,
            "Notification accepted"
        );
        Ok(SubmitResponse::accepted(request_id))
    }

    fn validate(&self, request: &NotificationRequest) -> NotificationResult<()> {
        if request.recipient.trim().is_empty() {
            return Err(NotificationError::Validation("recipient is empty".into()));
        }
        if request.channels.is_empty() {
            return Err(NotificationError::Validation("channel list is empty".into()));
        }

        let mut seen = HashSet::new();
        for channel in &request.channels {
            if !seen.insert(channel) {
                return Err(NotificationError::Validation(format!(
                    "channel '{}' listed twice",
                    channel
                )));
            }
            if !self.registry.contains(channel) {
                return Err(NotificationError::UnknownChannel(channel.clone()));
            }
        }
        Ok(())
    }

    /// Cancel a pending request. False when it already reached a terminal
    /// state or does not exist.
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub async fn cancel(&self, request_id: Uuid) -> NotificationResult<bool> {
        let cancelled = self
            .requests
            .transition(request_id, RequestState::Pending, RequestState::Cancelled)
            .await?;

        if cancelled {
            metrics::request_finished(RequestState::Cancelled);
            info!("Notification cancelled");
        } else {
            debug!("Nothing to cancel");
        }
        Ok(cancelled)
    }

    /// All attempts for a request plus its current status.
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub async fn report(&self, request_id: Uuid) -> NotificationResult<DeliveryReport> {
        let request = self
            .requests
            .get_request(request_id)
            .await?
            .ok_or(NotificationError::NotFound(request_id))?;

        let attempts = self
            .reports
            .query(&DeliveryFilter::for_request(request_id))
            .await?;

        Ok(DeliveryReport {
            request_id,
            recipient: request.recipient,
            status: request.state,
            attempts,
        })
    }

    /// Attempt rows matching `filter`.
    #[instrument(skip(self))]
    pub async fn query(&self, filter: &DeliveryFilter) -> NotificationResult<Vec<DeliveryAttemptRecord>> {
        self.reports.query(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MockChannelAdapter;
    use crate::memory::InMemoryDeliveryStore;
    use crate::models::{ChannelDescriptor, ChannelId, Payload};
    use crate::repository::MockRequestStore;
    use job_queue::MemoryQueue;
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryDeliveryStore>,
        queue: Arc<MemoryQueue<NotificationJob>>,
        service: NotificationService,
    }

    fn registry() -> Arc<ChannelRegistry> {
        let mut builder = ChannelRegistry::builder();
        for (id, max) in [("email", 4), ("sms", 2)] {
            let mut mock = MockChannelAdapter::new();
            mock.expect_name().return_const("mock");
            builder = builder
                .register(ChannelDescriptor::new(id).with_max_attempts(max), Arc::new(mock))
                .unwrap();
        }
        Arc::new(builder.build())
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryDeliveryStore::new());
        let queue = Arc::new(MemoryQueue::<NotificationJob>::new("test", Duration::from_secs(30)));
        let service = NotificationService::new(registry(), store.clone(), store.clone(), queue.clone());
        Fixture { store, queue, service }
    }

    fn request(channels: &[&str]) -> NotificationRequest {
        NotificationRequest::new(
            "alice@example.com",
            channels.iter().map(|c| ChannelId::new(*c)).collect(),
            Payload::new("hello"),
        )
    }

    #[tokio::test]
    async fn test_submit_enqueues_first_job() {
        let f = fixture();
        let response = f.service.submit(request(&["email", "sms"])).await.unwrap();

        assert!(response.accepted);
        let request_id = response.request_id.unwrap();

        let jobs = f.queue.snapshot().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].request_id, request_id);
        assert_eq!(jobs[0].channel.as_str(), "email");
        assert_eq!(jobs[0].attempt, 1);
        assert_eq!(jobs[0].max_attempts, 4);

        let stored = f.store.get_request(request_id).await.unwrap().unwrap();
        assert_eq!(stored.state, RequestState::Pending);
        assert!(stored.last_enqueued_at.is_some());
    }

    #[tokio::test]
    async fn test_submit_scheduled_is_delayed() {
        let f = fixture();
        let at = Utc::now() + chrono::TimeDelta::hours(1);
        let response = f
            .service
            .submit(request(&["sms"]).with_scheduled_at(at))
            .await
            .unwrap();

        let jobs = f.queue.snapshot().await;
        assert_eq!(jobs[0].not_before, at);
        assert_eq!(f.queue.visible_at(&jobs[0].job_id).await, Some(at));
        assert!(f.queue.dequeue().await.unwrap().is_none());
        assert!(response.accepted);
    }

    #[tokio::test]
    async fn test_duplicate_key_returns_existing_request() {
        let f = fixture();
        let first = f
            .service
            .submit(request(&["email"]).with_idempotency_key("order-1"))
            .await
            .unwrap();
        let second = f
            .service
            .submit(request(&["email"]).with_idempotency_key("order-1"))
            .await
            .unwrap();

        assert!(second.accepted);
        assert_eq!(second.request_id, first.request_id);
        assert_eq!(second.reason.as_deref(), Some("duplicate idempotency key"));
        assert_eq!(f.queue.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_derived_key_dedupes_identical_requests() {
        let f = fixture();
        let first = f.service.submit(request(&["email"])).await.unwrap();
        let second = f.service.submit(request(&["email"])).await.unwrap();

        assert_eq!(first.request_id, second.request_id);
        assert_eq!(f.queue.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_invalid_requests() {
        let f = fixture();

        for (req, needle) in [
            (request(&[]), "empty"),
            (request(&["email", "email"]), "twice"),
            (request(&["email", "fax"]), "fax"),
            (
                NotificationRequest::new(" ", vec!["email".into()], Payload::new("x")),
                "recipient",
            ),
        ] {
            let response = f.service.submit(req).await.unwrap();
            assert!(!response.accepted);
            assert!(response.request_id.is_none());
            assert!(response.reason.unwrap().contains(needle));
        }
        assert!(f.queue.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let f = fixture();
        let id = f.service.submit(request(&["email"])).await.unwrap().request_id.unwrap();

        assert!(f.service.cancel(id).await.unwrap());
        assert!(!f.service.cancel(id).await.unwrap());
        assert!(!f.service.cancel(Uuid::now_v7()).await.unwrap());
        assert_eq!(f.service.report(id).await.unwrap().status, RequestState::Cancelled);
    }

    #[tokio::test]
    async fn test_report_unknown_request() {
        let f = fixture();
        let missing = Uuid::now_v7();
        let err = f.service.report(missing).await.unwrap_err();
        assert!(matches!(err, NotificationError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_store_failure_is_error() {
        let mut requests = MockRequestStore::new();
        requests
            .expect_insert_if_absent()
            .returning(|_| Err(NotificationError::Store("connection refused".into())));

        let service = NotificationService::new(
            registry(),
            Arc::new(requests),
            Arc::new(InMemoryDeliveryStore::new()),
            Arc::new(MemoryQueue::<NotificationJob>::new("test", Duration::from_secs(30))),
        );

        let err = service.submit(request(&["email"])).await.unwrap_err();
        assert!(err.is_infrastructure());
    }
}
