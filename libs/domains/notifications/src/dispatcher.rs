//! The Dispatcher: one channel attempt per job.
//!
//! ```text
//! job ─► lease(request) ─► terminal? / delivered? / already run? ─► ack
//!                │
//!                ▼
//!         resolve channel ──unknown──► PERMANENT record, EXHAUSTED
//!                │
//!                ▼
//!          cancelled? ─► ack
//!                │
//!                ▼
//!        send (timeout) ─► append record ─► follow-up
//!                                         ├─ Delivered
//!                                         ├─ Retry(attempt+1, same channel, +backoff)
//!                                         ├─ Failover(attempt 1, next channel)
//!                                         └─ Exhausted
//! ```
//!
//! The per-request lease keeps two workers from running the same request at
//! once. Together with the redelivery check it guarantees a job that was
//! already executed never reaches `send` again. The lease lives at least as
//! long as the queue's visibility timeout (`min_lease`), so a job redelivered
//! after a stalled worker's lease expired still finds the request locked.

use chrono::{DateTime, Utc};
use job_queue::{deadline, DispatchQueue, Settle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::ChannelRegistry;
use crate::error::NotificationResult;
use crate::metrics;
use crate::models::{
    AttemptOutcome, ChannelId, DeliveryAttemptRecord, DeliveryFilter, NotificationJob, Outcome,
    RequestRecord, RequestState,
};
use crate::repository::{DeliveryReportStore, RequestStore};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Added to the channel timeout to size the request lease.
    pub lease_margin: Duration,
    /// Requeue delay when another worker holds the request lease.
    pub lease_busy_delay: Duration,
    /// Lower bound for the request lease; set to the queue visibility timeout.
    pub min_lease: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lease_margin: Duration::from_secs(5),
            lease_busy_delay: Duration::from_secs(1),
            min_lease: Duration::from_secs(60),
        }
    }
}

impl DispatcherConfig {
    pub fn with_lease_margin(mut self, margin: Duration) -> Self {
        self.lease_margin = margin;
        self
    }

    pub fn with_lease_busy_delay(mut self, delay: Duration) -> Self {
        self.lease_busy_delay = delay;
        self
    }

    pub fn with_min_lease(mut self, min_lease: Duration) -> Self {
        self.min_lease = min_lease;
        self
    }

    /// Lease TTL for a send bounded by `send_timeout`.
    pub fn lease_ttl(&self, send_timeout: Duration) -> Duration {
        (send_timeout + self.lease_margin).max(self.min_lease)
    }
}

/// What happens to a request after a failed or successful attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUp {
    Delivered,
    /// Same channel, next attempt.
    Retry(NotificationJob),
    /// Next channel in the request's list, attempt 1.
    Failover(NotificationJob),
    /// No channel left.
    Exhausted,
}

/// Decide the next step for `request` after `attempt` on `channel` ended
/// with `outcome`.
///
/// Retries need a retryable channel, a transient failure and attempts left.
/// Anything else that is not a success fails over, or exhausts the request
/// when `channel` is the last one.
pub fn plan_follow_up(
    registry: &ChannelRegistry,
    request: &RequestRecord,
    channel: &ChannelId,
    attempt: u32,
    max_attempts: u32,
    outcome: AttemptOutcome,
    now: DateTime<Utc>,
) -> FollowUp {
    if outcome == AttemptOutcome::Success {
        return FollowUp::Delivered;
    }

    if let Some(descriptor) = registry.descriptor(channel) {
        if outcome == AttemptOutcome::TransientFailure && descriptor.retryable && attempt < max_attempts {
            let delay = descriptor.backoff.delay_for(attempt);
            return FollowUp::Retry(NotificationJob::new(
                request,
                channel.clone(),
                attempt + 1,
                max_attempts,
                deadline(now, delay),
            ));
        }
    }

    match request.next_channel(channel) {
        Some(next) => {
            let max_attempts = registry.descriptor(next).map_or(1, |d| d.max_attempts);
            FollowUp::Failover(NotificationJob::new(request, next.clone(), 1, max_attempts, now))
        }
        None => FollowUp::Exhausted,
    }
}

/// Consumes notification jobs and drives each request through its channels.
pub struct Dispatcher {
    pub(crate) registry: Arc<ChannelRegistry>,
    pub(crate) requests: Arc<dyn RequestStore>,
    pub(crate) reports: Arc<dyn DeliveryReportStore>,
    pub(crate) queue: Arc<dyn DispatchQueue<NotificationJob>>,
    config: DispatcherConfig,
}

impl Dispatcher {
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
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Process one dequeued job.
    ///
    /// Every per-notification outcome resolves to `Ok`. `Err` means the store
    /// or queue failed and the job should be seen again.
    pub async fn process_job(&self, job: &NotificationJob) -> NotificationResult<Settle> {
        let owner = Uuid::new_v4().to_string();
        let ttl = self.config.lease_ttl(
            self.registry
                .descriptor(&job.channel)
                .map_or(Duration::ZERO, |d| d.timeout),
        );

        if !self.requests.try_acquire_lease(job.request_id, &owner, ttl).await? {
            debug!(
                job_id = %job.job_id,
                request_id = %job.request_id,
                "Request is being processed elsewhere, requeueing"
            );
            return Ok(Settle::Requeue(self.config.lease_busy_delay));
        }

        let result = self.process_leased(job).await;

        if let Err(e) = self.requests.release_lease(job.request_id, &owner).await {
            // The lease expires on its own.
            warn!(request_id = %job.request_id, error = %e, "Failed to release request lease");
        }

        result
    }

    async fn process_leased(&self, job: &NotificationJob) -> NotificationResult<Settle> {
        let Some(request) = self.requests.get_request(job.request_id).await? else {
            warn!(job_id = %job.job_id, request_id = %job.request_id, "Job for unknown request, dropping");
            return Ok(Settle::Ack);
        };

        if request.state.is_terminal() {
            debug!(job_id = %job.job_id, state = %request.state, "Request already terminal, dropping job");
            return Ok(Settle::Ack);
        }

        let attempts = self
            .reports
            .query(&DeliveryFilter::for_request(request.id))
            .await?;

        if attempts.iter().any(DeliveryAttemptRecord::is_success) {
            info!(job_id = %job.job_id, request_id = %request.id, "Request already delivered, dropping job");
            self.finish(&request, RequestState::Delivered).await?;
            return Ok(Settle::Ack);
        }

        if let Some(previous) = attempts
            .iter()
            .find(|a| a.channel == job.channel && a.attempt == job.attempt)
        {
            info!(
                job_id = %job.job_id,
                request_id = %request.id,
                outcome = %previous.outcome,
                "Job already executed, resuming from recorded attempt"
            );
            let enqueued = request
                .last_enqueued_at
                .is_some_and(|watermark| watermark >= previous.finished_at);
            if !enqueued {
                let follow_up = plan_follow_up(
                    &self.registry,
                    &request,
                    &job.channel,
                    job.attempt,
                    job.max_attempts,
                    previous.outcome,
                    Utc::now(),
                );
                self.apply_follow_up(&request, follow_up).await?;
            }
            return Ok(Settle::Ack);
        }

        let channel = match self.registry.resolve(&job.channel) {
            Ok(channel) => channel,
            Err(e) => {
                error!(job_id = %job.job_id, channel = %job.channel, error = %e, "Misconfigured channel");
                let now = Utc::now();
                self.record(
                    &request,
                    job,
                    now,
                    now,
                    Duration::ZERO,
                    &Outcome::PermanentFailure(e.to_string()),
                )
                .await?;
                self.finish(&request, RequestState::Exhausted).await?;
                return Ok(Settle::Ack);
            }
        };

        // Cancellation may land between intake and now.
        let cancelled = self
            .requests
            .get_request(request.id)
            .await?
            .is_none_or(|current| current.state != RequestState::Pending);
        if cancelled {
            info!(job_id = %job.job_id, request_id = %request.id, "Request cancelled before send");
            return Ok(Settle::Ack);
        }

        let timeout = channel.descriptor.timeout;
        debug!(
            job_id = %job.job_id,
            channel = %job.channel,
            adapter = %channel.adapter.name(),
            attempt = %job.attempt,
            "Sending notification"
        );

        let started_at = Utc::now();
        let clock = Instant::now();
        let outcome = match tokio::time::timeout(
            timeout,
            channel.adapter.send(&request.recipient, &job.payload, timeout),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Outcome::TransientFailure(format!("send timed out after {}ms", timeout.as_millis())),
        };
        let latency = clock.elapsed();
        let finished_at = Utc::now();

        self.record(&request, job, started_at, finished_at, latency, &outcome)
            .await?;

        match &outcome {
            Outcome::Success => info!(
                request_id = %request.id,
                channel = %job.channel,
                attempt = %job.attempt,
                latency_ms = %latency.as_millis(),
                "Notification delivered"
            ),
            Outcome::TransientFailure(detail) | Outcome::PermanentFailure(detail) => warn!(
                request_id = %request.id,
                channel = %job.channel,
                attempt = %job.attempt,
                outcome = %outcome.kind(),
                detail = %detail,
                "Delivery attempt failed"
            ),
        }

        let follow_up = plan_follow_up(
            &self.registry,
            &request,
            &job.channel,
            job.attempt,
            job.max_attempts,
            outcome.kind(),
            finished_at,
        );
        self.apply_follow_up(&request, follow_up).await?;

        Ok(Settle::Ack)
    }

    /// Append the attempt row for one adapter invocation.
    async fn record(
        &self,
        request: &RequestRecord,
        job: &NotificationJob,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        latency: Duration,
        outcome: &Outcome,
    ) -> NotificationResult<()> {
        let record = DeliveryAttemptRecord {
            request_id: request.id,
            recipient: request.recipient.clone(),
            channel: job.channel.clone(),
            attempt: job.attempt,
            started_at,
            finished_at,
            outcome: outcome.kind(),
            error_detail: outcome.detail().map(str::to_string),
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
        };
        self.reports.append(&record).await?;
        metrics::attempt_recorded(&job.channel, record.outcome, latency);
        Ok(())
    }

    /// Enqueue the follow-up job and move the watermark, or settle the
    /// request's final state.
    pub(crate) async fn apply_follow_up(
        &self,
        request: &RequestRecord,
        follow_up: FollowUp,
    ) -> NotificationResult<()> {
        match follow_up {
            FollowUp::Delivered => self.finish(request, RequestState::Delivered).await,
            FollowUp::Exhausted => {
                warn!(request_id = %request.id, recipient = %request.recipient, "All channels exhausted");
                self.finish(request, RequestState::Exhausted).await
            }
            FollowUp::Retry(job) | FollowUp::Failover(job) => {
                self.queue.enqueue(&job, job.not_before).await?;
                self.requests.touch_enqueued(request.id, Utc::now()).await?;
                debug!(
                    job_id = %job.job_id,
                    channel = %job.channel,
                    attempt = %job.attempt,
                    not_before = %job.not_before,
                    "Follow-up job enqueued"
                );
                Ok(())
            }
        }
    }

    async fn finish(&self, request: &RequestRecord, state: RequestState) -> NotificationResult<()> {
        if self
            .requests
            .transition(request.id, RequestState::Pending, state)
            .await?
        {
            metrics::request_finished(state);
            info!(request_id = %request.id, state = %state, "Request finished");
        } else {
            debug!(request_id = %request.id, state = %state, "Request already left PENDING");
        }
        Ok(())
    }
}
