//! Retry Sweeper: periodic crash-recovery backstop.
//!
//! Normal retries and failovers are enqueued by the [`Dispatcher`] right after
//! an attempt. If the process dies between appending the attempt row and
//! enqueueing the follow-up, the request's `last_enqueued_at` watermark stays
//! older than its latest attempt. The sweeper finds those requests and
//! re-creates the missing job. Job ids are deterministic, so a follow-up that
//! does exist is replaced, never doubled.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatcher::{plan_follow_up, Dispatcher, FollowUp};
use crate::error::NotificationResult;
use crate::metrics;
use crate::models::{DeliveryFilter, NotificationJob, RequestRecord, RequestState};

const SWEEP_LEASE_TTL: Duration = Duration::from_secs(30);
const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between passes.
    pub interval: Duration,
    /// Only attempts older than this are considered lost.
    pub stale_after: Duration,
    /// Global attempt ceiling per request.
    pub max_total_attempts: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(300),
            max_total_attempts: 20,
        }
    }
}

impl SweeperConfig {
    /// Time between passes, at least 100ms.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_max_total_attempts(mut self, max: usize) -> Self {
        self.max_total_attempts = max.max(1);
        self
    }
}

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Lost retry or failover jobs re-created.
    pub requeued: usize,
    /// Lost first jobs re-created.
    pub repaired_intake: usize,
    /// Requests marked delivered from their attempt history.
    pub delivered: usize,
    /// Requests marked exhausted.
    pub exhausted: usize,
    /// Requests skipped because of a store or queue error.
    pub failed: usize,
}

impl SweepReport {
    pub fn repairs(&self) -> usize {
        self.requeued + self.repaired_intake + self.delivered + self.exhausted
    }
}

enum Repair {
    Requeued,
    Intake,
    Delivered,
    Exhausted,
}

pub struct RetrySweeper {
    dispatcher: Arc<Dispatcher>,
    config: SweeperConfig,
}

impl RetrySweeper {
    pub fn new(dispatcher: Arc<Dispatcher>, config: SweeperConfig) -> Self {
        Self { dispatcher, config }
    }

    /// Sweep on `config.interval` until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = %self.config.interval.as_secs(),
            stale_after_secs = %self.config.stale_after.as_secs(),
            "Retry sweeper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report.repairs() > 0 || report.failed > 0 => {
                            info!(?report, "Sweep finished");
                        }
                        Ok(_) => debug!("Sweep found nothing to repair"),
                        Err(e) => error!(error = %e, "Sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Retry sweeper stopped");
    }

    /// One pass over every pending request.
    pub async fn sweep_once(&self) -> NotificationResult<SweepReport> {
        let now = Utc::now();
        let stale_before = TimeDelta::from_std(self.config.stale_after)
            .ok()
            .and_then(|delta| now.checked_sub_signed(delta))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut report = SweepReport::default();
        for request in self.dispatcher.requests.pending_requests().await? {
            match self.sweep_leased(&request, now, stale_before).await {
                Ok(Some(Repair::Requeued)) => report.requeued += 1,
                Ok(Some(Repair::Intake)) => report.repaired_intake += 1,
                Ok(Some(Repair::Delivered)) => report.delivered += 1,
                Ok(Some(Repair::Exhausted)) => report.exhausted += 1,
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(request_id = %request.id, error = %e, "Failed to sweep request");
                }
            }
        }
        Ok(report)
    }

    async fn sweep_leased(
        &self,
        request: &RequestRecord,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> NotificationResult<Option<Repair>> {
        let requests = &self.dispatcher.requests;
        let owner = format!("sweeper-{}", Uuid::new_v4());
        if !requests.try_acquire_lease(request.id, &owner, SWEEP_LEASE_TTL).await? {
            debug!(request_id = %request.id, "Request busy, skipping");
            return Ok(None);
        }

        let result = self.sweep_request(request, now, stale_before).await;

        if let Err(e) = requests.release_lease(request.id, &owner).await {
            warn!(request_id = %request.id, error = %e, "Failed to release request lease");
        }
        result
    }

    async fn sweep_request(
        &self,
        request: &RequestRecord,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> NotificationResult<Option<Repair>> {
        let dispatcher = &self.dispatcher;
        // Re-read under the lease; the pending list may be stale.
        let Some(request) = dispatcher.requests.get_request(request.id).await? else {
            return Ok(None);
        };
        if request.state != RequestState::Pending {
            return Ok(None);
        }

        let attempts = dispatcher
            .reports
            .query(&DeliveryFilter::for_request(request.id))
            .await?;

        let Some(last) = attempts.iter().max_by_key(|a| a.finished_at) else {
            return self.repair_intake(&request, now, stale_before).await;
        };

        if attempts.iter().any(|a| a.is_success()) {
            if dispatcher
                .requests
                .transition(request.id, RequestState::Pending, RequestState::Delivered)
                .await?
            {
                metrics::request_finished(RequestState::Delivered);
                metrics::sweeper_repaired("delivered");
                info!(request_id = %request.id, "Marked delivered from attempt history");
                return Ok(Some(Repair::Delivered));
            }
            return Ok(None);
        }

        if last.finished_at > stale_before {
            return Ok(None);
        }
        if request
            .last_enqueued_at
            .is_some_and(|watermark| watermark >= last.finished_at)
        {
            return Ok(None);
        }

        if attempts.len() >= self.config.max_total_attempts {
            warn!(
                request_id = %request.id,
                attempts = %attempts.len(),
                "Attempt ceiling reached, marking exhausted"
            );
            dispatcher
                .apply_follow_up(&request, FollowUp::Exhausted)
                .await?;
            metrics::sweeper_repaired("exhausted");
            return Ok(Some(Repair::Exhausted));
        }

        let max_attempts = dispatcher
            .registry
            .descriptor(&last.channel)
            .map_or(1, |d| d.max_attempts);
        let follow_up = plan_follow_up(
            &dispatcher.registry,
            &request,
            &last.channel,
            last.attempt,
            max_attempts,
            last.outcome,
            now,
        );

        let repair = match &follow_up {
            FollowUp::Retry(job) | FollowUp::Failover(job) => {
                info!(
                    request_id = %request.id,
                    job_id = %job.job_id,
                    channel = %job.channel,
                    attempt = %job.attempt,
                    "Re-enqueueing lost follow-up job"
                );
                metrics::sweeper_repaired("requeued");
                Repair::Requeued
            }
            FollowUp::Exhausted => {
                metrics::sweeper_repaired("exhausted");
                Repair::Exhausted
            }
            FollowUp::Delivered => Repair::Delivered,
        };
        dispatcher.apply_follow_up(&request, follow_up).await?;
        Ok(Some(repair))
    }

    /// A pending request with no attempts and no watermark lost its first
    /// enqueue.
    async fn repair_intake(
        &self,
        request: &RequestRecord,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> NotificationResult<Option<Repair>> {
        if request.last_enqueued_at.is_some() || request.created_at > stale_before {
            return Ok(None);
        }
        let Some(first) = request.channels.first() else {
            return Ok(None);
        };

        let max_attempts = self
            .dispatcher
            .registry
            .descriptor(first)
            .map_or(1, |d| d.max_attempts);
        let job = NotificationJob::new(
            request,
            first.clone(),
            1,
            max_attempts,
            request.scheduled_at.unwrap_or(now),
        );

        info!(request_id = %request.id, job_id = %job.job_id, "Re-enqueueing lost first job");
        self.dispatcher
            .apply_follow_up(request, FollowUp::Failover(job))
            .await?;
        metrics::sweeper_repaired("intake");
        Ok(Some(Repair::Intake))
    }
}
