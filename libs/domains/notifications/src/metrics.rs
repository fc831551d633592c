//! Delivery metrics.
//!
//! Recorded through the `metrics` facade; the binary installs the Prometheus
//! recorder via `job_queue::init_metrics`.

use metrics::{counter, histogram};
use std::time::Duration;

use crate::models::{AttemptOutcome, ChannelId, RequestState};

/// Record one adapter invocation.
pub fn attempt_recorded(channel: &ChannelId, outcome: AttemptOutcome, latency: Duration) {
    counter!(
        "notification_attempts_total",
        "channel" => channel.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        "notification_attempt_duration_seconds",
        "channel" => channel.to_string()
    )
    .record(latency.as_secs_f64());
}

/// Record a request reaching a terminal state.
pub fn request_finished(state: RequestState) {
    counter!("notification_requests_total", "status" => state.to_string()).increment(1);
}

/// Record a repair made by the retry sweeper.
pub fn sweeper_repaired(kind: &'static str) {
    counter!("notification_sweeper_repairs_total", "kind" => kind).increment(1);
}
