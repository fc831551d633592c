//! Prometheus metrics for queue workers
//!
//! Provides observability into worker throughput and queue size.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

use crate::error::{QueueError, QueueResult};
use crate::queue::QueueDepth;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> QueueResult<()> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| QueueError::Config(format!("failed to install Prometheus recorder: {}", e)))?;
        info!("Prometheus metrics initialized");
        Ok::<_, QueueError>(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Queue worker metrics helper
#[derive(Clone)]
pub struct QueueMetrics {
    /// Queue name for labeling
    queue_name: String,
    /// Processor name for labeling
    processor_name: String,
}

impl QueueMetrics {
    /// Create new QueueMetrics
    pub fn new(queue_name: impl Into<String>, processor_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            processor_name: processor_name.into(),
        }
    }

    /// Record a job being leased by a worker
    pub fn job_received(&self) {
        counter!(
            "dispatch_queue_jobs_received_total",
            "queue" => self.queue_name.clone(),
            "processor" => self.processor_name.clone()
        )
        .increment(1);
    }

    /// Record a job that was processed and acked
    pub fn job_acked(&self, duration: Duration) {
        self.job_settled("acked");

        histogram!(
            "dispatch_queue_job_duration_seconds",
            "queue" => self.queue_name.clone(),
            "processor" => self.processor_name.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job the processor asked to see again later
    pub fn job_requeued(&self) {
        self.job_settled("requeued");
    }

    /// Record a job whose processing failed on infrastructure
    pub fn job_failed(&self) {
        self.job_settled("failed");
    }

    fn job_settled(&self, status: &'static str) {
        counter!(
            "dispatch_queue_jobs_total",
            "queue" => self.queue_name.clone(),
            "processor" => self.processor_name.clone(),
            "status" => status
        )
        .increment(1);
    }

    /// Record a worker loop error (dequeue or settle)
    pub fn worker_error(&self, kind: &'static str) {
        counter!(
            "dispatch_queue_worker_errors_total",
            "queue" => self.queue_name.clone(),
            "kind" => kind
        )
        .increment(1);
    }

    /// Record a panicked worker being replaced
    pub fn worker_restarted(&self) {
        counter!(
            "dispatch_queue_worker_restarts_total",
            "queue" => self.queue_name.clone()
        )
        .increment(1);
    }

    /// Update queue depth gauges
    pub fn depth(&self, depth: QueueDepth) {
        gauge!("dispatch_queue_depth", "queue" => self.queue_name.clone()).set(depth.total as f64);
        gauge!("dispatch_queue_due", "queue" => self.queue_name.clone()).set(depth.due as f64);
        gauge!("dispatch_queue_leased", "queue" => self.queue_name.clone()).set(depth.leased as f64);
    }
}
