//! Worker configuration
//!
//! This module provides `WorkerConfig` for configuring the worker pool.

use uuid::Uuid;

/// Configuration for the queue worker pool
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique pool ID (auto-generated if not provided)
    pub worker_id: String,

    /// Number of parallel pull loops
    pub concurrency: usize,

    /// Sleep in milliseconds when no job is due
    pub poll_interval_ms: u64,

    /// Requeue delay in milliseconds after an infrastructure failure
    pub failure_requeue_ms: u64,

    /// Exit once no job is due and none is leased (batch mode); delayed jobs stay queued
    pub drain: bool,
}

impl WorkerConfig {
    /// Create a new WorkerConfig with defaults
    pub fn new() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: 4,
            poll_interval_ms: 500,
            failure_requeue_ms: 5_000,
            drain: false,
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the number of parallel workers
    pub fn with_concurrency(mut self, count: usize) -> Self {
        self.concurrency = count.max(1);
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }

    /// Set the requeue delay used after processing errors
    pub fn with_failure_requeue_ms(mut self, delay: u64) -> Self {
        self.failure_requeue_ms = delay;
        self
    }

    /// Enable or disable drain mode
    pub fn with_drain(mut self, drain: bool) -> Self {
        self.drain = drain;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}
