//! Worker pool and processor trait.
//!
//! This module provides:
//! - `JobProcessor` trait for job handlers
//! - `Settle` for telling the pool what to do with a processed job
//! - `QueueWorker` for running N supervised pull loops over a `DispatchQueue`
//!
//! ```text
//!             ┌───────────── supervisor (JoinSet) ─────────────┐
//!             │  respawns a loop whose task panicked           │
//!             └───────┬──────────────┬──────────────┬──────────┘
//!                     ▼              ▼              ▼
//!                 worker-0       worker-1   ...  worker-N
//!            dequeue → process → ack | nack(delay)
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{QueueError, QueueResult};
use crate::metrics::QueueMetrics;
use crate::queue::{Delivery, DispatchQueue, QueueJob};

const MAX_BACKOFF_SECS: u64 = 30;

/// What the pool should do with a job after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    /// Remove the job from the queue.
    Ack,
    /// Put the job back, invisible for the given delay.
    Requeue(Duration),
}

/// Trait for job processors.
///
/// Return `Ok(Settle)` for every outcome the processor handled itself,
/// including business failures. `Err` means infrastructure trouble: the job
/// is nacked with the pool's failure delay and will be seen again.
#[async_trait]
pub trait JobProcessor<J: QueueJob>: Send + Sync {
    /// Process a single job.
    async fn process(&self, job: &J) -> Result<Settle, QueueError>;

    /// Get the processor name for logging.
    fn name(&self) -> &'static str;
}

/// Fixed-size pool of pull loops over one queue.
pub struct QueueWorker<J: QueueJob, P: JobProcessor<J>> {
    queue: Arc<dyn DispatchQueue<J>>,
    processor: Arc<P>,
    config: WorkerConfig,
}

/// Everything a single pull loop needs, cheap to clone into a task.
struct LoopContext<J: QueueJob, P: JobProcessor<J>> {
    queue: Arc<dyn DispatchQueue<J>>,
    processor: Arc<P>,
    config: WorkerConfig,
    metrics: QueueMetrics,
}

impl<J: QueueJob, P: JobProcessor<J>> Clone for LoopContext<J, P> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            processor: Arc::clone(&self.processor),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<J, P> QueueWorker<J, P>
where
    J: QueueJob,
    P: JobProcessor<J> + 'static,
{
    /// Create a new worker pool.
    pub fn new(queue: Arc<dyn DispatchQueue<J>>, processor: Arc<P>, config: WorkerConfig) -> Self {
        Self {
            queue,
            processor,
            config,
        }
    }

    /// Run the pool until shutdown is signalled (or, in drain mode, until the
    /// queue is empty). In-flight jobs always finish before this returns.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> QueueResult<()> {
        let ctx = LoopContext {
            queue: Arc::clone(&self.queue),
            processor: Arc::clone(&self.processor),
            config: self.config.clone(),
            metrics: QueueMetrics::new(self.queue.name(), self.processor.name()),
        };

        info!(
            worker_id = %self.config.worker_id,
            queue = %self.queue.name(),
            processor = %self.processor.name(),
            concurrency = %self.config.concurrency,
            drain = %self.config.drain,
            "Starting queue worker pool"
        );

        let mut loops: JoinSet<()> = JoinSet::new();
        let mut slots: HashMap<tokio::task::Id, usize> = HashMap::new();
        for slot in 0..self.config.concurrency {
            let handle = loops.spawn(pull_loop(ctx.clone(), slot, shutdown.clone()));
            slots.insert(handle.id(), slot);
        }

        while let Some(joined) = loops.join_next_with_id().await {
            match joined {
                Ok((id, ())) => {
                    slots.remove(&id);
                }
                Err(e) => {
                    let slot = slots.remove(&e.id()).unwrap_or_default();
                    if e.is_cancelled() {
                        continue;
                    }
                    error!(slot = %slot, error = %e, "Worker loop panicked");
                    ctx.metrics.worker_restarted();

                    let stopping = *shutdown.borrow();
                    if !stopping {
                        let handle = loops.spawn(pull_loop(ctx.clone(), slot, shutdown.clone()));
                        slots.insert(handle.id(), slot);
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "Queue worker pool stopped");
        Ok(())
    }
}

/// One worker: `dequeue → process → ack/nack` until told to stop.
async fn pull_loop<J, P>(ctx: LoopContext<J, P>, slot: usize, mut shutdown: watch::Receiver<bool>)
where
    J: QueueJob,
    P: JobProcessor<J> + 'static,
{
    let poll_interval = Duration::from_millis(ctx.config.poll_interval_ms);
    let mut consecutive_errors: u32 = 0;

    debug!(slot = %slot, "Worker loop started");

    loop {
        if *shutdown.borrow() {
            info!(slot = %slot, "Received shutdown signal, stopping worker");
            break;
        }

        let idle = match ctx.queue.dequeue().await {
            Ok(Some(delivery)) => {
                if consecutive_errors > 0 {
                    info!("Queue recovered after {} errors", consecutive_errors);
                    consecutive_errors = 0;
                }
                handle_delivery(&ctx, delivery).await;
                continue;
            }
            Ok(None) => poll_interval,
            Err(e) => {
                consecutive_errors += 1;
                ctx.metrics.worker_error("dequeue");

                if e.is_connection_error() {
                    let backoff_secs =
                        std::cmp::min(2u64.pow(consecutive_errors.min(5)), MAX_BACKOFF_SECS);
                    warn!(
                        error = %e,
                        consecutive_errors = %consecutive_errors,
                        backoff_secs = %backoff_secs,
                        "Queue connection error, backing off"
                    );
                    Duration::from_secs(backoff_secs)
                } else {
                    error!(error = %e, "Error dequeuing job");
                    Duration::from_secs(1)
                }
            }
        };

        if ctx.config.drain && consecutive_errors == 0 {
            match ctx.queue.depth().await {
                Ok(depth) if depth.is_idle() => {
                    ctx.metrics.depth(depth);
                    info!(slot = %slot, delayed = %depth.total, "Queue drained, stopping worker");
                    break;
                }
                Ok(depth) => ctx.metrics.depth(depth),
                Err(e) => debug!(error = %e, "Failed to read queue depth"),
            }
        }

        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(idle) => {}
        }
    }
}

async fn handle_delivery<J, P>(ctx: &LoopContext<J, P>, delivery: Delivery<J>)
where
    J: QueueJob,
    P: JobProcessor<J> + 'static,
{
    let Delivery { job, handle } = delivery;
    ctx.metrics.job_received();
    debug!(job_id = %handle.job_id, lease = %handle.lease, "Processing job");

    let start = Instant::now();
    let settled = match ctx.processor.process(&job).await {
        Ok(Settle::Ack) => {
            ctx.metrics.job_acked(start.elapsed());
            ctx.queue.ack(&handle).await
        }
        Ok(Settle::Requeue(delay)) => {
            ctx.metrics.job_requeued();
            debug!(job_id = %handle.job_id, delay_ms = %delay.as_millis(), "Requeueing job");
            ctx.queue.nack(&handle, delay).await
        }
        Err(e) => {
            ctx.metrics.job_failed();
            error!(
                job_id = %handle.job_id,
                processor = %ctx.processor.name(),
                error = %e,
                "Job processing failed, returning to queue"
            );
            ctx.queue
                .nack(&handle, Duration::from_millis(ctx.config.failure_requeue_ms))
                .await
        }
    };

    match settled {
        Ok(()) => {}
        Err(e) if e.is_lease_lost() => {
            warn!(job_id = %handle.job_id, "Lease expired before settle, job will be redelivered");
        }
        Err(e) => {
            ctx.metrics.worker_error("settle");
            error!(job_id = %handle.job_id, error = %e, "Failed to settle job");
        }
    }
}
