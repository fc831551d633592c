//! Job Queue Framework
//!
//! A durable delayed work queue with leased, at-least-once delivery and a
//! supervised worker pool on top of it.
//!
//! ## Features
//!
//! - **Delayed jobs**: a job stays invisible until its `not_before` time
//! - **Leases**: dequeued jobs are hidden for a visibility timeout and come
//!   back on their own if the worker dies
//! - **Backends**: `MemoryQueue` (in-process) and `RedisQueue` (durable)
//! - **Worker pool**: `QueueWorker<J, P>` runs N pull loops, restarts a
//!   panicked loop and finishes in-flight jobs on shutdown
//! - **Prometheus metrics** and **health endpoints**
//!
//! ## Example
//!
//! ```ignore
//! use job_queue::{JobProcessor, QueueJob, QueueWorker, RedisQueue, Settle, WorkerConfig};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct MyJob { id: String }
//!
//! impl QueueJob for MyJob {
//!     fn job_id(&self) -> String { self.id.clone() }
//! }
//!
//! let queue = Arc::new(RedisQueue::<MyJob>::new(redis, "my:jobs", Duration::from_secs(60)));
//! let worker = QueueWorker::new(queue, Arc::new(processor), WorkerConfig::new());
//! worker.run(shutdown_rx).await?;
//! ```

mod config;
mod error;
mod health;
mod memory;
pub mod metrics;
mod queue;
mod redis_queue;
mod worker;

// Re-export main types
pub use config::WorkerConfig;
pub use error::{QueueError, QueueResult};
pub use health::{health_router, HealthState};
pub use memory::MemoryQueue;
pub use metrics::{init_metrics, QueueMetrics};
pub use queue::{deadline, AckHandle, Delivery, DispatchQueue, QueueDepth, QueueJob, QueueProbe};
pub use redis_queue::RedisQueue;
pub use worker::{JobProcessor, QueueWorker, Settle};
