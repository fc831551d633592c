//! Queue error types.
//!
//! Only infrastructure problems travel as `QueueError`. A processor that
//! wants a job retried later returns `Settle::Requeue`, not an error.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue and worker errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The delivery was re-leased (or removed) before it was settled
    #[error("Lease lost for job {job_id}")]
    LeaseLost { job_id: String },

    /// Job processing hit an infrastructure failure
    #[error("Processing error: {0}")]
    Processing(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl QueueError {
    /// Create a processing error
    pub fn processing(message: impl Into<String>) -> Self {
        QueueError::Processing(message.into())
    }

    /// Create a lease-lost error for a job
    pub fn lease_lost(job_id: impl Into<String>) -> Self {
        QueueError::LeaseLost {
            job_id: job_id.into(),
        }
    }

    /// True when the backing store could not be reached at all.
    ///
    /// The worker loop backs off exponentially on these instead of spinning.
    pub fn is_connection_error(&self) -> bool {
        match self {
            QueueError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_refusal()
                    || e.is_connection_dropped()
                    || e.is_timeout()
            }
            _ => false,
        }
    }

    /// True when a settle call raced with a redelivery.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, QueueError::LeaseLost { .. })
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}
