//! Error types for the notifications domain.
//!
//! Per-notification delivery failures are not errors; they are recorded as
//! attempt outcomes. These variants cover invalid input and infrastructure.

use job_queue::QueueError;
use thiserror::Error;
use uuid::Uuid;

use crate::models::ChannelId;

/// Result type for notification operations.
pub type NotificationResult<T> = Result<T, NotificationError>;

/// Errors that can occur in the notifications domain.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Request failed validation at intake.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Channel id has no registry entry.
    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),

    /// Request not found.
    #[error("Request not found: {0}")]
    NotFound(Uuid),

    /// Dispatch queue error.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Delivery store error.
    #[error("Store error: {0}")]
    Store(String),

    /// Channel provider could not be built.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NotificationError {
    /// True for failures of the queue or the store, which callers may retry.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, NotificationError::Queue(_) | NotificationError::Store(_))
    }
}

impl From<redis::RedisError> for NotificationError {
    fn from(err: redis::RedisError) -> Self {
        NotificationError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl From<QueueError> for NotificationError {
    fn from(err: QueueError) -> Self {
        NotificationError::Queue(err.to_string())
    }
}
