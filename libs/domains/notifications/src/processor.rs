//! Notification processor for queue workers.
//!
//! Plugs the [`Dispatcher`] into `job_queue::QueueWorker`.

use async_trait::async_trait;
use job_queue::{JobProcessor, QueueError, Settle};
use tracing::{error, info};

use crate::dispatcher::Dispatcher;
use crate::error::NotificationError;
use crate::models::NotificationJob;

#[async_trait]
impl JobProcessor<NotificationJob> for Dispatcher {
    async fn process(&self, job: &NotificationJob) -> Result<Settle, QueueError> {
        info!(
            job_id = %job.job_id,
            request_id = %job.request_id,
            channel = %job.channel,
            attempt = %job.attempt,
            max_attempts = %job.max_attempts,
            "Processing notification job"
        );

        self.process_job(job).await.map_err(|e| {
            error!(job_id = %job.job_id, error = %e, "Notification job failed on infrastructure");
            QueueError::from(e)
        })
    }

    fn name(&self) -> &'static str {
        "NotificationDispatcher"
    }
}

impl From<NotificationError> for QueueError {
    fn from(err: NotificationError) -> Self {
        QueueError::Processing(err.to_string())
    }
}
