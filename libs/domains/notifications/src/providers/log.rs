use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use crate::channels::ChannelAdapter;
use crate::models::{Outcome, Payload};

/// Writes the notification to the log and always succeeds.
///
/// Stands in for in-app delivery and for channels without a transport in
/// local runs.
#[derive(Debug, Clone, Default)]
pub struct LogAdapter {
    label: String,
}

impl LogAdapter {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

#[async_trait]
impl ChannelAdapter for LogAdapter {
    async fn send(&self, target: &str, payload: &Payload, _timeout: Duration) -> Outcome {
        info!(
            channel = %self.label,
            recipient = %target,
            subject = ?payload.subject,
            body_len = %payload.body.len(),
            "Notification delivered to log"
        );
        Outcome::Success
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_adapter_succeeds() {
        let adapter = LogAdapter::new("in_app");
        let outcome = adapter
            .send("user-42", &Payload::new("hi"), Duration::from_secs(1))
            .await;
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(adapter.name(), "log");
    }
}
