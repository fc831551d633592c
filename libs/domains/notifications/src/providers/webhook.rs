//! Webhook adapter: POSTs the payload as JSON.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::channels::ChannelAdapter;
use crate::error::{NotificationError, NotificationResult};
use crate::models::{Outcome, Payload};

#[derive(Serialize)]
struct WebhookBody<'a> {
    recipient: &'a str,
    subject: Option<&'a str>,
    body: &'a str,
    metadata: &'a BTreeMap<String, String>,
}

/// Chat or HTTP webhook channel.
///
/// 2xx is success. 408, 429, 5xx and transport errors are transient; any
/// other status is permanent.
#[derive(Debug, Clone)]
pub struct WebhookAdapter {
    client: reqwest::Client,
    url: String,
}

impl WebhookAdapter {
    pub fn new(url: impl Into<String>) -> NotificationResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("notify-dispatcher/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NotificationError::Provider(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

fn classify_status(status: StatusCode) -> Outcome {
    if status.is_success() {
        Outcome::Success
    } else if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Outcome::TransientFailure(format!("webhook returned {}", status))
    } else {
        Outcome::PermanentFailure(format!("webhook returned {}", status))
    }
}

#[async_trait]
impl ChannelAdapter for WebhookAdapter {
    async fn send(&self, target: &str, payload: &Payload, timeout: Duration) -> Outcome {
        let body = WebhookBody {
            recipient: target,
            subject: payload.subject.as_deref(),
            body: &payload.body,
            metadata: &payload.metadata,
        };

        debug!(url = %self.url, recipient = %target, "Posting webhook");
        match self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => classify_status(response.status()),
            Err(e) => {
                warn!(url = %self.url, error = %e, "Webhook request failed");
                if e.is_builder() {
                    Outcome::PermanentFailure(format!("invalid webhook request: {}", e))
                } else {
                    Outcome::TransientFailure(format!("webhook request failed: {}", e))
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}
