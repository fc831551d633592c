//! SMTP email adapter using lettre.
//!
//! 5xx replies (mailbox unknown, message rejected) and unparsable addresses
//! are permanent. Everything else, including 4xx replies and connection
//! trouble, is transient.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::channels::ChannelAdapter;
use crate::error::{NotificationError, NotificationResult};
use crate::models::{Outcome, Payload};

/// SMTP configuration.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    /// SMTP server host.
    pub host: String,
    /// SMTP server port.
    pub port: u16,
    /// Sender email address.
    pub from_email: String,
    /// Sender name.
    pub from_name: String,
    /// SMTP username (optional for dev servers like Mailpit).
    pub username: Option<String>,
    /// SMTP password (optional for dev servers like Mailpit).
    pub password: Option<String>,
    /// Whether to use TLS (false for local dev servers).
    pub use_tls: bool,
}

impl SmtpConfig {
    /// Create a new SMTP configuration.
    pub fn new(host: impl Into<String>, port: u16, from_email: impl Into<String>, from_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            from_email: from_email.into(),
            from_name: from_name.into(),
            username: None,
            password: None,
            use_tls: false,
        }
    }

    /// Builder method to set TLS.
    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    /// Builder method to set credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Email channel over SMTP.
pub struct SmtpAdapter {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    config: SmtpConfig,
}

impl SmtpAdapter {
    /// Create a new SMTP adapter.
    pub fn new(config: SmtpConfig) -> NotificationResult<Self> {
        let transport = Self::build_transport(&config)?;
        let from: Mailbox = format!("{} <{}>", config.from_name, config.from_email)
            .parse()
            .map_err(|e| NotificationError::Config(format!("Invalid from address: {}", e)))?;
        Ok(Self {
            transport,
            from,
            config,
        })
    }

    /// Build the SMTP transport based on configuration.
    fn build_transport(config: &SmtpConfig) -> NotificationResult<AsyncSmtpTransport<Tokio1Executor>> {
        let credentials = match (&config.username, &config.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username.clone(), password.clone())),
            _ => None,
        };

        let transport = if config.use_tls {
            let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| NotificationError::Provider(format!("Failed to create SMTP relay: {}", e)))?
                .port(config.port);
            if let Some(credentials) = credentials {
                builder = builder.credentials(credentials);
            }
            builder.build()
        } else {
            // Plain transport for local dev servers like Mailpit
            let mut builder =
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host).port(config.port);
            if let Some(credentials) = credentials {
                builder = builder.credentials(credentials);
            }
            builder.build()
        };

        Ok(transport)
    }

    /// Build a lettre Message, or the reason it can never be sent.
    fn build_message(&self, target: &str, payload: &Payload) -> Result<Message, String> {
        let to: Mailbox = target
            .parse()
            .map_err(|e| format!("Invalid recipient address '{}': {}", target, e))?;

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(payload.subject.clone().unwrap_or_default());

        if let Some(reply_to) = payload.metadata.get("reply_to") {
            let reply_to: Mailbox = reply_to
                .parse()
                .map_err(|e| format!("Invalid reply-to address: {}", e))?;
            builder = builder.reply_to(reply_to);
        }

        let text = SinglePart::builder()
            .header(ContentType::TEXT_PLAIN)
            .body(payload.body.clone());

        let message = match payload.metadata.get("html_body") {
            Some(html) => builder.multipart(
                MultiPart::alternative().singlepart(text).singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_HTML)
                        .body(html.clone()),
                ),
            ),
            None => builder.singlepart(text),
        };

        message.map_err(|e| format!("Failed to build email message: {}", e))
    }
}

/// Map an SMTP transport error onto an outcome.
fn classify_smtp_error(error: &lettre::transport::smtp::Error) -> Outcome {
    if error.is_permanent() {
        Outcome::PermanentFailure(format!("SMTP rejected message: {}", error))
    } else {
        Outcome::TransientFailure(format!("SMTP send failed: {}", error))
    }
}

#[async_trait]
impl ChannelAdapter for SmtpAdapter {
    async fn send(&self, target: &str, payload: &Payload, timeout: Duration) -> Outcome {
        debug!(
            to = %target,
            host = %self.config.host,
            port = %self.config.port,
            "Sending email via SMTP"
        );

        let message = match self.build_message(target, payload) {
            Ok(message) => message,
            Err(reason) => return Outcome::PermanentFailure(reason),
        };

        match tokio::time::timeout(timeout, self.transport.send(message)).await {
            Ok(Ok(response)) => {
                let message_id = response.message().next().map(|s| s.to_string());
                info!(to = %target, message_id = ?message_id, "Email sent via SMTP");
                Outcome::Success
            }
            Ok(Err(e)) => {
                warn!(to = %target, error = %e, "SMTP send failed");
                classify_smtp_error(&e)
            }
            Err(_) => Outcome::TransientFailure(format!("SMTP send timed out after {:?}", timeout)),
        }
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}
