//! Environment-driven configuration.

use domain_notifications::{BackoffPolicy, ChannelDescriptor, ChannelId, DispatcherConfig, SweeperConfig};
use job_queue::WorkerConfig;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::cli::Cli;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

impl ConfigError {
    fn parse(key: &str, details: impl Display) -> Self {
        ConfigError::ParseError {
            key: key.to_string(),
            details: details.to_string(),
        }
    }
}

/// Application environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Helper to load an environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper to load an environment variable or return an error
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parse an environment variable, falling back to `default` when unset
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| ConfigError::parse(key, e)),
        Err(_) => Ok(default),
    }
}

/// How a channel delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Smtp,
    Webhook,
    Log,
}

impl FromStr for AdapterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "smtp" => Ok(AdapterKind::Smtp),
            "webhook" => Ok(AdapterKind::Webhook),
            "log" => Ok(AdapterKind::Log),
            other => Err(format!("unknown adapter kind '{}' (expected smtp, webhook or log)", other)),
        }
    }
}

/// One `CHANNEL_<ID>_*` block.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    pub descriptor: ChannelDescriptor,
    pub kind: AdapterKind,
    pub webhook_url: Option<String>,
}

impl ChannelSettings {
    /// Prefix for a channel's variables: `email` -> `CHANNEL_EMAIL_`.
    pub fn env_prefix(id: &str) -> String {
        let id: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("CHANNEL_{}_", id)
    }

    fn default_kind(id: &str) -> AdapterKind {
        match id {
            "email" => AdapterKind::Smtp,
            "webhook" => AdapterKind::Webhook,
            _ => AdapterKind::Log,
        }
    }

    pub fn from_env_for(id: &str) -> Result<Self, ConfigError> {
        let prefix = Self::env_prefix(id);
        let key = |name: &str| format!("{}{}", prefix, name);

        let max_attempts: u32 = env_parse(&key("MAX_ATTEMPTS"), 3)?;
        if max_attempts == 0 {
            return Err(ConfigError::parse(&key("MAX_ATTEMPTS"), "must be at least 1"));
        }
        let multiplier: f64 = env_parse(&key("BACKOFF_MULTIPLIER"), 2.0)?;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(ConfigError::parse(&key("BACKOFF_MULTIPLIER"), "must be at least 1.0"));
        }

        let backoff = BackoffPolicy::new(
            Duration::from_millis(env_parse(&key("BACKOFF_BASE_MS"), 1_000)?),
            multiplier,
            Duration::from_millis(env_parse(&key("BACKOFF_CAP_MS"), 60_000)?),
        );

        let descriptor = ChannelDescriptor::new(id)
            .with_retryable(env_parse(&key("RETRYABLE"), true)?)
            .with_max_attempts(max_attempts)
            .with_backoff(backoff)
            .with_timeout(Duration::from_millis(env_parse(&key("TIMEOUT_MS"), 10_000)?));

        let kind = match env::var(key("KIND")) {
            Ok(raw) => raw.parse().map_err(|e: String| ConfigError::parse(&key("KIND"), e))?,
            Err(_) => Self::default_kind(id),
        };

        let webhook_url = env::var(key("WEBHOOK_URL")).ok().filter(|url| !url.is_empty());
        if kind == AdapterKind::Webhook && webhook_url.is_none() {
            return Err(ConfigError::MissingEnvVar(key("WEBHOOK_URL")));
        }

        Ok(Self {
            descriptor,
            kind,
            webhook_url,
        })
    }
}

/// SMTP settings shared by every `smtp` channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub from_email: String,
    pub from_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
}

impl FromEnv for SmtpSettings {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or_default("SMTP_HOST", "localhost"),
            port: env_parse("SMTP_PORT", 1025)?,
            from_email: env_or_default("SMTP_FROM_EMAIL", "noreply@localhost"),
            from_name: env_or_default("SMTP_FROM_NAME", "Notifications"),
            username: env::var("SMTP_USERNAME").ok(),
            password: env::var("SMTP_PASSWORD").ok(),
            use_tls: env_parse("SMTP_TLS", false)?,
        })
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub visibility_timeout: Duration,
    pub failure_requeue_ms: u64,
}

impl FromEnv for WorkerSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let concurrency: usize = env_parse("WORKER_CONCURRENCY", 4)?;
        if concurrency == 0 {
            return Err(ConfigError::parse("WORKER_CONCURRENCY", "must be at least 1"));
        }
        Ok(Self {
            concurrency,
            poll_interval_ms: env_parse("WORKER_POLL_INTERVAL_MS", 500)?,
            visibility_timeout: Duration::from_millis(env_parse("WORKER_VISIBILITY_TIMEOUT_MS", 60_000)?),
            failure_requeue_ms: env_parse("WORKER_FAILURE_REQUEUE_MS", 5_000)?,
        })
    }
}

/// Full dispatcher process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub redis_url: String,
    pub queue_name: String,
    pub store_prefix: String,
    pub health_port: u16,
    pub worker: WorkerSettings,
    pub sweeper_interval: Duration,
    pub sweeper_stale_after: Duration,
    pub sweeper_max_total_attempts: usize,
    pub channels: Vec<ChannelSettings>,
    pub smtp: SmtpSettings,
}

impl FromEnv for DispatchConfig {
    /// Requires REDIS_URL to be set (no default)
    fn from_env() -> Result<Self, ConfigError> {
        let channel_ids = env_or_default("DISPATCH_CHANNELS", "email,sms,push,webhook,in_app");
        let channels = channel_ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ChannelSettings::from_env_for)
            .collect::<Result<Vec<_>, _>>()?;
        if channels.is_empty() {
            return Err(ConfigError::parse("DISPATCH_CHANNELS", "no channels configured"));
        }

        let sweeper_interval_secs: u64 = env_parse("SWEEPER_INTERVAL_SECS", 60)?;
        if sweeper_interval_secs == 0 {
            return Err(ConfigError::parse("SWEEPER_INTERVAL_SECS", "must be at least 1"));
        }

        Ok(Self {
            redis_url: env_required("REDIS_URL")?,
            queue_name: env_or_default("QUEUE_NAME", "notify:jobs"),
            store_prefix: env_or_default("STORE_PREFIX", "notify"),
            health_port: env_parse("HEALTH_PORT", 8090)?,
            worker: WorkerSettings::from_env()?,
            sweeper_interval: Duration::from_secs(sweeper_interval_secs),
            sweeper_stale_after: Duration::from_secs(env_parse("SWEEPER_STALE_AFTER_SECS", 300)?),
            sweeper_max_total_attempts: env_parse("SWEEPER_MAX_TOTAL_ATTEMPTS", 20)?,
            channels,
            smtp: SmtpSettings::from_env()?,
        })
    }
}

impl DispatchConfig {
    /// Worker pool config, with CLI overrides applied.
    pub fn worker_config(&self, cli: &Cli) -> WorkerConfig {
        let concurrency = cli
            .workers
            .map_or(self.worker.concurrency, usize::from);
        WorkerConfig::new()
            .with_concurrency(concurrency)
            .with_poll_interval_ms(self.worker.poll_interval_ms)
            .with_failure_requeue_ms(self.worker.failure_requeue_ms)
            .with_drain(cli.drain)
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig::default()
            .with_interval(self.sweeper_interval)
            .with_stale_after(self.sweeper_stale_after)
            .with_max_total_attempts(self.sweeper_max_total_attempts)
    }

    /// Request leases outlive the queue's visibility timeout.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default().with_min_lease(self.worker.visibility_timeout)
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|c| c.descriptor.id.clone()).collect()
    }
}
