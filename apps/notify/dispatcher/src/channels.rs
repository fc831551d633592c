//! Builds the channel registry from configuration.

use domain_notifications::{
    ChannelAdapter, ChannelRegistry, LogAdapter, SmtpAdapter, SmtpConfig, WebhookAdapter,
};
use eyre::{eyre, Result, WrapErr};
use std::sync::Arc;
use tracing::info;

use crate::config::{AdapterKind, ChannelSettings, DispatchConfig, SmtpSettings};

fn smtp_config(settings: &SmtpSettings) -> SmtpConfig {
    let config = SmtpConfig::new(
        settings.host.clone(),
        settings.port,
        settings.from_email.clone(),
        settings.from_name.clone(),
    )
    .with_tls(settings.use_tls);

    match (&settings.username, &settings.password) {
        (Some(user), Some(pass)) => config.with_credentials(user.clone(), pass.clone()),
        _ => config,
    }
}

fn build_adapter(channel: &ChannelSettings, smtp: &SmtpSettings) -> Result<Arc<dyn ChannelAdapter>> {
    let adapter: Arc<dyn ChannelAdapter> = match channel.kind {
        AdapterKind::Smtp => Arc::new(
            SmtpAdapter::new(smtp_config(smtp)).wrap_err("Failed to build SMTP transport")?,
        ),
        AdapterKind::Webhook => {
            let url = channel
                .webhook_url
                .as_deref()
                .ok_or_else(|| eyre!("channel '{}' has no webhook url", channel.descriptor.id))?;
            Arc::new(WebhookAdapter::new(url).wrap_err("Failed to build webhook client")?)
        }
        AdapterKind::Log => Arc::new(LogAdapter::new(channel.descriptor.id.as_str())),
    };
    Ok(adapter)
}

/// Register every configured channel with its adapter.
pub fn build_registry(config: &DispatchConfig) -> Result<ChannelRegistry> {
    let mut builder = ChannelRegistry::builder();

    for channel in &config.channels {
        let adapter = build_adapter(channel, &config.smtp)
            .wrap_err_with(|| format!("Failed to configure channel '{}'", channel.descriptor.id))?;
        info!(
            channel = %channel.descriptor.id,
            adapter = %adapter.name(),
            retryable = %channel.descriptor.retryable,
            max_attempts = %channel.descriptor.max_attempts,
            "Registered channel"
        );
        builder = builder.register(channel.descriptor.clone(), adapter)?;
    }

    Ok(builder.build())
}
