//! Reference channel adapters.
//!
//! Each adapter implements [`ChannelAdapter`](crate::channels::ChannelAdapter)
//! and maps its transport's failures onto transient or permanent outcomes.

mod log;
mod smtp;
mod webhook;

pub use log::LogAdapter;
pub use smtp::{SmtpAdapter, SmtpConfig};
pub use webhook::WebhookAdapter;
