//! Notifications Domain
//!
//! Multi-channel notification dispatch: accepts a request, walks it through
//! an ordered list of channels with retries and failover, and records every
//! delivery attempt.
//!
//! # Features
//!
//! - Idempotent intake (caller key or SHA-256 derived key)
//! - Per-channel retry ceilings with capped exponential backoff
//! - Sequential failover, first success wins
//! - Append-only delivery history and per-request reports
//! - Cancellation before the next attempt starts
//! - Crash recovery through the retry sweeper
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │ NotificationService │  ← submit / cancel / report
//! └──────────┬──────────┘
//!            │ first job
//! ┌──────────▼──────────┐      ┌───────────────┐
//! │   Dispatch Queue    │ ◄─── │ Retry Sweeper │  ← re-creates lost jobs
//! └──────────┬──────────┘      └───────────────┘
//!            │        ▲
//! ┌──────────▼──────┐ │ retry / failover job
//! │   Dispatcher    │─┘
//! └──┬───────────┬──┘
//!    │           │
//! ┌──▼───────┐ ┌─▼──────────────────┐
//! │ Channel  │ │ Request + Delivery │
//! │ Adapters │ │      Stores        │
//! └──────────┘ └────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_notifications::{
//!     ChannelDescriptor, ChannelRegistry, Dispatcher, InMemoryDeliveryStore,
//!     NotificationRequest, NotificationService, Payload, providers::LogAdapter,
//! };
//!
//! let registry = Arc::new(
//!     ChannelRegistry::builder()
//!         .register(ChannelDescriptor::new("in_app"), Arc::new(LogAdapter::new("in_app")))?
//!         .build(),
//! );
//! let service = NotificationService::new(registry.clone(), store.clone(), store.clone(), queue.clone());
//! service
//!     .submit(NotificationRequest::new("user-42", vec!["in_app".into()], Payload::new("hi")))
//!     .await?;
//! ```

pub mod channels;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod processor;
pub mod providers;
pub mod redis_store;
pub mod repository;
pub mod service;
pub mod sweeper;

pub use channels::{ChannelAdapter, ChannelRegistry, ChannelRegistryBuilder, RegisteredChannel};
pub use dispatcher::{plan_follow_up, Dispatcher, DispatcherConfig, FollowUp};
pub use error::{NotificationError, NotificationResult};
pub use memory::InMemoryDeliveryStore;
pub use models::{
    AttemptOutcome, BackoffPolicy, ChannelDescriptor, ChannelId, DeliveryAttemptRecord,
    DeliveryFilter, DeliveryReport, NotificationJob, NotificationRequest, Outcome, Payload,
    RequestRecord, RequestState, SubmitResponse,
};
pub use providers::{LogAdapter, SmtpAdapter, SmtpConfig, WebhookAdapter};
pub use redis_store::RedisDeliveryStore;
pub use repository::{DeliveryReportStore, InsertOutcome, RequestStore};
pub use service::NotificationService;
pub use sweeper::{RetrySweeper, SweepReport, SweeperConfig};
