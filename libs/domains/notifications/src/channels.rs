//! Channel adapters and the Channel Registry.
//!
//! Each channel kind implements one capability, `send`. The registry maps a
//! channel id to its descriptor and adapter. It is built once before workers
//! start and never mutated, so lookups need no locking.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{NotificationError, NotificationResult};
use crate::models::{ChannelDescriptor, ChannelId, Outcome, Payload};

/// Uniform send capability, one implementation per channel kind.
///
/// Implementations classify their own failures. The dispatcher enforces
/// `timeout` as well and records an expired call as a transient failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Deliver `payload` to `target`.
    async fn send(&self, target: &str, payload: &Payload, timeout: Duration) -> Outcome;

    /// Adapter name for logging.
    fn name(&self) -> &'static str;
}

/// A registry entry: static properties plus the adapter.
#[derive(Clone)]
pub struct RegisteredChannel {
    pub descriptor: ChannelDescriptor,
    pub adapter: Arc<dyn ChannelAdapter>,
}

impl fmt::Debug for RegisteredChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredChannel")
            .field("descriptor", &self.descriptor)
            .field("adapter", &self.adapter.name())
            .finish()
    }
}

/// Read-only lookup from channel id to descriptor and adapter.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelId, RegisteredChannel>,
}

impl ChannelRegistry {
    pub fn builder() -> ChannelRegistryBuilder {
        ChannelRegistryBuilder::default()
    }

    /// Descriptor and adapter for `id`.
    pub fn resolve(&self, id: &ChannelId) -> NotificationResult<&RegisteredChannel> {
        self.channels
            .get(id)
            .ok_or_else(|| NotificationError::UnknownChannel(id.clone()))
    }

    pub fn descriptor(&self, id: &ChannelId) -> Option<&ChannelDescriptor> {
        self.channels.get(id).map(|c| &c.descriptor)
    }

    pub fn contains(&self, id: &ChannelId) -> bool {
        self.channels.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Collects descriptors before the registry is frozen.
#[derive(Default)]
pub struct ChannelRegistryBuilder {
    channels: HashMap<ChannelId, RegisteredChannel>,
}

impl ChannelRegistryBuilder {
    /// Register a channel. Registering an id twice is a configuration error.
    pub fn register(
        mut self,
        descriptor: ChannelDescriptor,
        adapter: Arc<dyn ChannelAdapter>,
    ) -> NotificationResult<Self> {
        if self.channels.contains_key(&descriptor.id) {
            return Err(NotificationError::Config(format!(
                "channel '{}' registered twice",
                descriptor.id
            )));
        }
        self.channels.insert(
            descriptor.id.clone(),
            RegisteredChannel {
                descriptor,
                adapter,
            },
        );
        Ok(self)
    }

    pub fn build(self) -> ChannelRegistry {
        ChannelRegistry {
            channels: self.channels,
        }
    }
}
