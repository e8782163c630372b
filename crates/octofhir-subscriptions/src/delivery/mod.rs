//! Notification delivery.
//!
//! Every channel type implements [`DeliveryChannel`]. The
//! [`DeliveryDispatcher`] routes jobs to the channel registered for the
//! subscription's channel type.

pub mod dispatcher;
pub mod websocket;

pub use dispatcher::{DeliveryDispatcher, DeliveryStats, DeliveryStatsSnapshot};
pub use websocket::{SessionEncoding, SessionHandle, SessionMessage, WebSocketChannel, WebSocketRegistry};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SubscriptionResult;
use crate::types::{ChannelType, DeliveryJob, DeliveryOutcome, SubscriptionChannel};

/// Trait for notification delivery channels.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Channel type this implementation serves.
    fn channel_type(&self) -> ChannelType;

    /// Check that a subscription's channel descriptor can be served.
    ///
    /// Called by the lifecycle before `requested -> active`. An error moves
    /// the subscription to `error` with the message as its reason.
    fn provision(&self, channel: &SubscriptionChannel) -> SubscriptionResult<()>;

    /// Send one notification.
    async fn send(&self, job: &DeliveryJob) -> DeliveryOutcome;
}

/// Immutable map of channel type to implementation.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelType, Arc<dyn DeliveryChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel, replacing any earlier one for the same type.
    pub fn with(mut self, channel: Arc<dyn DeliveryChannel>) -> Self {
        self.channels.insert(channel.channel_type(), channel);
        self
    }

    pub fn get(&self, channel_type: &ChannelType) -> Option<&Arc<dyn DeliveryChannel>> {
        self.channels.get(channel_type)
    }

    pub fn supported(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.channels.keys().map(ChannelType::as_str).collect();
        codes.sort_unstable();
        codes
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.supported())
            .finish()
    }
}
