//! Channel transport abstraction

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::{MessagePosition, Result};
use std::sync::Arc;

/// Receipt for a posted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub channel: String,
    pub position: MessagePosition,
}

/// A message read back from the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub position: MessagePosition,
    pub author: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Trait for talking to the shared channel (allows mocking in tests)
///
/// Implementations must tolerate concurrent use from many routing tasks.
/// The only ordering guarantee routing relies on is that a message becomes
/// visible to `read_since` once `post` has returned.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Identity messages are posted under
    fn identity(&self) -> &str;

    /// Append a message to a channel
    async fn post(&self, channel: &str, text: &str) -> Result<MessageHandle>;

    /// Messages strictly after `position`, in channel order
    async fn read_since(&self, channel: &str, position: MessagePosition)
        -> Result<Vec<ChannelMessage>>;
}

#[async_trait]
impl<T: ChannelAdapter + ?Sized> ChannelAdapter for Arc<T> {
    fn identity(&self) -> &str {
        (**self).identity()
    }

    async fn post(&self, channel: &str, text: &str) -> Result<MessageHandle> {
        (**self).post(channel, text).await
    }

    async fn read_since(
        &self,
        channel: &str,
        position: MessagePosition,
    ) -> Result<Vec<ChannelMessage>> {
        (**self).read_since(channel, position).await
    }
}
