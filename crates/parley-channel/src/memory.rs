//! In-memory channel board shared by every participant

use async_trait::async_trait;
use chrono::Utc;
use parley_core::{MessagePosition, ParleyError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::adapter::{ChannelAdapter, ChannelMessage, MessageHandle};

/// Append-only message board holding any number of channels
///
/// Cloning is cheap; clones share the same messages.
#[derive(Clone, Default)]
pub struct InMemoryBoard {
    channels: Arc<RwLock<HashMap<String, Vec<ChannelMessage>>>>,
}

impl InMemoryBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// A participant that posts under `identity`
    pub fn participant(&self, identity: impl Into<String>) -> InMemoryChannel {
        InMemoryChannel {
            board: self.clone(),
            identity: identity.into(),
        }
    }

    /// Full transcript of a channel
    pub async fn transcript(&self, channel: &str) -> Vec<ChannelMessage> {
        self.channels
            .read()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    async fn append(&self, channel: &str, author: &str, text: &str) -> MessageHandle {
        let mut channels = self.channels.write().await;
        let messages = channels.entry(channel.to_string()).or_default();
        let position = MessagePosition(messages.len() as u64 + 1);
        messages.push(ChannelMessage {
            position,
            author: author.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        });
        debug!("{} posted {} to {}", author, position, channel);
        MessageHandle {
            channel: channel.to_string(),
            position,
        }
    }

    async fn since(&self, channel: &str, position: MessagePosition) -> Vec<ChannelMessage> {
        let channels = self.channels.read().await;
        match channels.get(channel) {
            // Positions are 1-based indexes, so `position.0` is the first unread slot
            Some(messages) => messages
                .get(position.0 as usize..)
                .map(<[ChannelMessage]>::to_vec)
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

/// One participant's view of an [`InMemoryBoard`]
#[derive(Clone)]
pub struct InMemoryChannel {
    board: InMemoryBoard,
    identity: String,
}

impl InMemoryChannel {
    pub fn board(&self) -> &InMemoryBoard {
        &self.board
    }
}

#[async_trait]
impl ChannelAdapter for InMemoryChannel {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn post(&self, channel: &str, text: &str) -> Result<MessageHandle> {
        if channel.is_empty() {
            return Err(ParleyError::Channel("channel name is empty".to_string()));
        }
        Ok(self.board.append(channel, &self.identity, text).await)
    }

    async fn read_since(
        &self,
        channel: &str,
        position: MessagePosition,
    ) -> Result<Vec<ChannelMessage>> {
        Ok(self.board.since(channel, position).await)
    }
}
