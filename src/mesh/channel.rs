//! Cross-node notification channels.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::trace;

use crate::error::Result;

/// A published notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// Best-effort publish/subscribe transport used by the coordinator.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;
}

/// In-process channel for coordinators sharing one runtime.
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    sender: broadcast::Sender<ChannelMessage>,
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new(256)
    }
}

impl BroadcastChannel {
    /// Create a channel buffering up to `capacity` messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Messages published from now on. Lagged messages are skipped.
    pub fn subscribe(&self) -> impl Stream<Item = ChannelMessage> {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|m| m.ok())
    }
}

#[async_trait]
impl EventChannel for BroadcastChannel {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let message = ChannelMessage {
            channel: channel.to_string(),
            payload: message.to_string(),
        };
        // No subscribers is not a failure
        let receivers = self.sender.send(message).unwrap_or(0);
        trace!(channel = %channel, receivers = receivers, "Published message");
        Ok(())
    }
}
