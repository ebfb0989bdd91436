use crate::traits::ChannelAdapter;
use crate::types::OutboundMessage;
use anyhow::Result;
use async_trait::async_trait;

/// Delivers replies to the log. Used for the HTTP ingress channel in
/// development, where there is no platform to send to.
#[derive(Debug, Clone)]
pub struct LogChannelAdapter {
    channel_id: String,
}

impl LogChannelAdapter {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for LogChannelAdapter {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        tracing::info!(
            channel = %self.channel_id,
            recipient = %recipient_id,
            reply_to = ?message.reply_to_message_id,
            content = %message.content,
            "outbound message"
        );
        Ok(())
    }
}
