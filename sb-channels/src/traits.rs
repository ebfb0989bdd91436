use crate::types::{InboundMessage, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier: "whatsapp", "webhook", ...
    fn channel_id(&self) -> &str;

    /// Start receiving messages. Webhook-driven channels push from their HTTP
    /// route instead and keep the default.
    async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        Ok(())
    }

    /// Deliver a reply. `recipient_id` is the raw sender address the
    /// conversation's newest message came from.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;
}
