use crate::types::{InboundMessage, MessageId, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "telegram".
    fn channel_id(&self) -> &str;

    /// Start receiving messages. Push to tx for each inbound message or action.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Send a message (text, attachments, action buttons) to a conversation.
    async fn send(&self, conversation_id: &str, message: OutboundMessage) -> Result<()>;

    /// Replace the content and controls of a previously sent message.
    /// Adapters that cannot edit should keep the default.
    async fn edit(
        &self,
        _conversation_id: &str,
        _message_id: &MessageId,
        _message: OutboundMessage,
    ) -> Result<()> {
        Err(anyhow::anyhow!("edit is not supported by this channel"))
    }

    fn supports_actions(&self) -> bool {
        false
    }

    fn supports_attachments(&self) -> bool {
        false
    }
}
