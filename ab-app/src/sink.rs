use crate::monitor::NotificationSink;
use ab_channels::{ChannelAdapter, ConversationId, OutboundMessage};
use async_trait::async_trait;
use std::sync::Arc;

/// Delivers monitor notifications to one chat conversation.
pub struct ChannelSink {
    adapter: Arc<dyn ChannelAdapter>,
    conversation_id: ConversationId,
}

impl ChannelSink {
    pub fn new(adapter: Arc<dyn ChannelAdapter>, conversation_id: ConversationId) -> Self {
        Self {
            adapter,
            conversation_id,
        }
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    #[tracing::instrument(level = "debug", skip_all, fields(channel = %self.adapter.channel_id(), conversation = %self.conversation_id))]
    async fn deliver(&self, mut message: OutboundMessage) -> anyhow::Result<()> {
        if !self.adapter.supports_actions() {
            message.actions.clear();
        }
        if !self.adapter.supports_attachments() && !message.attachments.is_empty() {
            tracing::debug!(dropped = message.attachments.len(), "channel cannot carry attachments");
            message.attachments.clear();
        }
        if message.content.trim().is_empty() && message.attachments.is_empty() {
            return Ok(());
        }
        self.adapter
            .send(self.conversation_id.as_str(), message)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ab_channels::{ActionButton, Attachment, InboundMessage};
    use bytes::Bytes;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct TextOnlyChannel {
        sent: Mutex<Vec<(String, OutboundMessage)>>,
    }

    #[async_trait]
    impl ChannelAdapter for TextOnlyChannel {
        fn channel_id(&self) -> &str {
            "test"
        }

        async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send(&self, conversation_id: &str, message: OutboundMessage) -> anyhow::Result<()> {
            self.sent
                .lock()
                .expect("sent lock")
                .push((conversation_id.to_string(), message));
            Ok(())
        }
    }

    #[tokio::test]
    async fn strips_what_the_channel_cannot_render() {
        let channel = Arc::new(TextOnlyChannel::default());
        let sink = ChannelSink::new(channel.clone(), ConversationId::new("c1"));
        let message = OutboundMessage::text("plan")
            .with_attachments(vec![Attachment {
                name: "shot.png".to_string(),
                content_type: "image/png".to_string(),
                data: Bytes::from_static(b"png"),
            }])
            .with_action(ActionButton {
                id: "approve:s1".to_string(),
                label: "Approve plan".to_string(),
            });
        sink.deliver(message).await.expect("deliver");

        let sent = channel.sent.lock().expect("sent lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "c1");
        assert_eq!(sent[0].1.content, "plan");
        assert!(sent[0].1.actions.is_empty());
        assert!(sent[0].1.attachments.is_empty());
    }

    #[tokio::test]
    async fn empty_messages_are_not_sent() {
        let channel = Arc::new(TextOnlyChannel::default());
        let sink = ChannelSink::new(channel.clone(), ConversationId::new("c1"));
        sink.deliver(OutboundMessage::text("  ")).await.expect("deliver");
        assert!(channel.sent.lock().expect("sent lock").is_empty());
    }
}
