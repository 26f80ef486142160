//! Inbound dispatch: every channel adapter feeds one queue; each event is
//! handled on its own task so slow conversations never block others.

use crate::commands;
use crate::monitor::{NotificationSink, parse_approve_action};
use crate::router::SessionRouter;
use crate::sink::ChannelSink;
use ab_agent::AgentService;
use ab_channels::{ChannelAdapter, InboundMessage, InboundMessageKind, OutboundMessage};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Gateway {
    started_at: Instant,
    router: Arc<SessionRouter>,
    service: Arc<dyn AgentService>,
    channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    inbound_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>>,
}

impl Gateway {
    pub fn new(
        started_at: Instant,
        router: Arc<SessionRouter>,
        service: Arc<dyn AgentService>,
        channels: HashMap<String, Arc<dyn ChannelAdapter>>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            started_at,
            router,
            service,
            channels,
            inbound_rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop(shutdown).await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(self: &Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("gateway loop stopping");
                    return Ok(());
                }
                msg = async {
                    let mut rx = self.inbound_rx.lock().await;
                    rx.recv().await
                } => msg,
            };
            let Some(inbound) = msg else {
                return Ok(());
            };
            if inbound.sender_is_bot {
                continue;
            }

            let gateway = Arc::clone(self);
            tokio::spawn(async move {
                let channel_id = inbound.channel_id.clone();
                let conversation_id = inbound.conversation_id.clone();
                if let Err(e) = gateway.handle_inbound(inbound).await {
                    tracing::warn!(%e, channel = %channel_id, conversation = %conversation_id, "handle_inbound failed");
                    gateway
                        .reply_error(channel_id.as_str(), conversation_id.as_str(), &e)
                        .await;
                }
            });
        }
    }

    fn channel(&self, channel_id: &str) -> Result<Arc<dyn ChannelAdapter>> {
        self.channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown channel: {channel_id}"))
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(channel = %inbound.channel_id, conversation = %inbound.conversation_id, kind = ?inbound.kind)
    )]
    pub(crate) async fn handle_inbound(&self, inbound: InboundMessage) -> Result<()> {
        let channel = self.channel(inbound.channel_id.as_str())?;
        let sink: Arc<dyn NotificationSink> = Arc::new(ChannelSink::new(
            channel.clone(),
            inbound.conversation_id.clone(),
        ));

        if inbound.kind == InboundMessageKind::Action {
            return self.handle_action(&channel, &inbound, sink).await;
        }

        let text = inbound.content.trim();
        if text.is_empty() {
            return Ok(());
        }

        let reply = match commands::handle_command(
            &self.router,
            self.service.as_ref(),
            &inbound.conversation_id,
            text,
            self.started_at.elapsed(),
        )
        .await
        {
            Some(reply) => Some(reply),
            None => {
                self.router
                    .handle_message(&inbound.conversation_id, text, sink)
                    .await
            }
        };

        if let Some(reply) = reply {
            channel
                .send(inbound.conversation_id.as_str(), OutboundMessage::text(reply))
                .await?;
        }
        Ok(())
    }

    async fn handle_action(
        &self,
        channel: &Arc<dyn ChannelAdapter>,
        inbound: &InboundMessage,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<()> {
        let Some(session_id) = parse_approve_action(&inbound.content) else {
            tracing::debug!(action = %inbound.content, "ignoring unknown action");
            return Ok(());
        };

        let (outcome, reply) = self
            .router
            .approve_plan(&inbound.conversation_id, &session_id, sink)
            .await;

        // Drop the button once the plan can no longer be approved; after a
        // transient failure it stays so the user can retry.
        if outcome.is_settled() {
            if let Err(e) = channel
                .edit(
                    inbound.conversation_id.as_str(),
                    &inbound.message_id,
                    OutboundMessage::default(),
                )
                .await
            {
                tracing::debug!(%e, "could not clear approval button");
            }
        }

        channel
            .send(inbound.conversation_id.as_str(), OutboundMessage::text(reply))
            .await
    }

    async fn reply_error(&self, channel_id: &str, conversation_id: &str, error: &anyhow::Error) {
        let Ok(channel) = self.channel(channel_id) else {
            return;
        };
        if let Err(e) = channel
            .send(conversation_id, OutboundMessage::text(format!("Error: {error}")))
            .await
        {
            tracing::warn!(%e, "failed to report error to user");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::SessionMonitor;
    use crate::registry::MonitorRegistry;
    use crate::resolver::SourceMatch;
    use crate::router::{FAILURE_TEXT, PLAN_APPROVED_TEXT, RouterState};
    use crate::scaling::ScalingPolicy;
    use crate::test_support::{FakeAgentService, ScriptedTransform, fast_config};
    use ab_agent::SessionId;
    use ab_channels::{ChannelId, ConversationId, MessageId, SenderId};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeChannel {
        sent: Mutex<Vec<OutboundMessage>>,
        edited: Mutex<Vec<(String, OutboundMessage)>>,
    }

    #[async_trait]
    impl ChannelAdapter for FakeChannel {
        fn channel_id(&self) -> &str {
            "fake"
        }

        async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
            Ok(())
        }

        async fn send(&self, _conversation_id: &str, message: OutboundMessage) -> Result<()> {
            self.sent.lock().expect("sent lock").push(message);
            Ok(())
        }

        async fn edit(
            &self,
            _conversation_id: &str,
            message_id: &MessageId,
            message: OutboundMessage,
        ) -> Result<()> {
            self.edited
                .lock()
                .expect("edited lock")
                .push((message_id.to_string(), message));
            Ok(())
        }

        fn supports_actions(&self) -> bool {
            true
        }
    }

    fn gateway() -> (Arc<FakeAgentService>, Arc<FakeChannel>, Gateway) {
        let service = Arc::new(FakeAgentService::with_sources(&["repo-a"]));
        let transform = Arc::new(ScriptedTransform::answering(SourceMatch::Index(0)));
        let monitor = Arc::new(SessionMonitor::new(
            service.clone(),
            transform.clone(),
            fast_config(),
        ));
        let registry = MonitorRegistry::new(monitor, ScalingPolicy::disabled());
        let router = Arc::new(SessionRouter::new(service.clone(), transform, registry));
        let channel = Arc::new(FakeChannel::default());
        let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
        channels.insert("fake".to_string(), channel.clone());
        let (_tx, rx) = mpsc::channel(8);
        let gateway = Gateway::new(Instant::now(), router, service.clone(), channels, rx);
        (service, channel, gateway)
    }

    fn inbound(kind: InboundMessageKind, content: &str) -> InboundMessage {
        InboundMessage {
            kind,
            message_id: MessageId::new("m1"),
            channel_id: ChannelId::new("fake"),
            conversation_id: ConversationId::new("chat-1"),
            sender_id: SenderId::new("u1"),
            sender_is_bot: false,
            content: content.to_string(),
            received_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn message_starts_session_and_replies() {
        let (service, channel, gateway) = gateway();
        gateway
            .handle_inbound(inbound(InboundMessageKind::Message, "fix the login bug"))
            .await
            .expect("handled");
        assert_eq!(service.created_sources(), vec!["repo-a".to_string()]);
        assert_eq!(channel.sent.lock().expect("sent lock").len(), 1);
        assert!(matches!(
            gateway.router.state_of(&ConversationId::new("chat-1")),
            RouterState::ActiveSession { .. }
        ));
        gateway.router.reset(&ConversationId::new("chat-1")).await;
    }

    #[tokio::test]
    async fn approve_action_approves_and_clears_button() {
        let (service, channel, gateway) = gateway();
        gateway
            .handle_inbound(inbound(InboundMessageKind::Action, "approve:s9"))
            .await
            .expect("handled");
        assert_eq!(
            *service.approved.lock().expect("approved lock"),
            vec![SessionId::new("s9")]
        );
        let edited = channel.edited.lock().expect("edited lock");
        assert_eq!(edited.len(), 1);
        assert_eq!(edited[0].0, "m1");
        assert!(edited[0].1.actions.is_empty());
        assert_eq!(
            channel.sent.lock().expect("sent lock")[0].content,
            PLAN_APPROVED_TEXT
        );
    }

    #[tokio::test]
    async fn failed_approval_keeps_the_button() {
        let (service, channel, gateway) = gateway();
        service
            .approve_fails
            .store(true, std::sync::atomic::Ordering::SeqCst);
        gateway
            .handle_inbound(inbound(InboundMessageKind::Action, "approve:s1"))
            .await
            .expect("handled");
        assert!(channel.edited.lock().expect("edited lock").is_empty());
        assert_eq!(
            channel.sent.lock().expect("sent lock")[0].content,
            FAILURE_TEXT
        );
        assert!(service.approved.lock().expect("approved lock").is_empty());
    }

    #[tokio::test]
    async fn unknown_channel_is_an_error() {
        let (_service, _channel, gateway) = gateway();
        let mut msg = inbound(InboundMessageKind::Message, "hi");
        msg.channel_id = ChannelId::new("missing");
        assert!(gateway.handle_inbound(msg).await.is_err());
    }
}
