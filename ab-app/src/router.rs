//! Per-conversation session routing.
//!
//! Each conversation is in exactly one of three states: no session, waiting
//! for the user to pick a source, or bound to an active remote session. The
//! state lives in a single map entry per conversation, so a pending selection
//! and an active session can never coexist. Events of one conversation are
//! serialized by a per-conversation lock.

use crate::monitor::NotificationSink;
use crate::registry::MonitorRegistry;
use crate::resolver::{
    Direction, SourceMatch, TextTransform, fallback_clarification, numbered_sources,
};
use ab_agent::{AgentError, AgentService, SessionId, Source};
use ab_channels::ConversationId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const NO_SOURCES_TEXT: &str =
    "No repositories are connected to the agent yet. Connect one and try again.";
pub const REPROMPT_TEXT: &str = "Please reply with one of the numbers below:";
pub const SESSION_EXPIRED_TEXT: &str =
    "That session has expired. Send your request again to start a new one.";
pub const FAILURE_TEXT: &str = "Something went wrong talking to the agent. Please try again.";
pub const PLAN_APPROVED_TEXT: &str = "Plan approved. The agent is getting to work.";
pub const MESSAGE_FORWARDED_TEXT: &str = "Sent to the agent.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterState {
    NoSession,
    PendingSelection { candidates: usize },
    ActiveSession { session_id: SessionId, source: String },
}

/// How an approval attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    /// The service no longer knows the session.
    Expired,
    /// Transient failure; the plan can still be approved.
    Failed,
}

impl ApprovalOutcome {
    /// True when the plan can no longer be approved from the chat.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Approved | Self::Expired)
    }
}

#[derive(Debug, Clone)]
struct PendingSelection {
    sources: Vec<Source>,
    instruction: String,
}

#[derive(Debug, Clone)]
struct ActiveSession {
    session_id: SessionId,
    source: String,
    plan_gated: bool,
}

#[derive(Debug, Clone)]
enum ConversationState {
    Pending(PendingSelection),
    Active(ActiveSession),
}

pub struct SessionRouter {
    service: Arc<dyn AgentService>,
    transform: Arc<dyn TextTransform>,
    monitors: Arc<MonitorRegistry>,
    states: DashMap<ConversationId, ConversationState>,
    locks: DashMap<ConversationId, Arc<Mutex<()>>>,
}

impl SessionRouter {
    pub fn new(
        service: Arc<dyn AgentService>,
        transform: Arc<dyn TextTransform>,
        monitors: Arc<MonitorRegistry>,
    ) -> Self {
        Self {
            service,
            transform,
            monitors,
            states: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn monitors(&self) -> &Arc<MonitorRegistry> {
        &self.monitors
    }

    pub fn state_of(&self, conversation: &ConversationId) -> RouterState {
        match self.states.get(conversation).map(|entry| entry.value().clone()) {
            None => RouterState::NoSession,
            Some(ConversationState::Pending(pending)) => RouterState::PendingSelection {
                candidates: pending.sources.len(),
            },
            Some(ConversationState::Active(active)) => RouterState::ActiveSession {
                session_id: active.session_id,
                source: active.source,
            },
        }
    }

    fn lock_for(&self, conversation: &ConversationId) -> Arc<Mutex<()>> {
        self.locks
            .entry(conversation.clone())
            .or_default()
            .value()
            .clone()
    }

    /// Handles one user message and returns the reply to post, if any.
    #[tracing::instrument(level = "info", skip_all, fields(conversation = %conversation))]
    pub async fn handle_message(
        &self,
        conversation: &ConversationId,
        text: &str,
        sink: Arc<dyn NotificationSink>,
    ) -> Option<String> {
        let lock = self.lock_for(conversation);
        let _guard = lock.lock().await;

        let state = self.states.get(conversation).map(|entry| entry.value().clone());
        match state {
            None => self.on_idle(conversation, text, sink).await,
            Some(ConversationState::Pending(pending)) => {
                self.on_selection(conversation, pending, text, sink).await
            }
            Some(ConversationState::Active(active)) => {
                self.on_follow_up(conversation, active, text, sink).await
            }
        }
    }

    async fn on_idle(
        &self,
        conversation: &ConversationId,
        text: &str,
        sink: Arc<dyn NotificationSink>,
    ) -> Option<String> {
        let sources = match self.service.list_sources().await {
            Ok(sources) => sources,
            Err(error) => return Some(self.failure(&error).await),
        };
        if sources.is_empty() {
            tracing::info!("no sources available");
            return Some(self.localize(NO_SOURCES_TEXT).await);
        }

        match self.transform.match_source(text, &sources).await {
            SourceMatch::Index(idx) => match sources.get(idx) {
                Some(source) => self.start_session(conversation, source, text, sink).await,
                None => Some(self.hold_selection(conversation, sources, text, None)),
            },
            SourceMatch::Clarify(question) => {
                Some(self.hold_selection(conversation, sources, text, Some(question)))
            }
        }
    }

    fn hold_selection(
        &self,
        conversation: &ConversationId,
        sources: Vec<Source>,
        instruction: &str,
        question: Option<String>,
    ) -> String {
        let reply = question.unwrap_or_else(|| fallback_clarification(&sources));
        tracing::info!(candidates = sources.len(), "waiting for source selection");
        self.states.insert(
            conversation.clone(),
            ConversationState::Pending(PendingSelection {
                sources,
                instruction: instruction.to_string(),
            }),
        );
        reply
    }

    async fn on_selection(
        &self,
        conversation: &ConversationId,
        pending: PendingSelection,
        text: &str,
        sink: Arc<dyn NotificationSink>,
    ) -> Option<String> {
        let Some(idx) = parse_selection(text, pending.sources.len()) else {
            let prompt = self.localize(REPROMPT_TEXT).await;
            return Some(format!("{prompt}\n{}", numbered_sources(&pending.sources)));
        };

        self.states.remove(conversation);
        let source = &pending.sources[idx];
        let reply = self
            .start_session(conversation, source, &pending.instruction, sink)
            .await;
        let started = matches!(
            self.states.get(conversation).as_deref(),
            Some(ConversationState::Active(_))
        );
        if !started {
            // Creation failed; let the user pick again.
            self.states
                .insert(conversation.clone(), ConversationState::Pending(pending));
        }
        reply
    }

    async fn start_session(
        &self,
        conversation: &ConversationId,
        source: &Source,
        instruction: &str,
        sink: Arc<dyn NotificationSink>,
    ) -> Option<String> {
        let instruction = self.transform.translate(instruction, Direction::ToAgent).await;
        let session = match self.service.create_session(source, &instruction).await {
            Ok(session) => session,
            Err(error) => return Some(self.failure(&error).await),
        };
        let session_id = session.session_id();
        let source_name = source.display_name();
        tracing::info!(session_id = %session_id, source = %source_name, "session created");

        self.states.insert(
            conversation.clone(),
            ConversationState::Active(ActiveSession {
                session_id: session_id.clone(),
                source: source_name.clone(),
                plan_gated: session.require_plan_approval,
            }),
        );
        self.monitors
            .start_fresh(session_id, session.require_plan_approval, sink)
            .await;

        let mut reply = self
            .localize(&format!("Started a session on {source_name}."))
            .await;
        if let Some(url) = session.url.as_deref().filter(|u| !u.is_empty()) {
            reply.push('\n');
            reply.push_str(url);
        }
        Some(reply)
    }

    async fn on_follow_up(
        &self,
        conversation: &ConversationId,
        active: ActiveSession,
        text: &str,
        sink: Arc<dyn NotificationSink>,
    ) -> Option<String> {
        let instruction = self.transform.translate(text, Direction::ToAgent).await;
        match self
            .service
            .send_message(&active.session_id, &instruction)
            .await
        {
            Ok(()) => {
                self.monitors
                    .resume(active.session_id, active.plan_gated, sink)
                    .await;
                Some(self.localize(MESSAGE_FORWARDED_TEXT).await)
            }
            Err(error) if error.is_not_found() => {
                self.evict(conversation, &active.session_id);
                Some(self.localize(SESSION_EXPIRED_TEXT).await)
            }
            Err(error) => Some(self.failure(&error).await),
        }
    }

    /// Approves a session's plan on behalf of the conversation that owns it,
    /// then keeps watching the session. Returns the outcome with the reply.
    #[tracing::instrument(level = "info", skip_all, fields(conversation = %conversation, session_id = %session_id))]
    pub async fn approve_plan(
        &self,
        conversation: &ConversationId,
        session_id: &SessionId,
        sink: Arc<dyn NotificationSink>,
    ) -> (ApprovalOutcome, String) {
        let lock = self.lock_for(conversation);
        let _guard = lock.lock().await;

        let active = match self.states.get(conversation).as_deref() {
            Some(ConversationState::Active(active)) if &active.session_id == session_id => {
                Some(active.clone())
            }
            _ => None,
        };
        match self.service.approve_plan(session_id).await {
            Ok(()) => {
                if let Some(active) = active {
                    self.monitors
                        .resume(active.session_id, active.plan_gated, sink)
                        .await;
                }
                (
                    ApprovalOutcome::Approved,
                    self.localize(PLAN_APPROVED_TEXT).await,
                )
            }
            Err(error) if error.is_not_found() => {
                if active.is_some() {
                    self.evict(conversation, session_id);
                }
                (
                    ApprovalOutcome::Expired,
                    self.localize(SESSION_EXPIRED_TEXT).await,
                )
            }
            Err(error) => (ApprovalOutcome::Failed, self.failure(&error).await),
        }
    }

    /// Drops whatever the conversation was doing. Returns the prior state.
    pub async fn reset(&self, conversation: &ConversationId) -> RouterState {
        let lock = self.lock_for(conversation);
        let _guard = lock.lock().await;

        let previous = self.state_of(conversation);
        if let Some((_, ConversationState::Active(active))) = self.states.remove(conversation) {
            self.monitors.forget(&active.session_id);
        }
        tracing::info!(conversation = %conversation, ?previous, "conversation reset");
        previous
    }

    fn evict(&self, conversation: &ConversationId, session_id: &SessionId) {
        tracing::info!(session_id = %session_id, "session unknown to the agent service; evicting");
        self.states.remove(conversation);
        self.monitors.forget(session_id);
    }

    async fn failure(&self, error: &AgentError) -> String {
        tracing::warn!(%error, status = ?error.status(), "agent service call failed");
        self.localize(FAILURE_TEXT).await
    }

    async fn localize(&self, text: &str) -> String {
        self.transform.translate(text, Direction::ToUser).await
    }
}

/// 1-based choice among `candidates`.
fn parse_selection(text: &str, candidates: usize) -> Option<usize> {
    let choice: usize = text.trim().trim_end_matches('.').parse().ok()?;
    (1..=candidates).contains(&choice).then(|| choice - 1)
}
