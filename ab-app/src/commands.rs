//! Slash commands, answered before a message reaches the router.

use crate::resolver::numbered_sources;
use crate::router::{RouterState, SessionRouter};
use ab_agent::AgentService;
use ab_channels::ConversationId;
use std::time::Duration;

pub const HELP_TEXT: &str = "Describe a coding task and I'll start an agent session on the matching repository.\n\
Commands:\n\
/new - forget the current session and start over\n\
/status - show what this chat is working on\n\
/sources - list the repositories the agent can work on\n\
/help - show this message";

pub async fn handle_command(
    router: &SessionRouter,
    service: &dyn AgentService,
    conversation: &ConversationId,
    input: &str,
    uptime: Duration,
) -> Option<String> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    // Group chats address commands as "/cmd@botname".
    let command = trimmed
        .split_whitespace()
        .next()
        .unwrap_or(trimmed)
        .split('@')
        .next()
        .unwrap_or(trimmed)
        .to_ascii_lowercase();

    match command.as_str() {
        "/start" | "/help" => Some(HELP_TEXT.to_string()),
        "/new" => match router.reset(conversation).await {
            RouterState::ActiveSession { session_id, .. } => Some(format!(
                "Session reset. No longer following session {session_id}."
            )),
            RouterState::PendingSelection { .. } => {
                Some("Session reset. Repository selection cancelled.".to_string())
            }
            RouterState::NoSession => Some("Session reset.".to_string()),
        },
        "/status" => {
            let state = match router.state_of(conversation) {
                RouterState::NoSession => "state=idle".to_string(),
                RouterState::PendingSelection { candidates } => {
                    format!("state=awaiting_selection\ncandidates={candidates}")
                }
                RouterState::ActiveSession { session_id, source } => format!(
                    "state=active\nsession_id={session_id}\nsource={source}\nmonitor_running={}",
                    router.monitors().is_running(&session_id)
                ),
            };
            Some(format!(
                "{state}\nactive_monitors={}\nuptime_seconds={}",
                router.monitors().active_count(),
                uptime.as_secs()
            ))
        }
        "/sources" => match service.list_sources().await {
            Ok(sources) if sources.is_empty() => {
                Some("No repositories are connected to the agent.".to_string())
            }
            Ok(sources) => Some(format!("Available repositories:\n{}", numbered_sources(&sources))),
            Err(error) => {
                tracing::warn!(%error, "listing sources failed");
                Some(format!("Error: {error}"))
            }
        },
        _ => Some("Unknown command. Supported: /new /status /sources /help".to_string()),
    }
}
