use crate::error::Result;
use crate::types::{ActivityPage, Session, SessionId, Source};
use async_trait::async_trait;

/// Operations of the remote agent service the bot depends on.
#[async_trait]
pub trait AgentService: Send + Sync {
    /// Every source available to the account, across all pages.
    async fn list_sources(&self) -> Result<Vec<Source>>;

    /// Start a remote task that auto-produces a pull request and, for
    /// version-controlled sources, waits for plan approval.
    async fn create_session(&self, source: &Source, instruction: &str) -> Result<Session>;

    /// Append a user turn. Fails with a not-found error once the session expired.
    async fn send_message(&self, session_id: &SessionId, text: &str) -> Result<()>;

    async fn approve_plan(&self, session_id: &SessionId) -> Result<()>;

    /// One page of the activity feed in creation order.
    async fn list_activities(
        &self,
        session_id: &SessionId,
        page_token: Option<&str>,
    ) -> Result<ActivityPage>;
}
