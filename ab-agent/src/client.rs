use crate::error::{AgentError, Result};
use crate::traits::AgentService;
use crate::types::{ActivityPage, Session, SessionId, Source};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

const API_KEY_HEADER: &str = "X-Goog-Api-Key";
const AUTOMATION_MODE_AUTO_CREATE_PR: &str = "AUTO_CREATE_PR";
const DEFAULT_STARTING_BRANCH: &str = "main";
const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_SOURCE_PAGES: usize = 20;
const SESSION_TITLE_MAX_CHARS: usize = 80;

#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    default_branch: String,
    require_plan_approval: bool,
    page_size: u32,
}

impl AgentClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(AgentError::InvalidInput(
                "agent service api key is required".to_string(),
            ));
        }
        Url::parse(base_url)
            .map_err(|e| AgentError::InvalidInput(format!("invalid base url {base_url:?}: {e}")))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            default_branch: DEFAULT_STARTING_BRANCH.to_string(),
            require_plan_approval: true,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        let branch = branch.into();
        if !branch.trim().is_empty() {
            self.default_branch = branch;
        }
        self
    }

    pub fn with_require_plan_approval(mut self, require: bool) -> Self {
        self.require_plan_approval = require;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
            .query(query)
            .send()
            .await?;
        handle_response(response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .http
            .post(self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await?;
        handle_response(response).await
    }

    fn create_session_body(&self, source: &Source, instruction: &str) -> serde_json::Value {
        let mut source_context = serde_json::json!({ "source": source.name });
        if source.is_version_controlled() {
            let branch = source.default_branch().unwrap_or(&self.default_branch);
            source_context["githubRepoContext"] = serde_json::json!({ "startingBranch": branch });
        }
        let mut body = serde_json::json!({
            "prompt": instruction,
            "title": session_title(instruction),
            "sourceContext": source_context,
            "automationMode": AUTOMATION_MODE_AUTO_CREATE_PR,
        });
        if self.require_plan_approval && source.is_version_controlled() {
            body["requirePlanApproval"] = serde_json::Value::Bool(true);
        }
        body
    }
}

#[async_trait]
impl AgentService for AgentClient {
    #[tracing::instrument(level = "info", skip_all)]
    async fn list_sources(&self) -> Result<Vec<Source>> {
        let mut sources = Vec::new();
        let mut page_token: Option<String> = None;
        for _ in 0..MAX_SOURCE_PAGES {
            let mut query = vec![("pageSize", self.page_size.to_string())];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }
            let page: SourcePage = self.get_json("sources", &query).await?;
            sources.extend(page.sources);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        tracing::debug!(count = sources.len(), "listed agent sources");
        Ok(sources)
    }

    #[tracing::instrument(level = "info", skip_all, fields(source = %source.name))]
    async fn create_session(&self, source: &Source, instruction: &str) -> Result<Session> {
        if instruction.trim().is_empty() {
            return Err(AgentError::InvalidInput(
                "session instruction must not be empty".to_string(),
            ));
        }
        let body = self.create_session_body(source, instruction);
        let session: Session = self.post_json("sessions", &body).await?;
        let session = checked_session(session, body.get("requirePlanApproval").is_some())?;
        tracing::info!(
            session_id = %session.session_id(),
            require_plan_approval = session.require_plan_approval,
            "agent session created"
        );
        Ok(session)
    }

    #[tracing::instrument(level = "info", skip_all, fields(session_id = %session_id))]
    async fn send_message(&self, session_id: &SessionId, text: &str) -> Result<()> {
        let body = serde_json::json!({ "prompt": text });
        let _: serde_json::Value = self
            .post_json(&format!("{}:sendMessage", session_path(session_id)), &body)
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all, fields(session_id = %session_id))]
    async fn approve_plan(&self, session_id: &SessionId) -> Result<()> {
        let _: serde_json::Value = self
            .post_json(
                &format!("{}:approvePlan", session_path(session_id)),
                &serde_json::json!({}),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(session_id = %session_id))]
    async fn list_activities(
        &self,
        session_id: &SessionId,
        page_token: Option<&str>,
    ) -> Result<ActivityPage> {
        let mut query = vec![("pageSize", self.page_size.to_string())];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        self.get_json(&format!("{}/activities", session_path(session_id)), &query)
            .await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourcePage {
    #[serde(default)]
    sources: Vec<Source>,
    #[serde(default)]
    next_page_token: Option<String>,
}

async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(AgentError::Remote {
            status: status.as_u16(),
            body,
        });
    }
    // Action endpoints may answer with an empty body.
    let body = if body.trim().is_empty() { "{}" } else { body.as_str() };
    Ok(serde_json::from_str(body)?)
}

/// Rejects a created session the service gave no id, and records whether
/// its plans were requested to wait for approval.
fn checked_session(mut session: Session, approval_requested: bool) -> Result<Session> {
    if session.session_id().is_empty() {
        return Err(AgentError::ResponseFormat(
            "created session carries neither id nor name".to_string(),
        ));
    }
    session.require_plan_approval |= approval_requested;
    Ok(session)
}

fn session_path(session_id: &SessionId) -> String {
    let id = session_id.as_str();
    if id.starts_with("sessions/") {
        id.to_string()
    } else {
        format!("sessions/{id}")
    }
}

fn session_title(instruction: &str) -> String {
    let first_line = instruction.lines().next().unwrap_or_default().trim();
    if first_line.chars().count() <= SESSION_TITLE_MAX_CHARS {
        return first_line.to_string();
    }
    let mut title: String = first_line.chars().take(SESSION_TITLE_MAX_CHARS - 1).collect();
    title.push('…');
    title
}
