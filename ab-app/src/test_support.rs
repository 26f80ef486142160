//! In-process fakes shared by the unit tests.

use crate::monitor::{MonitorConfig, NotificationSink};
use crate::resolver::{Direction, SourceMatch, TextTransform};
use ab_agent::{
    Activity, ActivityId, ActivityPage, ActivityPayload, AgentError, AgentService, Originator,
    Output, PlanStep, Session, SessionId, Source,
};
use ab_channels::OutboundMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

const PAGE_SIZE: usize = 2;

/// Agent service backed by in-memory feeds. Page tokens are offsets.
#[derive(Default)]
pub struct FakeAgentService {
    pub sources: Mutex<Vec<Source>>,
    feeds: Mutex<HashMap<String, Vec<Activity>>>,
    pub created: Mutex<Vec<(String, String)>>,
    pub sent: Mutex<Vec<(SessionId, String)>>,
    pub approved: Mutex<Vec<SessionId>>,
    pub list_calls: AtomicU32,
    /// Number of upcoming `list_activities` calls that fail.
    pub failing_polls: AtomicU32,
    pub sessions_expired: AtomicBool,
    pub send_fails: AtomicBool,
    pub approve_fails: AtomicBool,
    next_session: AtomicU32,
}

impl FakeAgentService {
    pub fn with_sources(names: &[&str]) -> Self {
        let service = Self::default();
        *service.sources.lock().expect("sources lock") =
            names.iter().map(|name| Source::named(*name)).collect();
        service
    }

    pub fn push(&self, session_id: &str, activity: Activity) {
        self.feeds
            .lock()
            .expect("feeds lock")
            .entry(session_id.to_string())
            .or_default()
            .push(activity);
    }

    pub fn created_sources(&self) -> Vec<String> {
        self.created
            .lock()
            .expect("created lock")
            .iter()
            .map(|(source, _)| source.clone())
            .collect()
    }
}

fn remote(status: u16, body: &str) -> AgentError {
    AgentError::Remote {
        status,
        body: body.to_string(),
    }
}

#[async_trait]
impl AgentService for FakeAgentService {
    async fn list_sources(&self) -> ab_agent::Result<Vec<Source>> {
        Ok(self.sources.lock().expect("sources lock").clone())
    }

    async fn create_session(&self, source: &Source, instruction: &str) -> ab_agent::Result<Session> {
        self.created
            .lock()
            .expect("created lock")
            .push((source.display_name(), instruction.to_string()));
        let n = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Session {
            name: format!("sessions/s{n}"),
            id: format!("s{n}"),
            title: instruction.to_string(),
            url: None,
            create_time: None,
            require_plan_approval: true,
        })
    }

    async fn send_message(&self, session_id: &SessionId, text: &str) -> ab_agent::Result<()> {
        if self.sessions_expired.load(Ordering::SeqCst) {
            return Err(remote(404, r#"{"error":{"status":"NOT_FOUND"}}"#));
        }
        if self.send_fails.load(Ordering::SeqCst) {
            return Err(remote(500, "internal"));
        }
        self.sent
            .lock()
            .expect("sent lock")
            .push((session_id.clone(), text.to_string()));
        Ok(())
    }

    async fn approve_plan(&self, session_id: &SessionId) -> ab_agent::Result<()> {
        if self.sessions_expired.load(Ordering::SeqCst) {
            return Err(remote(404, "session not found"));
        }
        if self.approve_fails.load(Ordering::SeqCst) {
            return Err(remote(503, "unavailable"));
        }
        self.approved
            .lock()
            .expect("approved lock")
            .push(session_id.clone());
        Ok(())
    }

    async fn list_activities(
        &self,
        session_id: &SessionId,
        page_token: Option<&str>,
    ) -> ab_agent::Result<ActivityPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_polls.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_polls.store(failing - 1, Ordering::SeqCst);
            return Err(remote(503, "unavailable"));
        }
        let feed = self
            .feeds
            .lock()
            .expect("feeds lock")
            .get(session_id.as_str())
            .cloned()
            .unwrap_or_default();
        let start = page_token
            .map(|t| t.parse::<usize>().expect("offset token"))
            .unwrap_or(0)
            .min(feed.len());
        let end = (start + PAGE_SIZE).min(feed.len());
        Ok(ActivityPage {
            activities: feed[start..end].to_vec(),
            next_page_token: (end < feed.len()).then(|| end.to_string()),
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub messages: Mutex<Vec<OutboundMessage>>,
}

impl RecordingSink {
    pub fn texts(&self) -> Vec<String> {
        self.messages
            .lock()
            .expect("messages lock")
            .iter()
            .map(|m| m.content.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, message: OutboundMessage) -> anyhow::Result<()> {
        self.messages.lock().expect("messages lock").push(message);
        Ok(())
    }
}

/// Returns a fixed source match and tags translated text.
pub struct ScriptedTransform {
    pub answer: Mutex<SourceMatch>,
}

impl ScriptedTransform {
    pub fn answering(answer: SourceMatch) -> Self {
        Self {
            answer: Mutex::new(answer),
        }
    }
}

#[async_trait]
impl TextTransform for ScriptedTransform {
    async fn translate(&self, text: &str, _direction: Direction) -> String {
        text.to_string()
    }

    async fn match_source(&self, _instruction: &str, _sources: &[Source]) -> SourceMatch {
        self.answer.lock().expect("answer lock").clone()
    }
}

pub fn fast_config() -> MonitorConfig {
    MonitorConfig {
        poll_interval: Duration::from_millis(10),
        timeout: Duration::from_secs(5),
        idle_threshold: Duration::from_secs(60),
    }
}

pub fn activity(id: &str, originator: Originator, payload: ActivityPayload) -> Activity {
    Activity {
        id: ActivityId::new(id),
        originator,
        payload,
        artifacts: vec![],
        create_time: None,
    }
}

pub fn progress(id: &str, title: &str) -> Activity {
    activity(
        id,
        Originator::Agent,
        ActivityPayload::ProgressUpdated {
            title: title.to_string(),
            description: None,
        },
    )
}

pub fn plan(id: &str, steps: &[&str]) -> Activity {
    activity(
        id,
        Originator::Agent,
        ActivityPayload::PlanGenerated {
            steps: steps
                .iter()
                .map(|title| PlanStep {
                    title: title.to_string(),
                    description: None,
                })
                .collect(),
        },
    )
}

pub fn pull_request(id: &str, url: &str) -> Activity {
    activity(
        id,
        Originator::Agent,
        ActivityPayload::Outputs {
            outputs: vec![Output::PullRequest {
                url: url.to_string(),
                title: "Change".to_string(),
                description: None,
            }],
        },
    )
}

pub fn completed(id: &str) -> Activity {
    activity(id, Originator::System, ActivityPayload::SessionCompleted)
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
