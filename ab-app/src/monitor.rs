//! Session monitor: turns a remote session's activity feed into chat
//! notifications.
//!
//! A run starts by backfilling (recording every existing activity without
//! announcing it) unless it is seeded with the seen-set of a previous run,
//! then polls until the session completes, the wall-clock budget runs out,
//! or the run is cancelled.

use crate::config::MonitorSettings;
use crate::formatter::{self, NotificationKind};
use crate::resolver::{Direction, TextTransform};
use ab_agent::{Activity, ActivityId, ActivityPayload, AgentService, Originator, SessionId};
use ab_channels::{ActionButton, OutboundMessage};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Upper bound on pages followed by one backfill or poll.
const MAX_PAGES_PER_FETCH: usize = 200;

pub const APPROVE_ACTION_PREFIX: &str = "approve:";
pub const APPROVE_BUTTON_LABEL: &str = "Approve plan";

const FILLER_PHRASES: &[&str] = &[
    "Still working on it.",
    "The agent is busy on your request. I'll report back soon.",
    "Hang tight, work is in progress.",
    "Still on it. Updates will show up here as they happen.",
    "The agent hasn't finished yet. Thanks for waiting.",
];

pub type SeenSet = HashSet<ActivityId>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Wall-clock budget of one run, backfill included.
    pub timeout: Duration,
    pub idle_threshold: Duration,
}

impl From<&MonitorSettings> for MonitorConfig {
    fn from(settings: &MonitorSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            timeout: settings.timeout(),
            idle_threshold: settings.idle_threshold(),
        }
    }
}

/// Where a run's notifications go. Delivery failures are logged by the
/// monitor and never end the run.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, message: OutboundMessage) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub struct MonitorOutcome {
    /// Everything observed during the run; seeds the next continuation.
    pub seen: SeenSet,
    pub reason: StopReason,
}

/// Effect of one activity on the waiting flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Waiting(bool),
    Terminate,
    Unchanged,
}

pub(crate) fn transition_for(payload: &ActivityPayload) -> Transition {
    match payload {
        ActivityPayload::PlanGenerated { .. } | ActivityPayload::Outputs { .. } => {
            Transition::Waiting(false)
        }
        ActivityPayload::ProgressUpdated { .. } => Transition::Waiting(true),
        ActivityPayload::SessionCompleted => Transition::Terminate,
        ActivityPayload::Other => Transition::Unchanged,
    }
}

pub fn approve_action_id(session_id: &SessionId) -> String {
    format!("{APPROVE_ACTION_PREFIX}{session_id}")
}

/// Inverse of [`approve_action_id`].
pub fn parse_approve_action(action_id: &str) -> Option<SessionId> {
    action_id
        .strip_prefix(APPROVE_ACTION_PREFIX)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(SessionId::new)
}

fn filler_phrase() -> &'static str {
    FILLER_PHRASES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(FILLER_PHRASES[0])
}

pub struct SessionMonitor {
    service: Arc<dyn AgentService>,
    transform: Arc<dyn TextTransform>,
    config: MonitorConfig,
}

impl SessionMonitor {
    pub fn new(
        service: Arc<dyn AgentService>,
        transform: Arc<dyn TextTransform>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            service,
            transform,
            config,
        }
    }

    /// Records every activity currently in the feed without emitting anything.
    /// Errors end the pass early; whatever was gathered is kept.
    #[tracing::instrument(level = "info", skip_all, fields(session_id = %session_id))]
    pub async fn backfill(&self, session_id: &SessionId) -> SeenSet {
        let mut seen = SeenSet::new();
        let mut token: Option<String> = None;
        for _ in 0..MAX_PAGES_PER_FETCH {
            let page = match self
                .service
                .list_activities(session_id, token.as_deref())
                .await
            {
                Ok(page) => page,
                Err(error) => {
                    tracing::warn!(%error, recorded = seen.len(), "backfill stopped early");
                    break;
                }
            };
            seen.extend(page.activities.iter().map(|a| a.id.clone()));
            match page.next_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        tracing::debug!(recorded = seen.len(), "backfill complete");
        seen
    }

    /// Plans get an approve button only when `plan_gated` is set, since an
    /// ungated session rejects approvals.
    #[tracing::instrument(level = "info", skip_all, fields(session_id = %session_id, seeded = seed.is_some(), plan_gated = plan_gated))]
    pub async fn run(
        &self,
        session_id: SessionId,
        plan_gated: bool,
        sink: Arc<dyn NotificationSink>,
        seed: Option<SeenSet>,
        cancel: CancellationToken,
    ) -> MonitorOutcome {
        let started = Instant::now();
        let deadline = started + self.config.timeout;

        let mut seen = match seed {
            Some(seen) => seen,
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return MonitorOutcome { seen: SeenSet::new(), reason: StopReason::Cancelled };
                    }
                    seen = self.backfill(&session_id) => seen,
                }
            }
        };

        let mut cursor: Option<String> = None;
        let mut waiting = true;
        let mut last_heard = Instant::now();

        let reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if Instant::now() >= deadline {
                break StopReason::TimedOut;
            }

            let fetched = tokio::select! {
                _ = cancel.cancelled() => break StopReason::Cancelled,
                _ = tokio::time::sleep_until(deadline) => break StopReason::TimedOut,
                fetched = self.fetch_new(&session_id, &mut cursor) => fetched,
            };

            let fresh: Vec<Activity> = fetched
                .into_iter()
                .filter(|a| !seen.contains(&a.id))
                .collect();

            if fresh.is_empty() {
                if waiting && last_heard.elapsed() >= self.config.idle_threshold {
                    let text = self
                        .transform
                        .translate(filler_phrase(), Direction::ToUser)
                        .await;
                    deliver(sink.as_ref(), OutboundMessage::text(text)).await;
                    last_heard = Instant::now();
                }
            } else {
                last_heard = Instant::now();
                let mut terminate = false;
                for activity in fresh {
                    // Pages may repeat an id; first occurrence wins.
                    if !seen.insert(activity.id.clone()) {
                        continue;
                    }
                    if self
                        .surface(&session_id, plan_gated, &activity, sink.as_ref(), &mut waiting)
                        .await
                    {
                        terminate = true;
                        break;
                    }
                }
                if terminate {
                    break StopReason::Completed;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break StopReason::Cancelled,
                _ = tokio::time::sleep_until(deadline) => break StopReason::TimedOut,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        };

        tracing::info!(
            reason = ?reason,
            seen = seen.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "monitor run finished"
        );
        MonitorOutcome { seen, reason }
    }

    /// Reads from the cursor page to the end of the feed. The cursor is left
    /// at the last page read so the next poll re-reads only that page onward.
    /// Errors are logged and yield whatever was read before them.
    async fn fetch_new(&self, session_id: &SessionId, cursor: &mut Option<String>) -> Vec<Activity> {
        let mut out = Vec::new();
        let mut token = cursor.clone();
        for _ in 0..MAX_PAGES_PER_FETCH {
            match self
                .service
                .list_activities(session_id, token.as_deref())
                .await
            {
                Ok(page) => {
                    *cursor = token.clone();
                    let next = page.next_token().map(str::to_string);
                    out.extend(page.activities);
                    match next {
                        Some(next) => token = Some(next),
                        None => break,
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, cursored = token.is_some(), "activity poll failed");
                    if token.is_some() && out.is_empty() {
                        // Stale cursor; start over from the first page next time.
                        *cursor = None;
                    }
                    break;
                }
            }
        }
        out
    }

    /// Announces one newly seen activity. Returns true when the run must end.
    #[tracing::instrument(level = "debug", skip_all, fields(activity_id = %activity.id))]
    async fn surface(
        &self,
        session_id: &SessionId,
        plan_gated: bool,
        activity: &Activity,
        sink: &dyn NotificationSink,
        waiting: &mut bool,
    ) -> bool {
        if activity.originator == Originator::User {
            tracing::debug!("skipping user-authored activity");
            return false;
        }

        let transition = transition_for(&activity.payload);
        if let Transition::Waiting(value) = transition {
            *waiting = value;
        }

        if let Some(notification) = formatter::format_activity(activity) {
            let text = if notification.text.is_empty() {
                notification.text
            } else {
                self.transform
                    .translate(&notification.text, Direction::ToUser)
                    .await
            };
            let mut message = OutboundMessage::text(text).with_attachments(notification.attachments);
            if plan_gated && notification.kind == NotificationKind::Plan {
                message = message.with_action(ActionButton {
                    id: approve_action_id(session_id),
                    label: APPROVE_BUTTON_LABEL.to_string(),
                });
            }
            deliver(sink, message).await;
        } else {
            tracing::debug!("activity has nothing to announce");
        }

        transition == Transition::Terminate
    }
}

async fn deliver(sink: &dyn NotificationSink, message: OutboundMessage) {
    if let Err(error) = sink.deliver(message).await {
        tracing::warn!(%error, "notification delivery failed");
    }
}
