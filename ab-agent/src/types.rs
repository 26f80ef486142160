use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(SessionId);
id_newtype!(ActivityId);

/// A repository the remote agent can operate on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Resource name, e.g. `sources/github/acme/chat-app`.
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub github_repo: Option<GithubRepo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubRepo {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub default_branch: Option<GithubBranch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubBranch {
    #[serde(default)]
    pub display_name: String,
}

impl Source {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: String::new(),
            github_repo: None,
        }
    }

    /// Human-facing label: `owner/repo` for GitHub sources, else the last path segment.
    pub fn display_name(&self) -> String {
        if let Some(repo) = &self.github_repo {
            if !repo.owner.is_empty() && !repo.repo.is_empty() {
                return format!("{}/{}", repo.owner, repo.repo);
            }
        }
        let id = if self.id.is_empty() { &self.name } else { &self.id };
        id.rsplit('/').next().unwrap_or(id).to_string()
    }

    pub fn is_version_controlled(&self) -> bool {
        self.github_repo.is_some() || self.name.starts_with("sources/github/")
    }

    pub fn default_branch(&self) -> Option<&str> {
        self.github_repo
            .as_ref()
            .and_then(|repo| repo.default_branch.as_ref())
            .map(|branch| branch.display_name.as_str())
            .filter(|name| !name.is_empty())
    }
}

/// A remote task as returned by session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,
    /// Plans wait for an explicit approval before the agent proceeds.
    #[serde(default)]
    pub require_plan_approval: bool,
}

impl Session {
    pub fn session_id(&self) -> SessionId {
        if !self.id.is_empty() {
            return SessionId::new(self.id.clone());
        }
        SessionId::new(last_segment(&self.name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Originator {
    User,
    Agent,
    System,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    PullRequest {
        url: String,
        title: String,
        description: Option<String>,
    },
    Other,
}

/// Primary payload of an activity. A wire record carrying several payload
/// kinds decodes to the first of: plan, progress, outputs, completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityPayload {
    PlanGenerated {
        steps: Vec<PlanStep>,
    },
    ProgressUpdated {
        title: String,
        description: Option<String>,
    },
    Outputs {
        outputs: Vec<Output>,
    },
    SessionCompleted,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    BashOutput {
        command: String,
        output: String,
        exit_code: Option<i32>,
    },
    /// Base64 payload, decoded by whoever renders it.
    Media { mime_type: String, data: String },
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "WireActivity")]
pub struct Activity {
    pub id: ActivityId,
    pub originator: Originator,
    pub payload: ActivityPayload,
    pub artifacts: Vec<Artifact>,
    pub create_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPage {
    #[serde(default)]
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl ActivityPage {
    /// Absent or empty token: end of the currently available feed.
    pub fn next_token(&self) -> Option<&str> {
        self.next_page_token.as_deref().filter(|t| !t.is_empty())
    }
}

fn last_segment(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireActivity {
    #[serde(default)]
    name: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    originator: Option<Originator>,
    #[serde(default)]
    create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    plan_generated: Option<WirePlanGenerated>,
    #[serde(default)]
    progress_updated: Option<WireProgressUpdated>,
    #[serde(default)]
    outputs: Option<Vec<WireOutput>>,
    #[serde(default)]
    session_completed: Option<serde_json::Value>,
    #[serde(default)]
    artifacts: Vec<WireArtifact>,
}

#[derive(Debug, Deserialize)]
struct WirePlanGenerated {
    #[serde(default)]
    plan: WirePlan,
}

#[derive(Debug, Default, Deserialize)]
struct WirePlan {
    #[serde(default)]
    steps: Vec<WirePlanStep>,
}

#[derive(Debug, Deserialize)]
struct WirePlanStep {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    index: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireProgressUpdated {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOutput {
    #[serde(default)]
    pull_request: Option<WirePullRequest>,
}

#[derive(Debug, Deserialize)]
struct WirePullRequest {
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireArtifact {
    #[serde(default)]
    bash_output: Option<WireBashOutput>,
    #[serde(default)]
    media: Option<WireMedia>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBashOutput {
    #[serde(default)]
    command: String,
    #[serde(default)]
    output: String,
    #[serde(default)]
    exit_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMedia {
    #[serde(default)]
    data: String,
    #[serde(default)]
    mime_type: String,
}

impl From<WireActivity> for Activity {
    fn from(wire: WireActivity) -> Self {
        let id = if wire.id.is_empty() {
            last_segment(&wire.name).to_string()
        } else {
            wire.id
        };

        let payload = if let Some(plan) = wire.plan_generated {
            let mut steps = plan.plan.steps;
            steps.sort_by_key(|step| step.index.unwrap_or(i64::MAX));
            ActivityPayload::PlanGenerated {
                steps: steps
                    .into_iter()
                    .map(|step| PlanStep {
                        title: step.title,
                        description: step.description.filter(|d| !d.trim().is_empty()),
                    })
                    .collect(),
            }
        } else if let Some(progress) = wire.progress_updated {
            ActivityPayload::ProgressUpdated {
                title: progress.title,
                description: progress.description,
            }
        } else if let Some(outputs) = wire.outputs {
            ActivityPayload::Outputs {
                outputs: outputs
                    .into_iter()
                    .map(|output| match output.pull_request {
                        Some(pr) => Output::PullRequest {
                            url: pr.url,
                            title: pr.title,
                            description: pr.description,
                        },
                        None => Output::Other,
                    })
                    .collect(),
            }
        } else if wire.session_completed.is_some() {
            ActivityPayload::SessionCompleted
        } else {
            ActivityPayload::Other
        };

        let artifacts = wire
            .artifacts
            .into_iter()
            .map(|artifact| {
                if let Some(bash) = artifact.bash_output {
                    Artifact::BashOutput {
                        command: bash.command,
                        output: bash.output,
                        exit_code: bash.exit_code,
                    }
                } else if let Some(media) = artifact.media {
                    Artifact::Media {
                        mime_type: media.mime_type,
                        data: media.data,
                    }
                } else {
                    Artifact::Other
                }
            })
            .collect();

        Activity {
            id: ActivityId::new(id),
            originator: wire.originator.unwrap_or(Originator::Unknown),
            payload,
            artifacts,
            create_time: wire.create_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: serde_json::Value) -> Activity {
        serde_json::from_value(value).expect("decode activity")
    }

    #[test]
    fn plan_wins_over_outputs_when_both_are_present() {
        let activity = decode(json!({
            "name": "sessions/1/activities/a1",
            "originator": "agent",
            "planGenerated": {"plan": {"steps": [{"title": "Write code", "index": 0}]}},
            "outputs": [{"pullRequest": {"url": "https://example.test/pr/1", "title": "PR"}}]
        }));
        assert!(matches!(activity.payload, ActivityPayload::PlanGenerated { .. }));
    }

    #[test]
    fn plan_steps_are_ordered_by_index() {
        let activity = decode(json!({
            "id": "a1",
            "planGenerated": {"plan": {"steps": [
                {"title": "second", "index": 1},
                {"title": "first", "index": 0}
            ]}}
        }));
        let ActivityPayload::PlanGenerated { steps } = activity.payload else {
            panic!("expected plan payload");
        };
        let titles: Vec<&str> = steps.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["first", "second"]);
    }

    #[test]
    fn id_falls_back_to_last_name_segment() {
        let activity = decode(json!({"name": "sessions/9/activities/xyz"}));
        assert_eq!(activity.id.as_str(), "xyz");
        assert_eq!(activity.originator, Originator::Unknown);
        assert_eq!(activity.payload, ActivityPayload::Other);
    }

    #[test]
    fn unknown_originator_and_artifact_kinds_decode_without_error() {
        let activity = decode(json!({
            "id": "a2",
            "originator": "robot",
            "sessionCompleted": {},
            "artifacts": [
                {"changeSet": {"source": "sources/github/a/b"}},
                {"bashOutput": {"command": "ls", "output": "src", "exitCode": 0}},
                {"media": {"data": "aGk=", "mimeType": "image/png"}}
            ]
        }));
        assert_eq!(activity.originator, Originator::Unknown);
        assert_eq!(activity.payload, ActivityPayload::SessionCompleted);
        assert_eq!(activity.artifacts.len(), 3);
        assert_eq!(activity.artifacts[0], Artifact::Other);
        assert!(matches!(
            activity.artifacts[1],
            Artifact::BashOutput { exit_code: Some(0), .. }
        ));
    }

    #[test]
    fn page_treats_empty_token_as_end_of_feed() {
        let page: ActivityPage =
            serde_json::from_value(json!({"activities": [], "nextPageToken": ""}))
                .expect("decode page");
        assert!(page.next_token().is_none());
    }

    #[test]
    fn source_display_name_prefers_owner_and_repo() {
        let source: Source = serde_json::from_value(json!({
            "name": "sources/github/acme/chat-app",
            "id": "github/acme/chat-app",
            "githubRepo": {"owner": "acme", "repo": "chat-app", "defaultBranch": {"displayName": "trunk"}}
        }))
        .expect("decode source");
        assert_eq!(source.display_name(), "acme/chat-app");
        assert_eq!(source.default_branch(), Some("trunk"));
        assert!(source.is_version_controlled());

        let bare = Source::named("repo-a");
        assert_eq!(bare.display_name(), "repo-a");
        assert!(!bare.is_version_controlled());
    }

    #[test]
    fn session_id_uses_id_then_name() {
        let session: Session =
            serde_json::from_value(json!({"name": "sessions/42"})).expect("decode session");
        assert_eq!(session.session_id().as_str(), "42");
        assert!(!session.require_plan_approval);
    }

    #[test]
    fn session_without_id_or_name_has_empty_id() {
        let session: Session = serde_json::from_str("{}").expect("decode session");
        assert!(session.session_id().is_empty());
    }
}
