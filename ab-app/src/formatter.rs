//! Renders agent activities as chat notifications.

use ab_agent::{Activity, ActivityPayload, Artifact, Output};
use ab_channels::Attachment;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;

pub const PLAN_ANNOUNCEMENT: &str = "The agent proposed a plan:";
pub const SESSION_COMPLETED_TEXT: &str = "The session is complete.";
const BASH_OUTPUT_MAX_CHARS: usize = 1500;

/// What an activity was classified as. Drives the monitor's waiting flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Plan,
    Progress,
    Outputs,
    Completed,
    /// No primary payload; content comes from attached artifacts only.
    Artifacts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

pub fn format_activity(activity: &Activity) -> Option<Notification> {
    let (kind, primary) = match &activity.payload {
        ActivityPayload::PlanGenerated { steps } => {
            let mut text = PLAN_ANNOUNCEMENT.to_string();
            for (idx, step) in steps.iter().enumerate() {
                text.push_str(&format!("\n{}. {}", idx + 1, step.title.trim()));
            }
            (NotificationKind::Plan, Some(text))
        }
        ActivityPayload::ProgressUpdated { title, description } => {
            let title = title.trim();
            let mut text = title.to_string();
            if let Some(description) = description.as_deref().map(str::trim) {
                if !description.is_empty() && description != title {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(description);
                }
            }
            (NotificationKind::Progress, Some(text).filter(|t| !t.is_empty()))
        }
        ActivityPayload::Outputs { outputs } => {
            let text = outputs.iter().find_map(|output| match output {
                Output::PullRequest { url, title, .. } => {
                    Some(format!("Pull request ready: {}\n{}", title.trim(), url.trim()))
                }
                Output::Other => None,
            });
            (NotificationKind::Outputs, text)
        }
        ActivityPayload::SessionCompleted => (
            NotificationKind::Completed,
            Some(SESSION_COMPLETED_TEXT.to_string()),
        ),
        ActivityPayload::Other => (NotificationKind::Artifacts, None),
    };

    let mut sections: Vec<String> = primary.into_iter().collect();
    let mut attachments = Vec::new();
    for artifact in &activity.artifacts {
        match artifact {
            Artifact::BashOutput {
                command,
                output,
                exit_code,
            } => sections.push(render_bash_output(command, output, *exit_code)),
            Artifact::Media { mime_type, data } => {
                let Ok(decoded) = STANDARD.decode(data.trim()) else {
                    tracing::debug!(activity_id = %activity.id, "skipping undecodable media artifact");
                    continue;
                };
                let attachment = Attachment {
                    name: format!(
                        "{}-{}.{}",
                        activity.id,
                        attachments.len() + 1,
                        extension_for(mime_type)
                    ),
                    content_type: if mime_type.is_empty() {
                        "application/octet-stream".to_string()
                    } else {
                        mime_type.clone()
                    },
                    data: Bytes::from(decoded),
                };
                sections.push(media_caption(&attachment));
                attachments.push(attachment);
            }
            Artifact::Other => {}
        }
    }

    if sections.is_empty() && attachments.is_empty() {
        return None;
    }

    Some(Notification {
        kind,
        text: sections.join("\n\n"),
        attachments,
    })
}

fn render_bash_output(command: &str, output: &str, exit_code: Option<i32>) -> String {
    let output = output.trim_end();
    let mut body = format!("$ {}", command.trim());
    if !output.is_empty() {
        body.push('\n');
        let total = output.chars().count();
        if total > BASH_OUTPUT_MAX_CHARS {
            body.extend(output.chars().take(BASH_OUTPUT_MAX_CHARS));
            body.push_str(&format!("\n… ({} more characters)", total - BASH_OUTPUT_MAX_CHARS));
        } else {
            body.push_str(output);
        }
    }
    if let Some(code) = exit_code.filter(|code| *code != 0) {
        body.push_str(&format!("\n[exit code {code}]"));
    }
    format!("```\n{body}\n```")
}

fn media_caption(attachment: &Attachment) -> String {
    if attachment.is_image() {
        "(screenshot attached)".to_string()
    } else {
        format!("(file attached: {})", attachment.name)
    }
}

fn extension_for(mime_type: &str) -> &str {
    match mime_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "text/plain" => "txt",
        "application/json" => "json",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ab_agent::{ActivityId, Originator, PlanStep};

    fn activity(payload: ActivityPayload, artifacts: Vec<Artifact>) -> Activity {
        Activity {
            id: ActivityId::new("a1"),
            originator: Originator::Agent,
            payload,
            artifacts,
            create_time: None,
        }
    }

    fn step(title: &str) -> PlanStep {
        PlanStep {
            title: title.to_string(),
            description: None,
        }
    }

    #[test]
    fn plan_renders_numbered_steps_after_announcement() {
        let n = format_activity(&activity(
            ActivityPayload::PlanGenerated {
                steps: vec![step("Read the code"), step("Fix the bug")],
            },
            vec![],
        ))
        .expect("plan notification");
        assert_eq!(n.kind, NotificationKind::Plan);
        assert_eq!(
            n.text,
            format!("{PLAN_ANNOUNCEMENT}\n1. Read the code\n2. Fix the bug")
        );
        assert!(n.attachments.is_empty());
    }

    #[test]
    fn progress_appends_description_only_when_different() {
        let same = format_activity(&activity(
            ActivityPayload::ProgressUpdated {
                title: "Running tests".to_string(),
                description: Some("Running tests".to_string()),
            },
            vec![],
        ))
        .expect("progress");
        assert_eq!(same.kind, NotificationKind::Progress);
        assert_eq!(same.text, "Running tests");

        let different = format_activity(&activity(
            ActivityPayload::ProgressUpdated {
                title: "Running tests".to_string(),
                description: Some("3 of 10 passed".to_string()),
            },
            vec![],
        ))
        .expect("progress");
        assert_eq!(different.text, "Running tests\n3 of 10 passed");
    }

    #[test]
    fn outputs_render_first_pull_request() {
        let n = format_activity(&activity(
            ActivityPayload::Outputs {
                outputs: vec![
                    Output::Other,
                    Output::PullRequest {
                        url: "https://example.test/pr/7".to_string(),
                        title: "Fix login".to_string(),
                        description: None,
                    },
                    Output::PullRequest {
                        url: "https://example.test/pr/8".to_string(),
                        title: "Second".to_string(),
                        description: None,
                    },
                ],
            },
            vec![],
        ))
        .expect("outputs");
        assert_eq!(n.kind, NotificationKind::Outputs);
        assert!(n.text.contains("https://example.test/pr/7"));
        assert!(n.text.contains("Fix login"));
        assert!(!n.text.contains("pr/8"));
    }

    #[test]
    fn outputs_without_pull_request_and_without_artifacts_is_none() {
        let n = format_activity(&activity(
            ActivityPayload::Outputs {
                outputs: vec![Output::Other],
            },
            vec![],
        ));
        assert!(n.is_none());
    }

    #[test]
    fn outputs_without_pull_request_still_render_artifacts() {
        let n = format_activity(&activity(
            ActivityPayload::Outputs { outputs: vec![] },
            vec![Artifact::BashOutput {
                command: "git status".to_string(),
                output: "clean".to_string(),
                exit_code: Some(0),
            }],
        ))
        .expect("artifact content");
        assert_eq!(n.kind, NotificationKind::Outputs);
        assert_eq!(n.text, "```\n$ git status\nclean\n```");
    }

    #[test]
    fn completed_uses_fixed_text() {
        let n = format_activity(&activity(ActivityPayload::SessionCompleted, vec![]))
            .expect("completed");
        assert_eq!(n.kind, NotificationKind::Completed);
        assert_eq!(n.text, SESSION_COMPLETED_TEXT);
    }

    #[test]
    fn unrecognized_payload_without_artifacts_is_none() {
        assert!(format_activity(&activity(ActivityPayload::Other, vec![])).is_none());
        assert!(format_activity(&activity(ActivityPayload::Other, vec![Artifact::Other])).is_none());
    }

    #[test]
    fn media_is_decoded_into_attachment_with_caption() {
        let n = format_activity(&activity(
            ActivityPayload::Other,
            vec![Artifact::Media {
                mime_type: "image/png".to_string(),
                data: STANDARD.encode(b"png-bytes"),
            }],
        ))
        .expect("media notification");
        assert_eq!(n.kind, NotificationKind::Artifacts);
        assert_eq!(n.attachments.len(), 1);
        assert_eq!(n.attachments[0].data.as_ref(), b"png-bytes");
        assert_eq!(n.attachments[0].name, "a1-1.png");
        assert_eq!(n.text, "(screenshot attached)");
    }

    #[test]
    fn undecodable_media_is_skipped() {
        let n = format_activity(&activity(
            ActivityPayload::Other,
            vec![Artifact::Media {
                mime_type: "image/png".to_string(),
                data: "%%% not base64 %%%".to_string(),
            }],
        ));
        assert!(n.is_none());
    }

    #[test]
    fn bash_output_is_truncated_and_reports_failures() {
        let long = "x".repeat(BASH_OUTPUT_MAX_CHARS + 10);
        let rendered = render_bash_output("cargo test", &long, Some(101));
        assert!(rendered.starts_with("```\n$ cargo test\n"));
        assert!(rendered.contains("… (10 more characters)"));
        assert!(rendered.contains("[exit code 101]"));
        assert!(rendered.ends_with("\n```"));
    }

    #[test]
    fn record_with_plan_and_outputs_formats_as_plan() {
        let decoded: Activity = serde_json::from_value(serde_json::json!({
            "id": "both",
            "originator": "agent",
            "planGenerated": {"plan": {"steps": [{"title": "Step one", "index": 0}]}},
            "outputs": [{"pullRequest": {"url": "https://example.test/pr/1", "title": "PR"}}]
        }))
        .expect("decode activity");
        let n = format_activity(&decoded).expect("notification");
        assert_eq!(n.kind, NotificationKind::Plan);
        assert!(!n.text.contains("https://example.test/pr/1"));
    }

    #[test]
    fn formatting_is_deterministic() {
        let a = activity(
            ActivityPayload::ProgressUpdated {
                title: "t".to_string(),
                description: None,
            },
            vec![],
        );
        assert_eq!(format_activity(&a), format_activity(&a));
    }
}
