//! Text transforms backed by a language model: translation between the
//! user's and the agent's language, and matching free text to a source.

use crate::config::TranslationConfig;
use ab_agent::Source;
use ab_llm::LlmClient;
use async_trait::async_trait;
use serde::Deserialize;

pub const FALLBACK_CLARIFICATION: &str =
    "I couldn't tell which repository you meant. Reply with its number:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Agent output on its way to the chat.
    ToUser,
    /// User instructions on their way to the agent.
    ToAgent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceMatch {
    /// Zero-based index into the candidate list.
    Index(usize),
    Clarify(String),
}

/// Failures never escape: translation passes text through and matching
/// falls back to a clarification listing the candidates.
#[async_trait]
pub trait TextTransform: Send + Sync {
    async fn translate(&self, text: &str, direction: Direction) -> String;

    async fn match_source(&self, instruction: &str, sources: &[Source]) -> SourceMatch;
}

pub fn numbered_sources(sources: &[Source]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(idx, source)| format!("{}. {}", idx + 1, source.display_name()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn fallback_clarification(sources: &[Source]) -> String {
    format!("{FALLBACK_CLARIFICATION}\n{}", numbered_sources(sources))
}

/// Used when no language model is configured.
pub struct PassthroughTransform;

#[async_trait]
impl TextTransform for PassthroughTransform {
    async fn translate(&self, text: &str, _direction: Direction) -> String {
        text.to_string()
    }

    async fn match_source(&self, _instruction: &str, sources: &[Source]) -> SourceMatch {
        if sources.len() == 1 {
            return SourceMatch::Index(0);
        }
        SourceMatch::Clarify(fallback_clarification(sources))
    }
}

pub struct LlmTransform {
    llm: LlmClient,
    translation: Option<TranslationConfig>,
}

impl LlmTransform {
    pub fn new(llm: LlmClient, translation: &TranslationConfig) -> Self {
        Self {
            llm: llm.with_temperature(0.0),
            translation: translation.enabled.then(|| translation.clone()),
        }
    }

    fn languages(&self, direction: Direction) -> Option<(&str, &str)> {
        let cfg = self.translation.as_ref()?;
        Some(match direction {
            Direction::ToUser => (cfg.agent_language.as_str(), cfg.user_language.as_str()),
            Direction::ToAgent => (cfg.user_language.as_str(), cfg.agent_language.as_str()),
        })
    }

    fn reply_language(&self) -> &str {
        self.translation
            .as_ref()
            .map(|cfg| cfg.user_language.as_str())
            .unwrap_or("the language of the request")
    }
}

#[async_trait]
impl TextTransform for LlmTransform {
    #[tracing::instrument(level = "debug", skip_all, fields(direction = ?direction))]
    async fn translate(&self, text: &str, direction: Direction) -> String {
        let Some((from, to)) = self.languages(direction) else {
            return text.to_string();
        };
        if text.trim().is_empty() {
            return text.to_string();
        }
        let system = format!(
            "Translate the user's text from {from} to {to}. Keep URLs, code blocks, \
             file paths, and numbering unchanged. Reply with the translation only."
        );
        match self.llm.complete(&system, text).await {
            Ok(translated) if !translated.trim().is_empty() => translated.trim().to_string(),
            Ok(_) => text.to_string(),
            Err(error) => {
                tracing::warn!(%error, "translation failed; passing text through");
                text.to_string()
            }
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(candidates = sources.len()))]
    async fn match_source(&self, instruction: &str, sources: &[Source]) -> SourceMatch {
        let system = format!(
            "You route coding requests to repositories. Candidates, zero-based:\n{}\n\n\
             Reply with JSON only: {{\"match_index\": <number or null>, \"reply\": <string>}}. \
             Set match_index only when the request clearly refers to one repository. \
             Otherwise set it to null and write in reply, in {}, a short question asking \
             which repository to use, listing the candidates numbered from 1.",
            sources
                .iter()
                .enumerate()
                .map(|(idx, source)| format!("{idx}: {}", source.display_name()))
                .collect::<Vec<_>>()
                .join("\n"),
            self.reply_language(),
        );
        match self.llm.complete(&system, instruction).await {
            Ok(reply) => parse_match_reply(&reply, sources.len()).unwrap_or_else(|| {
                tracing::warn!(%reply, "unusable source match reply; asking the user");
                SourceMatch::Clarify(fallback_clarification(sources))
            }),
            Err(error) => {
                tracing::warn!(%error, "source matching failed; asking the user");
                SourceMatch::Clarify(fallback_clarification(sources))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct MatchReply {
    #[serde(default)]
    match_index: Option<i64>,
    #[serde(default)]
    reply: Option<String>,
}

/// Parses the model's JSON answer. Tolerates surrounding prose and code fences.
fn parse_match_reply(raw: &str, candidates: usize) -> Option<SourceMatch> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    let parsed: MatchReply = serde_json::from_str(&raw[start..=end]).ok()?;
    match parsed.match_index {
        Some(idx) if idx >= 0 && (idx as usize) < candidates => Some(SourceMatch::Index(idx as usize)),
        Some(_) => None,
        None => parsed
            .reply
            .map(|reply| reply.trim().to_string())
            .filter(|reply| !reply.is_empty())
            .map(SourceMatch::Clarify),
    }
}
