use crate::traits::ChannelAdapter;
use crate::types::{
    ActionButton, Attachment, InboundMessage, InboundMessageKind, MessageId, OutboundMessage,
};
use anyhow::Result;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message","callback_query"]"#;
const TELEGRAM_MAX_MESSAGE_CHARS: usize = 4096;
const TELEGRAM_MAX_CAPTION_CHARS: usize = 1024;
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    bot_token: String,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        if bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!("telegram bot token is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
        })
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "https://api.telegram.org/bot{}/{}",
            self.bot_token, method
        ))?)
    }

    async fn call(&self, method: &str, body: &serde_json::Value) -> Result<()> {
        let url = self.api_url(method)?;
        let resp = self.http.post(url).json(body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!(
                "telegram {method} failed: status={status} body={text}"
            ));
        }
        Ok(())
    }

    async fn send_attachment(&self, chat_id: &str, attachment: &Attachment) -> Result<()> {
        let (method, field) = if attachment.is_image() {
            ("sendPhoto", "photo")
        } else {
            ("sendDocument", "document")
        };
        let part = Part::bytes(attachment.data.to_vec())
            .file_name(attachment.name.clone())
            .mime_str(&attachment.content_type)?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text(
                "caption",
                truncate_chars(&attachment.name, TELEGRAM_MAX_CAPTION_CHARS),
            )
            .part(field, part);
        let url = self.api_url(method)?;
        let resp = self.http.post(url).multipart(form).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!(
                "telegram {method} failed: status={status} body={text}"
            ));
        }
        Ok(())
    }

    async fn answer_callback_query(&self, callback_query_id: &str) {
        let body = serde_json::json!({ "callback_query_id": callback_query_id });
        if let Err(error) = self.call("answerCallbackQuery", &body).await {
            tracing::warn!(%error, "telegram answerCallbackQuery failed");
        }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_poll_loop(tx).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        });
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(chat_id = %conversation_id))]
    async fn send(&self, conversation_id: &str, message: OutboundMessage) -> Result<()> {
        let chunks = split_message(&message.content, TELEGRAM_MAX_MESSAGE_CHARS);
        let last = chunks.len().saturating_sub(1);
        for (idx, chunk) in chunks.iter().enumerate() {
            let mut body = serde_json::json!({
                "chat_id": conversation_id,
                "text": chunk,
            });
            if idx == last && !message.actions.is_empty() {
                body["reply_markup"] = inline_keyboard(&message.actions);
            }
            self.call("sendMessage", &body).await?;
        }
        for attachment in &message.attachments {
            self.send_attachment(conversation_id, attachment).await?;
        }
        Ok(())
    }

    async fn edit(
        &self,
        conversation_id: &str,
        message_id: &MessageId,
        message: OutboundMessage,
    ) -> Result<()> {
        let message_id = message_id.as_str().parse::<i64>()?;
        // No text: keep the message body and only swap its buttons.
        if message.content.trim().is_empty() {
            let body = serde_json::json!({
                "chat_id": conversation_id,
                "message_id": message_id,
                "reply_markup": inline_keyboard(&message.actions),
            });
            return self.call("editMessageReplyMarkup", &body).await;
        }
        let body = serde_json::json!({
            "chat_id": conversation_id,
            "message_id": message_id,
            "text": truncate_chars(&message.content, TELEGRAM_MAX_MESSAGE_CHARS),
            "reply_markup": inline_keyboard(&message.actions),
        });
        self.call("editMessageText", &body).await
    }

    fn supports_actions(&self) -> bool {
        true
    }

    fn supports_attachments(&self) -> bool {
        true
    }
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response.json::<TelegramGetUpdatesResponse>().await {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result;
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                if let Some(callback) = update.callback_query.as_ref() {
                    self.answer_callback_query(&callback.id).await;
                }

                for inbound in build_inbound_messages(&update) {
                    tx.send(inbound)
                        .await
                        .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
                }
            }
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn inline_keyboard(actions: &[ActionButton]) -> serde_json::Value {
    let row: Vec<serde_json::Value> = actions
        .iter()
        .map(|action| {
            serde_json::json!({
                "text": action.label,
                "callback_data": action.id,
            })
        })
        .collect();
    if row.is_empty() {
        serde_json::json!({ "inline_keyboard": [] })
    } else {
        serde_json::json!({ "inline_keyboard": [row] })
    }
}

/// Splits text into chunks of at most `max_chars` characters, breaking on the
/// last newline inside a chunk when there is one. Always yields at least one chunk.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest: Vec<char> = text.chars().collect();
    while rest.len() > max_chars {
        let window = &rest[..max_chars];
        let cut = window
            .iter()
            .rposition(|c| *c == '\n')
            .filter(|pos| *pos > 0)
            .map(|pos| pos + 1)
            .unwrap_or(max_chars);
        chunks.push(rest[..cut].iter().collect::<String>());
        rest.drain(..cut);
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.into_iter().collect());
    }
    chunks
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn build_inbound_messages(update: &TelegramUpdate) -> Vec<InboundMessage> {
    let mut inbound = Vec::new();
    if let Some(message) = build_message_inbound(update.update_id, update.message.as_ref()) {
        inbound.push(message);
    }
    if let Some(action) = build_action_inbound(update.update_id, update.callback_query.as_ref()) {
        inbound.push(action);
    }
    inbound
}

fn build_message_inbound(
    update_id: i64,
    message: Option<&TelegramMessage>,
) -> Option<InboundMessage> {
    let message = message?;
    let chat = message.chat.as_ref()?;
    let content = extract_message_content(message)?;
    let sender_id = message
        .from
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| format!("chat:{}", chat.id));
    let message_id = message
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{update_id}:message"));

    Some(InboundMessage {
        kind: InboundMessageKind::Message,
        message_id: message_id.into(),
        channel_id: TELEGRAM_CHANNEL_ID.into(),
        conversation_id: chat.id.to_string().into(),
        sender_id: sender_id.into(),
        sender_is_bot: message.from.as_ref().is_some_and(|user| user.is_bot),
        content,
        received_at: Utc::now(),
    })
}

fn build_action_inbound(
    update_id: i64,
    callback: Option<&TelegramCallbackQuery>,
) -> Option<InboundMessage> {
    let callback = callback?;
    let data = callback
        .data
        .as_deref()
        .map(str::trim)
        .filter(|data| !data.is_empty())?;
    let message = callback.message.as_ref()?;
    let chat = message.chat.as_ref()?;
    let message_id = message
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{update_id}:callback"));

    Some(InboundMessage {
        kind: InboundMessageKind::Action,
        message_id: message_id.into(),
        channel_id: TELEGRAM_CHANNEL_ID.into(),
        conversation_id: chat.id.to_string().into(),
        sender_id: callback.from.id.to_string().into(),
        sender_is_bot: callback.from.is_bot,
        content: data.to_string(),
        received_at: Utc::now(),
    })
}

fn extract_message_content(message: &TelegramMessage) -> Option<String> {
    [message.text.as_deref(), message.caption.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(ToOwned::to_owned)
}

#[derive(Debug, Deserialize)]
struct TelegramGetUpdatesResponse {
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramCallbackQuery {
    id: String,
    from: TelegramUser,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(value: serde_json::Value) -> TelegramUpdate {
        serde_json::from_value(value).expect("decode update")
    }

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        assert_eq!(transient_retry_delay(1).as_millis(), 250);
        assert_eq!(transient_retry_delay(2).as_millis(), 500);
        assert_eq!(transient_retry_delay(3).as_millis(), 1000);
        assert_eq!(transient_retry_delay(20).as_millis(), 30000);
    }

    #[test]
    fn text_message_becomes_inbound_message_keyed_by_chat() {
        let inbound = build_inbound_messages(&update(serde_json::json!({
            "update_id": 10,
            "message": {
                "message_id": 5,
                "from": {"id": 99, "is_bot": false},
                "chat": {"id": -100, "type": "group"},
                "text": "  fix the tests  "
            }
        })));
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].kind, InboundMessageKind::Message);
        assert_eq!(inbound[0].conversation_id.as_str(), "-100");
        assert_eq!(inbound[0].sender_id.as_str(), "99");
        assert_eq!(inbound[0].content, "fix the tests");
        assert!(!inbound[0].sender_is_bot);
    }

    #[test]
    fn bot_authored_messages_are_flagged() {
        let inbound = build_inbound_messages(&update(serde_json::json!({
            "update_id": 11,
            "message": {
                "message_id": 6,
                "from": {"id": 1, "is_bot": true},
                "chat": {"id": 7},
                "text": "hello"
            }
        })));
        assert!(inbound[0].sender_is_bot);
    }

    #[test]
    fn callback_query_becomes_action_on_the_button_message() {
        let inbound = build_inbound_messages(&update(serde_json::json!({
            "update_id": 12,
            "callback_query": {
                "id": "cb1",
                "from": {"id": 99},
                "data": "approve:123",
                "message": {"message_id": 44, "chat": {"id": 7}, "text": "plan"}
            }
        })));
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].kind, InboundMessageKind::Action);
        assert_eq!(inbound[0].content, "approve:123");
        assert_eq!(inbound[0].message_id.as_str(), "44");
        assert_eq!(inbound[0].conversation_id.as_str(), "7");
    }

    #[test]
    fn messages_without_text_are_dropped() {
        let inbound = build_inbound_messages(&update(serde_json::json!({
            "update_id": 13,
            "message": {"message_id": 1, "chat": {"id": 7}}
        })));
        assert!(inbound.is_empty());
    }

    #[test]
    fn split_message_prefers_newline_boundaries() {
        let text = format!("{}\n{}", "a".repeat(6), "b".repeat(6));
        let chunks = split_message(&text, 10);
        assert_eq!(chunks, vec!["aaaaaa\n".to_string(), "bbbbbb".to_string()]);
    }

    #[test]
    fn split_message_hard_cuts_long_lines_and_keeps_empty_text() {
        let chunks = split_message(&"x".repeat(25), 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], "xxxxx");
        assert_eq!(split_message("", 10), vec![String::new()]);
    }

    #[test]
    fn inline_keyboard_renders_one_row_of_buttons() {
        let keyboard = inline_keyboard(&[ActionButton {
            id: "approve:1".to_string(),
            label: "Approve plan".to_string(),
        }]);
        assert_eq!(keyboard["inline_keyboard"][0][0]["callback_data"], "approve:1");
        assert_eq!(
            inline_keyboard(&[]),
            serde_json::json!({ "inline_keyboard": [] })
        );
    }
}
