//! Telegram channel — long-polls the Bot API for posts and sends alerts.
//!
//! Native Rust Telegram Bot API implementation. The listener watches the
//! configured chats (groups the bot is in, or channels where it is admin);
//! the notifier posts alerts to a single destination chat.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channels::{AlertNotice, EventStream, Listener, Notifier};
use crate::error::{ChannelError, DeliveryError};
use crate::pipeline::types::InboundEvent;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Long-poll timeout passed to getUpdates.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Pause after a failed poll before trying again.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Events buffered between the poll loop and the pipeline.
const LISTENER_BUFFER: usize = 256;

/// Cap on any single Bot API request other than the long poll, and on a
/// whole image download.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Shared Bot API client.
struct BotApi {
    bot_token: SecretString,
    base_url: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl BotApi {
    fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            base_url: TELEGRAM_API_BASE.to_string(),
            client: build_client(REQUEST_TIMEOUT),
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    fn set_request_timeout(&mut self, timeout: Duration) {
        self.client = build_client(timeout);
        self.request_timeout = timeout;
    }

    fn redact(&self, e: &reqwest::Error) -> String {
        strip_token(&e.to_string(), self.bot_token.expose_secret())
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.base_url,
            self.bot_token.expose_secret()
        )
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{file_path}",
            self.base_url,
            self.bot_token.expose_secret()
        )
    }

    /// Validate the token with getMe.
    async fn get_me(&self, name: &str) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: name.into(),
                reason: self.redact(&e),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        // Telegram answers 401 for a revoked token and 404 for a malformed one.
        if matches!(status.as_u16(), 401 | 403 | 404) {
            return Err(ChannelError::AuthFailed {
                name: name.into(),
                reason: format!("getMe returned {status}"),
            });
        }
        Err(ChannelError::StartupFailed {
            name: name.into(),
            reason: format!("getMe returned {status}"),
        })
    }

    /// Look up one configured chat with getChat. Returns its display name.
    async fn get_chat(&self, chat: &str) -> Result<String, ChannelError> {
        let resp = self
            .client
            .post(self.api_url("getChat"))
            .json(&serde_json::json!({ "chat_id": chat }))
            .send()
            .await
            .map_err(|e| ChannelError::Http(self.redact(&e)))?;

        let status = resp.status();
        let reply: ApiReply<ChatInfo> = resp
            .json()
            .await
            .map_err(|e| ChannelError::InvalidMessage(format!("getChat response: {e}")))?;
        let info = reply.into_result("getChat", status)?;

        let title = info.title.or(info.first_name).unwrap_or_else(|| chat.to_string());
        Ok(format!("{title} ({})", info.kind))
    }

    /// Resolve a file id and download its bytes, within `request_timeout`.
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, ChannelError> {
        tokio::time::timeout(self.request_timeout, self.fetch_file(file_id))
            .await
            .map_err(|_| {
                ChannelError::Http(format!(
                    "image download timed out after {:?}",
                    self.request_timeout
                ))
            })?
    }

    async fn fetch_file(&self, file_id: &str) -> Result<Vec<u8>, ChannelError> {
        let resp = self
            .client
            .post(self.api_url("getFile"))
            .json(&serde_json::json!({ "file_id": file_id }))
            .send()
            .await
            .map_err(|e| ChannelError::Http(self.redact(&e)))?;
        let status = resp.status();
        let reply: ApiReply<FileInfo> = resp
            .json()
            .await
            .map_err(|e| ChannelError::InvalidMessage(format!("getFile response: {e}")))?;
        let file_path = reply
            .into_result("getFile", status)?
            .file_path
            .ok_or_else(|| ChannelError::InvalidMessage("getFile returned no file_path".into()))?;

        let resp = self
            .client
            .get(self.file_url(&file_path))
            .send()
            .await
            .map_err(|e| ChannelError::Http(self.redact(&e)))?;

        if !resp.status().is_success() {
            return Err(ChannelError::Http(format!(
                "file download returned {}",
                resp.status()
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ChannelError::Http(self.redact(&e)))?;
        Ok(bytes.to_vec())
    }
}

/// Envelope of every Bot API reply.
#[derive(Debug, Deserialize)]
struct ApiReply<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

impl<T> ApiReply<T> {
    fn into_result(self, method: &str, status: reqwest::StatusCode) -> Result<T, ChannelError> {
        match self.result {
            Some(result) if self.ok => Ok(result),
            _ => Err(ChannelError::Http(format!(
                "{method} returned {status}: {}",
                self.description.as_deref().unwrap_or("no description")
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatInfo {
    #[serde(rename = "type")]
    kind: String,
    title: Option<String>,
    first_name: Option<String>,
}

// ── Listener ────────────────────────────────────────────────────────

/// Telegram listener — connects to the Bot API via long-polling.
pub struct TelegramListener {
    api: Arc<BotApi>,
    monitored: Arc<Vec<String>>,
}

impl TelegramListener {
    pub fn new(bot_token: SecretString, monitored: Vec<String>) -> Self {
        Self {
            api: Arc::new(BotApi::new(bot_token)),
            monitored: Arc::new(monitored),
        }
    }

    /// Point at a different Bot API server (self-hosted or test).
    pub fn with_api_base(mut self, base_url: impl Into<String>) -> Self {
        if let Some(api) = Arc::get_mut(&mut self.api) {
            api.base_url = base_url.into();
        }
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        if let Some(api) = Arc::get_mut(&mut self.api) {
            api.set_request_timeout(timeout);
        }
        self
    }

    /// Log what each configured `@username` or numeric entry resolves to.
    /// Returns the entries Telegram could not resolve. Titles cannot be
    /// looked up through the Bot API and are skipped.
    pub async fn report_monitored_chats(&self) -> Vec<String> {
        let mut unresolved = Vec::new();
        for entry in self.monitored.iter() {
            if !entry.starts_with('@') && entry.parse::<i64>().is_err() {
                tracing::info!(channel = %entry, "Monitoring chat by title");
                continue;
            }
            match self.api.get_chat(entry).await {
                Ok(name) => tracing::info!(channel = %entry, chat = %name, "Monitoring chat"),
                Err(e) => {
                    tracing::warn!(
                        channel = %entry,
                        error = %e,
                        "Configured chat not reachable; check the name and that the bot is a member"
                    );
                    unresolved.push(entry.clone());
                }
            }
        }
        unresolved
    }
}

#[async_trait]
impl Listener for TelegramListener {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        self.api.get_me(self.name()).await?;
        self.report_monitored_chats().await;
        Ok(())
    }

    async fn start(&self, cancel: CancellationToken) -> Result<EventStream, ChannelError> {
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        let api = Arc::clone(&self.api);
        let monitored = Arc::clone(&self.monitored);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Telegram listener stopped");
                }
                _ = tx.closed() => {
                    tracing::info!("Telegram listener channel closed");
                }
                _ = poll_loop(api, monitored, tx.clone()) => {}
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(Box::pin(stream))
    }
}

/// Long-poll getUpdates forever, forwarding monitored posts.
async fn poll_loop(api: Arc<BotApi>, monitored: Arc<Vec<String>>, tx: mpsc::Sender<InboundEvent>) {
    let mut offset: i64 = 0;

    tracing::info!(channels = monitored.len(), "Telegram listener polling for updates...");

    loop {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": POLL_TIMEOUT_SECS,
            "allowed_updates": ["message", "channel_post"]
        });

        let resp = match api
            .client
            .post(api.api_url("getUpdates"))
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let err = ChannelError::Disconnected {
                    name: "telegram".into(),
                    reason: api.redact(&e),
                };
                tracing::warn!(
                    error = %err,
                    retry_in_secs = RETRY_DELAY.as_secs(),
                    "Telegram poll failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        if resp.status().as_u16() == 401 {
            tracing::error!("Telegram rejected the bot token; listener stopping");
            return;
        }

        let data: Value = match resp.json().await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Telegram parse error: {e}");
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        let Some(results) = data.get("result").and_then(Value::as_array) else {
            tracing::warn!(response = %data, "Telegram getUpdates returned no result");
            tokio::time::sleep(RETRY_DELAY).await;
            continue;
        };

        for update in results {
            // Advance offset past this update
            if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                offset = uid + 1;
            }

            let Some(post) = parse_update(update, &monitored) else {
                continue;
            };

            let event = post.into_event(&api).await;
            tracing::debug!(
                channel = %event.channel_id,
                source_id = %event.source_message_id,
                has_image = event.has_image,
                "Telegram post received"
            );

            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

/// A monitored post pulled out of one update, before any download.
#[derive(Debug, Clone, PartialEq)]
struct ParsedPost {
    channel_id: String,
    message_id: String,
    timestamp: DateTime<Utc>,
    text: String,
    image_file_id: Option<String>,
}

impl ParsedPost {
    async fn into_event(self, api: &BotApi) -> InboundEvent {
        let event = InboundEvent::text(self.channel_id, self.message_id, self.text)
            .with_timestamp(self.timestamp);

        let Some(file_id) = self.image_file_id else {
            return event;
        };

        match api.download_file(&file_id).await {
            Ok(bytes) => event.with_image(bytes),
            Err(e) => {
                tracing::warn!(
                    channel = %event.channel_id,
                    source_id = %event.source_message_id,
                    error = %e,
                    "Image download failed, continuing without it"
                );
                event.with_missing_image()
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Extract a monitored post from a `message` or `channel_post` update.
fn parse_update(update: &Value, monitored: &[String]) -> Option<ParsedPost> {
    let message = update
        .get("message")
        .or_else(|| update.get("channel_post"))?;

    let chat = message.get("chat")?;
    let channel_id = match_channel(monitored, chat)?.to_string();

    let message_id = message.get("message_id").and_then(Value::as_i64)?;
    let timestamp = message
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    let text = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some(ParsedPost {
        channel_id,
        message_id: message_id.to_string(),
        timestamp,
        text,
        image_file_id: image_file_id(message),
    })
}

/// File id of the image carried by a message: the largest `photo` size, or
/// a `document` whose MIME type is an image.
fn image_file_id(message: &Value) -> Option<String> {
    if let Some(sizes) = message.get("photo").and_then(Value::as_array) {
        let largest = sizes.iter().max_by_key(|size| {
            size.get("file_size")
                .and_then(Value::as_i64)
                .unwrap_or_else(|| {
                    let w = size.get("width").and_then(Value::as_i64).unwrap_or(0);
                    let h = size.get("height").and_then(Value::as_i64).unwrap_or(0);
                    w * h
                })
        });
        if let Some(id) = largest
            .and_then(|s| s.get("file_id"))
            .and_then(Value::as_str)
        {
            return Some(id.to_string());
        }
    }

    let document = message.get("document")?;
    let is_image = document
        .get("mime_type")
        .and_then(Value::as_str)
        .is_some_and(|m| m.starts_with("image/"));
    if !is_image {
        return None;
    }
    document
        .get("file_id")
        .and_then(Value::as_str)
        .map(String::from)
}

/// Find the monitored entry naming this chat.
///
/// An entry matches by `@username` (case-insensitive), numeric chat id, or
/// exact chat title. The matched entry becomes the event's channel id.
fn match_channel<'a>(monitored: &'a [String], chat: &Value) -> Option<&'a str> {
    let chat_id = chat.get("id").and_then(Value::as_i64);
    let username = chat.get("username").and_then(Value::as_str);
    let title = chat.get("title").and_then(Value::as_str);

    monitored
        .iter()
        .find(|entry| {
            if let Some(handle) = entry.strip_prefix('@') {
                return username.is_some_and(|u| u.eq_ignore_ascii_case(handle));
            }
            if let Ok(id) = entry.parse::<i64>() {
                return chat_id == Some(id);
            }
            title == Some(entry.as_str())
        })
        .map(String::as_str)
}

/// HTTP client with a default per-request timeout. The long poll sets its
/// own, longer one.
fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Falling back to a default HTTP client");
            reqwest::Client::new()
        })
}

/// Remove the bot token from reqwest error text (it embeds the URL).
fn strip_token(message: &str, token: &str) -> String {
    if token.is_empty() {
        return message.to_string();
    }
    message.replace(token, "<redacted>")
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        // Find a good split point on a char boundary
        let mut boundary = max_len;
        while !remaining.is_char_boundary(boundary) {
            boundary -= 1;
        }
        let chunk = &remaining[..boundary];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(boundary);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { boundary } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Notifier ────────────────────────────────────────────────────────

/// Sends alerts to one Telegram chat.
pub struct TelegramNotifier {
    api: BotApi,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: SecretString, chat_id: impl Into<String>) -> Self {
        Self {
            api: BotApi::new(bot_token),
            chat_id: chat_id.into(),
        }
    }

    pub fn with_api_base(mut self, base_url: impl Into<String>) -> Self {
        self.api.base_url = base_url.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.api.set_request_timeout(timeout);
        self
    }

    /// Send a text message, trying Markdown first with plain text fallback.
    /// Splits long messages that exceed Telegram's 4096 char limit.
    async fn send_message(&self, text: &str) -> Result<(), DeliveryError> {
        for chunk in &split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(chunk).await?;
        }
        Ok(())
    }

    /// Send a single message chunk (≤4096 chars), Markdown-first with fallback.
    async fn send_message_chunk(&self, text: &str) -> Result<(), DeliveryError> {
        let markdown_body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });

        let markdown_resp = self.post_send(&markdown_body).await?;
        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        // Retry without parse_mode
        let plain_body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
        });
        let plain_resp = self.post_send(&plain_body).await?;

        if !plain_resp.status().is_success() {
            let plain_status = plain_resp.status();
            let plain_err = plain_resp.text().await.unwrap_or_default();
            let reason = format!(
                "sendMessage failed (markdown: {markdown_status}, plain: {plain_status} {plain_err})"
            );
            // 429 and 5xx are worth retrying; anything else is a hard rejection.
            if plain_status.as_u16() == 429 || plain_status.is_server_error() {
                return Err(DeliveryError::Transport {
                    notifier: "telegram".into(),
                    reason,
                });
            }
            return Err(DeliveryError::Rejected {
                notifier: "telegram".into(),
                reason,
            });
        }

        Ok(())
    }

    async fn post_send(&self, body: &Value) -> Result<reqwest::Response, DeliveryError> {
        self.api
            .client
            .post(self.api.api_url("sendMessage"))
            .json(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport {
                notifier: "telegram".into(),
                reason: self.api.redact(&e),
            })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(&self, notice: &AlertNotice) -> Result<(), DeliveryError> {
        self.send_message(&notice.render()).await?;
        tracing::info!(
            alert_id = %notice.alert_id,
            chat_id = %self.chat_id,
            "Alert sent to Telegram"
        );
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
