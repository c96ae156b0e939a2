//! Listener and Notifier traits plus the alert notice they exchange.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::{ChannelError, DeliveryError};
use crate::pipeline::types::InboundEvent;
use crate::store::{Alert, StoredMessage};

/// Ordered stream of inbound events from a listener.
pub type EventStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// Characters of message content included in an alert.
pub const ALERT_EXCERPT_CHARS: usize = 200;

/// Source of inbound events. Delivery is at-least-once.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Listener name (for logging).
    fn name(&self) -> &str;

    /// Validate credentials. Fails with `ChannelError::AuthFailed` when the
    /// channel rejects them.
    async fn health_check(&self) -> Result<(), ChannelError>;

    /// Start producing events. The stream ends when `cancel` fires or the
    /// stream is dropped.
    async fn start(&self, cancel: CancellationToken) -> Result<EventStream, ChannelError>;
}

/// Destination for alert notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one alert. Any error leaves the alert pending.
    async fn deliver(&self, notice: &AlertNotice) -> Result<(), DeliveryError>;
}

/// Everything an operator needs to act on one alert.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertNotice {
    pub alert_id: uuid::Uuid,
    pub channel_id: String,
    pub source_message_id: String,
    pub message_timestamp: DateTime<Utc>,
    pub matched_keywords: Vec<String>,
    /// Bounded excerpt of the combined text.
    pub excerpt: String,
    pub detected_at: DateTime<Utc>,
}

impl AlertNotice {
    pub fn new(alert: &Alert, message: &StoredMessage) -> Self {
        Self {
            alert_id: alert.id,
            channel_id: message.channel_id.clone(),
            source_message_id: message.source_message_id.clone(),
            message_timestamp: message.timestamp,
            matched_keywords: alert.matched_keywords.iter().cloned().collect(),
            excerpt: excerpt(&message.combined_text, ALERT_EXCERPT_CHARS),
            detected_at: alert.created_at,
        }
    }

    /// Plain-text rendering sent to the alert chat.
    pub fn render(&self) -> String {
        format!(
            "🚨 POSSIBLE LEAK OR EXPOSURE DETECTED 🚨\n\n\
             📢 Channel: {}\n\
             🔍 Keywords: {}\n\
             🆔 Message ID: {}\n\
             🕒 Posted: {}\n\n\
             📝 Content:\n{}\n\n\
             ⏰ Detected: {}",
            self.channel_id,
            self.matched_keywords.join(", "),
            self.source_message_id,
            self.message_timestamp.format("%d/%m/%Y %H:%M:%S"),
            self.excerpt,
            self.detected_at.format("%d/%m/%Y %H:%M:%S"),
        )
    }
}

/// First `max_chars` characters of `text`, with "..." when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
