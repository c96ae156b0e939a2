//! Shared types for the ingestion pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

// ── Inbound event ───────────────────────────────────────────────────

/// One inbound message notification from a monitored channel.
///
/// Listeners convert their native update format into this struct. The
/// identity `(channel_id, source_message_id)` is the dedup key: a listener
/// may deliver the same event more than once.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Monitored channel, as configured (e.g. `@chanA` or a numeric chat id).
    pub channel_id: String,
    /// Channel-native message id.
    pub source_message_id: String,
    /// When the channel says the message was posted.
    pub timestamp: DateTime<Utc>,
    /// Typed text or media caption. Possibly empty.
    pub text: String,
    /// Whether the message carried an image, even if it could not be fetched.
    pub has_image: bool,
    /// Image payload, when the listener managed to download it.
    pub image_bytes: Option<Vec<u8>>,
}

impl InboundEvent {
    /// A text-only event.
    pub fn text(
        channel_id: impl Into<String>,
        source_message_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            source_message_id: source_message_id.into(),
            timestamp: Utc::now(),
            text: text.into(),
            has_image: false,
            image_bytes: None,
        }
    }

    /// Attach downloaded image bytes.
    pub fn with_image(mut self, bytes: Vec<u8>) -> Self {
        self.has_image = true;
        self.image_bytes = Some(bytes);
        self
    }

    /// Mark the event as carrying an image that could not be downloaded.
    pub fn with_missing_image(mut self) -> Self {
        self.has_image = true;
        self.image_bytes = None;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ── Extraction result ───────────────────────────────────────────────

/// Separator between raw text and OCR text. A newline never appears inside
/// a configured keyword, so joining cannot manufacture a match.
pub const TEXT_SEPARATOR: &str = "\n";

/// All textual signal pulled out of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedText {
    pub raw_text: String,
    /// Empty when there was no image or OCR failed.
    pub ocr_text: String,
    /// Lowercased join of the non-empty parts of `raw_text` and `ocr_text`.
    pub combined_text: String,
}

impl ExtractedText {
    pub fn new(raw_text: impl Into<String>, ocr_text: impl Into<String>) -> Self {
        let raw_text = raw_text.into();
        let ocr_text = ocr_text.into();
        let combined_text = combine(&raw_text, &ocr_text);
        Self {
            raw_text,
            ocr_text,
            combined_text,
        }
    }
}

/// Deterministic combination of the two text sources.
pub fn combine(raw_text: &str, ocr_text: &str) -> String {
    [raw_text, ocr_text]
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(TEXT_SEPARATOR)
        .to_lowercase()
}

// ── State machine ───────────────────────────────────────────────────

/// Per-event processing stage, used to tag logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Extracted,
    Persisted,
    Matched,
    Alerted,
    Skipped,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Extracted => "extracted",
            Self::Persisted => "persisted",
            Self::Matched => "matched",
            Self::Alerted => "alerted",
            Self::Skipped => "skipped",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Outcome ─────────────────────────────────────────────────────────

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// New message, keywords matched, alert created.
    Alerted { alert_id: Uuid, delivered: bool },
    /// New message, nothing matched.
    NoMatch,
    /// Identity already stored. `alert_recovered` is set when the replay
    /// created an alert an earlier, interrupted pass never got to.
    Duplicate { alert_recovered: bool },
}

impl ProcessOutcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Alerted { .. } => "alerted",
            Self::NoMatch => "no_match",
            Self::Duplicate { .. } => "duplicate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_lowercases_and_joins_with_newline() {
        assert_eq!(combine("Buy NOW", "Brand1 Promo"), "buy now\nbrand1 promo");
    }

    #[test]
    fn combine_skips_empty_parts() {
        assert_eq!(combine("buy now at brand1.shop", ""), "buy now at brand1.shop");
        assert_eq!(combine("", "  Leaked Creds \n"), "leaked creds");
        assert_eq!(combine("", ""), "");
    }

    #[test]
    fn separator_prevents_cross_boundary_match() {
        let combined = combine("brand", "one");
        assert!(!combined.contains("brandone"));
        assert!(!combined.contains("brand one"));
    }

    #[test]
    fn extracted_text_is_deterministic() {
        let a = ExtractedText::new("Hello", "World");
        let b = ExtractedText::new("Hello", "World");
        assert_eq!(a, b);
        assert_eq!(a.raw_text, "Hello");
        assert_eq!(a.combined_text, "hello\nworld");
    }

    #[test]
    fn event_builders() {
        let ev = InboundEvent::text("@chanA", "42", "hi").with_image(vec![1, 2, 3]);
        assert!(ev.has_image);
        assert_eq!(ev.image_bytes.as_deref(), Some(&[1u8, 2, 3][..]));

        let ev = InboundEvent::text("@chanA", "43", "hi").with_missing_image();
        assert!(ev.has_image);
        assert!(ev.image_bytes.is_none());
    }

    #[test]
    fn stage_display() {
        assert_eq!(Stage::Persisted.to_string(), "persisted");
        assert_eq!(
            serde_json::to_value(Stage::Alerted).unwrap(),
            serde_json::json!("alerted")
        );
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(ProcessOutcome::NoMatch.label(), "no_match");
        assert_eq!(
            ProcessOutcome::Duplicate {
                alert_recovered: false
            }
            .label(),
            "duplicate"
        );
    }
}
