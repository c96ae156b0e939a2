//! `Database` trait — single async interface for all persistence.
//!
//! Uniqueness is enforced by the schema, never by application locks:
//! `messages(channel_id, source_message_id)` and `alerts(message_id)` are
//! both UNIQUE, and every create is insert-or-skip.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{ExtractedText, InboundEvent};

/// A persisted message. Immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: Uuid,
    pub channel_id: String,
    pub source_message_id: String,
    pub timestamp: DateTime<Utc>,
    pub raw_text: String,
    pub has_image: bool,
    /// `None` when there was no image or OCR produced nothing usable.
    pub ocr_text: Option<String>,
    pub combined_text: String,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Build the record for a freshly extracted event.
    pub fn from_event(event: &InboundEvent, text: ExtractedText) -> Self {
        let ocr_text = if text.ocr_text.is_empty() {
            None
        } else {
            Some(text.ocr_text)
        };
        Self {
            id: Uuid::new_v4(),
            channel_id: event.channel_id.clone(),
            source_message_id: event.source_message_id.clone(),
            timestamp: event.timestamp,
            raw_text: text.raw_text,
            has_image: event.has_image,
            ocr_text,
            combined_text: text.combined_text,
            created_at: Utc::now(),
        }
    }
}

/// Result of an idempotent persist.
#[derive(Debug, Clone)]
pub struct PersistResult {
    /// `true` only for the pass that actually inserted the row.
    pub created: bool,
    /// The stored row: the new one, or the untouched existing one.
    pub existing: StoredMessage,
}

/// Delivery lifecycle of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    /// Created, not yet delivered. Eligible for reconciliation.
    Pending,
    /// `notified_at` is set.
    Delivered,
    /// Attempts exhausted; needs an operator.
    Failed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "delivered" => Self::Delivered,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// A persisted alert. At most one per message.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub id: Uuid,
    pub message_id: Uuid,
    pub matched_keywords: BTreeSet<String>,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub notified_at: Option<DateTime<Utc>>,
    pub delivery_attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// A new pending alert with no delivery attempts yet.
    pub fn new(message_id: Uuid, matched_keywords: BTreeSet<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id,
            matched_keywords,
            status: AlertStatus::Pending,
            created_at: Utc::now(),
            notified_at: None,
            delivery_attempts: 0,
            last_error: None,
            next_attempt_at: None,
        }
    }
}

/// Backend-agnostic database trait covering messages and alerts.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert the message unless its `(channel_id, source_message_id)`
    /// already exists. Never overwrites.
    async fn persist_message(&self, message: &StoredMessage)
    -> Result<PersistResult, DatabaseError>;

    /// Look up a message by its dedup identity.
    async fn get_message_by_identity(
        &self,
        channel_id: &str,
        source_message_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError>;

    /// Look up a message by its row id.
    async fn get_message(&self, id: Uuid) -> Result<Option<StoredMessage>, DatabaseError>;

    /// Total stored messages.
    async fn count_messages(&self) -> Result<u64, DatabaseError>;

    // ── Alerts ──────────────────────────────────────────────────────

    /// Insert the alert unless its message already has one.
    /// Returns `None` when an alert already existed.
    async fn create_alert(&self, alert: &Alert) -> Result<Option<Alert>, DatabaseError>;

    /// Get an alert by id.
    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>, DatabaseError>;

    /// Get the alert owned by a message, if any.
    async fn get_alert_for_message(&self, message_id: Uuid)
    -> Result<Option<Alert>, DatabaseError>;

    /// Take the delivery lease on a due pending alert by pushing its
    /// `next_attempt_at` to `lease_until`. Returns `false` when the alert is
    /// no longer pending or someone else holds an unexpired lease.
    async fn claim_alert(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Pending → delivered. Counts the successful attempt.
    async fn mark_alert_delivered(
        &self,
        id: Uuid,
        notified_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Count a failed attempt and schedule the next one.
    /// Returns the attempt count after the update.
    async fn record_delivery_failure(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<u32, DatabaseError>;

    /// Pending → failed, after the last allowed attempt.
    async fn mark_alert_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    /// Pending alerts created before `created_before` whose next attempt is
    /// due at `now`, oldest first.
    async fn due_pending_alerts(
        &self,
        now: DateTime<Utc>,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Alert>, DatabaseError>;

    /// Count alerts, optionally by status.
    async fn count_alerts(&self, status: Option<AlertStatus>) -> Result<u64, DatabaseError>;
}
