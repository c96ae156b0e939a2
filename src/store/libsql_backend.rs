//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! fixed-width RFC 3339 (microseconds, `Z`) so string comparison in SQL
//! orders them correctly.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Alert, AlertStatus, Database, PersistResult, StoredMessage};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Corrupt(format!("PRAGMA foreign_keys: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_count(&self, sql: &str, params: Vec<libsql::Value>) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count parse: {e}")))?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count: {e}"))),
        }
    }

    async fn query_alerts(
        &self,
        sql: &str,
        params: Vec<libsql::Value>,
        op: &str,
    ) -> Result<Vec<Alert>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut alerts = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => alerts.push(row_to_alert(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(alerts)
    }

    async fn query_one_message(
        &self,
        sql: &str,
        params: Vec<libsql::Value>,
        op: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{column} '{s}': {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

const MESSAGE_COLUMNS: &str = "id, channel_id, source_message_id, timestamp, raw_text, has_image, ocr_text, combined_text, created_at";

const ALERT_COLUMNS: &str = "id, message_id, matched_keywords, status, created_at, notified_at, delivery_attempts, last_error, next_attempt_at";

/// Map a libsql Row (MESSAGE_COLUMNS order) to a StoredMessage.
fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let timestamp: String = row.get(3).map_err(row_err)?;
    let has_image: i64 = row.get(5).map_err(row_err)?;
    let created_at: String = row.get(8).map_err(row_err)?;

    Ok(StoredMessage {
        id: parse_uuid(&id, "messages.id")?,
        channel_id: row.get(1).map_err(row_err)?,
        source_message_id: row.get(2).map_err(row_err)?,
        timestamp: parse_datetime(&timestamp),
        raw_text: row.get(4).map_err(row_err)?,
        has_image: has_image != 0,
        ocr_text: row.get(6).ok(),
        combined_text: row.get(7).map_err(row_err)?,
        created_at: parse_datetime(&created_at),
    })
}

/// Map a libsql Row (ALERT_COLUMNS order) to an Alert.
fn row_to_alert(row: &libsql::Row) -> Result<Alert, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let message_id: String = row.get(1).map_err(row_err)?;
    let keywords_json: String = row.get(2).map_err(row_err)?;
    let status: String = row.get(3).map_err(row_err)?;
    let created_at: String = row.get(4).map_err(row_err)?;
    let attempts: i64 = row.get(6).map_err(row_err)?;

    let matched_keywords: BTreeSet<String> = serde_json::from_str(&keywords_json)
        .map_err(|e| DatabaseError::Serialization(format!("alerts.matched_keywords: {e}")))?;

    Ok(Alert {
        id: parse_uuid(&id, "alerts.id")?,
        message_id: parse_uuid(&message_id, "alerts.message_id")?,
        matched_keywords,
        status: AlertStatus::parse(&status),
        created_at: parse_datetime(&created_at),
        notified_at: parse_optional_datetime(row.get(5).ok()),
        delivery_attempts: attempts.max(0) as u32,
        last_error: row.get(7).ok(),
        next_attempt_at: parse_optional_datetime(row.get(8).ok()),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn persist_message(
        &self,
        message: &StoredMessage,
    ) -> Result<PersistResult, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO messages (id, channel_id, source_message_id, timestamp, raw_text,
                    has_image, ocr_text, combined_text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (channel_id, source_message_id) DO NOTHING",
                params![
                    message.id.to_string(),
                    message.channel_id.as_str(),
                    message.source_message_id.as_str(),
                    fmt_ts(message.timestamp),
                    message.raw_text.as_str(),
                    i64::from(message.has_image),
                    opt_text(message.ocr_text.as_deref()),
                    message.combined_text.as_str(),
                    fmt_ts(message.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_query("persist_message", e))?;

        let existing = self
            .get_message_by_identity(&message.channel_id, &message.source_message_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "message".into(),
                id: format!("{}/{}", message.channel_id, message.source_message_id),
            })?;

        let created = inserted == 1;
        debug!(
            channel = %message.channel_id,
            source_id = %message.source_message_id,
            created,
            "Message persisted"
        );
        Ok(PersistResult { created, existing })
    }

    async fn get_message_by_identity(
        &self,
        channel_id: &str,
        source_message_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        self.query_one_message(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE channel_id = ?1 AND source_message_id = ?2"
            ),
            vec![channel_id.into(), source_message_id.into()],
            "get_message_by_identity",
        )
        .await
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<StoredMessage>, DatabaseError> {
        self.query_one_message(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            vec![id.to_string().into()],
            "get_message",
        )
        .await
    }

    async fn count_messages(&self) -> Result<u64, DatabaseError> {
        self.query_count("SELECT COUNT(*) FROM messages", Vec::new())
            .await
    }

    // ── Alerts ──────────────────────────────────────────────────────

    async fn create_alert(&self, alert: &Alert) -> Result<Option<Alert>, DatabaseError> {
        let keywords = serde_json::to_string(&alert.matched_keywords)
            .map_err(|e| DatabaseError::Serialization(format!("matched_keywords: {e}")))?;

        let inserted = self
            .conn()
            .execute(
                "INSERT INTO alerts (id, message_id, matched_keywords, status, created_at,
                    notified_at, delivery_attempts, last_error, next_attempt_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (message_id) DO NOTHING",
                params![
                    alert.id.to_string(),
                    alert.message_id.to_string(),
                    keywords,
                    alert.status.as_str(),
                    fmt_ts(alert.created_at),
                    opt_text(alert.notified_at.map(fmt_ts).as_deref()),
                    i64::from(alert.delivery_attempts),
                    opt_text(alert.last_error.as_deref()),
                    opt_text(alert.next_attempt_at.map(fmt_ts).as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_query("create_alert", e))?;

        if inserted == 0 {
            debug!(message_id = %alert.message_id, "Alert already exists for message");
            return Ok(None);
        }

        debug!(alert_id = %alert.id, message_id = %alert.message_id, "Alert inserted into DB");
        Ok(Some(alert.clone()))
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>, DatabaseError> {
        let mut alerts = self
            .query_alerts(
                &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
                vec![id.to_string().into()],
                "get_alert",
            )
            .await?;
        Ok(alerts.pop())
    }

    async fn get_alert_for_message(
        &self,
        message_id: Uuid,
    ) -> Result<Option<Alert>, DatabaseError> {
        let mut alerts = self
            .query_alerts(
                &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE message_id = ?1"),
                vec![message_id.to_string().into()],
                "get_alert_for_message",
            )
            .await?;
        Ok(alerts.pop())
    }

    async fn claim_alert(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let claimed = self
            .conn()
            .execute(
                "UPDATE alerts SET next_attempt_at = ?1
                 WHERE id = ?2 AND status = 'pending'
                   AND (next_attempt_at IS NULL OR next_attempt_at <= ?3)",
                params![fmt_ts(lease_until), id.to_string(), fmt_ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::from_query("claim_alert", e))?;
        Ok(claimed == 1)
    }

    async fn mark_alert_delivered(
        &self,
        id: Uuid,
        notified_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE alerts SET status = 'delivered', notified_at = ?1,
                    delivery_attempts = delivery_attempts + 1, next_attempt_at = NULL
                 WHERE id = ?2 AND status = 'pending'",
                params![fmt_ts(notified_at), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_query("mark_alert_delivered", e))?;
        debug!(alert_id = %id, "Alert marked delivered");
        Ok(())
    }

    async fn record_delivery_failure(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<u32, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE alerts SET delivery_attempts = delivery_attempts + 1,
                    last_error = ?1, next_attempt_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![error, fmt_ts(next_attempt_at), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_query("record_delivery_failure", e))?;

        let alert = self.get_alert(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "alert".into(),
            id: id.to_string(),
        })?;
        Ok(alert.delivery_attempts)
    }

    async fn mark_alert_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE alerts SET status = 'failed', last_error = ?1, next_attempt_at = NULL
                 WHERE id = ?2 AND status = 'pending'",
                params![error, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_query("mark_alert_failed", e))?;
        Ok(())
    }

    async fn due_pending_alerts(
        &self,
        now: DateTime<Utc>,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Alert>, DatabaseError> {
        self.query_alerts(
            &format!(
                "SELECT {ALERT_COLUMNS} FROM alerts
                 WHERE status = 'pending' AND created_at <= ?1
                   AND (next_attempt_at IS NULL OR next_attempt_at <= ?2)
                 ORDER BY created_at ASC LIMIT ?3"
            ),
            vec![
                fmt_ts(created_before).into(),
                fmt_ts(now).into(),
                (limit as i64).into(),
            ],
            "due_pending_alerts",
        )
        .await
    }

    async fn count_alerts(&self, status: Option<AlertStatus>) -> Result<u64, DatabaseError> {
        match status {
            Some(status) => {
                self.query_count(
                    "SELECT COUNT(*) FROM alerts WHERE status = ?1",
                    vec![status.as_str().into()],
                )
                .await
            }
            None => self.query_count("SELECT COUNT(*) FROM alerts", Vec::new()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{ExtractedText, InboundEvent};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_message(channel: &str, source_id: &str, text: &str) -> StoredMessage {
        let event = InboundEvent::text(channel, source_id, text);
        StoredMessage::from_event(&event, ExtractedText::new(text, ""))
    }

    fn keywords(words: &[&str]) -> BTreeSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    // ── Message tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn persist_creates_once() {
        let db = test_db().await;
        let msg = make_message("@chanA", "42", "buy now at brand1.shop");

        let first = db.persist_message(&msg).await.unwrap();
        assert!(first.created);
        assert_eq!(first.existing.id, msg.id);
        assert_eq!(first.existing.combined_text, "buy now at brand1.shop");

        let replay = make_message("@chanA", "42", "different text this time");
        let second = db.persist_message(&replay).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.existing.id, msg.id);
        assert_eq!(second.existing.raw_text, "buy now at brand1.shop");

        assert_eq!(db.count_messages().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn same_source_id_on_other_channel_is_distinct() {
        let db = test_db().await;
        assert!(db.persist_message(&make_message("@chanA", "1", "a")).await.unwrap().created);
        assert!(db.persist_message(&make_message("@chanB", "1", "b")).await.unwrap().created);
        assert_eq!(db.count_messages().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn ocr_text_roundtrip_preserves_null() {
        let db = test_db().await;
        let plain = make_message("@chanA", "1", "hello");
        db.persist_message(&plain).await.unwrap();
        let fetched = db.get_message(plain.id).await.unwrap().unwrap();
        assert_eq!(fetched.ocr_text, None);
        assert!(!fetched.has_image);

        let event = InboundEvent::text("@chanA", "2", "caption").with_image(vec![0]);
        let with_ocr = StoredMessage::from_event(&event, ExtractedText::new("caption", "Brand1"));
        db.persist_message(&with_ocr).await.unwrap();
        let fetched = db
            .get_message_by_identity("@chanA", "2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.ocr_text.as_deref(), Some("Brand1"));
        assert!(fetched.has_image);
        assert_eq!(fetched.combined_text, "caption\nbrand1");
        assert_eq!(fetched.timestamp.timestamp_micros(), event.timestamp.timestamp_micros());
    }

    #[tokio::test]
    async fn get_message_not_found() {
        let db = test_db().await;
        assert!(db.get_message(Uuid::new_v4()).await.unwrap().is_none());
        assert!(db.get_message_by_identity("@x", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn on_disk_database_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("monitor.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.persist_message(&make_message("@chanA", "42", "x")).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(!db.persist_message(&make_message("@chanA", "42", "x")).await.unwrap().created);
        assert_eq!(db.count_messages().await.unwrap(), 1);
    }

    // ── Alert tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn create_alert_at_most_once_per_message() {
        let db = test_db().await;
        let msg = make_message("@chanA", "42", "brand1");
        db.persist_message(&msg).await.unwrap();

        let alert = Alert::new(msg.id, keywords(&["brand1"]));
        let created = db.create_alert(&alert).await.unwrap();
        assert_eq!(created.map(|a| a.id), Some(alert.id));

        let again = Alert::new(msg.id, keywords(&["brand1"]));
        assert!(db.create_alert(&again).await.unwrap().is_none());
        assert_eq!(db.count_alerts(None).await.unwrap(), 1);

        let stored = db.get_alert_for_message(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.id, alert.id);
        assert_eq!(stored.matched_keywords, keywords(&["brand1"]));
        assert_eq!(stored.status, AlertStatus::Pending);
    }

    #[tokio::test]
    async fn alert_requires_existing_message() {
        let db = test_db().await;
        let orphan = Alert::new(Uuid::new_v4(), keywords(&["x"]));
        let err = db.create_alert(&orphan).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)), "got {err:?}");
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn delivered_transition() {
        let db = test_db().await;
        let msg = make_message("@chanA", "42", "brand1");
        db.persist_message(&msg).await.unwrap();
        let alert = Alert::new(msg.id, keywords(&["brand1"]));
        db.create_alert(&alert).await.unwrap();

        let now = Utc::now();
        db.mark_alert_delivered(alert.id, now).await.unwrap();

        let stored = db.get_alert(alert.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertStatus::Delivered);
        assert_eq!(stored.delivery_attempts, 1);
        assert_eq!(
            stored.notified_at.map(|t| t.timestamp_micros()),
            Some(now.timestamp_micros())
        );
        assert_eq!(db.count_alerts(Some(AlertStatus::Delivered)).await.unwrap(), 1);
        assert_eq!(db.count_alerts(Some(AlertStatus::Pending)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failure_counts_attempts_then_fails() {
        let db = test_db().await;
        let msg = make_message("@chanA", "42", "brand1");
        db.persist_message(&msg).await.unwrap();
        let alert = Alert::new(msg.id, keywords(&["brand1"]));
        db.create_alert(&alert).await.unwrap();

        let next = Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(db.record_delivery_failure(alert.id, "timeout", next).await.unwrap(), 1);
        assert_eq!(db.record_delivery_failure(alert.id, "timeout", next).await.unwrap(), 2);

        db.mark_alert_failed(alert.id, "gave up").await.unwrap();
        let stored = db.get_alert(alert.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertStatus::Failed);
        assert_eq!(stored.delivery_attempts, 2);
        assert_eq!(stored.last_error.as_deref(), Some("gave up"));
        assert!(stored.next_attempt_at.is_none());

        // Terminal: a late success does not resurrect it.
        db.mark_alert_delivered(alert.id, Utc::now()).await.unwrap();
        let stored = db.get_alert(alert.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertStatus::Failed);
    }

    #[tokio::test]
    async fn due_pending_respects_grace_and_schedule() {
        let db = test_db().await;
        let now = Utc::now();

        let old = make_message("@chanA", "1", "a");
        let young = make_message("@chanA", "2", "b");
        let scheduled = make_message("@chanA", "3", "c");
        for m in [&old, &young, &scheduled] {
            db.persist_message(m).await.unwrap();
        }

        let mut a_old = Alert::new(old.id, keywords(&["a"]));
        a_old.created_at = now - chrono::Duration::minutes(5);
        let a_young = Alert::new(young.id, keywords(&["b"]));
        let mut a_sched = Alert::new(scheduled.id, keywords(&["c"]));
        a_sched.created_at = now - chrono::Duration::minutes(5);
        a_sched.next_attempt_at = Some(now + chrono::Duration::minutes(5));
        for a in [&a_old, &a_young, &a_sched] {
            db.create_alert(a).await.unwrap();
        }

        let cutoff = now - chrono::Duration::seconds(30);
        let due = db.due_pending_alerts(now, cutoff, 10).await.unwrap();
        assert_eq!(due.iter().map(|a| a.id).collect::<Vec<_>>(), vec![a_old.id]);

        let later = now + chrono::Duration::minutes(10);
        let due = db.due_pending_alerts(later, later, 10).await.unwrap();
        assert_eq!(due.len(), 3);

        let due = db.due_pending_alerts(later, later, 1).await.unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_lease_expires() {
        let db = test_db().await;
        let msg = make_message("@chanA", "42", "brand1");
        db.persist_message(&msg).await.unwrap();
        let alert = Alert::new(msg.id, keywords(&["brand1"]));
        db.create_alert(&alert).await.unwrap();

        let now = Utc::now();
        let lease = now + chrono::Duration::minutes(2);
        assert!(db.claim_alert(alert.id, now, lease).await.unwrap());
        assert!(!db.claim_alert(alert.id, now, lease).await.unwrap());
        assert!(db.due_pending_alerts(now, now, 10).await.unwrap().is_empty());

        let after = lease + chrono::Duration::seconds(1);
        assert!(db.claim_alert(alert.id, after, after).await.unwrap());

        db.mark_alert_delivered(alert.id, after).await.unwrap();
        let far = after + chrono::Duration::hours(1);
        assert!(!db.claim_alert(alert.id, far, far).await.unwrap());
    }

    #[test]
    fn timestamp_format_is_fixed_width() {
        let a = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let b = a + chrono::Duration::milliseconds(500);
        assert_eq!(fmt_ts(a), "2026-01-01T00:00:00.000000Z");
        assert!(fmt_ts(a) < fmt_ts(b));
        assert_eq!(parse_datetime(&fmt_ts(b)), b);
    }
}
