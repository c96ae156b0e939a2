//! Error types for leakwatch.

use std::time::Duration;

use crate::pipeline::types::Stage;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database is corrupt or unreadable: {0}")]
    Corrupt(String),
}

/// SQLite messages that mean the file itself is unusable, not that a
/// single statement hit a lock or a busy connection.
const FATAL_SQLITE_MARKERS: &[&str] = &[
    "malformed",
    "not a database",
    "unable to open",
    "disk i/o error",
    "readonly database",
];

impl DatabaseError {
    /// Classify a failed libSQL call made by `op`. Constraint failures get
    /// their own variant; everything else is a query error.
    pub fn from_query(op: &str, e: impl std::fmt::Display) -> Self {
        let message = format!("{op}: {e}");
        if message.contains("constraint failed") {
            Self::Constraint(message)
        } else {
            Self::Query(message)
        }
    }

    /// Whether retrying is pointless: the store is unreachable or corrupt.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Pool(_) | Self::Migration(_) | Self::Corrupt(_) => true,
            Self::Query(msg) => {
                let lower = msg.to_lowercase();
                FATAL_SQLITE_MARKERS.iter().any(|m| lower.contains(m))
            }
            Self::NotFound { .. } | Self::Constraint(_) | Self::Serialization(_) => false,
        }
    }
}

/// Channel-related errors (listener and notifier transport).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Channel {name} disconnected: {reason}")]
    Disconnected { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// OCR failures. Never fatal: the extractor degrades to empty OCR text.
#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("Unsupported or corrupt image ({len} bytes)")]
    UnsupportedFormat { len: usize },

    #[error("OCR engine failed: {0}")]
    Engine(String),

    #[error("OCR timed out after {0:?}")]
    Timeout(Duration),

    #[error("OCR worker pool is closed")]
    PoolClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alert delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Notifier {notifier} rejected the alert: {reason}")]
    Rejected { notifier: String, reason: String },

    #[error("Notifier {notifier} transport failed: {reason}")]
    Transport { notifier: String, reason: String },

    #[error("Message {0} for alert no longer exists")]
    MissingMessage(String),
}

/// Pipeline failure for a single event, tagged with the stage it hit.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Persistence failed at {stage}: {source}")]
    Persistence {
        stage: Stage,
        #[source]
        source: DatabaseError,
    },

    #[error("Alert evaluation failed: {0}")]
    Alert(DatabaseError),

    #[error("Worker for channel {channel} stopped: {reason}")]
    WorkerStopped { channel: String, reason: String },
}

impl PipelineError {
    /// Fatal errors halt the worker instead of acknowledging the event.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Persistence { source, .. } | Self::Alert(source) => source.is_fatal(),
            Self::WorkerStopped { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_and_corrupt_errors_are_fatal() {
        assert!(DatabaseError::Pool("gone".into()).is_fatal());
        assert!(DatabaseError::Corrupt("bad header".into()).is_fatal());
        assert!(DatabaseError::Migration("V1".into()).is_fatal());
    }

    #[test]
    fn busy_query_is_transient() {
        assert!(!DatabaseError::Query("database is locked".into()).is_fatal());
        assert!(!DatabaseError::Constraint("unique".into()).is_fatal());
    }

    #[test]
    fn constraint_failures_are_classified() {
        let err = DatabaseError::from_query("create_alert", "FOREIGN KEY constraint failed");
        assert!(matches!(err, DatabaseError::Constraint(_)));
        let err = DatabaseError::from_query("persist_message", "database is locked");
        assert!(matches!(err, DatabaseError::Query(_)));
    }

    #[test]
    fn malformed_query_is_fatal() {
        let err = DatabaseError::Query("persist_message: database disk image is malformed".into());
        assert!(err.is_fatal());
    }

    #[test]
    fn pipeline_error_inherits_fatality() {
        let transient = PipelineError::Persistence {
            stage: Stage::Persisted,
            source: DatabaseError::Query("database is locked".into()),
        };
        assert!(!transient.is_fatal());

        let fatal = PipelineError::Alert(DatabaseError::Pool("closed".into()));
        assert!(fatal.is_fatal());
    }
}
