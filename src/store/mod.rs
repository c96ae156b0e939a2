//! Persistence layer — libSQL-backed storage for messages and alerts.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Alert, AlertStatus, Database, PersistResult, StoredMessage};
