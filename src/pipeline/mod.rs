//! Ingestion pipeline.
//!
//! Every inbound event flows through:
//! 1. `Extractor::extract()` — message text plus OCR of any attached image
//! 2. `Database::persist_message()` — idempotent on the dedup identity
//! 3. `match_keywords()` — literal, case-insensitive substring matching
//! 4. `AlertEngine::evaluate()` — at most one alert per message, delivered
//!    now or later by the reconciler

pub mod alerts;
pub mod extractor;
pub mod matcher;
pub mod processor;
pub mod types;

pub use alerts::{AlertEngine, AlertPolicy, spawn_reconciler};
pub use extractor::Extractor;
pub use matcher::{KeywordSet, match_keywords};
pub use processor::{Pipeline, RunStats};
pub use types::{ExtractedText, InboundEvent, ProcessOutcome, Stage};
