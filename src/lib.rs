//! Leakwatch — real-time keyword monitor for messaging channels.
//!
//! Watches chats, OCRs attached images, and alerts when brand keywords
//! show up.

pub mod channels;
pub mod config;
pub mod error;
pub mod ocr;
pub mod pipeline;
pub mod shutdown;
pub mod store;
