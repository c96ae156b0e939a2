//! Channel abstraction for inbound events and outbound alerts.

pub mod channel;
pub mod telegram;

pub use channel::*;
pub use telegram::{TelegramListener, TelegramNotifier};
