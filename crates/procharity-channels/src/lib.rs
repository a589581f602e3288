//! # ProCharity Channels
//! Outbound delivery sinks.

pub mod telegram;

pub use telegram::TelegramSink;
