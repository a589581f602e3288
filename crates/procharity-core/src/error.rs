//! Error types shared by every ProCharity crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProCharityError>;

#[derive(Debug, Error)]
pub enum ProCharityError {
    #[error("Config error: {0}")]
    Config(String),

    /// Task store read/write or commit failure. The whole batch is rolled back.
    #[error("Store error: {0}")]
    Store(String),

    /// A single inbound record or operator request failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Recipient lookup failed: {0}")]
    Resolver(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProCharityError {
    /// Map any displayable backend error into a store error.
    pub fn store(e: impl std::fmt::Display) -> Self {
        Self::Store(e.to_string())
    }
}
