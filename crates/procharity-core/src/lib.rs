//! # ProCharity Core
//! Shared domain types, collaborator traits, errors and configuration.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::ProCharityConfig;
pub use error::{ProCharityError, Result};
