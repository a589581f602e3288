//! ProCharity configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProCharityError, Result};

/// Environment variable that overrides `telegram.bot_token`.
pub const TOKEN_ENV: &str = "PROCHARITY_TELEGRAM_TOKEN";

/// Upper bound on `dispatch.inter_task_delay_secs` (one hour).
pub const MAX_INTER_TASK_DELAY_SECS: u64 = 3600;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProCharityConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl ProCharityConfig {
    /// Load config from the default path (~/.procharity/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default().with_env())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProCharityError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ProCharityError::Config(format!("Failed to parse config: {e}")))?;
        config.dispatch.validate()?;
        Ok(config.with_env())
    }

    fn with_env(mut self) -> Self {
        if let Ok(token) = std::env::var(TOKEN_ENV)
            && !token.is_empty()
        {
            self.telegram.bot_token = token;
        }
        self
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the ProCharity home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".procharity")
    }
}

/// SQLite location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.procharity/procharity.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    /// Path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// Telegram Bot API delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_parse_mode")]
    pub parse_mode: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_parse_mode() -> String { "Markdown".into() }
fn default_api_base() -> String { "https://api.telegram.org".into() }

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            parse_mode: default_parse_mode(),
            api_base: default_api_base(),
        }
    }
}

/// Pacing and fan-out limits for outbound notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Spacing between successive task notification groups.
    #[serde(default = "default_inter_task_delay")]
    pub inter_task_delay_secs: u64,
    /// Provider-safe burst size for one chunk of recipients.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Upper bound on sends in flight across all jobs.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_sends: usize,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
}

fn default_inter_task_delay() -> u64 { 10 }
fn default_chunk_size() -> usize { 30 }
fn default_max_concurrent() -> usize { 8 }
fn default_send_timeout() -> u64 { 10 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            inter_task_delay_secs: default_inter_task_delay(),
            chunk_size: default_chunk_size(),
            max_concurrent_sends: default_max_concurrent(),
            send_timeout_secs: default_send_timeout(),
        }
    }
}

impl DispatchConfig {
    pub fn inter_task_delay(&self) -> Duration {
        Duration::from_secs(self.inter_task_delay_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ProCharityError::Config("dispatch.chunk_size must be > 0".into()));
        }
        if self.max_concurrent_sends == 0 {
            return Err(ProCharityError::Config(
                "dispatch.max_concurrent_sends must be > 0".into(),
            ));
        }
        if self.inter_task_delay_secs > MAX_INTER_TASK_DELAY_SECS {
            return Err(ProCharityError::Config(format!(
                "dispatch.inter_task_delay_secs must be <= {MAX_INTER_TASK_DELAY_SECS}"
            )));
        }
        Ok(())
    }
}

/// When tasks missing from a batch are archived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchivePolicy {
    /// Every previously active id absent from the batch is archived.
    #[default]
    Always,
    /// Archive only when the batch added, updated or re-activated something.
    OnChange,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default)]
    pub archive_policy: ArchivePolicy,
}
