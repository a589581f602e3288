//! Telegram Bot delivery sink — one `sendMessage` call per recipient.

use std::time::Duration;

use async_trait::async_trait;
use procharity_core::config::TelegramConfig;
use procharity_core::error::{ProCharityError, Result};
use procharity_core::traits::DeliverySink;
use procharity_core::types::RecipientId;
use serde::{Deserialize, Serialize};

/// Sends notifications through the Telegram Bot API.
pub struct TelegramSink {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramSink {
    pub fn new(config: TelegramConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProCharityError::Channel(format!("HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    pub fn has_token(&self) -> bool {
        !self.config.bot_token.trim().is_empty()
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    fn message_payload(&self, chat_id: i64, text: &str) -> serde_json::Value {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if !self.config.parse_mode.is_empty() {
            body["parse_mode"] = self.config.parse_mode.clone().into();
        }
        body
    }

    /// Send a text message.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        tracing::debug!("📤 sendMessage to {chat_id} ({} chars)", text.chars().count());
        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&self.message_payload(chat_id, text))
            .send()
            .await
            .map_err(|e| ProCharityError::Channel(format!("sendMessage failed: {e}")))?;

        let result: TelegramApiResponse<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| ProCharityError::Channel(format!("Invalid send response: {e}")))?;

        result.into_result().map(|_| ())
    }

    /// Get bot info. Used to check the token before sending.
    pub async fn get_me(&self) -> Result<TelegramUser> {
        let response = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ProCharityError::Channel(format!("getMe failed: {e}")))?;
        let body: TelegramApiResponse<TelegramUser> = response
            .json()
            .await
            .map_err(|e| ProCharityError::Channel(format!("Invalid getMe response: {e}")))?;
        body.into_result()
    }
}

#[async_trait]
impl DeliverySink for TelegramSink {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, recipient: RecipientId, text: &str) -> Result<()> {
        self.send_message(recipient, text).await
    }
}

// --- Telegram API Types ---

#[derive(Debug, Deserialize)]
pub struct TelegramApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseParameters {
    pub retry_after: Option<u64>,
}

impl<T> TelegramApiResponse<T> {
    /// Blocked or deactivated users surface as `Delivery`; anything else the
    /// API rejects is a `Channel` error.
    pub fn into_result(self) -> Result<T> {
        if !self.ok {
            let description = self.description.unwrap_or_default();
            let retry = self
                .parameters
                .and_then(|p| p.retry_after)
                .map(|s| format!(" (retry after {s}s)"))
                .unwrap_or_default();
            return Err(match self.error_code {
                Some(403) => ProCharityError::Delivery(format!("Recipient unreachable: {description}")),
                Some(code) => ProCharityError::Channel(format!("Telegram API error {code}: {description}{retry}")),
                None => ProCharityError::Channel(format!("Telegram API error: {description}")),
            });
        }
        self.result
            .ok_or_else(|| ProCharityError::Channel("Telegram response has no result".into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}
