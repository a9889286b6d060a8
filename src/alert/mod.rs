//! Alert delivery - Telegram notifications, or nothing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::core::config::ReportingConfig;
use crate::core::error::{Error, Result};
use crate::core::traits::AlertChannel;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the alert channel from config. Token comes from the
/// `TELEGRAM_BOT_TOKEN` env var and is never logged or persisted.
pub fn make_alerter(cfg: &ReportingConfig) -> Result<Arc<dyn AlertChannel>> {
    if !cfg.telegram.enabled {
        return Ok(Arc::new(NoopAlerter));
    }
    if cfg.telegram.chat_ids.is_empty() {
        return Err(Error::Config(
            "reporting.telegram.chat_ids is empty but telegram is enabled".into(),
        ));
    }
    let token = std::env::var("TELEGRAM_BOT_TOKEN")
        .map_err(|_| Error::Config("TELEGRAM_BOT_TOKEN not set".into()))?;
    Ok(Arc::new(TelegramAlerter::new(token, cfg.telegram.chat_ids.clone())?))
}

/// Sends each message to every configured chat via the Bot API.
pub struct TelegramAlerter {
    client: Client,
    token: String,
    chat_ids: Vec<i64>,
}

impl TelegramAlerter {
    pub fn new(token: String, chat_ids: Vec<i64>) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            token,
            chat_ids,
        })
    }
}

#[async_trait]
impl AlertChannel for TelegramAlerter {
    async fn send(&self, message: &str) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        for chat_id in &self.chat_ids {
            let resp = self
                .client
                .post(&url)
                .json(&json!({ "chat_id": chat_id, "text": message }))
                .send()
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Error::Transient(format!(
                    "telegram sendMessage failed with {status}: {body}"
                )));
            }
        }
        Ok(())
    }
}

/// Swallows everything. Used when reporting is disabled.
pub struct NoopAlerter;

#[async_trait]
impl AlertChannel for NoopAlerter {
    async fn send(&self, _message: &str) -> Result<()> {
        Ok(())
    }
}
