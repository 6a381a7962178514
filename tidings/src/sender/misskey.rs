//! Misskey send adapter (`notes/create`).

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{parse_retry_after, SendError, Sender};

/// Misskey adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MisskeyConfig {
    /// Instance host, e.g. `misskey.io`.
    pub instance: String,
    /// API token; empty disables the adapter.
    pub token: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    20
}

impl Default for MisskeyConfig {
    fn default() -> Self {
        Self {
            instance: "misskey.io".into(),
            token: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl MisskeyConfig {
    /// Credentials from `MISSKEY_INSTANCE` / `MISSKEY_TOKEN`.
    pub fn from_env() -> Self {
        Self {
            instance: std::env::var("MISSKEY_INSTANCE").unwrap_or_else(|_| "misskey.io".into()),
            token: std::env::var("MISSKEY_TOKEN").unwrap_or_default(),
            ..Self::default()
        }
    }
}

/// Misskey note sender.
pub struct MisskeySender {
    config: MisskeyConfig,
    client: Client,
}

impl MisskeySender {
    pub fn new(config: MisskeyConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.instance.is_empty() && !self.config.token.is_empty()
    }
}

#[async_trait]
impl Sender for MisskeySender {
    fn platform(&self) -> &str {
        "misskey"
    }

    async fn send(&self, channel: &str, text: &str) -> Result<(), SendError> {
        let url = format!("https://{}/api/notes/create", self.config.instance);
        let mut payload = json!({ "i": self.config.token, "text": text });
        if !channel.is_empty() {
            payload["channelId"] = json!(channel);
        }

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|_| SendError::network())?;

        let status = response.status();
        if status.is_success() {
            debug!(instance = %self.config.instance, "misskey note created");
            return Ok(());
        }

        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        Err(SendError::from_status(status.as_u16(), retry_after))
    }
}
