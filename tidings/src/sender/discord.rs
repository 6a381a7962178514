//! Discord REST send adapter.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{parse_retry_after, SendError, Sender};

/// Discord adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Bot token; empty disables the adapter.
    pub bot_token: String,
    /// Channel used when a request carries no channel.
    pub default_channel_id: String,
    /// API base, overridable for tests.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".into()
}

fn default_timeout_secs() -> u64 {
    20
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            default_channel_id: String::new(),
            api_base: default_api_base(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl DiscordConfig {
    /// Credentials from the environment, matching the deployed bot:
    /// `DISCORD_BOT_TOKEN` and `DISCORD_CHANNEL_ID`.
    pub fn from_env() -> Self {
        Self {
            bot_token: std::env::var("DISCORD_BOT_TOKEN").unwrap_or_default(),
            default_channel_id: std::env::var("DISCORD_CHANNEL_ID").unwrap_or_default(),
            ..Self::default()
        }
    }
}

/// Discord message sender.
pub struct DiscordSender {
    config: DiscordConfig,
    client: Client,
}

impl DiscordSender {
    pub fn new(config: DiscordConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.bot_token.is_empty()
    }
}

#[async_trait]
impl Sender for DiscordSender {
    fn platform(&self) -> &str {
        "discord"
    }

    async fn send(&self, channel: &str, text: &str) -> Result<(), SendError> {
        let channel_id = if channel.is_empty() {
            self.config.default_channel_id.as_str()
        } else {
            channel
        };
        let url = format!("{}/channels/{}/messages", self.config.api_base, channel_id);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bot {}", self.config.bot_token))
            .json(&json!({ "content": text }))
            .send()
            .await
            .map_err(|_| SendError::network())?;

        let status = response.status();
        if status.is_success() {
            debug!(channel = channel_id, "discord message delivered");
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
