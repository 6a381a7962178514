//! Platform send adapters.
//!
//! Each platform implements the [`Sender`] trait. An adapter performs a
//! single delivery attempt and classifies failures into a
//! [`SendError`]; retries are the orchestrator's policy, never the
//! adapter's.

mod discord;
mod misskey;

pub use discord::{DiscordConfig, DiscordSender};
pub use misskey::{MisskeyConfig, MisskeySender};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Transport failure classification consumed by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// HTTP 429.
    RateLimited,
    /// HTTP 5xx.
    ServerError,
    /// HTTP 4xx other than 429.
    ClientError,
    /// Connection, DNS or timeout failure before a status was received.
    Network,
}

impl SendErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::Network => "network",
        }
    }
}

/// A classified transport failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("send failed: {} (status {status_code:?})", .kind.as_str())]
pub struct SendError {
    pub kind: SendErrorKind,
    /// Server-requested wait before the next attempt, when provided.
    pub retry_after: Option<Duration>,
    pub status_code: Option<u16>,
}

impl SendError {
    pub fn network() -> Self {
        Self {
            kind: SendErrorKind::Network,
            retry_after: None,
            status_code: None,
        }
    }

    /// Classify an HTTP status code.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        let kind = match status {
            429 => SendErrorKind::RateLimited,
            500..=599 => SendErrorKind::ServerError,
            _ => SendErrorKind::ClientError,
        };
        Self {
            kind,
            retry_after,
            status_code: Some(status),
        }
    }
}

/// Outbound message sink for one platform.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Platform tag used in batch keys, metrics and logs.
    fn platform(&self) -> &str;

    /// Deliver `text` to `channel` in one attempt.
    async fn send(&self, channel: &str, text: &str) -> Result<(), SendError>;
}

/// Registry of configured platform senders.
#[derive(Default, Clone)]
pub struct SenderRegistry {
    senders: HashMap<String, Arc<dyn Sender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sender: Arc<dyn Sender>) {
        self.senders.insert(sender.platform().to_string(), sender);
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn Sender>> {
        self.senders.get(platform).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

/// Parse a `Retry-After` header value: either delay seconds or an
/// HTTP-date. Dates in the past collapse to zero.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        if !secs.is_finite() {
            return None;
        }
        return Some(Duration::from_secs_f64(secs.max(0.0)));
    }
    let when = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
