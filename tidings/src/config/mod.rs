//! Settings snapshot and loader.
//!
//! Settings are a single JSON document parsed into an immutable
//! [`Settings`] value. Readers hold an `Arc<Settings>`; the reload
//! watcher swaps whole snapshots atomically and never applies a
//! partially-invalid document.

pub mod diff;
pub mod watcher;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Quota entry key that applies to channels without an explicit entry.
pub const DEFAULT_QUOTA_KEY: &str = "default";

/// Root settings document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    /// Per-channel rolling quotas. The `default` key applies to any
    /// channel without its own entry.
    #[serde(default)]
    pub quotas: BTreeMap<String, QuotaConfig>,
    #[serde(default)]
    pub dedupe: DedupeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Accepted for forward compatibility; currently a passthrough.
    #[serde(default)]
    pub limits: serde_json::Value,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
    /// Provider references (`registry:key` or `registry.key`) resolved
    /// against the factory registry at startup.
    #[serde(default)]
    pub providers: BTreeMap<String, String>,
    #[serde(default)]
    pub profiles: ProfilesConfig,
}

/// Scheduler and coalescing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "bool_true")]
    pub jitter_enabled: bool,
    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
    #[serde(default = "default_coalesce_window_seconds")]
    pub coalesce_window_seconds: u64,
    #[serde(default = "default_coalesce_threshold")]
    pub coalesce_threshold: usize,
}

fn default_timezone() -> String {
    "Asia/Tokyo".into()
}
fn bool_true() -> bool {
    true
}
fn default_jitter_min_ms() -> u64 {
    100
}
fn default_jitter_max_ms() -> u64 {
    500
}
fn default_coalesce_window_seconds() -> u64 {
    180
}
fn default_coalesce_threshold() -> usize {
    3
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            jitter_enabled: true,
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
            coalesce_window_seconds: default_coalesce_window_seconds(),
            coalesce_threshold: default_coalesce_threshold(),
        }
    }
}

/// Cooldown gate configuration; jobs opt in per name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub jobs: BTreeMap<String, CooldownJobConfig>,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jobs: BTreeMap::new(),
        }
    }
}

/// Per-job cooldown parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownJobConfig {
    pub base_window_seconds: u64,
    #[serde(default = "default_max_factor")]
    pub max_factor: f64,
    #[serde(default = "default_growth")]
    pub growth: f64,
}

fn default_max_factor() -> f64 {
    6.0
}
fn default_growth() -> f64 {
    1.5
}

/// Sliding-window quota for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub window_seconds: u64,
    pub max_events: usize,
}

/// Near-duplicate filter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupeConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_dedupe_capacity")]
    pub capacity: usize,
    #[serde(default = "default_dedupe_ttl")]
    pub ttl_seconds: u64,
}

fn default_dedupe_capacity() -> usize {
    128
}
fn default_dedupe_ttl() -> u64 {
    3600
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_dedupe_capacity(),
            ttl_seconds: default_dedupe_ttl(),
        }
    }
}

/// Transport retry parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    8000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Metrics wiring; the export block is advisory for backends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub export: serde_json::Value,
}

/// One scheduled job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Single `HH:MM` fire time.
    #[serde(default)]
    pub schedule: Option<String>,
    /// Additional `HH:MM` fire times; collapsed with `schedule` into one
    /// job record with multiple slots.
    #[serde(default)]
    pub schedules: Vec<String>,
    /// Provider reference; defaults to `builtin:<job name>`.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    5
}

impl JobConfig {
    /// All configured fire times, `schedule` first.
    pub fn slots(&self) -> Vec<&str> {
        let mut slots: Vec<&str> = Vec::new();
        if let Some(single) = &self.schedule {
            slots.push(single.as_str());
        }
        slots.extend(self.schedules.iter().map(String::as_str));
        slots
    }
}

/// Active sender profiles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilesConfig {
    #[serde(default)]
    pub discord: ProfileConfig,
    #[serde(default)]
    pub misskey: ProfileConfig,
}

/// One platform profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_channel() -> String {
    "default".into()
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: default_channel(),
        }
    }
}

impl ProfilesConfig {
    /// The platform used for jobs without an explicit override: the first
    /// enabled profile, Discord winning ties.
    pub fn active_platform(&self) -> Option<(&'static str, &ProfileConfig)> {
        if self.discord.enabled {
            Some(("discord", &self.discord))
        } else if self.misskey.enabled {
            Some(("misskey", &self.misskey))
        } else {
            None
        }
    }
}

impl Settings {
    /// Load and validate a settings document from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "failed to read settings from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate a settings document from a JSON string.
    pub fn from_json(raw: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(raw)
            .map_err(|e| Error::config(format!("invalid settings document: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject inconsistent documents wholesale.
    pub fn validate(&self) -> Result<()> {
        self.scheduler
            .timezone
            .parse::<Tz>()
            .map_err(|_| Error::validation(format!("unknown timezone {:?}", self.scheduler.timezone)))?;

        if self.scheduler.jitter_min_ms > self.scheduler.jitter_max_ms {
            return Err(Error::validation(format!(
                "scheduler.jitter_min_ms ({}) exceeds jitter_max_ms ({})",
                self.scheduler.jitter_min_ms, self.scheduler.jitter_max_ms
            )));
        }
        if self.scheduler.coalesce_threshold == 0 {
            return Err(Error::validation("scheduler.coalesce_threshold must be positive"));
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::validation("retry.max_attempts must be at least 1"));
        }

        for (channel, quota) in &self.quotas {
            if quota.window_seconds == 0 || quota.max_events == 0 {
                return Err(Error::validation(format!(
                    "quotas.{channel}: window_seconds and max_events must be positive"
                )));
            }
        }

        if self.dedupe.enabled && (self.dedupe.capacity == 0 || self.dedupe.ttl_seconds == 0) {
            return Err(Error::validation(
                "dedupe.capacity and dedupe.ttl_seconds must be positive when enabled",
            ));
        }

        for (job, cooldown) in &self.cooldown.jobs {
            if cooldown.base_window_seconds == 0 {
                return Err(Error::validation(format!(
                    "cooldown.jobs.{job}.base_window_seconds must be positive"
                )));
            }
            if cooldown.max_factor < 1.0 || cooldown.growth < 1.0 {
                return Err(Error::validation(format!(
                    "cooldown.jobs.{job}: max_factor and growth must be at least 1.0"
                )));
            }
        }

        for (name, job) in &self.jobs {
            let slots = job.slots();
            if slots.is_empty() {
                return Err(Error::validation(format!(
                    "jobs.{name} defines no schedule"
                )));
            }
            for slot in slots {
                parse_slot(slot).map_err(|_| {
                    Error::validation(format!("jobs.{name}: invalid schedule {slot:?}"))
                })?;
            }
        }

        for (name, reference) in &self.providers {
            if !reference.contains(':') && !reference.contains('.') {
                return Err(Error::validation(format!(
                    "providers.{name}: reference {reference:?} is not of the form registry:key"
                )));
            }
        }

        Ok(())
    }

    /// Parsed scheduler timezone. Only valid after [`validate`](Self::validate).
    pub fn timezone(&self) -> Tz {
        self.scheduler
            .timezone
            .parse::<Tz>()
            .unwrap_or(chrono_tz::UTC)
    }
}

/// Parse a wall-clock slot in `HH:MM` form.
pub fn parse_slot(slot: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(slot, "%H:%M")
        .map_err(|e| Error::validation(format!("invalid slot {slot:?}: {e}")))
}
