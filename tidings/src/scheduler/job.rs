//! Scheduled jobs and the provider registry.
//!
//! Content producers are opaque to the pipeline: a [`JobFactory`] builds
//! zero or more text payloads at fire time and the scheduler turns them
//! into send requests. Provider references in settings
//! (`registry:key` or `registry.key`) are resolved against a lookup
//! table populated at startup; unknown references fail startup fatally.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveTime;
use rand::Rng;

use crate::config::{parse_slot, ProfilesConfig, Settings};
use crate::{Error, Result};

/// Builds payloads for one job at fire time.
#[async_trait]
pub trait JobFactory: Send + Sync {
    /// Zero or more payloads for this fire; an empty vec skips the slot.
    async fn build(&self) -> Result<Vec<String>>;
}

/// One job with all of its wall-clock fire slots collapsed into a single
/// record; the scheduler fires once per listed time per day.
pub struct ScheduledJob {
    pub name: String,
    pub slots: Vec<NaiveTime>,
    pub factory: Arc<dyn JobFactory>,
    pub priority: u8,
    pub platform: String,
    pub channel: String,
}

/// String → factory lookup table for provider references.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: HashMap<String, Arc<dyn JobFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in payload builders.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("builtin:weather", Arc::new(SampleWeather));
        registry.register("builtin:news", Arc::new(SampleNews));
        registry.register("builtin:omikuji", Arc::new(SampleOmikuji));
        registry.register("builtin:dm_digest", Arc::new(SampleDmDigest));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn JobFactory>) {
        self.entries.insert(name.into(), factory);
    }

    /// Resolve `registry:key` or `registry.key`. Unknown references are
    /// startup-fatal by contract.
    pub fn resolve(&self, reference: &str) -> Result<Arc<dyn JobFactory>> {
        let normalized = if reference.contains(':') {
            reference.to_string()
        } else {
            match reference.rsplit_once('.') {
                Some((registry, key)) => format!("{registry}:{key}"),
                None => reference.to_string(),
            }
        };
        self.entries
            .get(&normalized)
            .cloned()
            .ok_or_else(|| Error::UnknownProvider(reference.to_string()))
    }
}

/// Build the scheduled job list from settings.
///
/// Each `jobs.<name>` entry resolves its provider (default
/// `builtin:<name>`), inherits the active profile's platform and channel
/// unless overridden, and parses its fire slots.
pub fn jobs_from_settings(
    settings: &Settings,
    registry: &ProviderRegistry,
) -> Result<Vec<ScheduledJob>> {
    let (default_platform, default_channel) = default_destination(&settings.profiles)?;

    let mut jobs = Vec::with_capacity(settings.jobs.len());
    for (name, config) in &settings.jobs {
        let reference = settings
            .providers
            .get(name)
            .cloned()
            .or_else(|| config.provider.clone())
            .unwrap_or_else(|| format!("builtin:{name}"));
        let factory = registry.resolve(&reference)?;

        let mut slots = Vec::with_capacity(config.slots().len());
        for slot in config.slots() {
            slots.push(parse_slot(slot)?);
        }

        jobs.push(ScheduledJob {
            name: name.clone(),
            slots,
            factory,
            priority: config.priority,
            platform: config
                .platform
                .clone()
                .unwrap_or_else(|| default_platform.clone()),
            channel: config
                .channel
                .clone()
                .unwrap_or_else(|| default_channel.clone()),
        });
    }
    Ok(jobs)
}

fn default_destination(profiles: &ProfilesConfig) -> Result<(String, String)> {
    let (platform, profile) = profiles
        .active_platform()
        .ok_or_else(|| Error::config("no sender profile is enabled"))?;
    Ok((platform.to_string(), profile.channel.clone()))
}

// Built-in builders stand in for the external content producers; the
// pipeline only ever sees the returned text.

struct SampleWeather;

#[async_trait]
impl JobFactory for SampleWeather {
    async fn build(&self) -> Result<Vec<String>> {
        Ok(vec![
            "Today's weather: clear with a light breeze, high of 24°C.".to_string(),
        ])
    }
}

struct SampleNews;

#[async_trait]
impl JobFactory for SampleNews {
    async fn build(&self) -> Result<Vec<String>> {
        Ok(vec![
            "News digest: nothing notable on the wire this hour.".to_string(),
        ])
    }
}

struct SampleOmikuji;

const FORTUNES: &[&str] = &[
    "Great blessing: an excellent day to ship.",
    "Middle blessing: steady progress, mind the small stuff.",
    "Small blessing: a quiet day; tidy your queue.",
    "Curse: double-check everything before sending.",
];

#[async_trait]
impl JobFactory for SampleOmikuji {
    async fn build(&self) -> Result<Vec<String>> {
        let pick = rand::rng().random_range(0..FORTUNES.len());
        Ok(vec![format!("Omikuji: {}", FORTUNES[pick])])
    }
}

struct SampleDmDigest;

#[async_trait]
impl JobFactory for SampleDmDigest {
    async fn build(&self) -> Result<Vec<String>> {
        Ok(vec![
            "DM digest: no direct messages required attention today.".to_string(),
        ])
    }
}
