//! Channel admission control.
//!
//! Per-channel sliding-window quotas over *successful* sends. `admit` is
//! a read-only check; quota is consumed by `observe_success`, which the
//! orchestrator calls only after a dispatch succeeds, so denied and
//! failed attempts never count against the window.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::{QuotaConfig, DEFAULT_QUOTA_KEY};

/// Suffix appended to the job tag on denial so audit trails distinguish
/// granted and denied flows.
pub const DENIED_JOB_SUFFIX: &str = "-denied";

/// Why a permit decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitReason {
    QuotaAvailable,
    QuotaExceeded,
    ChannelUnknown,
    ConfigurationMissing,
}

impl PermitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuotaAvailable => "quota_available",
            Self::QuotaExceeded => "quota_exceeded",
            Self::ChannelUnknown => "channel_unknown",
            Self::ConfigurationMissing => "configuration_missing",
        }
    }
}

/// Admission decision for a single send.
#[derive(Debug, Clone, Copy)]
pub struct PermitDecision {
    pub granted: bool,
    pub reason: PermitReason,
    pub retryable: bool,
    pub suggested_job_suffix: Option<&'static str>,
}

impl PermitDecision {
    fn granted(reason: PermitReason) -> Self {
        Self {
            granted: true,
            reason,
            retryable: true,
            suggested_job_suffix: None,
        }
    }

    fn denied(reason: PermitReason, retryable: bool) -> Self {
        Self {
            granted: false,
            reason,
            retryable,
            suggested_job_suffix: Some(DENIED_JOB_SUFFIX),
        }
    }
}

struct ChannelWindow {
    window: Duration,
    max_events: usize,
    ring: VecDeque<DateTime<Utc>>,
}

impl ChannelWindow {
    fn new(quota: QuotaConfig) -> Self {
        Self {
            window: Duration::seconds(quota.window_seconds as i64),
            max_events: quota.max_events,
            ring: VecDeque::new(),
        }
    }

    // Invariant: after eviction every timestamp satisfies now - t < window.
    fn evict(&mut self, now: DateTime<Utc>) {
        while let Some(oldest) = self.ring.front() {
            if now - *oldest >= self.window {
                self.ring.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_full(&self) -> bool {
        self.ring.len() >= self.max_events
    }

    fn record(&mut self, now: DateTime<Utc>) {
        self.evict(now);
        self.ring.push_back(now);
    }
}

/// Sliding-window rate limiter keyed by channel.
pub struct PermitGate {
    quotas: HashMap<String, QuotaConfig>,
    default_quota: Option<QuotaConfig>,
    windows: Mutex<HashMap<String, ChannelWindow>>,
}

impl PermitGate {
    /// Build from the `quotas` settings section. The `default` entry, if
    /// present, applies to channels without their own entry.
    pub fn from_settings(
        quotas: &std::collections::BTreeMap<String, QuotaConfig>,
    ) -> Self {
        let default_quota = quotas.get(DEFAULT_QUOTA_KEY).copied();
        let quotas = quotas
            .iter()
            .filter(|(channel, _)| channel.as_str() != DEFAULT_QUOTA_KEY)
            .map(|(channel, quota)| (channel.clone(), *quota))
            .collect();
        Self {
            quotas,
            default_quota,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn quota_for(&self, channel: &str) -> Option<QuotaConfig> {
        self.quotas.get(channel).copied().or(self.default_quota)
    }

    /// Admission check. Read-only: a grant reserves nothing until
    /// [`observe_success`](Self::observe_success).
    pub fn admit(&self, channel: &str, now: DateTime<Utc>) -> PermitDecision {
        if self.quotas.is_empty() && self.default_quota.is_none() {
            // Nothing to enforce; the reason documents why the gate let it by.
            return PermitDecision::granted(PermitReason::ConfigurationMissing);
        }

        let Some(quota) = self.quota_for(channel) else {
            debug!(channel, "permit denied: channel has no quota entry");
            return PermitDecision::denied(PermitReason::ChannelUnknown, false);
        };

        let mut windows = self.windows.lock();
        let window = windows
            .entry(channel.to_string())
            .or_insert_with(|| ChannelWindow::new(quota));
        window.evict(now);
        if window.is_full() {
            return PermitDecision::denied(PermitReason::QuotaExceeded, true);
        }
        PermitDecision::granted(PermitReason::QuotaAvailable)
    }

    /// Consume quota for a successful dispatch.
    pub fn observe_success(&self, channel: &str, now: DateTime<Utc>) {
        let Some(quota) = self.quota_for(channel) else {
            return;
        };
        let mut windows = self.windows.lock();
        windows
            .entry(channel.to_string())
            .or_insert_with(|| ChannelWindow::new(quota))
            .record(now);
    }

    /// Number of events currently recorded in a channel's window.
    pub fn recorded(&self, channel: &str) -> usize {
        self.windows
            .lock()
            .get(channel)
            .map(|window| window.ring.len())
            .unwrap_or(0)
    }
}
