//! Metrics aggregator.
//!
//! Thread-safe counters keyed by tag-set, latency histograms with fixed
//! bucket boundaries in seconds, and a rolling 7-day event ring feeding
//! the weekly snapshot. The aggregator is injected as a narrow observer:
//! it never calls back into the pipeline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

/// Job whose own events are excluded from success-rate computation to
/// avoid the weekly report grading itself.
pub const WEEKLY_REPORT_JOB: &str = "weekly_report";

/// Histogram bucket upper bounds, in seconds.
const LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Retention of the event ring.
const RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Success { duration_secs: f64 },
    Failure { error: String },
    PermitDenied { reason: String },
    CooldownSkip,
    DuplicateSkip,
    FactoryError,
}

#[derive(Debug, Clone)]
struct EventRecord {
    at: DateTime<Utc>,
    job: String,
    outcome: Outcome,
}

struct Histogram {
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: LATENCY_BUCKETS.iter().map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    fn observe(&self, value_secs: f64) {
        for (bound, bucket) in LATENCY_BUCKETS.iter().zip(&self.buckets) {
            if value_secs <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value_secs * 1e6).max(0.0) as u64, Ordering::Relaxed);
    }
}

/// Counters, histograms and the 7-day rollup ring.
pub struct MetricsAggregator {
    counters: DashMap<String, AtomicU64>,
    histograms: DashMap<String, Histogram>,
    ring: Mutex<Vec<EventRecord>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            histograms: DashMap::new(),
            ring: Mutex::new(Vec::new()),
        }
    }

    fn increment(&self, name: &str, tags: &[(&str, &str)]) {
        self.add(name, tags, 1);
    }

    fn add(&self, name: &str, tags: &[(&str, &str)], amount: u64) {
        let key = series_key(name, tags);
        self.counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    fn observe(&self, name: &str, tags: &[(&str, &str)], value_secs: f64) {
        let key = series_key(name, tags);
        self.histograms
            .entry(key)
            .or_insert_with(Histogram::new)
            .observe(value_secs);
    }

    fn push_event(&self, at: DateTime<Utc>, job: &str, outcome: Outcome) {
        let mut ring = self.ring.lock();
        ring.push(EventRecord {
            at,
            job: job.to_string(),
            outcome,
        });
        // Opportunistic pruning keeps the ring bounded between snapshots.
        let cutoff = at - Duration::days(RETENTION_DAYS);
        if ring.first().is_some_and(|oldest| oldest.at < cutoff) {
            ring.retain(|record| record.at >= cutoff);
        }
    }

    /// Successful terminal dispatch; also samples `send.duration`.
    pub fn record_send_success(
        &self,
        job: &str,
        platform: &str,
        channel: &str,
        duration_secs: f64,
        at: DateTime<Utc>,
    ) {
        self.increment(
            "send_success",
            &[
                ("job", job),
                ("platform", platform),
                ("channel", channel),
                ("status", "success"),
            ],
        );
        self.observe("send.duration", &[("job", job)], duration_secs);
        self.push_event(at, job, Outcome::Success { duration_secs });
    }

    /// Terminal failure (non-retryable or retry-exhausted).
    pub fn record_send_failure(
        &self,
        job: &str,
        platform: &str,
        channel: &str,
        error: &str,
        retryable: bool,
        duration_secs: f64,
        at: DateTime<Utc>,
    ) {
        let retryable = if retryable { "true" } else { "false" };
        self.increment(
            "send_failure",
            &[
                ("job", job),
                ("platform", platform),
                ("channel", channel),
                ("status", "failure"),
                ("error", error),
                ("retryable", retryable),
            ],
        );
        self.observe("send.duration", &[("job", job)], duration_secs);
        self.push_event(
            at,
            job,
            Outcome::Failure {
                error: error.to_string(),
            },
        );
    }

    /// Quota denial. `job_tag` carries the denial suffix for audit parity
    /// with the log stream; the rollup uses the undecorated `job`.
    #[allow(clippy::too_many_arguments)]
    pub fn record_permit_denied(
        &self,
        job: &str,
        job_tag: &str,
        platform: &str,
        channel: &str,
        reason: &str,
        retryable: bool,
        at: DateTime<Utc>,
    ) {
        let retryable = if retryable { "true" } else { "false" };
        self.increment(
            "permit_denied",
            &[
                ("job", job_tag),
                ("platform", platform),
                ("channel", channel),
                ("reason", reason),
                ("retryable", retryable),
            ],
        );
        self.push_event(
            at,
            job,
            Outcome::PermitDenied {
                reason: reason.to_string(),
            },
        );
    }

    pub fn record_cooldown_skip(
        &self,
        job: &str,
        platform: &str,
        channel: &str,
        at: DateTime<Utc>,
    ) {
        self.increment(
            "send_cooldown_skip",
            &[
                ("job", job),
                ("platform", platform),
                ("channel", channel),
                ("status", "cooldown_skip"),
            ],
        );
        self.push_event(at, job, Outcome::CooldownSkip);
    }

    pub fn record_duplicate_skip(
        &self,
        job: &str,
        platform: &str,
        channel: &str,
        at: DateTime<Utc>,
    ) {
        self.increment(
            "send_duplicate_skip",
            &[
                ("job", job),
                ("platform", platform),
                ("channel", channel),
                ("status", "duplicate"),
                ("retryable", "false"),
            ],
        );
        self.push_event(at, job, Outcome::DuplicateSkip);
    }

    pub fn record_factory_error(&self, job: &str, at: DateTime<Utc>) {
        self.increment(
            "factory_error",
            &[("job", job), ("status", "factory_error")],
        );
        self.push_event(at, job, Outcome::FactoryError);
    }

    /// Observed dispatch delay (jitter sleep) in seconds.
    pub fn record_send_delay(&self, job: &str, platform: &str, channel: &str, delay_secs: f64) {
        self.observe(
            "send.delay",
            &[("job", job), ("platform", platform), ("channel", channel)],
            delay_secs,
        );
    }

    /// Work abandoned at shutdown.
    pub fn record_shutdown(&self, abandoned: usize) {
        self.increment("shutdown", &[]);
        if abandoned > 0 {
            self.add("shutdown.abandoned", &[], abandoned as u64);
        }
    }

    /// Counter value for exact name and tags; 0 when the series is absent.
    pub fn counter(&self, name: &str, tags: &[(&str, &str)]) -> u64 {
        self.counters
            .get(&series_key(name, tags))
            .map(|entry| entry.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum over every series of a counter regardless of tags.
    pub fn counter_total(&self, name: &str) -> u64 {
        let prefix = format!("{name}{{");
        self.counters
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.value().load(Ordering::Relaxed))
            .sum()
    }

    /// Number of samples observed for a histogram series.
    pub fn observation_count(&self, name: &str, tags: &[(&str, &str)]) -> u64 {
        self.histograms
            .get(&series_key(name, tags))
            .map(|entry| entry.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Build the rolling 7-day snapshot ending at `now`.
    pub fn weekly_snapshot(&self, now: DateTime<Utc>) -> WeeklySnapshot {
        let window_start = now - Duration::days(RETENTION_DAYS);
        let mut per_job: BTreeMap<String, JobWeekly> = BTreeMap::new();
        let mut denial_reasons: BTreeMap<String, u64> = BTreeMap::new();
        let mut latencies: BTreeMap<String, Vec<f64>> = BTreeMap::new();

        let ring = self.ring.lock();
        for record in ring.iter() {
            if record.at < window_start || record.at > now {
                continue;
            }
            if record.job == WEEKLY_REPORT_JOB {
                continue;
            }
            let entry = per_job.entry(record.job.clone()).or_default();
            match &record.outcome {
                Outcome::Success { duration_secs } => {
                    entry.sent += 1;
                    latencies
                        .entry(record.job.clone())
                        .or_default()
                        .push(*duration_secs);
                }
                Outcome::Failure { .. } => entry.failed += 1,
                Outcome::PermitDenied { reason } => {
                    entry.denied += 1;
                    *denial_reasons.entry(reason.clone()).or_default() += 1;
                }
                Outcome::CooldownSkip | Outcome::DuplicateSkip | Outcome::FactoryError => {}
            }
        }
        drop(ring);

        for (job, entry) in per_job.iter_mut() {
            let terminal = entry.sent + entry.failed;
            entry.success_rate = if terminal == 0 {
                0.0
            } else {
                entry.sent as f64 / terminal as f64
            };
            if let Some(samples) = latencies.get_mut(job) {
                samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                entry.latency_p50 = percentile(samples, 0.50);
                entry.latency_p95 = percentile(samples, 0.95);
            }
        }

        WeeklySnapshot {
            window_start,
            window_end: now,
            per_job,
            permit_denial_reasons: denial_reasons,
        }
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-job weekly rollup.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobWeekly {
    pub sent: u64,
    pub denied: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub latency_p50: f64,
    pub latency_p95: f64,
}

/// Rolling 7-day aggregation of outcome counters and latency quantiles.
#[derive(Debug, Clone, Serialize)]
pub struct WeeklySnapshot {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub per_job: BTreeMap<String, JobWeekly>,
    pub permit_denial_reasons: BTreeMap<String, u64>,
}

/// Stable series key: name plus tags sorted by tag name.
fn series_key(name: &str, tags: &[(&str, &str)]) -> String {
    let mut sorted: Vec<(&str, &str)> = tags.to_vec();
    sorted.sort_by_key(|(key, _)| *key);
    let mut out = String::with_capacity(name.len() + 16 * sorted.len());
    out.push_str(name);
    out.push('{');
    for (i, (key, value)) in sorted.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(value);
    }
    out.push('}');
    out
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
