//! End-to-end tests for the send-control pipeline.
//!
//! These drive the real processor, gates and queue with a scripted
//! in-memory sender and a manual clock, and assert on the metrics
//! surface each scenario must leave behind.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use tidings::clock::ManualClock;
use tidings::config::{
    CooldownConfig, CooldownJobConfig, DedupeConfig, QuotaConfig, RetryConfig, Settings,
};
use tidings::metrics::{render_weekly_report, MetricsAggregator, WEEKLY_REPORT_JOB};
use tidings::pipeline::{
    CoalesceQueue, CooldownGate, DedupeFilter, PermitGate, Processor, RetryPolicy, SendRequest,
};
use tidings::sender::{SendError, Sender, SenderRegistry};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

/// Sender that replays a script of failures before succeeding.
struct ScriptedSender {
    script: Mutex<Vec<Result<(), SendError>>>,
    sent: Mutex<Vec<String>>,
}

impl ScriptedSender {
    fn always_ok() -> Arc<Self> {
        Self::scripted(Vec::new())
    }

    fn scripted(script: Vec<Result<(), SendError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Sender for ScriptedSender {
    fn platform(&self) -> &str {
        "discord"
    }

    async fn send(&self, _channel: &str, text: &str) -> Result<(), SendError> {
        let step = {
            let mut script = self.script.lock();
            if script.is_empty() {
                Ok(())
            } else {
                script.remove(0)
            }
        };
        if step.is_ok() {
            self.sent.lock().push(text.to_string());
        }
        step
    }
}

struct Pipeline {
    processor: Processor,
    clock: Arc<ManualClock>,
    metrics: Arc<MetricsAggregator>,
    sender: Arc<ScriptedSender>,
}

struct PipelineConfig {
    quotas: BTreeMap<String, QuotaConfig>,
    cooldown: CooldownConfig,
    dedupe: DedupeConfig,
    retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quotas: BTreeMap::new(),
            cooldown: CooldownConfig::default(),
            dedupe: DedupeConfig::default(),
            retry: RetryConfig {
                max_attempts: 3,
                base_backoff_ms: 1,
                max_backoff_ms: 2,
            },
        }
    }
}

fn pipeline(sender: Arc<ScriptedSender>, config: PipelineConfig) -> Pipeline {
    let clock = Arc::new(ManualClock::new(at(0)));
    let metrics = Arc::new(MetricsAggregator::new());
    let mut senders = SenderRegistry::new();
    senders.register(sender.clone());

    let processor = Processor::new(
        senders,
        CooldownGate::from_settings(&config.cooldown),
        DedupeFilter::from_settings(&config.dedupe),
        PermitGate::from_settings(&config.quotas),
        RetryPolicy::from_settings(&config.retry),
        metrics.clone(),
        clock.clone(),
        CancellationToken::new(),
    );
    Pipeline {
        processor,
        clock,
        metrics,
        sender,
    }
}

async fn push_through(pipeline: &Pipeline, requests: Vec<SendRequest>) {
    let queue = CoalesceQueue::new(600, 100);
    for request in requests {
        queue.push(request);
    }
    for batch in queue.force_flush() {
        pipeline.processor.process(batch).await;
    }
}

fn request(job: &str, channel: &str, text: &str, when: DateTime<Utc>) -> SendRequest {
    SendRequest::new("discord", channel, job, text, 5, when)
}

mod permit_denial {
    use super::*;

    #[tokio::test]
    async fn third_send_in_window_is_denied_with_suffixed_job_tag() {
        let sender = ScriptedSender::always_ok();
        let quotas: BTreeMap<String, QuotaConfig> = [(
            "general".to_string(),
            QuotaConfig {
                window_seconds: 60,
                max_events: 2,
            },
        )]
        .into();
        let p = pipeline(
            sender.clone(),
            PipelineConfig {
                quotas,
                ..PipelineConfig::default()
            },
        );

        push_through(
            &p,
            vec![
                request("news", "general", "one", at(0)),
                request("news", "general", "two", at(1)),
                request("news", "general", "three", at(2)),
            ],
        )
        .await;

        assert_eq!(sender.sent(), vec!["one", "two"]);
        assert_eq!(p.metrics.counter_total("send_success"), 2);
        assert_eq!(
            p.metrics.counter(
                "permit_denied",
                &[
                    ("job", "news-denied"),
                    ("platform", "discord"),
                    ("channel", "general"),
                    ("reason", "quota_exceeded"),
                    ("retryable", "true"),
                ],
            ),
            1
        );
    }

    #[tokio::test]
    async fn denied_request_never_produces_a_send_event() {
        let sender = ScriptedSender::always_ok();
        let quotas: BTreeMap<String, QuotaConfig> = [(
            "general".to_string(),
            QuotaConfig {
                window_seconds: 60,
                max_events: 1,
            },
        )]
        .into();
        let p = pipeline(
            sender.clone(),
            PipelineConfig {
                quotas,
                ..PipelineConfig::default()
            },
        );

        push_through(
            &p,
            vec![
                request("news", "general", "one", at(0)),
                request("news", "general", "two", at(1)),
            ],
        )
        .await;

        assert_eq!(p.metrics.counter_total("send_success"), 1);
        assert_eq!(p.metrics.counter_total("send_failure"), 0);
        assert_eq!(p.metrics.counter_total("permit_denied"), 1);
    }
}

mod duplicate_skip {
    use super::*;

    #[tokio::test]
    async fn second_identical_payload_is_skipped_and_quota_untouched() {
        let sender = ScriptedSender::always_ok();
        let quotas: BTreeMap<String, QuotaConfig> = [(
            "general".to_string(),
            QuotaConfig {
                window_seconds: 600,
                max_events: 10,
            },
        )]
        .into();
        let p = pipeline(
            sender.clone(),
            PipelineConfig {
                quotas,
                ..PipelineConfig::default()
            },
        );

        push_through(
            &p,
            vec![
                request("news", "general", "hello", at(0)),
                request("news", "general", "hello", at(1)),
            ],
        )
        .await;

        assert_eq!(sender.sent(), vec!["hello"]);
        assert_eq!(p.metrics.counter_total("send_success"), 1);
        assert_eq!(
            p.metrics.counter(
                "send_duplicate_skip",
                &[
                    ("job", "news"),
                    ("platform", "discord"),
                    ("channel", "general"),
                    ("status", "duplicate"),
                    ("retryable", "false"),
                ],
            ),
            1
        );
        // The skipped duplicate consumed no quota: ring length is one.
        assert_eq!(p.metrics.counter_total("permit_denied"), 0);
    }
}

mod cooldown_flow {
    use super::*;

    #[tokio::test]
    async fn cooldown_suppresses_then_resumes() {
        let sender = ScriptedSender::always_ok();
        let mut cooldown = CooldownConfig::default();
        cooldown.jobs.insert(
            "weather".into(),
            CooldownJobConfig {
                base_window_seconds: 10,
                max_factor: 6.0,
                growth: 1.5,
            },
        );
        let p = pipeline(
            sender.clone(),
            PipelineConfig {
                cooldown,
                ..PipelineConfig::default()
            },
        );

        push_through(&p, vec![request("weather", "general", "first", at(0))]).await;
        assert_eq!(p.metrics.counter_total("send_success"), 1);

        p.clock.set(at(5));
        push_through(&p, vec![request("weather", "general", "second", at(5))]).await;
        assert_eq!(p.metrics.counter_total("send_cooldown_skip"), 1);
        assert_eq!(p.metrics.counter_total("send_success"), 1);

        p.clock.set(at(11));
        push_through(&p, vec![request("weather", "general", "third", at(11))]).await;
        assert_eq!(p.metrics.counter_total("send_success"), 2);
        assert_eq!(sender.sent(), vec!["first", "third"]);
    }

    #[tokio::test]
    async fn skipped_traffic_emits_no_permit_or_send_events() {
        let sender = ScriptedSender::always_ok();
        let mut cooldown = CooldownConfig::default();
        cooldown.jobs.insert(
            "weather".into(),
            CooldownJobConfig {
                base_window_seconds: 60,
                max_factor: 6.0,
                growth: 1.5,
            },
        );
        let quotas: BTreeMap<String, QuotaConfig> = [(
            "general".to_string(),
            QuotaConfig {
                window_seconds: 60,
                max_events: 1,
            },
        )]
        .into();
        let p = pipeline(
            sender.clone(),
            PipelineConfig {
                quotas,
                cooldown,
                ..PipelineConfig::default()
            },
        );

        push_through(&p, vec![request("weather", "general", "first", at(0))]).await;
        push_through(&p, vec![request("weather", "general", "second", at(1))]).await;

        // The second request died at the cooldown gate, so it neither
        // consumed quota nor produced a permit denial.
        assert_eq!(p.metrics.counter_total("send_cooldown_skip"), 1);
        assert_eq!(p.metrics.counter_total("permit_denied"), 0);
        assert_eq!(p.metrics.counter_total("send_success"), 1);
    }
}

mod retry_flow {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_limited_send_retries_once_and_waits_retry_after() {
        let sender = ScriptedSender::scripted(vec![Err(SendError::from_status(
            429,
            Some(Duration::from_secs(2)),
        ))]);
        let p = pipeline(sender.clone(), PipelineConfig::default());

        let started = tokio::time::Instant::now();
        push_through(&p, vec![request("news", "general", "body", at(0))]).await;

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(sender.sent(), vec!["body"]);
        assert_eq!(p.metrics.counter_total("send_success"), 1);
        assert_eq!(p.metrics.counter_total("send_failure"), 0);
    }

    #[tokio::test]
    async fn attempt_budget_is_never_exceeded() {
        let sender = ScriptedSender::scripted(vec![
            Err(SendError::from_status(500, None)),
            Err(SendError::from_status(500, None)),
            Err(SendError::from_status(500, None)),
            Err(SendError::from_status(500, None)),
        ]);
        let p = pipeline(sender.clone(), PipelineConfig::default());

        push_through(&p, vec![request("news", "general", "body", at(0))]).await;

        // max_attempts = 3: one attempt remains unconsumed in the script.
        assert_eq!(sender.script.lock().len(), 1);
        assert_eq!(p.metrics.counter_total("send_failure"), 1);
        assert_eq!(p.metrics.counter_total("send_success"), 0);
    }
}

mod weekly_snapshot {
    use super::*;

    #[tokio::test]
    async fn snapshot_counts_rates_and_denial_reasons() {
        let metrics = MetricsAggregator::new();
        for i in 0..10 {
            metrics.record_send_success("news", "discord", "general", 0.1, at(i));
        }
        metrics.record_send_failure("news", "discord", "general", "server_error", false, 0.2, at(20));
        metrics.record_send_failure("news", "discord", "general", "network", false, 0.2, at(21));
        metrics.record_permit_denied(
            "news",
            "news-denied",
            "discord",
            "general",
            "quota_exceeded",
            true,
            at(30),
        );
        // The weekly-report job's own traffic must not skew the rate.
        metrics.record_send_failure(
            WEEKLY_REPORT_JOB,
            "discord",
            "ops-weekly",
            "server_error",
            false,
            0.2,
            at(40),
        );

        let snapshot = metrics.weekly_snapshot(at(3600));
        let news = &snapshot.per_job["news"];
        assert_eq!(news.sent, 10);
        assert_eq!(news.failed, 2);
        assert!((news.success_rate - 10.0 / 12.0).abs() < 1e-9);
        assert_eq!(snapshot.permit_denial_reasons["quota_exceeded"], 1);
        assert!(!snapshot.per_job.contains_key(WEEKLY_REPORT_JOB));

        let report = render_weekly_report(&snapshot);
        assert!(report.contains("- news: 10 sent, 1 denied, 2 failed"));
        assert!(report.contains("Denials: quota_exceeded=1"));
    }
}

mod settings_reload {
    use super::*;
    use tidings::config::watcher::SettingsWatcher;

    #[tokio::test]
    async fn applying_the_same_settings_twice_reloads_at_most_once() {
        let initial = Arc::new(Settings::from_json("{}").unwrap());
        let (watcher, rx) = SettingsWatcher::new("settings.json", initial);

        let changed = Settings::from_json(r#"{"retry": {"max_attempts": 4}}"#).unwrap();
        assert!(watcher.apply(changed.clone()));
        assert!(!watcher.apply(changed.clone()));
        assert!(!watcher.apply(changed));
        assert_eq!(rx.borrow().retry.max_attempts, 4);
    }
}

mod ordering {
    use super::*;

    #[tokio::test]
    async fn same_key_payloads_reach_the_sender_in_order() {
        let sender = ScriptedSender::always_ok();
        let p = pipeline(sender.clone(), PipelineConfig::default());

        push_through(
            &p,
            vec![
                request("news", "general", "alpha", at(0)),
                request("news", "general", "beta", at(1)),
                request("news", "general", "gamma", at(2)),
            ],
        )
        .await;

        assert_eq!(sender.sent(), vec!["alpha", "beta", "gamma"]);
    }
}
