//! Scheduler service.
//!
//! Two long-lived workers: the slot loop wakes once per minute in the
//! configured timezone and fires due job factories into the coalesce
//! queue; the dispatch worker polls the queue, applies jitter to each
//! ready batch and hands it to the processor. Factory failures never
//! poison later fires.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike};
use chrono_tz::Tz;
use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::SchedulerConfig;
use crate::metrics::MetricsAggregator;
use crate::pipeline::{CoalesceQueue, Processor, SendRequest};

use super::job::ScheduledJob;

/// How long the dispatch worker keeps processing after shutdown before
/// abandoning the rest.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Slot firing and batch dispatch.
pub struct SchedulerService {
    jobs: Vec<ScheduledJob>,
    queue: Arc<CoalesceQueue>,
    processor: Arc<Processor>,
    metrics: Arc<MetricsAggregator>,
    clock: SharedClock,
    tz: Tz,
    jitter_enabled: bool,
    jitter_min_ms: u64,
    jitter_max_ms: u64,
    /// Cancels in-flight retries once the drain grace window ends.
    abort: CancellationToken,
    fired: Mutex<HashSet<(String, NaiveTime, NaiveDate)>>,
}

impl SchedulerService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Vec<ScheduledJob>,
        queue: Arc<CoalesceQueue>,
        processor: Arc<Processor>,
        metrics: Arc<MetricsAggregator>,
        clock: SharedClock,
        tz: Tz,
        config: &SchedulerConfig,
        abort: CancellationToken,
    ) -> Self {
        Self {
            jobs,
            queue,
            processor,
            metrics,
            clock,
            tz,
            jitter_enabled: config.jitter_enabled,
            jitter_min_ms: config.jitter_min_ms,
            jitter_max_ms: config.jitter_max_ms,
            abort,
            fired: Mutex::new(HashSet::new()),
        }
    }

    /// Slot loop: fire due jobs, then sleep to the next minute boundary.
    pub async fn run_slots(&self, shutdown: CancellationToken) {
        info!(
            jobs = self.jobs.len(),
            timezone = %self.tz,
            "scheduler slot loop started"
        );
        loop {
            let local = self.clock.now().with_timezone(&self.tz);
            self.fire_due_slots(local).await;

            let sleep_for = seconds_to_next_minute(local);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("slot loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Fire every job whose slot matches the current local minute. Each
    /// `(job, slot)` pair fires at most once per day.
    pub async fn fire_due_slots(&self, local: DateTime<Tz>) {
        let Some(minute) = NaiveTime::from_hms_opt(local.hour(), local.minute(), 0) else {
            return;
        };
        let today = local.date_naive();

        for job in &self.jobs {
            for slot in &job.slots {
                if *slot != minute {
                    continue;
                }
                if !self.mark_fired(&job.name, *slot, today) {
                    continue;
                }
                self.fire_job(job).await;
            }
        }
    }

    fn mark_fired(&self, name: &str, slot: NaiveTime, date: NaiveDate) -> bool {
        let mut fired = self.fired.lock();
        fired.retain(|(_, _, fired_date)| *fired_date == date);
        fired.insert((name.to_string(), slot, date))
    }

    async fn fire_job(&self, job: &ScheduledJob) {
        match job.factory.build().await {
            Ok(payloads) => {
                let enqueued_at = self.clock.now();
                for payload in payloads {
                    self.queue.push(SendRequest::new(
                        job.platform.as_str(),
                        job.channel.as_str(),
                        job.name.as_str(),
                        payload,
                        job.priority,
                        enqueued_at,
                    ));
                }
            }
            Err(err) => {
                self.metrics
                    .record_factory_error(&job.name, self.clock.now());
                error!(
                    event = "factory_error",
                    job = %job.name,
                    platform = %job.platform,
                    channel = %job.channel,
                    correlation_id = %Uuid::new_v4(),
                    status = "factory_error",
                    error = %err,
                    "job factory failed"
                );
            }
        }
    }

    /// Dispatch worker: drains the queue's ready list until shutdown,
    /// then drains opened batches within the grace window.
    pub async fn run_dispatch(&self, shutdown: CancellationToken) {
        let poll = poll_interval(self.queue.window_seconds());
        debug!(poll_ms = poll.as_millis() as u64, "dispatch worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.drain_for_shutdown().await;
                    return;
                }
                _ = tokio::time::sleep(poll) => {}
            }
            self.dispatch_ready_batches(&shutdown).await;
        }
    }

    /// Forward closed batches to the processor, FIFO within each drain.
    /// Jitter delays the batch dispatch, never the factory.
    pub async fn dispatch_ready_batches(&self, shutdown: &CancellationToken) {
        let now = self.clock.now();
        for batch in self.queue.pop_ready(now) {
            let delay = jitter_delay(self.jitter_enabled, self.jitter_min_ms, self.jitter_max_ms);
            if !delay.is_zero() {
                tokio::select! {
                    // On shutdown the remaining delay is skipped so the
                    // batch still reaches the drain path.
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            self.metrics.record_send_delay(
                &batch.key.job,
                &batch.key.platform,
                &batch.key.channel,
                delay.as_secs_f64(),
            );
            self.processor.process(batch).await;
        }
    }

    async fn drain_for_shutdown(&self) {
        let batches = self.queue.force_flush();
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        let mut abandoned = 0usize;

        for batch in batches {
            if tokio::time::Instant::now() >= deadline {
                abandoned += 1;
                continue;
            }
            if tokio::time::timeout_at(deadline, self.processor.process(batch))
                .await
                .is_err()
            {
                abandoned += 1;
            }
        }

        self.abort.cancel();
        self.metrics.record_shutdown(abandoned);
        info!(
            event = "shutdown",
            abandoned, "dispatch worker drained"
        );
    }
}

/// Uniform dispatch jitter; both bounds are admissible outcomes. Zero
/// when disabled.
pub(crate) fn jitter_delay(enabled: bool, min_ms: u64, max_ms: u64) -> Duration {
    if !enabled {
        return Duration::ZERO;
    }
    if min_ms >= max_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
}

fn seconds_to_next_minute(local: DateTime<Tz>) -> Duration {
    let elapsed = local.second() as f64 + local.nanosecond() as f64 / 1e9;
    Duration::from_secs_f64((60.0 - elapsed).clamp(0.2, 60.0))
}

fn poll_interval(window_seconds: u64) -> Duration {
    Duration::from_millis((window_seconds * 1000 / 2).max(200)).min(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{CooldownConfig, DedupeConfig, QuotaConfig, RetryConfig};
    use crate::pipeline::{CooldownGate, DedupeFilter, PermitGate, RetryPolicy};
    use crate::scheduler::job::JobFactory;
    use crate::sender::{SendError, Sender, SenderRegistry};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingFactory {
        builds: AtomicU32,
        fail: bool,
    }

    impl CountingFactory {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                builds: AtomicU32::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                builds: AtomicU32::new(0),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl JobFactory for CountingFactory {
        async fn build(&self) -> crate::Result<Vec<String>> {
            let n = self.builds.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err(crate::Error::job("feed unavailable"));
            }
            Ok(vec![format!("payload {n}")])
        }
    }

    struct OkSender;

    #[async_trait]
    impl Sender for OkSender {
        fn platform(&self) -> &str {
            "discord"
        }
        async fn send(&self, _channel: &str, _text: &str) -> Result<(), SendError> {
            Ok(())
        }
    }

    fn job(name: &str, factory: Arc<dyn JobFactory>, slot: &str) -> ScheduledJob {
        ScheduledJob {
            name: name.into(),
            slots: vec![NaiveTime::parse_from_str(slot, "%H:%M").unwrap()],
            factory,
            priority: 5,
            platform: "discord".into(),
            channel: "general".into(),
        }
    }

    fn service(jobs: Vec<ScheduledJob>, window_seconds: u64, jitter_enabled: bool) -> (SchedulerService, Arc<MetricsAggregator>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 7, 30, 0).unwrap(),
        ));
        let metrics = Arc::new(MetricsAggregator::new());
        let queue = Arc::new(CoalesceQueue::new(window_seconds, 10));
        let mut senders = SenderRegistry::new();
        senders.register(Arc::new(OkSender));
        let processor = Arc::new(Processor::new(
            senders,
            CooldownGate::from_settings(&CooldownConfig::default()),
            DedupeFilter::from_settings(&DedupeConfig::default()),
            PermitGate::from_settings(&BTreeMap::<String, QuotaConfig>::new()),
            RetryPolicy::from_settings(&RetryConfig::default()),
            metrics.clone(),
            clock.clone(),
            CancellationToken::new(),
        ));
        let config = SchedulerConfig {
            timezone: "UTC".into(),
            jitter_enabled,
            jitter_min_ms: 1,
            jitter_max_ms: 2,
            coalesce_window_seconds: window_seconds,
            coalesce_threshold: 10,
        };
        let service = SchedulerService::new(
            jobs,
            queue,
            processor,
            metrics.clone(),
            clock.clone(),
            chrono_tz::UTC,
            &config,
            CancellationToken::new(),
        );
        (service, metrics, clock)
    }

    fn local(clock: &ManualClock) -> DateTime<Tz> {
        clock.now().with_timezone(&chrono_tz::UTC)
    }

    #[test]
    fn jitter_samples_cover_the_configured_range() {
        let mut seen_high = false;
        let mut seen_low = false;
        for _ in 0..1000 {
            let delay = jitter_delay(true, 100, 500);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(500));
            if delay >= Duration::from_millis(450) {
                seen_high = true;
            }
            if delay <= Duration::from_millis(150) {
                seen_low = true;
            }
        }
        assert!(seen_high, "no sample near the upper bound");
        assert!(seen_low, "no sample near the lower bound");
    }

    #[test]
    fn jitter_disabled_means_zero_offset() {
        for _ in 0..100 {
            assert_eq!(jitter_delay(false, 100, 500), Duration::ZERO);
        }
    }

    #[test]
    fn degenerate_jitter_range_is_the_single_value() {
        assert_eq!(jitter_delay(true, 250, 250), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn slot_fires_once_per_minute_and_again_next_day() {
        let factory = CountingFactory::ok();
        let (service, _metrics, clock) = service(
            vec![job("weather", factory.clone(), "07:30")],
            600,
            false,
        );

        service.fire_due_slots(local(&clock)).await;
        service.fire_due_slots(local(&clock)).await;
        assert_eq!(factory.builds.load(Ordering::Relaxed), 1);

        // A non-matching minute does not fire.
        clock.advance_secs(60);
        service.fire_due_slots(local(&clock)).await;
        assert_eq!(factory.builds.load(Ordering::Relaxed), 1);

        // The same slot the next day fires again.
        clock.advance_secs(24 * 3600 - 60);
        service.fire_due_slots(local(&clock)).await;
        assert_eq!(factory.builds.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn factory_error_is_recorded_and_other_jobs_still_fire() {
        let broken = CountingFactory::failing();
        let healthy = CountingFactory::ok();
        let (service, metrics, clock) = service(
            vec![
                job("news", broken.clone(), "07:30"),
                job("weather", healthy.clone(), "07:30"),
            ],
            600,
            false,
        );

        service.fire_due_slots(local(&clock)).await;
        assert_eq!(metrics.counter_total("factory_error"), 1);
        assert_eq!(healthy.builds.load(Ordering::Relaxed), 1);
        assert_eq!(service.queue.pending(), 1);

        // The next slot proceeds for the broken job too.
        clock.advance_secs(24 * 3600);
        service.fire_due_slots(local(&clock)).await;
        assert_eq!(broken.builds.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn dispatch_processes_ready_batches_and_records_delay() {
        let factory = CountingFactory::ok();
        let (service, metrics, clock) = service(
            vec![job("weather", factory, "07:30")],
            0,
            false,
        );

        service.fire_due_slots(local(&clock)).await;
        let shutdown = CancellationToken::new();
        service.dispatch_ready_batches(&shutdown).await;

        assert_eq!(metrics.counter_total("send_success"), 1);
        assert_eq!(
            metrics.observation_count(
                "send.delay",
                &[
                    ("job", "weather"),
                    ("platform", "discord"),
                    ("channel", "general"),
                ],
            ),
            1
        );
        assert_eq!(service.queue.pending(), 0);
    }

    #[tokio::test]
    async fn drain_processes_open_batches_on_shutdown() {
        let factory = CountingFactory::ok();
        let (service, metrics, clock) = service(
            vec![job("weather", factory, "07:30")],
            600,
            false,
        );

        service.fire_due_slots(local(&clock)).await;
        assert_eq!(service.queue.pending(), 1);

        service.drain_for_shutdown().await;
        assert_eq!(metrics.counter_total("send_success"), 1);
        assert_eq!(metrics.counter("shutdown", &[]), 1);
        assert!(service.abort.is_cancelled());
    }
}
