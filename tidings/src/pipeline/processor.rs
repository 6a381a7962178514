//! Orchestrator processor.
//!
//! Ties the gates together: for each payload of a batch, in insertion
//! order, consult Cooldown, then Dedupe, then Permit, then dispatch to
//! the platform sender under the retry policy. Every step emits one
//! structured audit line and exactly one terminal metrics observation per
//! request. Gates return decisions; nothing here throws across the
//! scheduler boundary.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::SharedClock;
use crate::metrics::MetricsAggregator;
use crate::sender::SenderRegistry;

use super::cooldown::CooldownGate;
use super::dedupe::DedupeFilter;
use super::permit::PermitGate;
use super::request::{Batch, SendRequest};
use super::retry::{send_with_retry, RetryPolicy};

/// Gate composition and dispatch.
pub struct Processor {
    senders: SenderRegistry,
    cooldown: CooldownGate,
    dedupe: DedupeFilter,
    permit: PermitGate,
    retry: RetryPolicy,
    metrics: Arc<MetricsAggregator>,
    clock: SharedClock,
    cancel: CancellationToken,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        senders: SenderRegistry,
        cooldown: CooldownGate,
        dedupe: DedupeFilter,
        permit: PermitGate,
        retry: RetryPolicy,
        metrics: Arc<MetricsAggregator>,
        clock: SharedClock,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            senders,
            cooldown,
            dedupe,
            permit,
            retry,
            metrics,
            clock,
            cancel,
        }
    }

    /// Process a closed batch; payloads keep their insertion order.
    pub async fn process(&self, batch: Batch) {
        for request in batch.requests {
            self.process_request(request).await;
        }
    }

    async fn process_request(&self, request: SendRequest) {
        let now = self.clock.now();

        if !self.cooldown.check(&request.job, now) {
            self.metrics
                .record_cooldown_skip(&request.job, &request.platform, &request.channel, now);
            info!(
                event = "send_cooldown_skip",
                job = %request.job,
                platform = %request.platform,
                channel = %request.channel,
                correlation_id = %request.correlation_id,
                status = "cooldown_skip",
                "send suppressed by cooldown"
            );
            return;
        }

        if !self.dedupe.check_and_insert(&request.payload, now) {
            self.metrics
                .record_duplicate_skip(&request.job, &request.platform, &request.channel, now);
            info!(
                event = "send_duplicate_skip",
                job = %request.job,
                platform = %request.platform,
                channel = %request.channel,
                correlation_id = %request.correlation_id,
                status = "duplicate",
                retryable = false,
                "near-duplicate payload skipped"
            );
            return;
        }

        let decision = self.permit.admit(&request.channel, now);
        if !decision.granted {
            let job_tag = format!(
                "{}{}",
                request.job,
                decision.suggested_job_suffix.unwrap_or_default()
            );
            self.metrics.record_permit_denied(
                &request.job,
                &job_tag,
                &request.platform,
                &request.channel,
                decision.reason.as_str(),
                decision.retryable,
                now,
            );
            warn!(
                event = "permit_denied",
                job = %job_tag,
                platform = %request.platform,
                channel = %request.channel,
                correlation_id = %request.correlation_id,
                status = "permit_denied",
                reason = decision.reason.as_str(),
                retryable = decision.retryable,
                "send denied by channel quota"
            );
            // Legacy consumers key on the job-prefixed event name; emitted
            // alongside the canonical line until they are migrated.
            warn!(
                event = %format!("{}_permit_denied", request.job),
                job = %job_tag,
                platform = %request.platform,
                channel = %request.channel,
                correlation_id = %request.correlation_id,
                status = "permit_denied",
                reason = decision.reason.as_str(),
                retryable = decision.retryable,
                "send denied by channel quota"
            );
            return;
        }

        let Some(sender) = self.senders.get(&request.platform) else {
            self.metrics.record_send_failure(
                &request.job,
                &request.platform,
                &request.channel,
                "platform_unconfigured",
                false,
                0.0,
                now,
            );
            error!(
                event = "send_failure",
                job = %request.job,
                platform = %request.platform,
                channel = %request.channel,
                correlation_id = %request.correlation_id,
                status = "failure",
                error_kind = "platform_unconfigured",
                retryable = false,
                "no sender registered for platform"
            );
            return;
        };

        let started = Instant::now();
        let outcome = send_with_retry(&self.retry, &self.cancel, |_| {
            sender.send(&request.channel, &request.payload)
        })
        .await;
        let duration = started.elapsed().as_secs_f64();

        match outcome.result {
            Ok(()) => {
                let now = self.clock.now();
                // Quota is consumed before the success event becomes
                // externally visible.
                self.permit.observe_success(&request.channel, now);
                self.cooldown.record_success(&request.job, now);
                self.metrics.record_send_success(
                    &request.job,
                    &request.platform,
                    &request.channel,
                    duration,
                    now,
                );
                info!(
                    event = "send_success",
                    job = %request.job,
                    platform = %request.platform,
                    channel = %request.channel,
                    correlation_id = %request.correlation_id,
                    status = "success",
                    duration_secs = duration,
                    attempts = outcome.attempts,
                    "sent"
                );
            }
            Err(send_error) => {
                let now = self.clock.now();
                if outcome.exhausted {
                    error!(
                        event = "send_retry_exhausted",
                        job = %request.job,
                        platform = %request.platform,
                        channel = %request.channel,
                        correlation_id = %request.correlation_id,
                        status = "failure",
                        attempts = outcome.attempts,
                        max_attempts = self.retry.max_attempts,
                        error_kind = send_error.kind.as_str(),
                        "retry budget exhausted"
                    );
                }
                // The policy has stopped; only cancellation leaves the
                // request worth retrying on a later slot.
                let retryable = outcome.cancelled;
                self.metrics.record_send_failure(
                    &request.job,
                    &request.platform,
                    &request.channel,
                    send_error.kind.as_str(),
                    retryable,
                    duration,
                    now,
                );
                error!(
                    event = "send_failure",
                    job = %request.job,
                    platform = %request.platform,
                    channel = %request.channel,
                    correlation_id = %request.correlation_id,
                    status = "failure",
                    error_kind = send_error.kind.as_str(),
                    status_code = send_error.status_code,
                    retryable,
                    attempts = outcome.attempts,
                    duration_secs = duration,
                    "send failed"
                );
            }
        }
    }
}
