//! Retry policy for transport sends.
//!
//! Exponential backoff with ±20% jitter, `Retry-After` honoring for rate
//! limits, and terminal classification for client errors. The attempt
//! budget bounds total sender invocations; cancellation is honored at
//! backoff boundaries.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::sender::{SendError, SendErrorKind};

/// Backoff parameters and attempt budget.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total sender invocations allowed per request.
    pub max_attempts: u32,
    /// Base delay; attempt `n` backs off `base × 2^n` before jitter.
    pub base_backoff: Duration,
    /// Hard cap on any computed delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.base_backoff_ms)),
        }
    }

    /// Decide what a failed attempt means. `attempt` is 0-indexed.
    pub fn classify(&self, error: &SendError, attempt: u32) -> RetryAction {
        match error.kind {
            SendErrorKind::RateLimited => RetryAction::Retry {
                wait: error
                    .retry_after
                    .unwrap_or_else(|| self.backoff_for_attempt(attempt)),
            },
            SendErrorKind::ServerError | SendErrorKind::Network => RetryAction::Retry {
                wait: self.backoff_for_attempt(attempt),
            },
            SendErrorKind::ClientError => RetryAction::Fail,
        }
    }

    /// Exponential delay with ±20% jitter, capped.
    ///
    /// 2^attempt is computed with a checked shift so a misconfigured
    /// attempt count saturates instead of overflowing.
    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp = self
            .base_backoff
            .checked_mul(multiplier)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);

        let span = exp.as_secs_f64() * 0.2;
        if span <= 0.0 {
            return exp;
        }
        let offset = rand::rng().random_range(-span..=span);
        Duration::from_secs_f64((exp.as_secs_f64() + offset).max(0.0)).min(self.max_backoff)
    }
}

/// Result of classifying a single failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry { wait: Duration },
    Fail,
}

/// Terminal outcome of a retried send.
#[derive(Debug)]
pub struct RetryOutcome {
    /// Sender invocations performed.
    pub attempts: u32,
    pub result: Result<(), SendError>,
    /// The attempt budget ran out on a retryable error.
    pub exhausted: bool,
    /// The caller was cancelled before the policy finished.
    pub cancelled: bool,
}

/// Drive `operation` under `policy` until success, terminal failure,
/// exhaustion or cancellation. The closure receives the 0-indexed
/// attempt number.
pub async fn send_with_retry<F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> RetryOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), SendError>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return RetryOutcome {
                attempts: attempt,
                result: Err(SendError::network()),
                exhausted: false,
                cancelled: true,
            };
        }

        let error = match operation(attempt).await {
            Ok(()) => {
                return RetryOutcome {
                    attempts: attempt + 1,
                    result: Ok(()),
                    exhausted: false,
                    cancelled: false,
                };
            }
            Err(error) => error,
        };

        match policy.classify(&error, attempt) {
            RetryAction::Fail => {
                return RetryOutcome {
                    attempts: attempt + 1,
                    result: Err(error),
                    exhausted: false,
                    cancelled: false,
                };
            }
            RetryAction::Retry { wait } => {
                if attempt + 1 >= policy.max_attempts {
                    return RetryOutcome {
                        attempts: attempt + 1,
                        result: Err(error),
                        exhausted: true,
                        cancelled: false,
                    };
                }
                warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error_kind = error.kind.as_str(),
                    "retrying transient send failure"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return RetryOutcome {
                            attempts: attempt + 1,
                            result: Err(error),
                            exhausted: false,
                            cancelled: true,
                        };
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
        attempt += 1;
    }
}
