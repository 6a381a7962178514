//! Per-job cooldown with adaptive stretching.
//!
//! Each job carries a minimum interval between successful sends. Rapid
//! re-sends stretch the interval by `growth` (clamped to `max_factor`);
//! quiet periods let the factor decay back toward 1.0, halving its
//! excess once per elapsed base window.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::config::CooldownConfig;

struct JobParams {
    base_window: Duration,
    max_factor: f64,
    growth: f64,
}

struct JobState {
    last_success_at: DateTime<Utc>,
    adaptive_factor: f64,
}

/// Per-job minimum-interval gate. Jobs without an entry pass through.
pub struct CooldownGate {
    enabled: bool,
    params: HashMap<String, JobParams>,
    state: Mutex<HashMap<String, JobState>>,
}

impl CooldownGate {
    pub fn from_settings(config: &CooldownConfig) -> Self {
        let params = config
            .jobs
            .iter()
            .map(|(job, entry)| {
                (
                    job.clone(),
                    JobParams {
                        base_window: Duration::seconds(entry.base_window_seconds as i64),
                        max_factor: entry.max_factor,
                        growth: entry.growth,
                    },
                )
            })
            .collect();
        Self {
            enabled: config.enabled,
            params,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Pass-through gate that always permits.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            params: HashMap::new(),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `job` may emit at `now`. Denials are silent drops at the
    /// orchestrator level, not errors.
    pub fn check(&self, job: &str, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(params) = self.params.get(job) else {
            return true;
        };
        let state = self.state.lock();
        let Some(state) = state.get(job) else {
            return true;
        };
        let effective = scale(params.base_window, state.adaptive_factor);
        now - state.last_success_at >= effective
    }

    /// Record a successful send; only successes advance the clock.
    pub fn record_success(&self, job: &str, now: DateTime<Utc>) {
        let Some(params) = self.params.get(job) else {
            return;
        };
        let mut state = self.state.lock();
        match state.get_mut(job) {
            None => {
                state.insert(
                    job.to_string(),
                    JobState {
                        last_success_at: now,
                        adaptive_factor: 1.0,
                    },
                );
            }
            Some(entry) => {
                let interval = now - entry.last_success_at;
                if interval < params.base_window {
                    entry.adaptive_factor =
                        (entry.adaptive_factor * params.growth).min(params.max_factor);
                } else {
                    let windows = interval.num_milliseconds() as f64
                        / params.base_window.num_milliseconds() as f64;
                    let decayed = 1.0 + (entry.adaptive_factor - 1.0) * 0.5_f64.powf(windows);
                    entry.adaptive_factor = decayed.max(1.0);
                }
                entry.last_success_at = now;
            }
        }
    }

    /// Current adaptive factor for `job`; 1.0 when untouched.
    pub fn factor(&self, job: &str) -> f64 {
        self.state
            .lock()
            .get(job)
            .map(|state| state.adaptive_factor)
            .unwrap_or(1.0)
    }
}

fn scale(window: Duration, factor: f64) -> Duration {
    let millis = window.num_milliseconds() as f64 * factor;
    Duration::milliseconds(millis as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CooldownJobConfig;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn gate(base_window_seconds: u64, max_factor: f64, growth: f64) -> CooldownGate {
        let mut config = CooldownConfig::default();
        config.jobs.insert(
            "weather".into(),
            CooldownJobConfig {
                base_window_seconds,
                max_factor,
                growth,
            },
        );
        CooldownGate::from_settings(&config)
    }

    #[test]
    fn suppresses_within_window_and_resumes_after() {
        let gate = gate(10, 6.0, 1.5);

        assert!(gate.check("weather", at(0)));
        gate.record_success("weather", at(0));

        assert!(!gate.check("weather", at(5)));
        assert!(gate.check("weather", at(11)));
    }

    #[test]
    fn unconfigured_jobs_pass_through() {
        let gate = gate(10, 6.0, 1.5);
        gate.record_success("news", at(0));
        assert!(gate.check("news", at(0)));
    }

    #[test]
    fn disabled_gate_always_permits() {
        let gate = CooldownGate::disabled();
        gate.record_success("weather", at(0));
        assert!(gate.check("weather", at(0)));
    }

    #[test]
    fn rapid_emits_stretch_the_factor() {
        let gate = gate(10, 6.0, 2.0);
        gate.record_success("weather", at(0));
        // Recorded again inside the base window: factor doubles.
        gate.record_success("weather", at(4));
        assert!((gate.factor("weather") - 2.0).abs() < 1e-9);

        // The effective window is now 20s.
        assert!(!gate.check("weather", at(18)));
        assert!(gate.check("weather", at(24)));
    }

    #[test]
    fn factor_clamps_at_max() {
        let gate = gate(10, 3.0, 2.0);
        gate.record_success("weather", at(0));
        for i in 1..6 {
            gate.record_success("weather", at(i));
        }
        assert!(gate.factor("weather") <= 3.0);
    }

    #[test]
    fn factor_decays_toward_one_over_quiet_periods() {
        let gate = gate(10, 6.0, 2.0);
        gate.record_success("weather", at(0));
        gate.record_success("weather", at(1));
        assert!((gate.factor("weather") - 2.0).abs() < 1e-9);

        // One full base window of quiet halves the excess: 1 + 1*0.5 = 1.5.
        gate.record_success("weather", at(11));
        assert!((gate.factor("weather") - 1.5).abs() < 1e-9);

        // A very long gap brings it back to ~1.0.
        gate.record_success("weather", at(1000));
        assert!(gate.factor("weather") < 1.01);
    }

    #[test]
    fn factor_never_drops_below_one() {
        let gate = gate(10, 6.0, 1.5);
        gate.record_success("weather", at(0));
        gate.record_success("weather", at(500));
        assert!(gate.factor("weather") >= 1.0);
    }
}
