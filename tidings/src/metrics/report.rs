//! Weekly operational report rendering.
//!
//! The aggregator supplies the snapshot; this module renders the text
//! payload the `weekly_report` job posts. The template is fixed and the
//! pipeline treats the result as an opaque payload.

use std::sync::Arc;

use async_trait::async_trait;

use super::aggregator::{MetricsAggregator, WeeklySnapshot};
use crate::clock::SharedClock;
use crate::scheduler::job::JobFactory;

/// Success rate under which a job line carries a degradation marker.
const SUCCESS_RATE_TARGET: f64 = 0.9;

/// Render the weekly snapshot into a posting payload.
pub fn render_weekly_report(snapshot: &WeeklySnapshot) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "Weekly send report ({} .. {})",
        snapshot.window_start.format("%Y-%m-%d"),
        snapshot.window_end.format("%Y-%m-%d"),
    ));

    if snapshot.per_job.is_empty() {
        lines.push("- no send activity this week".to_string());
    }
    for (job, stats) in &snapshot.per_job {
        let mut line = format!(
            "- {job}: {} sent, {} denied, {} failed, success {:.1}%",
            stats.sent,
            stats.denied,
            stats.failed,
            stats.success_rate * 100.0,
        );
        if stats.sent > 0 {
            line.push_str(&format!(
                ", p50 {:.2}s, p95 {:.2}s",
                stats.latency_p50, stats.latency_p95
            ));
        }
        if stats.sent + stats.failed > 0 && stats.success_rate < SUCCESS_RATE_TARGET {
            line.push_str(" [below target]");
        }
        lines.push(line);
    }

    if !snapshot.permit_denial_reasons.is_empty() {
        let reasons = snapshot
            .permit_denial_reasons
            .iter()
            .map(|(reason, count)| format!("{reason}={count}"))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("Denials: {reasons}"));
    }

    lines.push("See the ops dashboard for details.".to_string());
    lines.join("\n")
}

/// Job factory that posts the rendered weekly snapshot.
pub struct WeeklyReportFactory {
    metrics: Arc<MetricsAggregator>,
    clock: SharedClock,
}

impl WeeklyReportFactory {
    pub fn new(metrics: Arc<MetricsAggregator>, clock: SharedClock) -> Self {
        Self { metrics, clock }
    }
}

#[async_trait]
impl JobFactory for WeeklyReportFactory {
    async fn build(&self) -> crate::Result<Vec<String>> {
        let snapshot = self.metrics.weekly_snapshot(self.clock.now());
        Ok(vec![render_weekly_report(&snapshot)])
    }
}
