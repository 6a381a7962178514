//! Metrics aggregation and the weekly operational report.

pub mod aggregator;
pub mod report;

pub use aggregator::{JobWeekly, MetricsAggregator, WeeklySnapshot, WEEKLY_REPORT_JOB};
pub use report::{render_weekly_report, WeeklyReportFactory};
