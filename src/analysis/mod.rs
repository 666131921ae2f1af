//! Reporting over detection output: summaries and metrics exposition.

pub mod aggregator;
pub mod metrics;

pub use aggregator::{
    detailed_view, summarize_global, summarize_measurement, AlertsReport, EventDetail,
    GlobalSummary, MeasurementSummary,
};
pub use metrics::render_prometheus;
