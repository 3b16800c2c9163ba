//! Observability infrastructure for the optimizer
//!
//! Provides:
//! - Prometheus run metrics (resources scanned, recommendations, schedule
//!   actions, skipped resources, fetch retries and latency, savings)
//! - Text exposition output for the node-exporter textfile collector
//! - Structured JSON logging with tracing

use crate::error::{OptimizerError, Result};
use crate::planner::{PowerAction, ScheduleAction};
use crate::report::{Report, SkippedResource};
use crate::rules::{Recommendation, Severity};
use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, Gauge, Histogram, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for provider fetch latency (in seconds)
const FETCH_LATENCY_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<OptimizerMetricsInner> = OnceLock::new();

struct OptimizerMetricsInner {
    resources_scanned: IntCounter,
    recommendations: IntCounterVec,
    schedule_actions: IntCounterVec,
    resources_skipped: IntCounterVec,
    fetch_retries: IntCounter,
    catalog_fetch_seconds: Histogram,
    usage_fetch_seconds: Histogram,
    estimated_savings: Gauge,
    last_run_partial: IntGauge,
    runs: IntCounterVec,
}

impl OptimizerMetricsInner {
    fn new() -> Self {
        Self {
            resources_scanned: register_int_counter!(
                "cost_optimizer_resources_scanned_total",
                "Catalog resources evaluated by the rule engine"
            )
            .expect("Failed to register resources_scanned"),

            recommendations: register_int_counter_vec!(
                "cost_optimizer_recommendations_total",
                "Recommendations emitted, by rule",
                &["rule"]
            )
            .expect("Failed to register recommendations"),

            schedule_actions: register_int_counter_vec!(
                "cost_optimizer_schedule_actions_total",
                "Schedule actions planned, by action",
                &["action"]
            )
            .expect("Failed to register schedule_actions"),

            resources_skipped: register_int_counter_vec!(
                "cost_optimizer_resources_skipped_total",
                "Resources whose usage could not be collected, by reason",
                &["reason"]
            )
            .expect("Failed to register resources_skipped"),

            fetch_retries: register_int_counter!(
                "cost_optimizer_fetch_retries_total",
                "Provider calls retried after a rate-limit response"
            )
            .expect("Failed to register fetch_retries"),

            catalog_fetch_seconds: register_histogram!(
                "cost_optimizer_catalog_fetch_seconds",
                "Time spent listing the resource catalog",
                FETCH_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register catalog_fetch_seconds"),

            usage_fetch_seconds: register_histogram!(
                "cost_optimizer_usage_fetch_seconds",
                "Time spent collecting usage for all instances",
                FETCH_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register usage_fetch_seconds"),

            estimated_savings: register_gauge!(
                "cost_optimizer_estimated_monthly_savings",
                "Total estimated monthly savings of the last report"
            )
            .expect("Failed to register estimated_savings"),

            last_run_partial: register_int_gauge!(
                "cost_optimizer_last_run_partial",
                "1 if the last run hit the usage fetch deadline"
            )
            .expect("Failed to register last_run_partial"),

            runs: register_int_counter_vec!(
                "cost_optimizer_runs_total",
                "Optimization runs, by outcome",
                &["outcome"]
            )
            .expect("Failed to register runs"),
        }
    }
}

/// Optimizer metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct OptimizerMetrics {
    _private: (),
}

impl Default for OptimizerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(OptimizerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &OptimizerMetricsInner {
        GLOBAL_METRICS.get_or_init(OptimizerMetricsInner::new)
    }

    pub fn add_resources_scanned(&self, count: usize) {
        self.inner().resources_scanned.inc_by(count as u64);
    }

    pub fn record_recommendation(&self, rec: &Recommendation) {
        self.inner()
            .recommendations
            .with_label_values(&[rec.rule.as_str()])
            .inc();
    }

    pub fn record_schedule_action(&self, action: &ScheduleAction) {
        let label = match action.action {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
        };
        self.inner().schedule_actions.with_label_values(&[label]).inc();
    }

    pub fn record_skipped(&self, skipped: &SkippedResource) {
        self.inner()
            .resources_skipped
            .with_label_values(&[skipped.reason.as_str()])
            .inc();
    }

    pub fn add_fetch_retries(&self, retries: u64) {
        self.inner().fetch_retries.inc_by(retries);
    }

    pub fn observe_catalog_latency(&self, elapsed: Duration) {
        self.inner().catalog_fetch_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn observe_usage_latency(&self, elapsed: Duration) {
        self.inner().usage_fetch_seconds.observe(elapsed.as_secs_f64());
    }

    /// Record the outcome of a finished report
    pub fn record_report(&self, report: &Report) {
        self.inner()
            .estimated_savings
            .set(report.total_estimated_savings);
        self.inner()
            .last_run_partial
            .set(i64::from(report.partial_data));
        let outcome = if report.partial_data { "partial" } else { "complete" };
        self.inner().runs.with_label_values(&[outcome]).inc();
    }

    pub fn record_failure(&self) {
        self.inner().runs.with_label_values(&["failed"]).inc();
    }

    /// Render every registered metric in text exposition format
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&prometheus::gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Write metrics to `path` for the textfile collector
    ///
    /// Written under a temporary name, then renamed into place.
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        let text = self.gather_text()?;
        let tmp = path.with_extension("prom.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Structured logger for optimizer events
///
/// Emits consistently named events so runs can be followed in JSON logs.
#[derive(Clone)]
pub struct StructuredLogger {
    project_id: String,
}

impl StructuredLogger {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
        }
    }

    /// Log the start of a run
    pub fn log_run_started(&self, version: &str, regions: &[String]) {
        info!(
            event = "run_started",
            project = %self.project_id,
            optimizer_version = %version,
            regions = ?regions,
            "Optimization run started"
        );
    }

    /// Log a recommendation
    pub fn log_recommendation(&self, rec: &Recommendation) {
        match rec.severity {
            Severity::High => {
                warn!(
                    event = "recommendation_emitted",
                    project = %self.project_id,
                    resource_id = %rec.resource_id,
                    resource_name = %rec.resource_name,
                    resource_kind = %rec.resource_kind,
                    rule = %rec.rule,
                    severity = ?rec.severity,
                    estimated_monthly_savings = rec.estimated_monthly_savings,
                    "High-value recommendation"
                );
            }
            _ => {
                info!(
                    event = "recommendation_emitted",
                    project = %self.project_id,
                    resource_id = %rec.resource_id,
                    resource_name = %rec.resource_name,
                    resource_kind = %rec.resource_kind,
                    rule = %rec.rule,
                    severity = ?rec.severity,
                    estimated_monthly_savings = rec.estimated_monthly_savings,
                    "Recommendation"
                );
            }
        }
    }

    /// Log a planned schedule action
    pub fn log_schedule_action(&self, action: &ScheduleAction) {
        info!(
            event = "schedule_planned",
            project = %self.project_id,
            resource_id = %action.resource_id,
            action = ?action.action,
            cron = %action.recurrence.cron,
            utc_offset_minutes = action.recurrence.utc_offset_minutes,
            scheduled_time = %action.scheduled_time.to_rfc3339(),
            "Schedule planned"
        );
    }

    /// Log a resource excluded from usage rules
    pub fn log_skipped(&self, skipped: &SkippedResource) {
        warn!(
            event = "resource_skipped",
            project = %self.project_id,
            resource_id = %skipped.resource_id,
            reason = %skipped.reason.as_str(),
            detail = %skipped.detail,
            "Resource skipped"
        );
    }

    /// Log the end of a run
    pub fn log_run_finished(&self, report: &Report, elapsed: Duration) {
        info!(
            event = "run_finished",
            project = %self.project_id,
            recommendations = report.recommendations.len(),
            schedule_actions = report.schedule_actions.len(),
            skipped = report.skipped.len(),
            partial_data = report.partial_data,
            total_estimated_savings = report.total_estimated_savings,
            currency = %report.currency,
            elapsed_ms = elapsed.as_millis() as u64,
            "Optimization run finished"
        );
    }

    /// Log a run that aborted
    pub fn log_run_failed(&self, error: &OptimizerError) {
        warn!(
            event = "run_failed",
            project = %self.project_id,
            error = %error,
            fatal = error.is_fatal(),
            "Optimization run failed"
        );
    }
}
