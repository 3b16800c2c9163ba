//! Structured optimization report
//!
//! A `Report` is assembled once per run by `ReportBuilder` and never mutated
//! afterwards. Given identical inputs and generation timestamp the serialized
//! output is byte-for-byte identical.

use crate::error::Result;
use crate::models::{ResourceKind, ResourceRecord};
use crate::planner::ScheduleAction;
use crate::pricing::round_cents;
use crate::rules::{Recommendation, RuleId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::Write;

/// Why a resource's usage could not be evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Rate-limit retries exhausted
    QuotaExhausted,
    /// Provider reported no data for the resource
    DataUnavailable,
    /// Any other provider failure
    FetchFailed,
    /// Still outstanding when the fetch deadline passed
    TimedOut,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::QuotaExhausted => "quota_exhausted",
            SkipReason::DataUnavailable => "data_unavailable",
            SkipReason::FetchFailed => "fetch_failed",
            SkipReason::TimedOut => "timed_out",
        }
    }
}

/// A resource excluded from usage-based rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedResource {
    pub resource_id: String,
    pub reason: SkipReason,
    pub detail: String,
}

/// Savings summary for one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSavings {
    pub rule: RuleId,
    pub recommendations: usize,
    pub estimated_monthly_savings: f64,
}

/// Output of one optimization run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub project_id: String,
    pub currency: String,
    pub recommendations: Vec<Recommendation>,
    pub schedule_actions: Vec<ScheduleAction>,
    #[serde(default)]
    pub skipped: Vec<SkippedResource>,
    /// Usage collection was cut short by the fetch deadline
    #[serde(default)]
    pub partial_data: bool,
    pub total_estimated_savings: f64,
    #[serde(default)]
    pub savings_by_rule: Vec<RuleSavings>,
    /// Instance count per machine type across the evaluated catalog
    #[serde(default)]
    pub machine_type_summary: BTreeMap<String, usize>,
}

impl Report {
    /// Serialize as pretty-printed JSON
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the report as JSON to `sink`, newline-terminated
    pub fn write_to<W: Write>(&self, mut sink: W) -> Result<()> {
        serde_json::to_writer_pretty(&mut sink, self)?;
        sink.write_all(b"\n")?;
        sink.flush()?;
        Ok(())
    }

    /// Parse a report previously written by `write_to`
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Assembles a `Report` from the outputs of one run
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    project_id: String,
    generated_at: DateTime<Utc>,
    currency: String,
    recommendations: Vec<Recommendation>,
    schedule_actions: Vec<ScheduleAction>,
    skipped: Vec<SkippedResource>,
    partial_data: bool,
    machine_type_summary: BTreeMap<String, usize>,
}

impl ReportBuilder {
    pub fn new(project_id: impl Into<String>, generated_at: DateTime<Utc>) -> Self {
        Self {
            project_id: project_id.into(),
            generated_at,
            currency: "USD".to_string(),
            recommendations: Vec::new(),
            schedule_actions: Vec::new(),
            skipped: Vec::new(),
            partial_data: false,
            machine_type_summary: BTreeMap::new(),
        }
    }

    pub fn currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn recommendations(mut self, recommendations: Vec<Recommendation>) -> Self {
        self.recommendations.extend(recommendations);
        self
    }

    pub fn schedule_actions(mut self, actions: Vec<ScheduleAction>) -> Self {
        self.schedule_actions.extend(actions);
        self
    }

    pub fn skipped(mut self, skipped: Vec<SkippedResource>) -> Self {
        self.skipped.extend(skipped);
        self
    }

    pub fn partial_data(mut self, partial: bool) -> Self {
        self.partial_data = partial;
        self
    }

    /// Count compute instances in `resources` by machine type
    pub fn machine_types(mut self, resources: &[ResourceRecord]) -> Self {
        for instance in resources
            .iter()
            .filter(|r| r.kind == ResourceKind::ComputeInstance)
        {
            let machine_type = instance.size_class.as_deref().unwrap_or("unknown");
            *self
                .machine_type_summary
                .entry(machine_type.to_string())
                .or_insert(0) += 1;
        }
        self
    }

    /// Order everything deterministically and compute the totals
    pub fn build(self) -> Report {
        let mut recommendations = self.recommendations;
        recommendations.sort_by(compare_recommendations);

        let mut schedule_actions = self.schedule_actions;
        schedule_actions.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let mut skipped = self.skipped;
        skipped.sort_by(|a, b| {
            a.resource_id
                .cmp(&b.resource_id)
                .then(a.reason.cmp(&b.reason))
        });
        skipped.dedup_by(|a, b| a.resource_id == b.resource_id && a.reason == b.reason);

        let mut by_rule: BTreeMap<RuleId, (usize, f64)> = BTreeMap::new();
        for rec in &recommendations {
            let entry = by_rule.entry(rec.rule).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += rec.estimated_monthly_savings;
        }
        let savings_by_rule = by_rule
            .into_iter()
            .map(|(rule, (count, total))| RuleSavings {
                rule,
                recommendations: count,
                estimated_monthly_savings: round_cents(total),
            })
            .collect();

        let total: f64 = recommendations
            .iter()
            .map(|r| r.estimated_monthly_savings)
            .sum();

        Report {
            generated_at: self.generated_at,
            project_id: self.project_id,
            currency: self.currency,
            recommendations,
            schedule_actions,
            skipped,
            partial_data: self.partial_data,
            total_estimated_savings: round_cents(total),
            savings_by_rule,
            machine_type_summary: self.machine_type_summary,
        }
    }
}

/// Descending savings, then resource id, then rule registration order
fn compare_recommendations(a: &Recommendation, b: &Recommendation) -> Ordering {
    b.estimated_monthly_savings
        .total_cmp(&a.estimated_monthly_savings)
        .then_with(|| a.resource_id.cmp(&b.resource_id))
        .then_with(|| a.rule.cmp(&b.rule))
}
