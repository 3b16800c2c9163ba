//! Optimization rules
//!
//! Each rule is a plain function over one catalog entry and its own usage
//! samples. Rules never fail: when the inputs do not support a finding they
//! abstain by returning `None`.
//!
//! Baseline rules, in registration order:
//! - idle compute (`compute`)
//! - unattached disk (`storage`)
//! - orphaned static IP (`network`)
//! - oversized machine (`compute`)
//! - stale snapshot (`storage`)
//! - long-stopped instance (`compute`)
//! - SSD disk downgrade (`storage`)

mod compute;
mod network;
mod storage;

use crate::error::{OptimizerError, Result};
use crate::models::{MetricKind, ResourceKind, ResourceRecord, UsageSample, UsageWindow};
use crate::pricing::{round_cents, PriceCatalog};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

pub use compute::{idle_compute, oversized_machine, stopped_instance};
pub use network::orphaned_static_ip;
pub use storage::{ssd_disk, stale_snapshot, unattached_disk};

/// Identifier of a baseline rule; ordering follows registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    IdleCompute,
    UnattachedDisk,
    OrphanedStaticIp,
    OversizedMachine,
    StaleSnapshot,
    StoppedInstance,
    SsdDisk,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::IdleCompute => "idle_compute",
            RuleId::UnattachedDisk => "unattached_disk",
            RuleId::OrphanedStaticIp => "orphaned_static_ip",
            RuleId::OversizedMachine => "oversized_machine",
            RuleId::StaleSnapshot => "stale_snapshot",
            RuleId::StoppedInstance => "stopped_instance",
            RuleId::SsdDisk => "ssd_disk",
        }
    }

    /// Whether the rule reads usage samples
    pub fn needs_usage(&self) -> bool {
        matches!(self, RuleId::IdleCompute | RuleId::OversizedMachine)
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much attention a recommendation deserves
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Bucket a monthly savings amount
    pub fn for_savings(monthly_savings: f64) -> Self {
        if monthly_savings >= 100.0 {
            Severity::High
        } else if monthly_savings >= 20.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// What the operator is advised to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SuggestedAction {
    DownsizeOrDelete,
    Delete,
    Release,
    Resize { target_machine_type: String },
    ChangeDiskType { target_disk_type: String },
}

/// A proposed optimization for one catalog resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub resource_id: String,
    pub resource_name: String,
    pub resource_kind: ResourceKind,
    pub rule: RuleId,
    pub action: SuggestedAction,
    /// Monthly amount in the catalog currency, rounded to cents, never negative
    pub estimated_monthly_savings: f64,
    pub severity: Severity,
    pub rationale: String,
}

impl Recommendation {
    /// Recommendation bound to `resource`
    pub fn for_resource(
        resource: &ResourceRecord,
        rule: RuleId,
        action: SuggestedAction,
        monthly_savings: f64,
        rationale: String,
    ) -> Self {
        let estimated_monthly_savings = round_cents(monthly_savings);
        Self {
            resource_id: resource.id.clone(),
            resource_name: resource.name.clone(),
            resource_kind: resource.kind,
            rule,
            action,
            estimated_monthly_savings,
            severity: Severity::for_savings(estimated_monthly_savings),
            rationale,
        }
    }
}

/// Thresholds used by the baseline rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Average CPU below this (percent) counts as idle
    pub idle_cpu_threshold_pct: f64,
    /// Peak CPU below this (percent) counts as oversized
    pub oversized_peak_cpu_threshold_pct: f64,
    /// Instances must have been running longer than this to be idle
    pub idle_min_running_days: i64,
    pub unattached_disk_grace_hours: i64,
    pub snapshot_retention_days: i64,
    /// Stopped instances older than this still bill for their disks
    pub stopped_instance_min_days: i64,
    /// Trailing window usage statistics are computed over
    pub observation_window_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_cpu_threshold_pct: 5.0,
            oversized_peak_cpu_threshold_pct: 20.0,
            idle_min_running_days: 7,
            unattached_disk_grace_hours: 24,
            snapshot_retention_days: 90,
            stopped_instance_min_days: 7,
            observation_window_days: 30,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, pct) in [
            ("idle_cpu_threshold_pct", self.idle_cpu_threshold_pct),
            (
                "oversized_peak_cpu_threshold_pct",
                self.oversized_peak_cpu_threshold_pct,
            ),
        ] {
            if !(0.0..=100.0).contains(&pct) {
                return Err(OptimizerError::Config(format!(
                    "{} must be between 0 and 100, got {}",
                    name, pct
                )));
            }
        }

        for (name, value) in [
            ("idle_min_running_days", self.idle_min_running_days),
            ("unattached_disk_grace_hours", self.unattached_disk_grace_hours),
            ("snapshot_retention_days", self.snapshot_retention_days),
            ("stopped_instance_min_days", self.stopped_instance_min_days),
        ] {
            if value < 0 {
                return Err(OptimizerError::Config(format!(
                    "{} must not be negative, got {}",
                    name, value
                )));
            }
        }

        if self.observation_window_days <= 0 {
            return Err(OptimizerError::Config(format!(
                "observation_window_days must be positive, got {}",
                self.observation_window_days
            )));
        }
        Ok(())
    }
}

/// Read-only inputs shared by every rule invocation
pub struct RuleContext<'a> {
    pub config: &'a EngineConfig,
    pub prices: &'a PriceCatalog,
    /// Evaluation instant
    pub now: DateTime<Utc>,
    /// Full catalog snapshot for cross-resource lookups, including entries
    /// outside the evaluated regions
    pub catalog: &'a [ResourceRecord],
}

impl RuleContext<'_> {
    /// Trailing observation window ending at `now`
    pub fn observation_window(&self) -> UsageWindow {
        UsageWindow::trailing_days(self.now, self.config.observation_window_days)
    }

    /// Catalog entry of `kind` that `reference` points at
    pub fn resolve_kind(&self, kind: ResourceKind, reference: &str) -> Option<&ResourceRecord> {
        self.catalog
            .iter()
            .find(|r| r.kind == kind && r.is_referenced_by(reference))
    }
}

/// Signature every rule implements
pub type RuleFn = fn(&RuleContext<'_>, &ResourceRecord, &[UsageSample]) -> Option<Recommendation>;

/// A registered rule
#[derive(Clone, Copy)]
pub struct Rule {
    pub id: RuleId,
    pub eval: RuleFn,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule").field("id", &self.id).finish()
    }
}

/// CPU utilization summary over the observation window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuStats {
    pub mean: f64,
    pub peak: f64,
    pub count: usize,
}

impl CpuStats {
    /// Summarize CPU samples inside `window`
    ///
    /// Returns `None` when no sample qualifies, which rules treat as
    /// insufficient data.
    pub fn from_samples(samples: &[UsageSample], window: &UsageWindow) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut peak = f64::MIN;

        for sample in samples {
            if sample.metric != MetricKind::CpuUtilization
                || !window.contains(sample.timestamp)
                || !sample.value.is_finite()
            {
                continue;
            }
            count += 1;
            sum += sample.value;
            peak = peak.max(sample.value);
        }

        if count == 0 {
            return None;
        }
        Some(Self {
            mean: sum / count as f64,
            peak,
            count,
        })
    }
}

/// Applies the registered rules to a catalog snapshot
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Vec<Rule>,
    config: EngineConfig,
    prices: PriceCatalog,
}

impl RuleEngine {
    /// Engine with the baseline rules
    pub fn new(config: EngineConfig, prices: PriceCatalog) -> Self {
        Self {
            rules: Self::default_rules(),
            config,
            prices,
        }
    }

    pub fn default_rules() -> Vec<Rule> {
        vec![
            Rule {
                id: RuleId::IdleCompute,
                eval: idle_compute,
            },
            Rule {
                id: RuleId::UnattachedDisk,
                eval: unattached_disk,
            },
            Rule {
                id: RuleId::OrphanedStaticIp,
                eval: orphaned_static_ip,
            },
            Rule {
                id: RuleId::OversizedMachine,
                eval: oversized_machine,
            },
            Rule {
                id: RuleId::StaleSnapshot,
                eval: stale_snapshot,
            },
            Rule {
                id: RuleId::StoppedInstance,
                eval: stopped_instance,
            },
            Rule {
                id: RuleId::SsdDisk,
                eval: ssd_disk,
            },
        ]
    }

    /// Replace the rule set
    pub fn with_rules(mut self, rules: Vec<Rule>) -> Self {
        self.rules = rules;
        self
    }

    /// Append a rule after the existing ones
    pub fn register(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn prices(&self) -> &PriceCatalog {
        &self.prices
    }

    /// Evaluate every rule against every catalog entry
    ///
    /// Samples are looked up by resource id; a resource missing from `usage`
    /// is evaluated with no samples.
    pub fn evaluate(
        &self,
        catalog: &[ResourceRecord],
        usage: &BTreeMap<String, Vec<UsageSample>>,
        now: DateTime<Utc>,
    ) -> Vec<Recommendation> {
        self.evaluate_within(catalog, catalog, usage, now)
    }

    /// Evaluate every rule against `targets`, resolving cross-resource
    /// references against the whole `catalog`
    pub fn evaluate_within(
        &self,
        targets: &[ResourceRecord],
        catalog: &[ResourceRecord],
        usage: &BTreeMap<String, Vec<UsageSample>>,
        now: DateTime<Utc>,
    ) -> Vec<Recommendation> {
        let ctx = RuleContext {
            config: &self.config,
            prices: &self.prices,
            now,
            catalog,
        };

        let mut recommendations = Vec::new();
        for resource in targets {
            let samples = usage.get(&resource.id).map(Vec::as_slice).unwrap_or(&[]);
            for rule in &self.rules {
                if let Some(rec) = (rule.eval)(&ctx, resource, samples) {
                    if rec.resource_id != resource.id {
                        debug!(rule = %rule.id, resource_id = %resource.id, "Discarding mismatched recommendation");
                        continue;
                    }
                    recommendations.push(rec);
                }
            }
        }

        debug!(
            resources = targets.len(),
            recommendations = recommendations.len(),
            "Rules evaluated"
        );
        recommendations
    }
}
