//! Off-hours scheduling for non-production instances
//!
//! Instances matching an inclusion selector (e.g. `env=dev`) get a stop action
//! at the end of the working window and a start action at its beginning.
//! Exemption selectors win over inclusion. Planning is idempotent: actions
//! already in place, compared by resource id and recurrence rule, are kept
//! rather than duplicated, and the output is sorted. Actions left over from
//! a previous window are replaced by the current one.

mod window;

pub use window::{parse_time, DayOfWeek, RecurrenceRule, ScheduleWindow};

use crate::error::{OptimizerError, Result};
use crate::models::{ResourceKind, ResourceRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// `key=value` label match
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LabelSelector {
    pub key: String,
    pub value: String,
}

impl LabelSelector {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, resource: &ResourceRecord) -> bool {
        resource.has_label(&self.key, &self.value)
    }
}

impl FromStr for LabelSelector {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok(Self::new(key.trim(), value.trim()))
            }
            _ => Err(OptimizerError::Config(format!(
                "label selector '{}' is not key=value",
                s
            ))),
        }
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Power transition applied by a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    Start,
    Stop,
}

/// A recurring start or stop for one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleAction {
    pub resource_id: String,
    pub action: PowerAction,
    /// Next occurrence after the planning instant
    pub scheduled_time: DateTime<Utc>,
    pub recurrence: RecurrenceRule,
}

impl ScheduleAction {
    /// Stable ordering key: resource id, then action, then recurrence
    pub fn sort_key(&self) -> (&str, PowerAction, &RecurrenceRule) {
        (self.resource_id.as_str(), self.action, &self.recurrence)
    }
}

/// Which instances are scheduled and when
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerConfig {
    pub window: ScheduleWindow,
    /// Any match makes an instance a candidate
    pub include: Vec<LabelSelector>,
    /// Any match removes an instance regardless of `include`
    pub exempt: Vec<LabelSelector>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            window: ScheduleWindow::default(),
            include: vec![
                LabelSelector::new("env", "dev"),
                LabelSelector::new("env", "staging"),
            ],
            exempt: vec![LabelSelector::new("schedule-exempt", "true")],
        }
    }
}

/// Computes start/stop actions for non-production instances
#[derive(Debug, Clone)]
pub struct SchedulePlanner {
    config: PlannerConfig,
}

impl SchedulePlanner {
    /// Create a planner, rejecting malformed windows
    pub fn new(config: PlannerConfig) -> Result<Self> {
        config.window.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Whether `resource` should carry an off-hours schedule
    pub fn is_schedulable(&self, resource: &ResourceRecord) -> bool {
        if resource.kind != ResourceKind::ComputeInstance {
            return false;
        }
        if self.config.exempt.iter().any(|s| s.matches(resource)) {
            return false;
        }
        self.config.include.iter().any(|s| s.matches(resource))
    }

    /// Plan schedules for `catalog`, merging `existing` actions
    ///
    /// Existing actions for instances that are still schedulable are kept
    /// with their next occurrence refreshed, as long as their recurrence
    /// matches the configured window. Actions for instances that left the
    /// selection, or carrying a recurrence from an older window, are dropped.
    pub fn plan(
        &self,
        catalog: &[ResourceRecord],
        existing: &[ScheduleAction],
        now: DateTime<Utc>,
    ) -> Vec<ScheduleAction> {
        let eligible: BTreeMap<&str, &ResourceRecord> = catalog
            .iter()
            .filter(|r| self.is_schedulable(r))
            .map(|r| (r.id.as_str(), r))
            .collect();

        let stop_rule = self.config.window.stop_rule();
        let start_rule = self.config.window.start_rule();
        let mut planned: BTreeMap<(String, RecurrenceRule), ScheduleAction> = BTreeMap::new();

        for action in existing {
            if !eligible.contains_key(action.resource_id.as_str()) {
                debug!(resource_id = %action.resource_id, "Dropping schedule for unselected instance");
                continue;
            }
            let current = match action.action {
                PowerAction::Stop => &stop_rule,
                PowerAction::Start => &start_rule,
            };
            if action.recurrence != *current {
                debug!(
                    resource_id = %action.resource_id,
                    action = ?action.action,
                    cron = %action.recurrence.cron,
                    "Dropping schedule from a previous window"
                );
                continue;
            }
            let Some(next) = action.recurrence.next_occurrence(now) else {
                debug!(resource_id = %action.resource_id, "Dropping schedule with no future occurrence");
                continue;
            };
            planned
                .entry((action.resource_id.clone(), action.recurrence.clone()))
                .or_insert_with(|| ScheduleAction {
                    scheduled_time: next,
                    ..action.clone()
                });
        }

        let rules = [(PowerAction::Stop, stop_rule), (PowerAction::Start, start_rule)];

        for id in eligible.keys() {
            for (power, rule) in &rules {
                let key = (id.to_string(), rule.clone());
                if planned.contains_key(&key) {
                    debug!(resource_id = %id, action = ?power, "Schedule already in place");
                    continue;
                }
                let Some(next) = rule.next_occurrence(now) else {
                    continue;
                };
                planned.insert(
                    key,
                    ScheduleAction {
                        resource_id: id.to_string(),
                        action: *power,
                        scheduled_time: next,
                        recurrence: rule.clone(),
                    },
                );
            }
        }

        let mut actions: Vec<ScheduleAction> = planned.into_values().collect();
        actions.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        actions
    }
}
