//! Core data models for the cost optimizer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of cloud resource tracked by the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ComputeInstance,
    Disk,
    StaticIp,
    Snapshot,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::ComputeInstance => "compute_instance",
            ResourceKind::Disk => "disk",
            ResourceKind::StaticIp => "static_ip",
            ResourceKind::Snapshot => "snapshot",
        };
        f.write_str(s)
    }
}

/// Whether a disk or address is bound to another resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
    Attached,
    Unattached,
}

/// Provider lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Running,
    Stopped,
    Terminated,
}

/// Immutable snapshot of one provider resource at fetch time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Provider-assigned unique identifier
    pub id: String,
    pub name: String,
    pub kind: ResourceKind,
    pub project: String,
    /// Zone, region, or `global`
    pub location: String,
    /// Machine type for instances, disk type for disks
    pub size_class: Option<String>,
    /// Provisioned size for disks, storage size for snapshots
    pub size_gb: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub attachment: AttachmentState,
    pub lifecycle: LifecycleState,
    /// Provider self-link, used to resolve cross-resource references
    pub self_link: String,
    /// Self-links of the resources this one is bound to
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<DateTime<Utc>>,
    /// Last time an instance was stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_detached_at: Option<DateTime<Utc>>,
    /// Snapshot a disk was restored from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_snapshot: Option<String>,
}

impl ResourceRecord {
    /// Region the resource lives in, or `None` for global resources
    ///
    /// Zones are `<region>-<letter>`, so a single trailing letter segment is
    /// stripped.
    pub fn region(&self) -> Option<&str> {
        if self.location.is_empty() || self.location == "global" {
            return None;
        }
        match self.location.rsplit_once('-') {
            Some((region, suffix))
                if suffix.len() == 1 && suffix.chars().all(|c| c.is_ascii_lowercase()) =>
            {
                Some(region)
            }
            _ => Some(&self.location),
        }
    }

    /// Check whether the resource carries `key=value`
    pub fn has_label(&self, key: &str, value: &str) -> bool {
        self.labels.get(key).map(|v| v == value).unwrap_or(false)
    }

    /// Instant the resource last became active (start time or creation)
    pub fn active_since(&self) -> DateTime<Utc> {
        self.last_started_at.unwrap_or(self.created_at)
    }

    /// Check whether `reference` (a self-link or a bare name) points at this resource
    pub fn is_referenced_by(&self, reference: &str) -> bool {
        reference == self.self_link
            || reference == self.id
            || reference.rsplit('/').next() == Some(self.name.as_str())
    }
}

/// Metric carried by a usage sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Percent, 0-100
    CpuUtilization,
    NetworkEgressBytes,
    DiskReadBytes,
    DiskWriteBytes,
}

impl MetricKind {
    /// Cloud Monitoring metric type for this kind
    pub fn monitoring_type(&self) -> &'static str {
        match self {
            MetricKind::CpuUtilization => "compute.googleapis.com/instance/cpu/utilization",
            MetricKind::NetworkEgressBytes => "compute.googleapis.com/instance/network/sent_bytes_count",
            MetricKind::DiskReadBytes => "compute.googleapis.com/instance/disk/read_bytes_count",
            MetricKind::DiskWriteBytes => "compute.googleapis.com/instance/disk/write_bytes_count",
        }
    }
}

/// A single utilization observation for one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub resource_id: String,
    pub metric: MetricKind,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Time range a usage query covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl UsageWindow {
    /// Window of `days` ending at `end`
    pub fn trailing_days(end: DateTime<Utc>, days: i64) -> Self {
        Self {
            start: end - chrono::Duration::days(days),
            end,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}
