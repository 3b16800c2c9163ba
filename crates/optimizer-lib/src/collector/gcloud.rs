//! Resource catalog backed by the `gcloud` CLI
//!
//! Lists instances, disks, addresses and snapshots with `--format=json` and
//! maps the provider payloads onto `ResourceRecord`s.

use super::{async_trait, CatalogFetcher};
use crate::error::{OptimizerError, Result};
use crate::models::{AttachmentState, LifecycleState, ResourceKind, ResourceRecord};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Catalog fetcher that shells out to `gcloud`
#[derive(Debug, Clone)]
pub struct GcloudCatalog {
    gcloud_path: PathBuf,
}

impl Default for GcloudCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl GcloudCatalog {
    /// Use the `gcloud` found on `PATH`
    pub fn new() -> Self {
        Self {
            gcloud_path: PathBuf::from("gcloud"),
        }
    }

    /// Use a specific `gcloud` binary
    pub fn with_binary(path: impl AsRef<Path>) -> Self {
        Self {
            gcloud_path: path.as_ref().to_path_buf(),
        }
    }

    /// Run `gcloud` with `args` and return stdout
    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(command = %args.join(" "), "Running gcloud");

        let output = Command::new(&self.gcloud_path)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                OptimizerError::Provider(format!(
                    "failed to run {}: {}",
                    self.gcloud_path.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_gcloud_failure(&stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Project configured in the active `gcloud` configuration, if any
    pub async fn default_project(&self) -> Result<Option<String>> {
        let stdout = self.run(&["config", "get-value", "project", "--quiet"]).await?;
        let project = stdout.trim();
        if project.is_empty() || project == "(unset)" {
            Ok(None)
        } else {
            Ok(Some(project.to_string()))
        }
    }

    async fn list<T: DeserializeOwned>(&self, group: &str, project: &str) -> Result<Vec<T>> {
        let project_arg = format!("--project={}", project);
        let stdout = self
            .run(&["compute", group, "list", &project_arg, "--format=json", "--quiet"])
            .await?;
        parse_list(&stdout)
    }
}

#[async_trait]
impl CatalogFetcher for GcloudCatalog {
    async fn list_resources(&self, project: &str) -> Result<Vec<ResourceRecord>> {
        let instances: Vec<GcpInstance> = self.list("instances", project).await?;
        let disks: Vec<GcpDisk> = self.list("disks", project).await?;
        let addresses: Vec<GcpAddress> = self.list("addresses", project).await?;
        let snapshots: Vec<GcpSnapshot> = self.list("snapshots", project).await?;

        let mut records = Vec::with_capacity(
            instances.len() + disks.len() + addresses.len() + snapshots.len(),
        );
        records.extend(instances.into_iter().filter_map(|i| i.into_record(project)));
        records.extend(disks.into_iter().filter_map(|d| d.into_record(project)));
        records.extend(addresses.into_iter().filter_map(|a| a.into_record(project)));
        records.extend(snapshots.into_iter().filter_map(|s| s.into_record(project)));

        debug!(project = %project, resources = records.len(), "Catalog listed");
        Ok(records)
    }
}

/// Map a failed `gcloud` invocation to the error taxonomy using its stderr
pub fn classify_gcloud_failure(stderr: &str) -> OptimizerError {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().lines().last().unwrap_or_default().to_string();

    const QUOTA_MARKERS: &[&str] = &[
        "quota",
        "rate limit",
        "ratelimitexceeded",
        "resource_exhausted",
        "429",
    ];
    // Token and login failures only; IAM denials on one API are not fatal
    const AUTH_MARKERS: &[&str] = &[
        "gcloud auth login",
        "auth tokens",
        "reauthentication",
        "invalid_grant",
        "unauthenticated",
        "no credentialed accounts",
        "do not currently have an active account",
    ];

    if QUOTA_MARKERS.iter().any(|m| lower.contains(m)) {
        OptimizerError::Quota(message)
    } else if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        OptimizerError::Auth(message)
    } else {
        OptimizerError::Provider(message)
    }
}

fn parse_list<T: DeserializeOwned>(stdout: &str) -> Result<Vec<T>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(stdout)?)
}

/// Last path segment of a provider self-link
fn short_name(link: &str) -> &str {
    link.rsplit('/').next().unwrap_or(link)
}

fn parse_timestamp(ts: Option<&str>) -> Option<DateTime<Utc>> {
    ts.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn required_timestamp(kind: ResourceKind, name: &str, ts: Option<&str>) -> Option<DateTime<Utc>> {
    let parsed = parse_timestamp(ts);
    if parsed.is_none() {
        warn!(kind = %kind, name = %name, "Skipping resource without a valid creation timestamp");
    }
    parsed
}

fn attachment_for(users: &[String]) -> AttachmentState {
    if users.is_empty() {
        AttachmentState::Unattached
    } else {
        AttachmentState::Attached
    }
}

/// gcloud encodes int64 fields as JSON strings
fn parse_u64(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.parse().ok())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcpInstance {
    id: String,
    name: String,
    #[serde(default)]
    zone: String,
    #[serde(default)]
    machine_type: String,
    #[serde(default)]
    status: String,
    creation_timestamp: Option<String>,
    last_start_timestamp: Option<String>,
    last_stop_timestamp: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    self_link: String,
}

impl GcpInstance {
    fn into_record(self, project: &str) -> Option<ResourceRecord> {
        let kind = ResourceKind::ComputeInstance;
        let created_at = required_timestamp(kind, &self.name, self.creation_timestamp.as_deref())?;
        let lifecycle = match self.status.as_str() {
            "RUNNING" | "PROVISIONING" | "STAGING" | "REPAIRING" => LifecycleState::Running,
            "TERMINATED" => LifecycleState::Terminated,
            _ => LifecycleState::Stopped,
        };

        Some(ResourceRecord {
            id: self.id,
            name: self.name,
            kind,
            project: project.to_string(),
            location: short_name(&self.zone).to_string(),
            size_class: Some(short_name(&self.machine_type).to_string()),
            size_gb: None,
            created_at,
            labels: self.labels,
            attachment: AttachmentState::Attached,
            lifecycle,
            self_link: self.self_link,
            users: Vec::new(),
            last_started_at: parse_timestamp(self.last_start_timestamp.as_deref()),
            last_stopped_at: parse_timestamp(self.last_stop_timestamp.as_deref()),
            last_detached_at: None,
            source_snapshot: None,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcpDisk {
    id: String,
    name: String,
    zone: Option<String>,
    region: Option<String>,
    #[serde(rename = "type", default)]
    disk_type: String,
    size_gb: Option<String>,
    #[serde(default)]
    status: String,
    creation_timestamp: Option<String>,
    last_detach_timestamp: Option<String>,
    source_snapshot: Option<String>,
    #[serde(default)]
    users: Vec<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    self_link: String,
}

impl GcpDisk {
    fn into_record(self, project: &str) -> Option<ResourceRecord> {
        let kind = ResourceKind::Disk;
        let created_at = required_timestamp(kind, &self.name, self.creation_timestamp.as_deref())?;
        let location = self
            .zone
            .as_deref()
            .or(self.region.as_deref())
            .map(short_name)
            .unwrap_or("global")
            .to_string();
        let lifecycle = match self.status.as_str() {
            "READY" | "CREATING" | "RESTORING" => LifecycleState::Running,
            "DELETING" => LifecycleState::Terminated,
            _ => LifecycleState::Stopped,
        };

        Some(ResourceRecord {
            id: self.id,
            name: self.name,
            kind,
            project: project.to_string(),
            location,
            size_class: Some(short_name(&self.disk_type).to_string()),
            size_gb: parse_u64(self.size_gb.as_deref()),
            created_at,
            labels: self.labels,
            attachment: attachment_for(&self.users),
            lifecycle,
            self_link: self.self_link,
            users: self.users,
            last_started_at: None,
            last_stopped_at: None,
            last_detached_at: parse_timestamp(self.last_detach_timestamp.as_deref()),
            source_snapshot: self.source_snapshot,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcpAddress {
    id: String,
    name: String,
    region: Option<String>,
    #[serde(default)]
    status: String,
    creation_timestamp: Option<String>,
    #[serde(default)]
    users: Vec<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    self_link: String,
}

impl GcpAddress {
    fn into_record(self, project: &str) -> Option<ResourceRecord> {
        let kind = ResourceKind::StaticIp;
        let created_at = required_timestamp(kind, &self.name, self.creation_timestamp.as_deref())?;
        let location = self
            .region
            .as_deref()
            .map(short_name)
            .unwrap_or("global")
            .to_string();
        let lifecycle = match self.status.as_str() {
            "RESERVED" | "IN_USE" => LifecycleState::Running,
            _ => LifecycleState::Stopped,
        };

        Some(ResourceRecord {
            id: self.id,
            name: self.name,
            kind,
            project: project.to_string(),
            location,
            size_class: None,
            size_gb: None,
            created_at,
            labels: self.labels,
            attachment: attachment_for(&self.users),
            lifecycle,
            self_link: self.self_link,
            users: self.users,
            last_started_at: None,
            last_stopped_at: None,
            last_detached_at: None,
            source_snapshot: None,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcpSnapshot {
    id: String,
    name: String,
    #[serde(default)]
    status: String,
    creation_timestamp: Option<String>,
    storage_bytes: Option<String>,
    disk_size_gb: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    self_link: String,
}

impl GcpSnapshot {
    fn into_record(self, project: &str) -> Option<ResourceRecord> {
        let kind = ResourceKind::Snapshot;
        let created_at = required_timestamp(kind, &self.name, self.creation_timestamp.as_deref())?;
        let size_gb = parse_u64(self.storage_bytes.as_deref())
            .map(|bytes| bytes.div_ceil(BYTES_PER_GB))
            .or_else(|| parse_u64(self.disk_size_gb.as_deref()));
        let lifecycle = match self.status.as_str() {
            "READY" | "CREATING" | "UPLOADING" => LifecycleState::Running,
            "DELETING" => LifecycleState::Terminated,
            _ => LifecycleState::Stopped,
        };

        Some(ResourceRecord {
            id: self.id,
            name: self.name,
            kind,
            project: project.to_string(),
            location: "global".to_string(),
            size_class: None,
            size_gb,
            created_at,
            labels: self.labels,
            attachment: AttachmentState::Unattached,
            lifecycle,
            self_link: self.self_link,
            users: Vec::new(),
            last_started_at: None,
            last_stopped_at: None,
            last_detached_at: None,
            source_snapshot: None,
        })
    }
}
