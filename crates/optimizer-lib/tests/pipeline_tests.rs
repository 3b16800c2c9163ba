//! End-to-end runs of the optimizer against in-memory collaborators

use chrono::{DateTime, Duration, TimeZone, Utc};
use optimizer_lib::collector::{async_trait, RetryPolicy};
use optimizer_lib::{
    AttachmentState, CatalogFetcher, LifecycleState, MetricKind, Optimizer, OptimizerConfig,
    OptimizerError, PowerAction, ResourceKind, ResourceRecord, Result, RuleId, ScheduleWindow,
    SkipReason, UsageFetcher, UsageSample, UsageWindow,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// Saturday
fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn base(id: &str, kind: ResourceKind, location: &str) -> ResourceRecord {
    ResourceRecord {
        id: id.to_string(),
        name: id.to_string(),
        kind,
        project: "acme".to_string(),
        location: location.to_string(),
        size_class: None,
        size_gb: None,
        created_at: now() - Duration::days(200),
        labels: BTreeMap::new(),
        attachment: AttachmentState::Attached,
        lifecycle: LifecycleState::Running,
        self_link: format!("projects/acme/{}/{}", kind, id),
        users: Vec::new(),
        last_started_at: None,
        last_stopped_at: None,
        last_detached_at: None,
        source_snapshot: None,
    }
}

fn vm(id: &str, machine_type: &str, running_days: i64, labels: &[(&str, &str)]) -> ResourceRecord {
    let mut r = base(id, ResourceKind::ComputeInstance, "us-central1-a");
    r.size_class = Some(machine_type.to_string());
    r.last_started_at = Some(now() - Duration::days(running_days));
    r.labels = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    r
}

fn unattached_disk(id: &str, size_gb: u64, age_hours: i64) -> ResourceRecord {
    let mut r = base(id, ResourceKind::Disk, "us-central1-a");
    r.attachment = AttachmentState::Unattached;
    r.size_class = Some("pd-standard".to_string());
    r.size_gb = Some(size_gb);
    r.created_at = now() - Duration::hours(age_hours);
    r
}

/// Catalog that fails with quota errors a fixed number of times first
struct FakeCatalog {
    resources: Vec<ResourceRecord>,
    quota_failures: u32,
    auth_failure: bool,
    calls: AtomicU32,
}

impl FakeCatalog {
    fn new(resources: Vec<ResourceRecord>) -> Self {
        Self {
            resources,
            quota_failures: 0,
            auth_failure: false,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl CatalogFetcher for FakeCatalog {
    async fn list_resources(&self, _project: &str) -> Result<Vec<ResourceRecord>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.auth_failure {
            return Err(OptimizerError::Auth("no active account".to_string()));
        }
        if call <= self.quota_failures {
            return Err(OptimizerError::Quota("rateLimitExceeded".to_string()));
        }
        Ok(self.resources.clone())
    }
}

/// Usage keyed by resource id; ids listed in `hang` never answer
#[derive(Default)]
struct FakeUsage {
    cpu: BTreeMap<String, f64>,
    hang: Vec<String>,
    missing: Vec<String>,
}

#[async_trait]
impl UsageFetcher for FakeUsage {
    async fn get_usage(&self, resource_id: &str, window: &UsageWindow) -> Result<Vec<UsageSample>> {
        if self.hang.iter().any(|id| id == resource_id) {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        }
        if self.missing.iter().any(|id| id == resource_id) {
            return Err(OptimizerError::DataUnavailable {
                resource_id: resource_id.to_string(),
                reason: "no series".to_string(),
            });
        }
        let Some(value) = self.cpu.get(resource_id) else {
            return Ok(Vec::new());
        };
        Ok((1..=72)
            .rev()
            .map(|h| UsageSample {
                resource_id: resource_id.to_string(),
                metric: MetricKind::CpuUtilization,
                timestamp: window.end - Duration::hours(h),
                value: *value,
            })
            .collect())
    }
}

fn config() -> OptimizerConfig {
    let mut config = OptimizerConfig::new("acme");
    config.planner.window = ScheduleWindow::parse(&["weekdays"], "07:00", "19:00", 0).unwrap();
    config.fetch.retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff: std::time::Duration::from_millis(1),
        max_backoff: std::time::Duration::from_millis(2),
    };
    config
}

fn optimizer(catalog: FakeCatalog, usage: FakeUsage, config: OptimizerConfig) -> Optimizer {
    Optimizer::new(Arc::new(catalog), Arc::new(usage), config).unwrap()
}

#[tokio::test]
async fn test_full_run_scenarios() {
    let catalog = FakeCatalog::new(vec![
        unattached_disk("d1", 100, 48),
        vm("v1", "e2-standard-4", 10, &[]),
        vm("v2", "e2-standard-2", 30, &[("env", "dev")]),
        vm("v3", "e2-standard-2", 30, &[("env", "dev"), ("schedule-exempt", "true")]),
    ]);
    let usage = FakeUsage {
        cpu: [("v1", 2.0), ("v2", 55.0), ("v3", 55.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        ..FakeUsage::default()
    };

    let report = optimizer(catalog, usage, config()).run(now(), &[]).await.unwrap();

    let disk = report
        .recommendations
        .iter()
        .find(|r| r.resource_id == "d1")
        .unwrap();
    assert_eq!(disk.rule, RuleId::UnattachedDisk);
    assert_eq!(disk.estimated_monthly_savings, 4.00);

    let idle: Vec<_> = report
        .recommendations
        .iter()
        .filter(|r| r.rule == RuleId::IdleCompute)
        .collect();
    assert_eq!(idle.len(), 1);
    assert_eq!(idle[0].resource_id, "v1");

    assert_eq!(report.schedule_actions.len(), 2);
    assert!(report.schedule_actions.iter().all(|a| a.resource_id == "v2"));
    assert_eq!(report.schedule_actions[0].action, PowerAction::Start);
    assert_eq!(report.schedule_actions[1].action, PowerAction::Stop);

    let sum: f64 = report
        .recommendations
        .iter()
        .map(|r| r.estimated_monthly_savings)
        .sum();
    assert!((report.total_estimated_savings - sum).abs() < 0.005);
    assert!(!report.partial_data);
    assert!(report.skipped.is_empty());
    assert_eq!(report.project_id, "acme");
    assert_eq!(report.machine_type_summary.get("e2-standard-2"), Some(&2));
    assert_eq!(report.machine_type_summary.get("e2-standard-4"), Some(&1));
}

#[tokio::test]
async fn test_runs_are_deterministic() {
    let build = || {
        let catalog = FakeCatalog::new(vec![
            unattached_disk("d2", 10, 72),
            unattached_disk("d1", 100, 48),
            vm("v2", "e2-standard-2", 30, &[("env", "staging")]),
        ]);
        optimizer(catalog, FakeUsage::default(), config())
    };

    let first = build().run(now(), &[]).await.unwrap().to_json_pretty().unwrap();
    let second = build().run(now(), &[]).await.unwrap().to_json_pretty().unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_previous_schedules_not_duplicated() {
    let make = || FakeCatalog::new(vec![vm("v2", "e2-standard-2", 30, &[("env", "dev")])]);

    let first = optimizer(make(), FakeUsage::default(), config())
        .run(now(), &[])
        .await
        .unwrap();
    let second = optimizer(make(), FakeUsage::default(), config())
        .run(now(), &first.schedule_actions)
        .await
        .unwrap();

    assert_eq!(first.schedule_actions, second.schedule_actions);
}

#[tokio::test]
async fn test_auth_failure_aborts_run() {
    let mut catalog = FakeCatalog::new(Vec::new());
    catalog.auth_failure = true;

    let result = optimizer(catalog, FakeUsage::default(), config()).run(now(), &[]).await;
    assert!(matches!(result, Err(OptimizerError::Auth(_))));
}

#[tokio::test]
async fn test_catalog_quota_retried_then_succeeds() {
    let mut catalog = FakeCatalog::new(vec![unattached_disk("d1", 100, 48)]);
    catalog.quota_failures = 2;

    let report = optimizer(catalog, FakeUsage::default(), config())
        .run(now(), &[])
        .await
        .unwrap();
    assert_eq!(report.recommendations.len(), 1);
}

#[tokio::test]
async fn test_catalog_quota_exhaustion_aborts() {
    let mut catalog = FakeCatalog::new(vec![unattached_disk("d1", 100, 48)]);
    catalog.quota_failures = 5;

    let result = optimizer(catalog, FakeUsage::default(), config()).run(now(), &[]).await;
    assert!(matches!(result, Err(OptimizerError::Quota(_))));
}

#[tokio::test]
async fn test_timeout_produces_partial_report() {
    let catalog = FakeCatalog::new(vec![
        vm("slow", "e2-standard-4", 30, &[]),
        vm("fast", "e2-standard-4", 30, &[]),
        unattached_disk("d1", 100, 48),
    ]);
    let usage = FakeUsage {
        cpu: [("slow", 1.0), ("fast", 1.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        hang: vec!["slow".to_string()],
        ..FakeUsage::default()
    };
    let mut config = config();
    config.fetch.timeout = std::time::Duration::from_millis(200);

    let report = optimizer(catalog, usage, config).run(now(), &[]).await.unwrap();

    assert!(report.partial_data);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].resource_id, "slow");
    assert_eq!(report.skipped[0].reason, SkipReason::TimedOut);
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.resource_id == "fast" && r.rule == RuleId::IdleCompute));
    assert!(report.recommendations.iter().all(|r| r.resource_id != "slow"));
    assert!(report.recommendations.iter().any(|r| r.resource_id == "d1"));
}

#[tokio::test]
async fn test_missing_usage_still_gets_catalog_rules() {
    let mut stopped = vm("v9", "e2-standard-4", 30, &[]);
    stopped.lifecycle = LifecycleState::Terminated;
    let mut ip = base("ip-1", ResourceKind::StaticIp, "us-central1");
    ip.users = vec![stopped.self_link.clone()];

    let catalog = FakeCatalog::new(vec![stopped, ip, vm("v1", "e2-standard-4", 30, &[])]);
    let usage = FakeUsage {
        missing: vec!["v1".to_string()],
        ..FakeUsage::default()
    };

    let report = optimizer(catalog, usage, config()).run(now(), &[]).await.unwrap();

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].reason, SkipReason::DataUnavailable);
    assert!(!report.partial_data);
    assert_eq!(report.recommendations.len(), 1);
    assert_eq!(report.recommendations[0].rule, RuleId::OrphanedStaticIp);
}

#[tokio::test]
async fn test_region_filter_selects_targets() {
    let catalog = FakeCatalog::new(vec![
        unattached_disk("d-us", 100, 48),
        {
            let mut d = unattached_disk("d-eu", 100, 48);
            d.location = "europe-west4-a".to_string();
            d
        },
    ]);
    let mut config = config();
    config.regions = ["us-central1".to_string()].into_iter().collect();

    let report = optimizer(catalog, FakeUsage::default(), config)
        .run(now(), &[])
        .await
        .unwrap();

    assert_eq!(report.recommendations.len(), 1);
    assert_eq!(report.recommendations[0].resource_id, "d-us");
}

#[tokio::test]
async fn test_region_filter_keeps_out_of_region_dependents_visible() {
    let mut golden = base("golden", ResourceKind::Snapshot, "global");
    golden.attachment = AttachmentState::Unattached;
    golden.size_gb = Some(30);
    golden.created_at = now() - Duration::days(200);

    let mut restored = base("restored", ResourceKind::Disk, "europe-west4-b");
    restored.size_class = Some("pd-balanced".to_string());
    restored.size_gb = Some(50);
    restored.created_at = now() - Duration::days(10);
    restored.source_snapshot = Some(golden.self_link.clone());

    let mut batch = vm("batch-eu", "n1-standard-4", 60, &[]);
    batch.location = "europe-west4-b".to_string();
    batch.lifecycle = LifecycleState::Terminated;
    let mut ip = base("ip-us", ResourceKind::StaticIp, "us-central1");
    ip.users = vec![batch.self_link.clone()];

    let catalog = FakeCatalog::new(vec![golden, restored, batch, ip]);
    let mut config = config();
    config.regions = ["us-central1".to_string()].into_iter().collect();

    let report = optimizer(catalog, FakeUsage::default(), config)
        .run(now(), &[])
        .await
        .unwrap();

    assert!(report
        .recommendations
        .iter()
        .all(|r| r.rule != RuleId::StaleSnapshot));
    assert!(report
        .recommendations
        .iter()
        .all(|r| r.resource_id != "restored" && r.resource_id != "batch-eu"));
    let released: Vec<_> = report
        .recommendations
        .iter()
        .filter(|r| r.rule == RuleId::OrphanedStaticIp)
        .collect();
    assert_eq!(released.len(), 1);
    assert!(released[0].rationale.contains("batch-eu"));
    assert!(report.machine_type_summary.is_empty());
}

#[test]
fn test_invalid_configuration_rejected() {
    let mut bad_window = config();
    bad_window.planner.window.stop = bad_window.planner.window.start;
    let result = Optimizer::new(
        Arc::new(FakeCatalog::new(Vec::new())),
        Arc::new(FakeUsage::default()),
        bad_window,
    );
    assert!(matches!(result, Err(OptimizerError::Config(_))));

    let result = Optimizer::new(
        Arc::new(FakeCatalog::new(Vec::new())),
        Arc::new(FakeUsage::default()),
        OptimizerConfig::new(""),
    );
    assert!(matches!(result, Err(OptimizerError::Config(_))));
}
