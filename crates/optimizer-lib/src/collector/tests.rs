//! Tests for usage collection and the provider-backed fetchers
//!
//! The pool is driven by in-memory fakes; `gcloud` is replaced by a shell
//! script and Cloud Monitoring by a mock HTTP server.

#[cfg(test)]
mod pool_tests {
    use crate::collector::{
        async_trait, FetchConfig, RetryPolicy, UsageCollector, UsageFetcher,
    };
    use crate::error::{OptimizerError, Result};
    use crate::models::{
        AttachmentState, LifecycleState, MetricKind, ResourceKind, ResourceRecord, UsageSample,
        UsageWindow,
    };
    use crate::report::SkipReason;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn instance(id: &str) -> ResourceRecord {
        ResourceRecord {
            id: id.to_string(),
            name: format!("vm-{}", id),
            kind: ResourceKind::ComputeInstance,
            project: "acme".to_string(),
            location: "us-central1-a".to_string(),
            size_class: Some("e2-standard-4".to_string()),
            size_gb: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            labels: BTreeMap::new(),
            attachment: AttachmentState::Attached,
            lifecycle: LifecycleState::Running,
            self_link: format!("projects/acme/zones/us-central1-a/instances/vm-{}", id),
            users: Vec::new(),
            last_started_at: None,
            last_stopped_at: None,
            last_detached_at: None,
            source_snapshot: None,
        }
    }

    fn window() -> UsageWindow {
        UsageWindow::trailing_days(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(), 30)
    }

    fn sample(resource_id: &str, hour: u32, value: f64) -> UsageSample {
        UsageSample {
            resource_id: resource_id.to_string(),
            metric: MetricKind::CpuUtilization,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 20, hour, 0, 0).unwrap(),
            value,
        }
    }

    fn fast_config(max_concurrency: usize, timeout: Duration) -> FetchConfig {
        FetchConfig {
            max_concurrency,
            timeout,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
        }
    }

    /// Tracks peak concurrency while returning one sample per call
    #[derive(Default)]
    struct CountingFetcher {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl UsageFetcher for CountingFetcher {
        async fn get_usage(&self, resource_id: &str, _window: &UsageWindow) -> Result<Vec<UsageSample>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![sample(resource_id, 1, 3.0)])
        }
    }

    /// Behaviour keyed by resource id
    struct ScriptedFetcher {
        calls: Mutex<BTreeMap<String, u32>>,
    }

    impl ScriptedFetcher {
        fn new() -> Self {
            Self {
                calls: Mutex::new(BTreeMap::new()),
            }
        }

        fn calls_for(&self, id: &str) -> u32 {
            self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl UsageFetcher for ScriptedFetcher {
        async fn get_usage(&self, resource_id: &str, _window: &UsageWindow) -> Result<Vec<UsageSample>> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(resource_id.to_string())
                .or_insert(0) += 1;

            match resource_id {
                "busy" => Err(OptimizerError::Quota("rateLimitExceeded".to_string())),
                "denied" => Err(OptimizerError::Auth("token expired".to_string())),
                "fresh" => Ok(Vec::new()),
                "gone" => Err(OptimizerError::DataUnavailable {
                    resource_id: resource_id.to_string(),
                    reason: "404".to_string(),
                }),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(vec![sample(resource_id, 1, 1.0)])
                }
                "mixed" => Ok(vec![
                    sample("mixed", 3, 4.0),
                    sample("someone-else", 2, 99.0),
                    sample("mixed", 1, 2.0),
                ]),
                _ => Ok(vec![sample(resource_id, 1, 10.0)]),
            }
        }
    }

    #[test]
    fn test_worker_count_bounded() {
        let collector = UsageCollector::new(
            Arc::new(CountingFetcher::default()),
            fast_config(10, Duration::from_secs(1)),
        );
        assert_eq!(collector.worker_count(3), 3);
        assert_eq!(collector.worker_count(10), 10);
        assert_eq!(collector.worker_count(250), 10);
        assert_eq!(collector.worker_count(0), 1);
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_width() {
        let fetcher = Arc::new(CountingFetcher::default());
        let collector = UsageCollector::new(fetcher.clone(), fast_config(4, Duration::from_secs(10)));
        let resources: Vec<_> = (0..25).map(|i| instance(&format!("vm{}", i))).collect();

        let collection = collector.collect(&resources, window()).await.unwrap();

        assert_eq!(collection.usage.len(), 25);
        assert!(!collection.partial);
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 4);
        assert!(fetcher.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_marks_skipped() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let collector = UsageCollector::new(fetcher.clone(), fast_config(10, Duration::from_secs(10)));
        let resources = vec![instance("busy"), instance("ok")];

        let collection = collector.collect(&resources, window()).await.unwrap();

        assert_eq!(fetcher.calls_for("busy"), 3);
        assert_eq!(collection.retries, 2);
        assert_eq!(collection.skipped.len(), 1);
        assert_eq!(collection.skipped[0].resource_id, "busy");
        assert_eq!(collection.skipped[0].reason, SkipReason::QuotaExhausted);
        assert_eq!(collection.samples_for("ok").len(), 1);
        assert!(collection.samples_for("busy").is_empty());
    }

    #[tokio::test]
    async fn test_auth_error_aborts() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let collector = UsageCollector::new(fetcher.clone(), fast_config(10, Duration::from_secs(10)));
        let resources = vec![instance("denied"), instance("ok")];

        let result = collector.collect(&resources, window()).await;

        assert!(matches!(result, Err(OptimizerError::Auth(_))));
        assert_eq!(fetcher.calls_for("denied"), 1);
    }

    #[tokio::test]
    async fn test_empty_usage_is_not_an_error() {
        let collector = UsageCollector::new(
            Arc::new(ScriptedFetcher::new()),
            fast_config(10, Duration::from_secs(10)),
        );
        let collection = collector
            .collect(&[instance("fresh"), instance("gone")], window())
            .await
            .unwrap();

        assert!(collection.usage.contains_key("fresh"));
        assert!(collection.samples_for("fresh").is_empty());
        assert_eq!(collection.skipped.len(), 1);
        assert_eq!(collection.skipped[0].reason, SkipReason::DataUnavailable);
    }

    #[tokio::test]
    async fn test_timeout_keeps_completed_subset() {
        let collector = UsageCollector::new(
            Arc::new(ScriptedFetcher::new()),
            fast_config(10, Duration::from_millis(200)),
        );
        let resources = vec![instance("slow"), instance("a"), instance("b")];

        let collection = collector.collect(&resources, window()).await.unwrap();

        assert!(collection.partial);
        assert_eq!(collection.usage.len(), 2);
        assert_eq!(collection.skipped.len(), 1);
        assert_eq!(collection.skipped[0].resource_id, "slow");
        assert_eq!(collection.skipped[0].reason, SkipReason::TimedOut);
    }

    #[tokio::test]
    async fn test_samples_paired_and_sorted() {
        let collector = UsageCollector::new(
            Arc::new(ScriptedFetcher::new()),
            fast_config(10, Duration::from_secs(10)),
        );
        let collection = collector.collect(&[instance("mixed")], window()).await.unwrap();

        let samples = collection.samples_for("mixed");
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.resource_id == "mixed"));
        assert!(samples[0].timestamp < samples[1].timestamp);
    }

    #[tokio::test]
    async fn test_duplicate_ids_fetched_once() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let collector = UsageCollector::new(fetcher.clone(), fast_config(10, Duration::from_secs(10)));

        collector
            .collect(&[instance("x"), instance("x")], window())
            .await
            .unwrap();

        assert_eq!(fetcher.calls_for("x"), 1);
    }

    #[tokio::test]
    async fn test_counting_fetcher_calls_once_per_resource() {
        let calls = Arc::new(AtomicU32::new(0));
        struct Once(Arc<AtomicU32>);

        #[async_trait]
        impl UsageFetcher for Once {
            async fn get_usage(&self, _id: &str, _w: &UsageWindow) -> Result<Vec<UsageSample>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            }
        }

        let collector = UsageCollector::new(
            Arc::new(Once(calls.clone())),
            fast_config(2, Duration::from_secs(10)),
        );
        let resources: Vec<_> = (0..7).map(|i| instance(&i.to_string())).collect();
        collector.collect(&resources, window()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }
}

#[cfg(all(test, unix))]
mod gcloud_tests {
    use crate::collector::{CatalogFetcher, GcloudCatalog};
    use crate::error::OptimizerError;
    use crate::models::ResourceKind;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Write an executable fake `gcloud` into `dir`
    fn fake_gcloud(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("gcloud");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn test_catalog_from_fake_gcloud() {
        let dir = TempDir::new().unwrap();
        let script = r#"
case "$2" in
  instances)
    echo '[{"id": "1", "name": "vm-a", "zone": "zones/us-central1-a", "machineType": "machineTypes/e2-standard-4", "status": "RUNNING", "creationTimestamp": "2024-01-01T00:00:00Z", "selfLink": "zones/us-central1-a/instances/vm-a"}]'
    ;;
  disks)
    echo '[{"id": "2", "name": "orphan", "zone": "zones/us-central1-a", "type": "diskTypes/pd-standard", "sizeGb": "100", "status": "READY", "creationTimestamp": "2024-01-01T00:00:00Z"}]'
    ;;
  addresses)
    echo '[]'
    ;;
  snapshots)
    echo ''
    ;;
esac"#;
        let catalog = GcloudCatalog::with_binary(fake_gcloud(&dir, script));

        let records = catalog.list_resources("acme").await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, ResourceKind::ComputeInstance);
        assert_eq!(records[1].kind, ResourceKind::Disk);
        assert!(records.iter().all(|r| r.project == "acme"));
    }

    #[tokio::test]
    async fn test_auth_failure_from_fake_gcloud() {
        let dir = TempDir::new().unwrap();
        let script = r#"echo "ERROR: (gcloud.compute.instances.list) You do not currently have an active account selected. Please run: gcloud auth login" >&2
exit 1"#;
        let catalog = GcloudCatalog::with_binary(fake_gcloud(&dir, script));

        let result = catalog.list_resources("acme").await;
        assert!(matches!(result, Err(OptimizerError::Auth(_))));
    }

    #[tokio::test]
    async fn test_default_project() {
        let dir = TempDir::new().unwrap();
        let catalog = GcloudCatalog::with_binary(fake_gcloud(&dir, "echo acme-prod"));
        assert_eq!(catalog.default_project().await.unwrap().as_deref(), Some("acme-prod"));

        let unset_dir = TempDir::new().unwrap();
        let unset = GcloudCatalog::with_binary(fake_gcloud(&unset_dir, "echo '(unset)'"));
        assert_eq!(unset.default_project().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_provider_error() {
        let catalog = GcloudCatalog::with_binary("/nonexistent/gcloud");
        let result = catalog.list_resources("acme").await;
        assert!(matches!(result, Err(OptimizerError::Provider(_))));
    }
}

#[cfg(test)]
mod monitoring_tests {
    use crate::collector::{MonitoringUsageFetcher, StaticTokenSource, UsageFetcher};
    use crate::error::OptimizerError;
    use crate::models::{MetricKind, UsageWindow};
    use chrono::{TimeZone, Utc};
    use mockito::Matcher;
    use std::sync::Arc;

    fn window() -> UsageWindow {
        UsageWindow::trailing_days(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(), 30)
    }

    fn fetcher(url: &str) -> MonitoringUsageFetcher {
        MonitoringUsageFetcher::new(
            url,
            "acme",
            Arc::new(StaticTokenSource("test-token".to_string())),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetches_cpu_series() {
        let mut server = mockito::Server::new_async().await;
        let body = r#"{"timeSeries": [{"points": [
            {"interval": {"endTime": "2024-05-31T02:00:00Z"}, "value": {"doubleValue": 0.04}},
            {"interval": {"endTime": "2024-05-31T01:00:00Z"}, "value": {"doubleValue": 0.02}}
        ]}]}"#;
        let mock = server
            .mock("GET", Matcher::Regex(r"^/v3/projects/acme/timeSeries".to_string()))
            .match_header("authorization", "Bearer test-token")
            .match_query(Matcher::UrlEncoded(
                "aggregation.perSeriesAligner".to_string(),
                "ALIGN_MEAN".to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;

        let samples = fetcher(&server.url()).get_usage("123", &window()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(samples.len(), 2);
        assert!(samples[0].timestamp < samples[1].timestamp);
        assert!((samples[0].value - 2.0).abs() < 1e-9);
        assert_eq!(samples[0].metric, MetricKind::CpuUtilization);
        assert_eq!(samples[0].resource_id, "123");
    }

    #[tokio::test]
    async fn test_empty_series_for_new_resource() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", Matcher::Regex(r"^/v3/projects/acme/timeSeries".to_string()))
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let samples = fetcher(&server.url()).get_usage("123", &window()).await.unwrap();
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_quota() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", Matcher::Regex(r"^/v3/projects/acme/timeSeries".to_string()))
            .match_query(Matcher::Any)
            .with_status(429)
            .create_async()
            .await;

        let result = fetcher(&server.url()).get_usage("123", &window()).await;
        assert!(matches!(result, Err(OptimizerError::Quota(_))));
    }

    #[tokio::test]
    async fn test_forbidden_maps_to_auth() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", Matcher::Regex(r"^/v3/projects/acme/timeSeries".to_string()))
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body(r#"{"error": {"status": "PERMISSION_DENIED"}}"#)
            .create_async()
            .await;

        let result = fetcher(&server.url()).get_usage("123", &window()).await;
        assert!(matches!(result, Err(OptimizerError::Auth(_))));
    }
}
