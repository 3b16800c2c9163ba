//! Usage fetcher backed by the Cloud Monitoring `timeSeries.list` API

use super::{async_trait, classify_gcloud_failure, UsageFetcher};
use crate::error::{OptimizerError, Result};
use crate::models::{MetricKind, UsageSample, UsageWindow};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

/// Public Cloud Monitoring endpoint
pub const DEFAULT_MONITORING_ENDPOINT: &str = "https://monitoring.googleapis.com/";

/// Alignment period requested from the API (hourly means)
const ALIGNMENT_PERIOD: &str = "3600s";

/// Access tokens are reused for this long before asking again
const TOKEN_TTL: Duration = Duration::from_secs(45 * 60);

/// Supplier of OAuth access tokens
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// Fixed token, mostly for tests and pre-minted credentials
pub struct StaticTokenSource(pub String);

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Token minted by `gcloud auth print-access-token`, cached for a while
pub struct GcloudTokenSource {
    gcloud_path: PathBuf,
    cached: Mutex<Option<(String, Instant)>>,
}

impl GcloudTokenSource {
    pub fn new(gcloud_path: impl Into<PathBuf>) -> Self {
        Self {
            gcloud_path: gcloud_path.into(),
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TokenSource for GcloudTokenSource {
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some((token, minted)) = cached.as_ref() {
            if minted.elapsed() < TOKEN_TTL {
                return Ok(token.clone());
            }
        }

        let output = Command::new(&self.gcloud_path)
            .args(["auth", "print-access-token", "--quiet"])
            .output()
            .await
            .map_err(|e| OptimizerError::Auth(format!("cannot run gcloud: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(match classify_gcloud_failure(&stderr) {
                OptimizerError::Quota(msg) => OptimizerError::Quota(msg),
                other => OptimizerError::Auth(other.to_string()),
            });
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(OptimizerError::Auth("gcloud returned an empty access token".to_string()));
        }

        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }
}

/// Fetches instance utilization from Cloud Monitoring
pub struct MonitoringUsageFetcher {
    client: Client,
    endpoint: Url,
    project: String,
    metrics: Vec<MetricKind>,
    tokens: Arc<dyn TokenSource>,
}

impl MonitoringUsageFetcher {
    /// Create a fetcher for `project` querying CPU utilization
    pub fn new(endpoint: &str, project: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let endpoint = Url::parse(endpoint)
            .map_err(|e| OptimizerError::Config(format!("invalid monitoring endpoint: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            project: project.into(),
            metrics: vec![MetricKind::CpuUtilization],
            tokens,
        })
    }

    /// Query these metrics instead of CPU utilization only
    pub fn with_metrics(mut self, metrics: Vec<MetricKind>) -> Self {
        self.metrics = metrics;
        self
    }

    async fn fetch_metric(
        &self,
        resource_id: &str,
        metric: MetricKind,
        window: &UsageWindow,
    ) -> Result<Vec<UsageSample>> {
        let path = format!("v3/projects/{}/timeSeries", self.project);
        let url = self
            .endpoint
            .join(&path)
            .map_err(|e| OptimizerError::Config(format!("invalid monitoring path: {}", e)))?;

        let filter = format!(
            "metric.type = \"{}\" AND resource.labels.instance_id = \"{}\"",
            metric.monitoring_type(),
            resource_id
        );
        let start = window.start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end = window.end.to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut samples = Vec::new();
        let mut page_token = String::new();

        loop {
            let token = self.tokens.access_token().await?;
            let mut query = vec![
                ("filter", filter.as_str()),
                ("interval.startTime", start.as_str()),
                ("interval.endTime", end.as_str()),
                ("aggregation.alignmentPeriod", ALIGNMENT_PERIOD),
                ("aggregation.perSeriesAligner", "ALIGN_MEAN"),
            ];
            if !page_token.is_empty() {
                query.push(("pageToken", page_token.as_str()));
            }

            let response = self
                .client
                .get(url.clone())
                .bearer_auth(token)
                .query(&query)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_status(status, resource_id, body));
            }

            let page: ListTimeSeriesResponse = response.json().await?;
            samples.extend(page.to_samples(resource_id, metric));

            if page_token_is_empty(&page.next_page_token) {
                break;
            }
            page_token = page.next_page_token;
        }

        debug!(
            resource_id = %resource_id,
            metric = ?metric,
            samples = samples.len(),
            "Fetched time series"
        );
        Ok(samples)
    }
}

#[async_trait]
impl UsageFetcher for MonitoringUsageFetcher {
    async fn get_usage(&self, resource_id: &str, window: &UsageWindow) -> Result<Vec<UsageSample>> {
        let mut samples = Vec::new();
        for metric in &self.metrics {
            samples.extend(self.fetch_metric(resource_id, *metric, window).await?);
        }
        samples.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.metric.cmp(&b.metric)));
        Ok(samples)
    }
}

fn page_token_is_empty(token: &str) -> bool {
    token.trim().is_empty()
}

/// Map a non-success HTTP status to the error taxonomy
fn classify_status(status: StatusCode, resource_id: &str, body: String) -> OptimizerError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            OptimizerError::Auth(format!("monitoring API returned {}: {}", status, body))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            OptimizerError::Quota(format!("monitoring API returned {}", status))
        }
        StatusCode::NOT_FOUND => OptimizerError::DataUnavailable {
            resource_id: resource_id.to_string(),
            reason: format!("monitoring API returned {}", status),
        },
        _ => OptimizerError::Provider(format!("monitoring API returned {}: {}", status, body)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTimeSeriesResponse {
    #[serde(default)]
    time_series: Vec<TimeSeries>,
    #[serde(default)]
    next_page_token: String,
}

impl ListTimeSeriesResponse {
    fn to_samples(&self, resource_id: &str, metric: MetricKind) -> Vec<UsageSample> {
        let scale = match metric {
            MetricKind::CpuUtilization => 100.0,
            _ => 1.0,
        };

        self.time_series
            .iter()
            .flat_map(|series| series.points.iter())
            .filter_map(|point| {
                let timestamp = DateTime::parse_from_rfc3339(&point.interval.end_time)
                    .ok()?
                    .with_timezone(&Utc);
                let value = point.value.as_f64()?;
                Some(UsageSample {
                    resource_id: resource_id.to_string(),
                    metric,
                    timestamp,
                    value: value * scale,
                })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct TimeSeries {
    #[serde(default)]
    points: Vec<Point>,
}

#[derive(Debug, Deserialize)]
struct Point {
    interval: TimeInterval,
    value: TypedValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeInterval {
    end_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypedValue {
    double_value: Option<f64>,
    /// int64 values arrive as JSON strings
    int64_value: Option<String>,
}

impl TypedValue {
    fn as_f64(&self) -> Option<f64> {
        self.double_value
            .or_else(|| self.int64_value.as_deref().and_then(|v| v.parse().ok()))
    }
}
