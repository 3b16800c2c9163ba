//! Optimizer configuration
//!
//! Layered from an optional file (TOML, JSON or YAML by extension) and
//! `OPTIMIZER__*` environment variables, e.g.
//! `OPTIMIZER__FETCH__MAX_CONCURRENCY=4` or `OPTIMIZER__REGIONS=us-central1,us-east1`.

use anyhow::{Context, Result};
use optimizer_lib::collector::{RetryPolicy, DEFAULT_MONITORING_ENDPOINT};
use optimizer_lib::{
    EngineConfig, FetchConfig, LabelSelector, OptimizerConfig, PlannerConfig, PriceCatalog,
    ScheduleWindow,
};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "OPTIMIZER";

/// Off-hours window as written in configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowSettings {
    /// Days instances run, e.g. `["weekdays"]` or `["mon-thu"]`
    pub days: Vec<String>,
    /// Local start time, `HH:MM`
    pub start: String,
    /// Local stop time, `HH:MM`
    pub stop: String,
    pub utc_offset_minutes: i32,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            days: vec!["weekdays".to_string()],
            start: "07:00".to_string(),
            stop: "19:00".to_string(),
            utc_offset_minutes: 0,
        }
    }
}

/// Provider fetch tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub max_concurrency: usize,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            timeout_secs: 300,
            max_attempts: 3,
            initial_backoff_ms: 500,
        }
    }
}

/// Optimizer configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Project to scan; the active gcloud project when empty
    pub project_id: String,
    /// Regions to keep; all when empty
    pub regions: Vec<String>,

    pub idle_cpu_threshold_pct: f64,
    pub oversized_peak_cpu_threshold_pct: f64,
    pub idle_min_running_days: i64,
    pub unattached_disk_grace_hours: i64,
    pub snapshot_retention_days: i64,
    pub stopped_instance_min_days: i64,
    pub observation_window_days: i64,

    pub schedule_window: WindowSettings,
    /// `key=value` selectors marking non-production instances
    pub schedule_include: Vec<String>,
    /// `key=value` selectors that exempt instances from scheduling
    pub schedule_exempt: Vec<String>,

    pub fetch: FetchSettings,

    /// `gcloud` binary used for the catalog and access tokens
    pub gcloud_path: String,
    pub monitoring_endpoint: String,

    /// Price table overrides merged onto list prices
    pub pricing: PriceCatalog,
}

impl Default for AppConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            project_id: String::new(),
            regions: Vec::new(),
            idle_cpu_threshold_pct: engine.idle_cpu_threshold_pct,
            oversized_peak_cpu_threshold_pct: engine.oversized_peak_cpu_threshold_pct,
            idle_min_running_days: engine.idle_min_running_days,
            unattached_disk_grace_hours: engine.unattached_disk_grace_hours,
            snapshot_retention_days: engine.snapshot_retention_days,
            stopped_instance_min_days: engine.stopped_instance_min_days,
            observation_window_days: engine.observation_window_days,
            schedule_window: WindowSettings::default(),
            schedule_include: vec!["env=dev".to_string(), "env=staging".to_string()],
            schedule_exempt: vec!["schedule-exempt=true".to_string()],
            fetch: FetchSettings::default(),
            gcloud_path: "gcloud".to_string(),
            monitoring_endpoint: DEFAULT_MONITORING_ENDPOINT.to_string(),
            pricing: PriceCatalog::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let env = config::Environment::with_prefix(prefix)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("regions")
            .with_list_parse_key("schedule_include")
            .with_list_parse_key("schedule_exempt")
            .with_list_parse_key("schedule_window.days");

        let config = builder
            .add_source(env)
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Convert into the library configuration for `project_id`
    pub fn to_optimizer_config(&self, project_id: &str) -> Result<OptimizerConfig> {
        let window = ScheduleWindow::parse(
            &self.schedule_window.days,
            &self.schedule_window.start,
            &self.schedule_window.stop,
            self.schedule_window.utc_offset_minutes,
        )
        .context("Invalid schedule_window")?;

        let include = parse_selectors(&self.schedule_include).context("Invalid schedule_include")?;
        let exempt = parse_selectors(&self.schedule_exempt).context("Invalid schedule_exempt")?;

        let engine = EngineConfig {
            idle_cpu_threshold_pct: self.idle_cpu_threshold_pct,
            oversized_peak_cpu_threshold_pct: self.oversized_peak_cpu_threshold_pct,
            idle_min_running_days: self.idle_min_running_days,
            unattached_disk_grace_hours: self.unattached_disk_grace_hours,
            snapshot_retention_days: self.snapshot_retention_days,
            stopped_instance_min_days: self.stopped_instance_min_days,
            observation_window_days: self.observation_window_days,
        };
        engine.validate().context("Invalid rule thresholds")?;

        let fetch = FetchConfig {
            max_concurrency: self.fetch.max_concurrency,
            timeout: Duration::from_secs(self.fetch.timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.fetch.max_attempts,
                initial_backoff: Duration::from_millis(self.fetch.initial_backoff_ms),
                ..RetryPolicy::default()
            },
        };

        Ok(OptimizerConfig {
            project_id: project_id.to_string(),
            regions: self
                .regions
                .iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
            engine,
            planner: PlannerConfig {
                window,
                include,
                exempt,
            },
            fetch,
            prices: self.pricing.clone(),
        })
    }
}

fn parse_selectors(raw: &[String]) -> Result<Vec<LabelSelector>> {
    raw.iter()
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<LabelSelector>().map_err(anyhow::Error::from))
        .collect()
}
