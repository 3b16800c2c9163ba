//! One-shot optimization run
//!
//! Wires the collaborators together:
//! 1. list the catalog (with backoff on rate limits)
//! 2. pick the resources in the configured regions as evaluation targets
//! 3. collect usage for targeted compute instances through the bounded pool
//! 4. evaluate rules on the targets against the whole catalog, plan
//!    schedules, build the report

use crate::collector::{
    retry_with_backoff, CatalogFetcher, FetchConfig, UsageCollection, UsageCollector, UsageFetcher,
};
use crate::error::{OptimizerError, Result};
use crate::models::{ResourceKind, ResourceRecord, UsageWindow};
use crate::observability::{OptimizerMetrics, StructuredLogger};
use crate::planner::{PlannerConfig, ScheduleAction, SchedulePlanner};
use crate::pricing::PriceCatalog;
use crate::report::{Report, ReportBuilder};
use crate::rules::{EngineConfig, RuleEngine};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Library version reported in run events
pub const OPTIMIZER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a run needs besides its collaborators
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub project_id: String,
    /// Regions to keep; empty keeps everything
    pub regions: BTreeSet<String>,
    pub engine: EngineConfig,
    pub planner: PlannerConfig,
    pub fetch: FetchConfig,
    pub prices: PriceCatalog,
}

impl OptimizerConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            regions: BTreeSet::new(),
            engine: EngineConfig::default(),
            planner: PlannerConfig::default(),
            fetch: FetchConfig::default(),
            prices: PriceCatalog::default(),
        }
    }
}

/// Keep resources located in `regions`
///
/// Global resources are always kept, as is everything when `regions` is empty.
pub fn filter_regions(
    resources: Vec<ResourceRecord>,
    regions: &BTreeSet<String>,
) -> Vec<ResourceRecord> {
    if regions.is_empty() {
        return resources;
    }
    resources
        .into_iter()
        .filter(|r| match r.region() {
            Some(region) => regions.contains(region),
            None => true,
        })
        .collect()
}

/// Runs the full inventory, recommendation and scheduling pass
pub struct Optimizer {
    catalog: Arc<dyn CatalogFetcher>,
    collector: UsageCollector,
    config: OptimizerConfig,
    engine: RuleEngine,
    planner: SchedulePlanner,
    metrics: OptimizerMetrics,
    logger: StructuredLogger,
}

impl Optimizer {
    /// Build an optimizer, validating thresholds and the schedule window
    pub fn new(
        catalog: Arc<dyn CatalogFetcher>,
        usage: Arc<dyn UsageFetcher>,
        config: OptimizerConfig,
    ) -> Result<Self> {
        if config.project_id.trim().is_empty() {
            return Err(OptimizerError::Config("project_id is empty".to_string()));
        }
        if config.fetch.max_concurrency == 0 {
            return Err(OptimizerError::Config(
                "fetch.max_concurrency must be at least 1".to_string(),
            ));
        }
        config.engine.validate()?;

        let engine = RuleEngine::new(config.engine.clone(), config.prices.clone());
        let planner = SchedulePlanner::new(config.planner.clone())?;
        let collector = UsageCollector::new(usage, config.fetch.clone());
        let logger = StructuredLogger::new(config.project_id.clone());

        Ok(Self {
            catalog,
            collector,
            config,
            engine,
            planner,
            metrics: OptimizerMetrics::new(),
            logger,
        })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Run once as of `now`, merging `existing` schedule actions
    pub async fn run(&self, now: DateTime<Utc>, existing: &[ScheduleAction]) -> Result<Report> {
        let regions: Vec<String> = self.config.regions.iter().cloned().collect();
        self.logger.log_run_started(OPTIMIZER_VERSION, &regions);
        let started = Instant::now();

        match self.run_inner(now, existing).await {
            Ok(report) => {
                self.metrics.record_report(&report);
                self.logger.log_run_finished(&report, started.elapsed());
                Ok(report)
            }
            Err(e) => {
                self.metrics.record_failure();
                self.logger.log_run_failed(&e);
                Err(e)
            }
        }
    }

    async fn run_inner(&self, now: DateTime<Utc>, existing: &[ScheduleAction]) -> Result<Report> {
        let catalog = self.fetch_catalog().await?;
        let targets = filter_regions(catalog.clone(), &self.config.regions);
        self.metrics.add_resources_scanned(targets.len());
        debug!(
            catalog = catalog.len(),
            targets = targets.len(),
            "Region filter applied"
        );

        let usage = self.collect_usage(&targets, now).await?;
        for skipped in &usage.skipped {
            self.metrics.record_skipped(skipped);
            self.logger.log_skipped(skipped);
        }

        let recommendations = self
            .engine
            .evaluate_within(&targets, &catalog, &usage.usage, now);
        for rec in &recommendations {
            self.metrics.record_recommendation(rec);
            self.logger.log_recommendation(rec);
        }

        let schedule_actions = self.planner.plan(&targets, existing, now);
        for action in &schedule_actions {
            self.metrics.record_schedule_action(action);
            self.logger.log_schedule_action(action);
        }

        Ok(ReportBuilder::new(self.config.project_id.clone(), now)
            .currency(self.config.prices.currency.clone())
            .recommendations(recommendations)
            .schedule_actions(schedule_actions)
            .skipped(usage.skipped)
            .partial_data(usage.partial)
            .machine_types(&targets)
            .build())
    }

    async fn fetch_catalog(&self) -> Result<Vec<ResourceRecord>> {
        let project = self.config.project_id.as_str();
        let started = Instant::now();

        let resources = retry_with_backoff(&self.config.fetch.retry, "list_resources", |attempt| {
            if attempt > 1 {
                self.metrics.add_fetch_retries(1);
            }
            self.catalog.list_resources(project)
        })
        .await?;

        self.metrics.observe_catalog_latency(started.elapsed());
        info!(
            project = %project,
            resources = resources.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Catalog fetched"
        );
        Ok(resources)
    }

    async fn collect_usage(
        &self,
        catalog: &[ResourceRecord],
        now: DateTime<Utc>,
    ) -> Result<UsageCollection> {
        let instances: Vec<ResourceRecord> = catalog
            .iter()
            .filter(|r| r.kind == ResourceKind::ComputeInstance)
            .cloned()
            .collect();
        let window = UsageWindow::trailing_days(now, self.config.engine.observation_window_days);
        let started = Instant::now();

        let usage = self.collector.collect(&instances, window).await?;

        self.metrics.observe_usage_latency(started.elapsed());
        self.metrics.add_fetch_retries(usage.retries);
        debug!(
            instances = instances.len(),
            collected = usage.usage.len(),
            skipped = usage.skipped.len(),
            partial = usage.partial,
            "Usage collected"
        );
        Ok(usage)
    }
}
