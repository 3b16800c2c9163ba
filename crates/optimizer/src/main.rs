//! Cost Optimizer - GCP resource inventory and recommendation job
//!
//! Runs once: lists the project's resources with `gcloud`, pulls utilization
//! from Cloud Monitoring, and writes a JSON report of savings
//! recommendations and off-hours schedules. Nothing is changed in the project.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use optimizer_lib::collector::{GcloudCatalog, GcloudTokenSource, MonitoringUsageFetcher};
use optimizer_lib::{Optimizer, OptimizerMetrics, Report, ScheduleAction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

/// GCP cost optimizer
#[derive(Parser)]
#[command(name = "cost-optimizer")]
#[command(author, version, about = "Inventory GCP resources and recommend cost savings", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(long, short, env = "OPTIMIZER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Project to scan (overrides configuration and the active gcloud project)
    #[arg(long, short)]
    pub project: Option<String>,

    /// Write the report here instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Earlier report whose schedule actions are already in place
    #[arg(long)]
    pub previous_report: Option<PathBuf>,

    /// Dump Prometheus metrics to this file after the run
    #[arg(long, env = "OPTIMIZER_METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,

    /// Evaluate as of this RFC 3339 instant instead of now
    #[arg(long)]
    pub as_of: Option<DateTime<Utc>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the report
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = config::AppConfig::load(cli.config.as_deref())?;

    let catalog = GcloudCatalog::with_binary(&settings.gcloud_path);
    let project_id = resolve_project(&cli, &settings, &catalog).await?;
    info!(project = %project_id, "Cost optimizer configured");

    let optimizer_config = settings.to_optimizer_config(&project_id)?;
    let tokens = Arc::new(GcloudTokenSource::new(&settings.gcloud_path));
    let usage = MonitoringUsageFetcher::new(&settings.monitoring_endpoint, &project_id, tokens)
        .context("Failed to create monitoring client")?;

    let optimizer = Optimizer::new(Arc::new(catalog), Arc::new(usage), optimizer_config)?;
    let existing = match &cli.previous_report {
        Some(path) => load_previous_actions(path)?,
        None => Vec::new(),
    };

    let now = cli.as_of.unwrap_or_else(Utc::now);
    let result = optimizer.run(now, &existing).await;

    if let Some(path) = &cli.metrics_file {
        if let Err(e) = OptimizerMetrics::new().write_textfile(path) {
            warn!(path = %path.display(), error = %e, "Failed to write metrics file");
        }
    }

    let report = result.context("Optimization run failed")?;
    write_report(&report, cli.output.as_deref())?;
    Ok(())
}

async fn resolve_project(
    cli: &Cli,
    settings: &config::AppConfig,
    catalog: &GcloudCatalog,
) -> Result<String> {
    if let Some(project) = cli.project.as_deref().filter(|p| !p.trim().is_empty()) {
        return Ok(project.trim().to_string());
    }
    if !settings.project_id.trim().is_empty() {
        return Ok(settings.project_id.trim().to_string());
    }

    match catalog
        .default_project()
        .await
        .context("Failed to read the active gcloud project")?
    {
        Some(project) => Ok(project),
        None => bail!("No project configured: pass --project, set project_id, or run `gcloud config set project`"),
    }
}

fn load_previous_actions(path: &Path) -> Result<Vec<ScheduleAction>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read previous report {}", path.display()))?;
    let report = Report::from_json(&raw)
        .with_context(|| format!("Failed to parse previous report {}", path.display()))?;
    Ok(report.schedule_actions)
}

fn write_report(report: &Report, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            report
                .write_to(std::io::BufWriter::new(file))
                .context("Failed to write report")?;
            info!(path = %path.display(), "Report written");
        }
        None => {
            report
                .write_to(std::io::stdout().lock())
                .context("Failed to write report")?;
        }
    }
    Ok(())
}
