//! Resource inventory and recommendation engine for GCP cost optimization
//!
//! This crate provides the core functionality for:
//! - Listing project resources via `gcloud` and usage via Cloud Monitoring
//! - Bounded concurrent usage collection with retry and deadline handling
//! - Rule-based savings recommendations (idle, unattached, orphaned, oversized,
//!   stale snapshots, long-stopped instances, SSD disks)
//! - Off-hours start/stop planning for non-production instances
//! - Deterministic JSON reports and Prometheus run metrics
//!
//! The library only proposes changes; it never calls mutating provider APIs.

pub mod collector;
pub mod error;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod planner;
pub mod pricing;
pub mod report;
pub mod rules;

pub use collector::{CatalogFetcher, FetchConfig, UsageFetcher};
pub use error::{OptimizerError, Result};
pub use models::*;
pub use observability::{OptimizerMetrics, StructuredLogger};
pub use pipeline::{filter_regions, Optimizer, OptimizerConfig, OPTIMIZER_VERSION};
pub use planner::{
    LabelSelector, PlannerConfig, PowerAction, RecurrenceRule, ScheduleAction, SchedulePlanner,
    ScheduleWindow,
};
pub use pricing::PriceCatalog;
pub use report::{Report, ReportBuilder, SkipReason, SkippedResource};
pub use rules::{EngineConfig, Recommendation, RuleEngine, RuleId, Severity, SuggestedAction};
