//! Resource catalog and usage collection from the cloud provider
//!
//! This module provides the collaborator seams the pipeline talks to:
//! - `CatalogFetcher` lists every resource in a project
//! - `UsageFetcher` returns a utilization time series for one resource
//!
//! Concrete implementations shell out to `gcloud` for the catalog and query
//! the Cloud Monitoring API for usage. Both can be swapped for fakes.

mod backoff;
mod gcloud;
mod monitoring;
mod pool;

#[cfg(test)]
mod tests;

pub use backoff::{retry_with_backoff, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
pub use gcloud::{classify_gcloud_failure, GcloudCatalog};
pub use monitoring::{
    GcloudTokenSource, MonitoringUsageFetcher, StaticTokenSource, TokenSource,
    DEFAULT_MONITORING_ENDPOINT,
};
pub use pool::{FetchConfig, UsageCollection, UsageCollector, DEFAULT_MAX_CONCURRENCY};

use crate::error::Result;
use crate::models::{ResourceRecord, UsageSample, UsageWindow};

pub use async_trait::async_trait;

/// Source of the resource inventory
#[async_trait]
pub trait CatalogFetcher: Send + Sync {
    /// List every resource in `project`
    async fn list_resources(&self, project: &str) -> Result<Vec<ResourceRecord>>;
}

/// Source of per-resource utilization
#[async_trait]
pub trait UsageFetcher: Send + Sync {
    /// Samples for `resource_id` inside `window`, time-ascending
    ///
    /// Returns an empty vector when the resource has no data yet.
    async fn get_usage(&self, resource_id: &str, window: &UsageWindow) -> Result<Vec<UsageSample>>;
}
