//! Bounded concurrent usage collection
//!
//! Fetches usage for every resource through a fixed-width worker pool,
//! retries rate-limited calls, and stops waiting once the caller's deadline
//! passes. Whatever completed in time is kept; the rest is reported as skipped.

use super::{retry_with_backoff, RetryPolicy, UsageFetcher};
use crate::error::{OptimizerError, Result};
use crate::models::{ResourceRecord, UsageSample, UsageWindow};
use crate::report::{SkipReason, SkippedResource};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default upper bound on concurrent usage calls
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Configuration for usage collection
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Maximum in-flight usage calls
    pub max_concurrency: usize,
    /// Overall deadline for the usage phase
    pub timeout: Duration,
    /// Retry policy for rate-limited calls
    pub retry: RetryPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of a usage collection pass
#[derive(Debug, Default)]
pub struct UsageCollection {
    /// Samples keyed by resource id, time-ascending
    pub usage: BTreeMap<String, Vec<UsageSample>>,
    /// Resources whose usage could not be collected
    pub skipped: Vec<SkippedResource>,
    /// True if the deadline cut collection short
    pub partial: bool,
    /// Number of retried calls
    pub retries: u64,
}

impl UsageCollection {
    /// Samples for one resource, empty when none were collected
    pub fn samples_for(&self, resource_id: &str) -> &[UsageSample] {
        self.usage.get(resource_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Collects usage for many resources through a bounded worker pool
pub struct UsageCollector {
    fetcher: Arc<dyn UsageFetcher>,
    config: FetchConfig,
}

impl UsageCollector {
    pub fn new(fetcher: Arc<dyn UsageFetcher>, config: FetchConfig) -> Self {
        Self { fetcher, config }
    }

    /// Pool width for `resource_count` resources
    pub fn worker_count(&self, resource_count: usize) -> usize {
        resource_count.min(self.config.max_concurrency).max(1)
    }

    /// Fetch usage for each resource
    ///
    /// Fails only on authentication errors. Quota exhaustion, missing data,
    /// provider failures and the deadline mark individual resources skipped.
    pub async fn collect(
        &self,
        resources: &[ResourceRecord],
        window: UsageWindow,
    ) -> Result<UsageCollection> {
        let ids: BTreeSet<String> = resources.iter().map(|r| r.id.clone()).collect();
        let mut collection = UsageCollection::default();
        if ids.is_empty() {
            return Ok(collection);
        }

        let workers = self.worker_count(ids.len());
        info!(
            resources = ids.len(),
            workers = workers,
            timeout_secs = self.config.timeout.as_secs(),
            "Collecting usage"
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let retries = Arc::new(AtomicU64::new(0));
        let mut tasks = JoinSet::new();

        for id in &ids {
            let fetcher = Arc::clone(&self.fetcher);
            let semaphore = Arc::clone(&semaphore);
            let retries = Arc::clone(&retries);
            let policy = self.config.retry;
            let id = id.clone();

            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        retry_with_backoff(&policy, &id, |attempt| {
                            if attempt > 1 {
                                retries.fetch_add(1, Ordering::Relaxed);
                            }
                            let fetcher = Arc::clone(&fetcher);
                            let id = id.clone();
                            async move { fetcher.get_usage(&id, &window).await }
                        })
                        .await
                    }
                    Err(_) => Err(OptimizerError::Provider("worker pool closed".to_string())),
                };
                (id, result)
            });
        }

        let mut pending = ids;
        let deadline = Instant::now() + self.config.timeout;

        loop {
            let joined = match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    warn!(outstanding = pending.len(), "Usage collection timed out");
                    tasks.abort_all();
                    collection.partial = true;
                    break;
                }
            };

            let (id, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Usage task failed");
                    continue;
                }
            };
            pending.remove(&id);

            match result {
                Ok(samples) => {
                    let samples = pair_samples(&id, samples);
                    collection.usage.insert(id, samples);
                }
                Err(OptimizerError::Auth(msg)) => {
                    tasks.abort_all();
                    return Err(OptimizerError::Auth(msg));
                }
                Err(e) => {
                    let reason = match &e {
                        OptimizerError::Quota(_) => SkipReason::QuotaExhausted,
                        OptimizerError::DataUnavailable { .. } => SkipReason::DataUnavailable,
                        _ => SkipReason::FetchFailed,
                    };
                    debug!(resource_id = %id, error = %e, "Usage unavailable");
                    collection.skipped.push(SkippedResource {
                        resource_id: id,
                        reason,
                        detail: e.to_string(),
                    });
                }
            }
        }

        // Tasks that panicked or were cut off by the deadline
        for id in pending {
            let reason = if collection.partial {
                SkipReason::TimedOut
            } else {
                SkipReason::FetchFailed
            };
            collection.skipped.push(SkippedResource {
                resource_id: id,
                reason,
                detail: "usage fetch did not complete".to_string(),
            });
        }

        collection.skipped.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        collection.retries = retries.load(Ordering::Relaxed);
        Ok(collection)
    }
}

/// Keep only samples belonging to `resource_id`, sorted by time
fn pair_samples(resource_id: &str, samples: Vec<UsageSample>) -> Vec<UsageSample> {
    let total = samples.len();
    let mut paired: Vec<UsageSample> = samples
        .into_iter()
        .filter(|s| s.resource_id == resource_id)
        .collect();
    if paired.len() != total {
        warn!(
            resource_id = %resource_id,
            dropped = total - paired.len(),
            "Dropped samples belonging to another resource"
        );
    }
    paired.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    paired
}
