//! Unit prices used to estimate monthly savings
//!
//! Defaults are us-central1 on-demand list prices in USD. Every table can be
//! overridden from configuration; table entries are merged key by key onto
//! the defaults, so overriding one disk type keeps the others.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Billing hours in a month
pub const HOURS_PER_MONTH: f64 = 730.0;

/// Price per GB-month for disk types missing from the table
pub const DEFAULT_DISK_PRICE_PER_GB: f64 = 0.04;

/// Snapshot storage price per GB-month
pub const DEFAULT_SNAPSHOT_PRICE_PER_GB: f64 = 0.05;

/// Reserved external address price per hour
pub const DEFAULT_STATIC_IP_PRICE_PER_HOUR: f64 = 0.01;

/// Pricing and tier ladder for a predefined machine family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineFamily {
    /// Hourly price of one vCPU (memory included)
    pub vcpu_hour_price: f64,
    /// Available vCPU counts, ascending
    pub tiers: Vec<u32>,
}

/// Price tables consulted by the rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PriceOverrides")]
pub struct PriceCatalog {
    pub currency: String,
    /// Disk type (e.g. `pd-ssd`) to price per GB-month
    pub disk_price_per_gb: BTreeMap<String, f64>,
    pub default_disk_price_per_gb: f64,
    pub snapshot_price_per_gb: f64,
    pub static_ip_price_per_hour: f64,
    /// Family prefix (e.g. `e2-standard`) to pricing
    pub machine_families: BTreeMap<String, MachineFamily>,
    /// Fixed hourly prices for shared-core machine types
    pub shared_core_hourly: BTreeMap<String, f64>,
}

impl Default for PriceCatalog {
    fn default() -> Self {
        let disk_price_per_gb = [
            ("pd-standard", 0.04),
            ("pd-balanced", 0.10),
            ("pd-ssd", 0.17),
            ("pd-extreme", 0.125),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let e2 = vec![2, 4, 8, 16, 32];
        let n1 = vec![1, 2, 4, 8, 16, 32, 64, 96];
        let n2 = vec![2, 4, 8, 16, 32, 48, 64, 80, 96, 128];
        let n2d = vec![2, 4, 8, 16, 32, 48, 64, 80, 96, 128, 224];

        let machine_families = [
            ("e2-standard", 0.0335, &e2),
            ("e2-highmem", 0.04522, &e2),
            ("e2-highcpu", 0.02474, &e2),
            ("n1-standard", 0.0475, &n1),
            ("n1-highmem", 0.0592, &n1),
            ("n1-highcpu", 0.03545, &n1),
            ("n2-standard", 0.04855, &n2),
            ("n2-highmem", 0.06549, &n2),
            ("n2-highcpu", 0.03584, &n2),
            ("n2d-standard", 0.04224, &n2d),
        ]
        .into_iter()
        .map(|(name, price, tiers)| {
            (
                name.to_string(),
                MachineFamily {
                    vcpu_hour_price: price,
                    tiers: tiers.clone(),
                },
            )
        })
        .collect();

        let shared_core_hourly = [
            ("e2-micro", 0.0084),
            ("e2-small", 0.0168),
            ("e2-medium", 0.0335),
            ("f1-micro", 0.0076),
            ("g1-small", 0.0257),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            currency: "USD".to_string(),
            disk_price_per_gb,
            default_disk_price_per_gb: DEFAULT_DISK_PRICE_PER_GB,
            snapshot_price_per_gb: DEFAULT_SNAPSHOT_PRICE_PER_GB,
            static_ip_price_per_hour: DEFAULT_STATIC_IP_PRICE_PER_HOUR,
            machine_families,
            shared_core_hourly,
        }
    }
}

/// Partial price configuration layered over the defaults
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PriceOverrides {
    pub currency: Option<String>,
    pub disk_price_per_gb: BTreeMap<String, f64>,
    pub default_disk_price_per_gb: Option<f64>,
    pub snapshot_price_per_gb: Option<f64>,
    pub static_ip_price_per_hour: Option<f64>,
    pub machine_families: BTreeMap<String, MachineFamily>,
    pub shared_core_hourly: BTreeMap<String, f64>,
}

impl From<PriceOverrides> for PriceCatalog {
    fn from(overrides: PriceOverrides) -> Self {
        let mut catalog = PriceCatalog::default();
        if let Some(currency) = overrides.currency {
            catalog.currency = currency;
        }
        if let Some(price) = overrides.default_disk_price_per_gb {
            catalog.default_disk_price_per_gb = price;
        }
        if let Some(price) = overrides.snapshot_price_per_gb {
            catalog.snapshot_price_per_gb = price;
        }
        if let Some(price) = overrides.static_ip_price_per_hour {
            catalog.static_ip_price_per_hour = price;
        }
        catalog.disk_price_per_gb.extend(overrides.disk_price_per_gb);
        catalog.machine_families.extend(overrides.machine_families);
        catalog.shared_core_hourly.extend(overrides.shared_core_hourly);
        catalog
    }
}

impl PriceCatalog {
    /// Price per GB-month for a disk type, falling back to the default
    pub fn disk_price(&self, disk_type: Option<&str>) -> f64 {
        disk_type
            .and_then(|t| self.disk_price_per_gb.get(t))
            .copied()
            .unwrap_or(self.default_disk_price_per_gb)
    }

    pub fn disk_monthly_cost(&self, disk_type: Option<&str>, size_gb: u64) -> f64 {
        size_gb as f64 * self.disk_price(disk_type)
    }

    pub fn snapshot_monthly_cost(&self, size_gb: u64) -> f64 {
        size_gb as f64 * self.snapshot_price_per_gb
    }

    pub fn static_ip_monthly_cost(&self) -> f64 {
        self.static_ip_price_per_hour * HOURS_PER_MONTH
    }

    /// Monthly on-demand cost of a machine type, `None` if unknown
    pub fn machine_monthly_cost(&self, machine_type: &str) -> Option<f64> {
        if let Some(hourly) = self.shared_core_hourly.get(machine_type) {
            return Some(hourly * HOURS_PER_MONTH);
        }
        let (family, vcpus) = split_machine_type(machine_type)?;
        let pricing = self.machine_families.get(family)?;
        Some(pricing.vcpu_hour_price * vcpus as f64 * HOURS_PER_MONTH)
    }

    /// Machine type one tier below `machine_type` in the same family
    ///
    /// Returns `None` for the smallest tier, custom shapes, and unknown families.
    pub fn next_smaller_machine(&self, machine_type: &str) -> Option<String> {
        let (family, vcpus) = split_machine_type(machine_type)?;
        let pricing = self.machine_families.get(family)?;
        let idx = pricing.tiers.iter().position(|&t| t == vcpus)?;
        if idx == 0 {
            return None;
        }
        Some(format!("{}-{}", family, pricing.tiers[idx - 1]))
    }
}

/// Split `e2-standard-8` into (`e2-standard`, 8)
pub fn split_machine_type(machine_type: &str) -> Option<(&str, u32)> {
    let (family, vcpus) = machine_type.rsplit_once('-')?;
    let vcpus = vcpus.parse().ok()?;
    Some((family, vcpus))
}

/// Round a currency amount to cents, clamping negatives to zero
pub fn round_cents(amount: f64) -> f64 {
    if !amount.is_finite() || amount <= 0.0 {
        return 0.0;
    }
    (amount * 100.0).round() / 100.0
}
