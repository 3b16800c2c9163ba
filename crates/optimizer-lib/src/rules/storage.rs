//! Catalog-only rules for disks and snapshots

use super::{Recommendation, RuleContext, RuleId, SuggestedAction};
use crate::models::{AttachmentState, LifecycleState, ResourceKind, ResourceRecord, UsageSample};
use chrono::Duration;

/// Disk left unattached for longer than the grace period
pub fn unattached_disk(
    ctx: &RuleContext<'_>,
    resource: &ResourceRecord,
    _samples: &[UsageSample],
) -> Option<Recommendation> {
    if resource.kind != ResourceKind::Disk
        || resource.attachment != AttachmentState::Unattached
        || resource.lifecycle == LifecycleState::Terminated
    {
        return None;
    }

    // A disk detached after creation has only been unattached since then
    let unattached_since = resource
        .last_detached_at
        .map_or(resource.created_at, |detached| detached.max(resource.created_at));
    let unattached_for = ctx.now - unattached_since;
    if unattached_for <= Duration::hours(ctx.config.unattached_disk_grace_hours) {
        return None;
    }

    let size_gb = resource.size_gb.unwrap_or(0);
    let disk_type = resource.size_class.as_deref();
    let unit_price = ctx.prices.disk_price(disk_type);
    let rationale = format!(
        "{} GB {} disk has been unattached for {} hours (${:.3}/GB-month)",
        size_gb,
        disk_type.unwrap_or("unknown"),
        unattached_for.num_hours(),
        unit_price
    );

    Some(Recommendation::for_resource(
        resource,
        RuleId::UnattachedDisk,
        SuggestedAction::Delete,
        ctx.prices.disk_monthly_cost(disk_type, size_gb),
        rationale,
    ))
}

/// Snapshot past retention that no disk in the catalog was restored from
pub fn stale_snapshot(
    ctx: &RuleContext<'_>,
    resource: &ResourceRecord,
    _samples: &[UsageSample],
) -> Option<Recommendation> {
    if resource.kind != ResourceKind::Snapshot {
        return None;
    }

    let age = ctx.now - resource.created_at;
    if age <= Duration::days(ctx.config.snapshot_retention_days) {
        return None;
    }

    let has_dependent = ctx.catalog.iter().any(|r| {
        r.kind == ResourceKind::Disk
            && r.created_at > resource.created_at
            && r.source_snapshot
                .as_deref()
                .is_some_and(|src| resource.is_referenced_by(src))
    });
    if has_dependent {
        return None;
    }

    let size_gb = resource.size_gb.unwrap_or(0);
    let rationale = format!(
        "Snapshot is {} days old (retention {} days) and no disk depends on it; {} GB stored",
        age.num_days(),
        ctx.config.snapshot_retention_days,
        size_gb
    );

    Some(Recommendation::for_resource(
        resource,
        RuleId::StaleSnapshot,
        SuggestedAction::Delete,
        ctx.prices.snapshot_monthly_cost(size_gb),
        rationale,
    ))
}

/// Disk type every SSD-backed disk is measured against
pub const STANDARD_DISK_TYPE: &str = "pd-standard";

/// SSD-backed disk that would be cheaper as a standard persistent disk
pub fn ssd_disk(
    ctx: &RuleContext<'_>,
    resource: &ResourceRecord,
    _samples: &[UsageSample],
) -> Option<Recommendation> {
    if resource.kind != ResourceKind::Disk || resource.lifecycle == LifecycleState::Terminated {
        return None;
    }
    let disk_type = resource.size_class.as_deref()?;
    if !disk_type.contains("ssd") {
        return None;
    }

    let size_gb = resource.size_gb.unwrap_or(0);
    let saving = ctx.prices.disk_monthly_cost(Some(disk_type), size_gb)
        - ctx.prices.disk_monthly_cost(Some(STANDARD_DISK_TYPE), size_gb);
    if saving <= 0.0 {
        return None;
    }

    let rationale = format!(
        "{} GB {} disk costs ${:.3}/GB-month against ${:.3} for {}; switch if IOPS allow",
        size_gb,
        disk_type,
        ctx.prices.disk_price(Some(disk_type)),
        ctx.prices.disk_price(Some(STANDARD_DISK_TYPE)),
        STANDARD_DISK_TYPE
    );

    Some(Recommendation::for_resource(
        resource,
        RuleId::SsdDisk,
        SuggestedAction::ChangeDiskType {
            target_disk_type: STANDARD_DISK_TYPE.to_string(),
        },
        saving,
        rationale,
    ))
}
