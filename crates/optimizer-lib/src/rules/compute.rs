//! Usage-based rules for compute instances

use super::{CpuStats, Recommendation, RuleContext, RuleId, SuggestedAction};
use crate::models::{LifecycleState, ResourceKind, ResourceRecord, UsageSample};
use chrono::Duration;

/// Running instance whose stats fall inside the observation window
fn running_instance_stats(
    ctx: &RuleContext<'_>,
    resource: &ResourceRecord,
    samples: &[UsageSample],
) -> Option<CpuStats> {
    if resource.kind != ResourceKind::ComputeInstance
        || resource.lifecycle != LifecycleState::Running
    {
        return None;
    }
    CpuStats::from_samples(samples, &ctx.observation_window())
}

fn is_idle(ctx: &RuleContext<'_>, resource: &ResourceRecord, stats: &CpuStats) -> bool {
    let running_for = ctx.now - resource.active_since();
    stats.mean < ctx.config.idle_cpu_threshold_pct
        && running_for > Duration::days(ctx.config.idle_min_running_days)
}

/// Average CPU below the idle threshold on an instance running long enough
pub fn idle_compute(
    ctx: &RuleContext<'_>,
    resource: &ResourceRecord,
    samples: &[UsageSample],
) -> Option<Recommendation> {
    let stats = running_instance_stats(ctx, resource, samples)?;
    if !is_idle(ctx, resource, &stats) {
        return None;
    }

    let machine_type = resource.size_class.as_deref().unwrap_or("unknown");
    let monthly_cost = ctx.prices.machine_monthly_cost(machine_type);
    let rationale = format!(
        "Average CPU {:.1}% over the last {} days is below {:.1}%; {} has been running for {} days{}",
        stats.mean,
        ctx.config.observation_window_days,
        ctx.config.idle_cpu_threshold_pct,
        machine_type,
        (ctx.now - resource.active_since()).num_days(),
        if monthly_cost.is_none() {
            " (no list price for this machine type)"
        } else {
            ""
        }
    );

    Some(Recommendation::for_resource(
        resource,
        RuleId::IdleCompute,
        SuggestedAction::DownsizeOrDelete,
        monthly_cost.unwrap_or(0.0),
        rationale,
    ))
}

/// Peak CPU below the oversized threshold and a smaller tier exists
pub fn oversized_machine(
    ctx: &RuleContext<'_>,
    resource: &ResourceRecord,
    samples: &[UsageSample],
) -> Option<Recommendation> {
    let stats = running_instance_stats(ctx, resource, samples)?;
    if stats.peak >= ctx.config.oversized_peak_cpu_threshold_pct {
        return None;
    }

    let current = resource.size_class.as_deref()?;
    let target = ctx.prices.next_smaller_machine(current)?;
    let current_cost = ctx.prices.machine_monthly_cost(current)?;
    let target_cost = ctx.prices.machine_monthly_cost(&target)?;

    let rationale = format!(
        "Peak CPU {:.1}% over the last {} days is below {:.1}%; {} can drop to {}",
        stats.peak,
        ctx.config.observation_window_days,
        ctx.config.oversized_peak_cpu_threshold_pct,
        current,
        target
    );

    Some(Recommendation::for_resource(
        resource,
        RuleId::OversizedMachine,
        SuggestedAction::Resize {
            target_machine_type: target,
        },
        current_cost - target_cost,
        rationale,
    ))
}

/// Instance stopped long enough that its attached disks are dead weight
///
/// Stopped instances bill nothing for compute but keep billing for every
/// persistent disk bound to them. Abstains when no disk in the catalog is
/// bound to the instance.
pub fn stopped_instance(
    ctx: &RuleContext<'_>,
    resource: &ResourceRecord,
    _samples: &[UsageSample],
) -> Option<Recommendation> {
    if resource.kind != ResourceKind::ComputeInstance
        || resource.lifecycle == LifecycleState::Running
    {
        return None;
    }

    let stopped_since = resource
        .last_stopped_at
        .unwrap_or_else(|| resource.active_since());
    let stopped_for = ctx.now - stopped_since;
    if stopped_for <= Duration::days(ctx.config.stopped_instance_min_days) {
        return None;
    }

    let (disk_count, disk_cost) = ctx
        .catalog
        .iter()
        .filter(|r| {
            r.kind == ResourceKind::Disk && r.users.iter().any(|u| resource.is_referenced_by(u))
        })
        .fold((0usize, 0.0), |(count, cost), disk| {
            (
                count + 1,
                cost + ctx
                    .prices
                    .disk_monthly_cost(disk.size_class.as_deref(), disk.size_gb.unwrap_or(0)),
            )
        });
    if disk_count == 0 {
        return None;
    }

    let rationale = format!(
        "{} has been stopped for {} days; {} attached disk(s) still bill for storage",
        resource.size_class.as_deref().unwrap_or("instance"),
        stopped_for.num_days(),
        disk_count
    );

    Some(Recommendation::for_resource(
        resource,
        RuleId::StoppedInstance,
        SuggestedAction::Delete,
        disk_cost,
        rationale,
    ))
}
