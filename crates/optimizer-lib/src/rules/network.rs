//! Catalog-only rule for reserved addresses

use super::{Recommendation, RuleContext, RuleId, SuggestedAction};
use crate::models::{LifecycleState, ResourceKind, ResourceRecord, UsageSample};

/// Static IP not bound to any running resource
///
/// Users that resolve to a catalog instance count only while that instance
/// is running. Users outside the catalog (forwarding rules, routers) are
/// assumed live.
pub fn orphaned_static_ip(
    ctx: &RuleContext<'_>,
    resource: &ResourceRecord,
    _samples: &[UsageSample],
) -> Option<Recommendation> {
    if resource.kind != ResourceKind::StaticIp {
        return None;
    }

    let bound_to_running = resource.users.iter().any(|user| {
        match ctx.resolve_kind(ResourceKind::ComputeInstance, user) {
            Some(instance) => instance.lifecycle == LifecycleState::Running,
            None => true,
        }
    });
    if bound_to_running {
        return None;
    }

    let rationale = if resource.users.is_empty() {
        "Reserved address has no users".to_string()
    } else {
        format!(
            "Reserved address is only bound to stopped instances: {}",
            resource
                .users
                .iter()
                .map(|u| u.rsplit('/').next().unwrap_or(u))
                .collect::<Vec<_>>()
                .join(", ")
        )
    };

    Some(Recommendation::for_resource(
        resource,
        RuleId::OrphanedStaticIp,
        SuggestedAction::Release,
        ctx.prices.static_ip_monthly_cost(),
        rationale,
    ))
}
