//! Plan repair after mid-simulation interruptions.
//!
//! Link bans, cancelled matches and changed drop-offs all arrive while
//! vehicles are executing their plans. Repairs are built on a clone of the
//! live plan (or via the splicing primitives, which resolve all routes before
//! mutating), so a vehicle never observes a half-repaired plan.

use bevy_ecs::prelude::Entity;

use crate::network::LinkId;
use crate::plan::{Activity, ActivityPlan, PlanError, RouteCtx, VehiclePosition};

/// Result of repairing one vehicle's plan after a network change.
#[derive(Debug)]
pub enum RepairOutcome {
    Unaffected,
    /// Every affected leg got a fresh route around the banned links.
    Rerouted { legs: usize },
    /// No route exists past `legs` repaired ones; the plan tail was dropped.
    Truncated {
        legs: usize,
        dropped: Vec<Activity>,
    },
}

impl RepairOutcome {
    /// Travelers whose pickup or serving activity was dropped by truncation.
    pub fn dropped_travelers(&self) -> Vec<Entity> {
        match self {
            RepairOutcome::Truncated { dropped, .. } => {
                let mut travelers: Vec<Entity> =
                    dropped.iter().filter_map(|a| a.bound_traveler()).collect();
                travelers.dedup();
                travelers
            }
            _ => Vec::new(),
        }
    }
}

/// Reroute every leg whose path crosses a banned link; truncate from the
/// first leg that cannot be rerouted.
///
/// A vehicle caught mid-link on a banned link finishes that link: the live
/// partial segment stays as the path prefix and is not treated as a crossing
/// again after its leg has been rerouted once.
pub fn repair_vehicle_plan(
    plan: &mut ActivityPlan,
    pos: &VehiclePosition,
    ctx: &RouteCtx<'_>,
) -> RepairOutcome {
    let banned = ctx.network.banned_links();
    let mut legs = 0;
    let mut start = 0;
    loop {
        let crossing = (start..plan.len())
            .find(|&i| plan.activity(i).is_some_and(|a| a.crosses(banned)));
        let Some(index) = crossing else {
            break;
        };
        match plan.reroute_activity(index, pos, ctx) {
            Ok(()) => {
                legs += 1;
                start = if plan.activity(index).is_some_and(|a| a.crosses(banned)) {
                    // Only the live partial link remains banned here.
                    index + 1
                } else {
                    index
                };
            }
            Err(_) => {
                let dropped = plan.truncate_from(index);
                return RepairOutcome::Truncated { legs, dropped };
            }
        }
    }
    if legs == 0 {
        RepairOutcome::Unaffected
    } else {
        RepairOutcome::Rerouted { legs }
    }
}

/// A walking traveler is affected when their remaining walk uses a banned link.
pub fn walk_path_affected(walk_path: &[LinkId], ctx: &RouteCtx<'_>) -> bool {
    walk_path.iter().any(|l| ctx.network.is_banned(*l))
}

/// Build the vehicle's plan with `traveler`'s pickup and serving removed.
/// The caller swaps the returned plan in on success.
pub fn cancel_match(
    plan: &ActivityPlan,
    pos: &VehiclePosition,
    traveler: Entity,
    ctx: &RouteCtx<'_>,
) -> Result<ActivityPlan, PlanError> {
    let mut candidate = plan.clone();
    let mut removed_any = false;
    // Serving first: removing it does not shift the pickup's index.
    if let Some(index) = candidate.position_of_serving(traveler) {
        candidate.remove_activity(index, pos, ctx)?;
        removed_any = true;
    }
    if let Some(index) = candidate.position_of_pickup(traveler) {
        candidate.remove_activity(index, pos, ctx)?;
        removed_any = true;
    }
    if !removed_any {
        return Err(PlanError::NotInPlan);
    }
    Ok(candidate)
}

/// Build the vehicle's plan with `traveler`'s serving activity retargeted to
/// `new_dropoff`, keeping its position among the other stops.
pub fn change_dropoff(
    plan: &ActivityPlan,
    pos: &VehiclePosition,
    traveler: Entity,
    new_dropoff: crate::network::NodeId,
    ctx: &RouteCtx<'_>,
) -> Result<ActivityPlan, PlanError> {
    let mut candidate = plan.clone();
    let index = candidate
        .position_of_serving(traveler)
        .ok_or(PlanError::NotInPlan)?;
    candidate.remove_activity(index, pos, ctx)?;
    let index = index.min(candidate.len());
    candidate.insert_activity(index, Activity::serving(traveler, new_dropoff), pos, ctx)?;
    Ok(candidate)
}
