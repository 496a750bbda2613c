//! Shared-ride insertion engine.
//!
//! Builds a hypothetical modified plan for a new (pickup, drop) pair without
//! touching the live plan: pickup goes immediately after the last existing
//! pickup (all-pickups-first), serving goes to the plan tail. The candidate
//! is scored by the marginal ride distance it imposes on every committed
//! traveler; any traveler pushed past their declared detour ratio makes the
//! candidate infeasible. The matcher commits the winning candidate by
//! swapping it in whole.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use bevy_ecs::prelude::Entity;

use crate::network::NodeId;
use crate::plan::{Activity, ActivityPlan, PlanError, RouteCtx, VehiclePosition};

/// The new request as the insertion engine sees it.
#[derive(Debug, Clone, Copy)]
pub struct NewRide {
    pub traveler: Entity,
    pub pickup: NodeId,
    pub dropoff: NodeId,
    pub max_detour_ratio: f64,
    /// Direct pickup-to-dropoff distance on the service's sub-graph.
    pub direct_m: f64,
}

/// A traveler already committed to the vehicle: onboard, or with a pending
/// pickup in the plan.
#[derive(Debug, Clone, Copy)]
pub struct CommittedRide {
    pub traveler: Entity,
    pub onboard: bool,
    pub traveled_m: f64,
    pub planned_m: f64,
    pub max_detour_ratio: f64,
}

/// A feasible candidate plan with its score.
#[derive(Debug, Clone)]
pub struct InsertionCandidate {
    pub plan: ActivityPlan,
    /// Summed marginal ride distance over all affected travelers.
    pub disutility_m: f64,
    /// Driving time until the new pickup completes.
    pub pickup_time_ms: u64,
    pub empty_approach: bool,
}

/// Feasibility precheck: seats for onboard travelers plus pending pickups.
pub fn capacity_ok(onboard: usize, pending_pickups: usize, capacity: usize) -> bool {
    onboard + pending_pickups < capacity
}

/// Build the candidate plan under the all-pickups-first policy.
pub fn build_candidate_plan(
    plan: &ActivityPlan,
    pos: &VehiclePosition,
    ride: &NewRide,
    ctx: &RouteCtx<'_>,
) -> Result<ActivityPlan, PlanError> {
    let mut candidate = plan.clone();
    let pickup_index = candidate.last_pickup_index().map_or(0, |i| i + 1);
    candidate.insert_activity(
        pickup_index,
        Activity::pickup(ride.traveler, ride.pickup),
        pos,
        ctx,
    )?;
    let tail = candidate.len();
    candidate.insert_activity(tail, Activity::serving(ride.traveler, ride.dropoff), pos, ctx)?;
    Ok(candidate)
}

/// Ride distance still ahead of `traveler` in `plan`: from their pickup
/// (or from the live position when onboard) to their serving activity.
pub fn remaining_ride_m(plan: &ActivityPlan, traveler: Entity, onboard: bool) -> f64 {
    let Some(serving) = plan.position_of_serving(traveler) else {
        return 0.0;
    };
    let first = if onboard {
        0
    } else {
        plan.position_of_pickup(traveler).map_or(0, |i| i + 1)
    };
    plan.iter()
        .enumerate()
        .filter(|(i, _)| *i >= first && *i <= serving)
        .map(|(_, a)| a.remaining_m())
        .sum()
}

/// Evaluate inserting `ride` into a vehicle's plan. Returns `None` when the
/// candidate is infeasible: no seat, no route, or any traveler's detour bound
/// violated.
pub fn evaluate(
    plan: &ActivityPlan,
    pos: &VehiclePosition,
    capacity: usize,
    onboard: usize,
    committed: &[CommittedRide],
    ride: &NewRide,
    ctx: &RouteCtx<'_>,
) -> Option<InsertionCandidate> {
    if !capacity_ok(onboard, plan.pending_pickups(), capacity) {
        return None;
    }

    let candidate = build_candidate_plan(plan, pos, ride, ctx).ok()?;

    let mut disutility_m = 0.0;
    for c in committed {
        let before = remaining_ride_m(plan, c.traveler, c.onboard);
        let after = remaining_ride_m(&candidate, c.traveler, c.onboard);
        disutility_m += (after - before).max(0.0);
        if c.planned_m > 0.0 && (c.traveled_m + after) / c.planned_m > c.max_detour_ratio {
            return None;
        }
    }

    let new_remaining = remaining_ride_m(&candidate, ride.traveler, false);
    disutility_m += (new_remaining - ride.direct_m).max(0.0);
    if ride.direct_m > 0.0 && new_remaining / ride.direct_m > ride.max_detour_ratio {
        return None;
    }

    let pickup_index = candidate.position_of_pickup(ride.traveler)?;
    let pickup_time_ms = candidate.time_until(pickup_index, ctx.network, ctx.costs);
    let empty_approach = candidate
        .activity(pickup_index)
        .is_some_and(|a| a.path().is_empty())
        && plan.idle_node(pos) == Some(ride.pickup);

    Some(InsertionCandidate {
        plan: candidate,
        disutility_m,
        pickup_time_ms,
        empty_approach,
    })
}

#[derive(Debug)]
struct Scored {
    disutility_m: f64,
    index: usize,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.disutility_m
            .total_cmp(&other.disutility_m)
            .then(self.index.cmp(&other.index))
    }
}

/// Minimum-disutility selection via a priority queue rather than a full sort;
/// ties resolve by input order, keeping selection deterministic.
pub fn select_min_by<T>(
    items: impl IntoIterator<Item = T>,
    disutility_m: impl Fn(&T) -> f64,
) -> Option<T> {
    let mut heap = BinaryHeap::new();
    let mut kept: Vec<Option<T>> = Vec::new();
    for item in items {
        heap.push(Reverse(Scored {
            disutility_m: disutility_m(&item),
            index: kept.len(),
        }));
        kept.push(Some(item));
    }
    let Reverse(best) = heap.pop()?;
    kept[best.index].take()
}
