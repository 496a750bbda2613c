//! The matching strategy trait and the per-pass context.
//!
//! Strategies are selected once at service construction (no string dispatch
//! on the hot path) and only produce proposals; the dispatch loop commits
//! them, so a pass never leaves partial mutation behind.

use h3o::Resolution;

use crate::network::{LinkCosts, NodeId, RoadNetwork, ServiceLayer};
use crate::plan::{Activity, RouteCtx};
use crate::replan::{self, NewRide};
use crate::routing::CostOracle;

use super::types::{MatchProposal, OpenRequest, PickupEstimate, VehicleCandidate};

/// Read-only inputs of one matching pass for one service.
pub struct MatchContext<'a> {
    pub now_ms: u64,
    pub network: &'a RoadNetwork,
    pub costs: &'a LinkCosts,
    pub layer: &'a ServiceLayer,
    pub oracle: &'a dyn CostOracle,
    /// Maximum H3 grid distance between vehicle and pickup cells; 0 = same cell.
    pub radius: u32,
    pub zone_resolution: Resolution,
    /// Shared-ride service: proposals go through the insertion engine.
    pub shared: bool,
}

impl<'a> MatchContext<'a> {
    pub fn route_ctx(&self) -> RouteCtx<'a> {
        RouteCtx {
            network: self.network,
            costs: self.costs,
            layer: self.layer,
            oracle: self.oracle,
        }
    }

    /// Spatial radius filter over zone cells (cheap pre-filter before any
    /// shortest-path query).
    pub fn within_radius(&self, a: NodeId, b: NodeId) -> bool {
        let ca = self.network.cell(a, self.zone_resolution);
        let cb = self.network.cell(b, self.zone_resolution);
        ca.grid_distance(cb)
            .is_ok_and(|d| d >= 0 && d <= self.radius as i32)
    }

    /// Time until `candidate` could start the pickup leg plus the approach
    /// itself: remaining plan driving time, then plan tail to the pickup node.
    pub fn tail_approach(&self, candidate: &VehicleCandidate, pickup: NodeId) -> PickupEstimate {
        let tail = candidate.plan.last_target(candidate.pos.node);
        match self.route_ctx().route(tail, pickup) {
            Ok(route) => PickupEstimate::Reachable {
                time_ms: candidate.plan.remaining_time_ms(self.network, self.costs) + route.time_ms,
            },
            Err(_) => PickupEstimate::Unreachable,
        }
    }

    /// Pickup delay experienced by the traveler if committed now.
    pub fn pickup_delay_ms(&self, submitted_at_ms: u64, pickup_time_ms: u64) -> u64 {
        self.now_ms.saturating_sub(submitted_at_ms) + pickup_time_ms
    }

    /// Build a proposal for an exclusive-ride service: pickup and serving
    /// appended at the plan tail.
    pub fn build_tail_proposal(
        &self,
        request: &OpenRequest,
        candidate: &VehicleCandidate,
    ) -> Option<MatchProposal> {
        let ctx = self.route_ctx();
        let direct_m = ctx.route(request.pickup, request.dropoff).ok()?.length_m;

        let mut plan = candidate.plan.clone();
        let tail = plan.len();
        plan.insert_activity(
            tail,
            Activity::pickup(request.traveler, request.pickup),
            &candidate.pos,
            &ctx,
        )
        .ok()?;
        let tail = plan.len();
        plan.insert_activity(
            tail,
            Activity::serving(request.traveler, request.dropoff),
            &candidate.pos,
            &ctx,
        )
        .ok()?;

        let pickup_index = plan.position_of_pickup(request.traveler)?;
        let pickup_time_ms = plan.time_until(pickup_index, self.network, self.costs);
        let empty_approach = plan
            .activity(pickup_index)
            .is_some_and(|a| a.path().is_empty())
            && candidate.plan.idle_node(&candidate.pos) == Some(request.pickup);

        Some(MatchProposal {
            traveler: request.traveler,
            vehicle: candidate.entity,
            pickup: request.pickup,
            dropoff: request.dropoff,
            submitted_at_ms: request.submitted_at_ms,
            pickup_time_ms,
            direct_m,
            plan,
            empty_approach,
        })
    }

    /// Build a proposal for a shared-ride service via the insertion engine.
    /// Returns the proposal only when feasible and within tolerance.
    pub fn build_shared_proposal(
        &self,
        request: &OpenRequest,
        candidate: &VehicleCandidate,
    ) -> Option<(f64, MatchProposal)> {
        let ctx = self.route_ctx();
        let direct_m = ctx.route(request.pickup, request.dropoff).ok()?.length_m;
        let ride = NewRide {
            traveler: request.traveler,
            pickup: request.pickup,
            dropoff: request.dropoff,
            max_detour_ratio: request.max_detour_ratio,
            direct_m,
        };
        let insertion = replan::evaluate(
            &candidate.plan,
            &candidate.pos,
            candidate.capacity,
            candidate.onboard_count(),
            &candidate.committed,
            &ride,
            &ctx,
        )?;
        if self.pickup_delay_ms(request.submitted_at_ms, insertion.pickup_time_ms)
            > request.tolerance_ms
        {
            return None;
        }
        Some((
            insertion.disutility_m,
            MatchProposal {
                traveler: request.traveler,
                vehicle: candidate.entity,
                pickup: request.pickup,
                dropoff: request.dropoff,
                submitted_at_ms: request.submitted_at_ms,
                pickup_time_ms: insertion.pickup_time_ms,
                direct_m,
                plan: insertion.plan,
                empty_approach: insertion.empty_approach,
            },
        ))
    }
}

/// A matching strategy pairs open requests with candidate vehicles.
///
/// Implementations must be deterministic: identical request and candidate
/// lists produce identical proposals.
pub trait MatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// One matching pass. Proposals reference disjoint vehicles.
    fn run(
        &self,
        requests: &[OpenRequest],
        candidates: &[VehicleCandidate],
        ctx: &MatchContext<'_>,
    ) -> Vec<MatchProposal>;
}

/// Capacity precheck shared by both strategies.
pub fn has_free_seat(candidate: &VehicleCandidate) -> bool {
    replan::capacity_ok(
        candidate.onboard_count(),
        candidate.plan.pending_pickups(),
        candidate.capacity,
    )
}

/// `true` when the plan could still serve this candidate filter policy.
pub fn passes_filter(candidate: &VehicleCandidate, idle_only: bool) -> bool {
    !idle_only || candidate.idle
}
