//! Shared types for the matching strategies.

use bevy_ecs::prelude::Entity;

use crate::network::NodeId;
use crate::plan::{ActivityPlan, VehiclePosition};
use crate::replan::CommittedRide;

/// Estimated time to pickup for one request/vehicle pair. Unreachable pairs
/// are a variant, never a sentinel number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickupEstimate {
    Reachable { time_ms: u64 },
    Unreachable,
}

impl PickupEstimate {
    pub fn reachable_ms(&self) -> Option<u64> {
        match self {
            PickupEstimate::Reachable { time_ms } => Some(*time_ms),
            PickupEstimate::Unreachable => None,
        }
    }
}

/// An open request as handed to a matching pass, with the traveler's declared
/// limits snapshotted.
#[derive(Debug, Clone, Copy)]
pub struct OpenRequest {
    pub traveler: Entity,
    pub pickup: NodeId,
    pub dropoff: NodeId,
    pub submitted_at_ms: u64,
    pub tolerance_ms: u64,
    pub max_detour_ratio: f64,
}

/// Snapshot of one candidate vehicle for a matching pass.
#[derive(Debug, Clone)]
pub struct VehicleCandidate {
    pub entity: Entity,
    /// Fleet insertion order; final tie-breaker.
    pub fleet_index: usize,
    pub pos: VehiclePosition,
    pub plan: ActivityPlan,
    pub capacity: usize,
    /// Travelers already committed to this vehicle.
    pub committed: Vec<CommittedRide>,
    pub idle: bool,
}

impl VehicleCandidate {
    pub fn onboard_count(&self) -> usize {
        self.committed.iter().filter(|c| c.onboard).count()
    }
}

/// A provisional plan modification produced by a strategy; committed by the
/// dispatch loop.
#[derive(Debug, Clone)]
pub struct MatchProposal {
    pub traveler: Entity,
    pub vehicle: Entity,
    pub pickup: NodeId,
    pub dropoff: NodeId,
    pub submitted_at_ms: u64,
    pub pickup_time_ms: u64,
    /// Direct pickup-to-dropoff distance; the traveler's detour baseline.
    pub direct_m: f64,
    /// The candidate plan to swap in on commit.
    pub plan: ActivityPlan,
    /// Approach path is empty and the vehicle already stands at the pickup
    /// node: the elapsed wait is credited to the vehicle's movement budget.
    pub empty_approach: bool,
}
