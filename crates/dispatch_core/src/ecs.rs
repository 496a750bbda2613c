//! Core agent components: travelers and vehicles.

use bevy_ecs::prelude::{Component, Entity};

use crate::network::{LinkId, NodeId};
use crate::services::ServiceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TravelerState {
    Walking,
    WaitingVehicle,
    InsideVehicle,
    Arrived,
    /// No route exists for this traveler; surfaced to the decision layer.
    Deadend,
}

#[derive(Debug, Clone, Component)]
pub struct Traveler {
    pub state: TravelerState,
    pub node: NodeId,
    /// Maximum acceptable delay between request submission and pickup.
    pub pickup_tolerance_ms: u64,
    /// Maximum ratio of actual to originally planned onboard distance.
    pub max_detour_ratio: f64,
    /// Direct pickup-to-dropoff distance of the committed match; baseline for
    /// the detour bound.
    pub planned_distance_m: f64,
    /// Onboard distance accumulated so far.
    pub traveled_m: f64,
    pub matched_vehicle: Option<Entity>,
    /// Pickup/dropoff of the committed match.
    pub pickup_node: Option<NodeId>,
    pub dropoff_node: Option<NodeId>,
    /// Planned walking route of an unmatched traveler; scanned when links
    /// disappear.
    pub walk_path: Vec<LinkId>,
    /// Ride timeline, simulation ms.
    pub requested_at_ms: u64,
    pub matched_at_ms: Option<u64>,
    pub pickup_at_ms: Option<u64>,
}

impl Traveler {
    pub fn new(node: NodeId, pickup_tolerance_ms: u64, max_detour_ratio: f64) -> Self {
        Self {
            state: TravelerState::Walking,
            node,
            pickup_tolerance_ms,
            max_detour_ratio,
            planned_distance_m: 0.0,
            traveled_m: 0.0,
            matched_vehicle: None,
            pickup_node: None,
            dropoff_node: None,
            walk_path: Vec::new(),
            requested_at_ms: 0,
            matched_at_ms: None,
            pickup_at_ms: None,
        }
    }
}

#[derive(Debug, Clone, Component)]
pub struct Vehicle {
    pub service: ServiceId,
    /// Insertion order into the fleet; final matching tie-breaker.
    pub fleet_index: usize,
    pub capacity: usize,
    pub onboard: Vec<Entity>,
    /// Movement budget credited by an immediate match, consumed on the next
    /// step so the matched timestep is not double-counted.
    pub carryover_ms: u64,
}

impl Vehicle {
    pub fn new(service: ServiceId, fleet_index: usize, capacity: usize) -> Self {
        Self {
            service,
            fleet_index,
            capacity,
            onboard: Vec::new(),
            carryover_ms: 0,
        }
    }

    pub fn onboard_count(&self) -> usize {
        self.onboard.len()
    }
}

/// Marker: plan repair was truncated, the vehicle needs a fresh dispatch cycle.
#[derive(Debug, Clone, Copy, Component)]
pub struct NeedsRedispatch;
