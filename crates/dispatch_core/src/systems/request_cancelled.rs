//! Request cancellation: withdraw an open request or unwind a match.
//!
//! Cancelling after boarding is ignored. A matched traveler's pickup and
//! serving activities are spliced out of the vehicle's plan on a clone, which
//! replaces the live plan only when the repair routes cleanly.

use bevy_ecs::prelude::{Entity, Query, Res, ResMut};

use crate::clock::{CurrentEvent, EventKind, EventSubject};
use crate::ecs::{Traveler, TravelerState, Vehicle};
use crate::interruption;
use crate::network::{LinkCosts, RoadNetwork};
use crate::plan::{ActivityPlan, RouteCtx, VehiclePosition};
use crate::routing::CostOracleResource;
use crate::services::ServiceRegistry;
use crate::telemetry::{InterruptionNotice, InterruptionOutbox, InterruptionReason, SimTelemetry};

#[allow(clippy::too_many_arguments)]
pub fn request_cancelled_system(
    event: Res<CurrentEvent>,
    network: Res<RoadNetwork>,
    costs: Res<LinkCosts>,
    oracle: Res<CostOracleResource>,
    mut registry: ResMut<ServiceRegistry>,
    mut telemetry: ResMut<SimTelemetry>,
    mut outbox: ResMut<InterruptionOutbox>,
    mut vehicles: Query<(Entity, &Vehicle, &mut ActivityPlan, &VehiclePosition)>,
    mut travelers: Query<&mut Traveler>,
) {
    if event.0.kind != EventKind::RequestCancelled {
        return;
    }
    let Some(EventSubject::Traveler(entity)) = event.0.subject else {
        return;
    };
    let Ok(mut traveler) = travelers.get_mut(entity) else {
        return;
    };
    if traveler.state == TravelerState::InsideVehicle {
        return;
    }
    let now = event.0.timestamp;

    match traveler.matched_vehicle {
        None => {
            let withdrawn = registry
                .iter_mut()
                .any(|(_, service)| service.take_request(entity).is_some());
            if !withdrawn {
                return;
            }
        }
        Some(vehicle_entity) => {
            let Ok((_, vehicle, mut plan, pos)) = vehicles.get_mut(vehicle_entity) else {
                return;
            };
            let layer = registry.get(vehicle.service).layer.clone();
            let ctx = RouteCtx {
                network: &network,
                costs: &costs,
                layer: &layer,
                oracle: oracle.0.as_ref(),
            };
            if let Ok(repaired) = interruption::cancel_match(&plan, pos, entity, &ctx) {
                *plan = repaired;
            }
            outbox.push(InterruptionNotice {
                at_ms: now,
                traveler: entity,
                vehicle: Some(vehicle_entity),
                reason: InterruptionReason::MatchCancelled,
            });
        }
    }

    traveler.matched_vehicle = None;
    traveler.pickup_node = None;
    traveler.dropoff_node = None;
    traveler.state = TravelerState::Walking;
    telemetry.counters.requests_cancelled += 1;
}
