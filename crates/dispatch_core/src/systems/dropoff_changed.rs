//! Drop-off changes for matched or riding travelers.
//!
//! The serving activity is retargeted on a clone of the vehicle's plan,
//! keeping its position among the other stops; the live plan is replaced only
//! when the new leg routes.

use bevy_ecs::prelude::{Entity, Query, Res, ResMut};

use crate::clock::{CurrentEvent, EventKind, EventSubject};
use crate::ecs::{Traveler, TravelerState, Vehicle};
use crate::interruption;
use crate::network::{LinkCosts, RoadNetwork};
use crate::plan::{ActivityPlan, RouteCtx, VehiclePosition};
use crate::routing::CostOracleResource;
use crate::scenario::PendingDropChanges;
use crate::services::{Request, ServiceRegistry};
use crate::telemetry::{InterruptionNotice, InterruptionOutbox, InterruptionReason};

#[allow(clippy::too_many_arguments)]
pub fn dropoff_changed_system(
    event: Res<CurrentEvent>,
    network: Res<RoadNetwork>,
    costs: Res<LinkCosts>,
    oracle: Res<CostOracleResource>,
    mut registry: ResMut<ServiceRegistry>,
    mut pending: ResMut<PendingDropChanges>,
    mut outbox: ResMut<InterruptionOutbox>,
    mut vehicles: Query<(Entity, &Vehicle, &mut ActivityPlan, &VehiclePosition)>,
    mut travelers: Query<&mut Traveler>,
) {
    if event.0.kind != EventKind::DropoffChanged {
        return;
    }
    let Some(EventSubject::Traveler(entity)) = event.0.subject else {
        return;
    };
    let now = event.0.timestamp;
    let Some(index) = pending
        .0
        .iter()
        .position(|(at, change)| *at <= now && change.traveler == entity)
    else {
        return;
    };
    let Some((_, change)) = pending.0.remove(index) else {
        return;
    };
    let Ok(mut traveler) = travelers.get_mut(entity) else {
        return;
    };

    match traveler.matched_vehicle {
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
            match interruption::change_dropoff(&plan, pos, entity, change.new_dropoff, &ctx) {
                Ok(repaired) => {
                    *plan = repaired;
                    traveler.dropoff_node = Some(change.new_dropoff);
                    // Detour baseline follows the destination.
                    let baseline_from = if traveler.state == TravelerState::InsideVehicle {
                        pos.node
                    } else {
                        traveler.pickup_node.unwrap_or(pos.node)
                    };
                    if let Ok(route) = ctx.route(baseline_from, change.new_dropoff) {
                        traveler.planned_distance_m = route.length_m;
                    }
                    outbox.push(InterruptionNotice {
                        at_ms: now,
                        traveler: entity,
                        vehicle: Some(vehicle_entity),
                        reason: InterruptionReason::DropoffChanged,
                    });
                }
                Err(_) => {
                    // No route to the new destination; keep the old one and
                    // surface it upstream.
                    outbox.push(InterruptionNotice {
                        at_ms: now,
                        traveler: entity,
                        vehicle: Some(vehicle_entity),
                        reason: InterruptionReason::RouteLost,
                    });
                }
            }
        }
        None => {
            // Unmatched: rewrite the open request in place.
            for (_, service) in registry.iter_mut() {
                if let Some(request) = service.take_request(entity) {
                    service.submit_request(Request {
                        dropoff: change.new_dropoff,
                        ..request
                    });
                    traveler.dropoff_node = Some(change.new_dropoff);
                    break;
                }
            }
        }
    }
}
