//! Network changes: apply link bans/restores and station withdrawals, then
//! repair every plan.
//!
//! All due edits are applied in one batch before any repair, and the cost
//! epoch is bumped once so cached routes under the old network are dropped.
//! Affected legs are rerouted in place; a leg with no remaining route
//! truncates the plan and the vehicle is flagged for redispatch. Open
//! requests stranded by the change leave their buffers so travelers do not
//! wait for a match that can never happen.

use bevy_ecs::prelude::{Commands, Entity, Query, Res, ResMut};

use crate::clock::{CurrentEvent, EventKind};
use crate::ecs::{NeedsRedispatch, Traveler, TravelerState, Vehicle};
use crate::interruption::{self, RepairOutcome};
use crate::network::{LinkCosts, RoadNetwork};
use crate::plan::{ActivityPlan, RouteCtx, VehiclePosition};
use crate::routing::CostOracleResource;
use crate::scenario::{NetworkChange, PendingNetworkChanges};
use crate::services::{Request, ServiceRegistry};
use crate::telemetry::{InterruptionNotice, InterruptionOutbox, InterruptionReason, SimTelemetry};

#[allow(clippy::too_many_arguments)]
pub fn network_changed_system(
    mut commands: Commands,
    event: Res<CurrentEvent>,
    mut network: ResMut<RoadNetwork>,
    mut costs: ResMut<LinkCosts>,
    oracle: Res<CostOracleResource>,
    mut registry: ResMut<ServiceRegistry>,
    mut pending: ResMut<PendingNetworkChanges>,
    mut telemetry: ResMut<SimTelemetry>,
    mut outbox: ResMut<InterruptionOutbox>,
    mut vehicles: Query<(Entity, &mut Vehicle, &mut ActivityPlan, &VehiclePosition)>,
    mut travelers: Query<(Entity, &mut Traveler)>,
) {
    if event.0.kind != EventKind::NetworkChanged {
        return;
    }
    let now = event.0.timestamp;

    let mut applied = false;
    while pending.0.front().is_some_and(|(at, _)| *at <= now) {
        if let Some((_, change)) = pending.0.pop_front() {
            match change {
                NetworkChange::Ban(link) => network.ban_link(link),
                NetworkChange::Restore(link) => network.restore_link(link),
                NetworkChange::WithdrawStation(node) => {
                    for link in network.incident_links(node) {
                        network.ban_link(link);
                    }
                    for (_, service) in registry.iter_mut() {
                        service.withdraw_station(node);
                    }
                }
            }
            applied = true;
        }
    }
    if !applied {
        return;
    }
    costs.bump_epoch();

    for (vehicle_entity, mut vehicle, mut plan, pos) in vehicles.iter_mut() {
        let layer = registry.get(vehicle.service).layer.clone();
        let ctx = RouteCtx {
            network: &network,
            costs: &costs,
            layer: &layer,
            oracle: oracle.0.as_ref(),
        };
        match interruption::repair_vehicle_plan(&mut plan, pos, &ctx) {
            RepairOutcome::Unaffected => {}
            RepairOutcome::Rerouted { legs } => {
                telemetry.counters.reroutes += legs;
            }
            RepairOutcome::Truncated { legs, dropped } => {
                telemetry.counters.reroutes += legs;
                telemetry.counters.truncations += 1;
                commands.entity(vehicle_entity).insert(NeedsRedispatch);

                let mut seen = Vec::new();
                for activity in &dropped {
                    let Some(rider) = activity.bound_traveler() else {
                        continue;
                    };
                    if seen.contains(&rider) {
                        continue;
                    }
                    seen.push(rider);

                    let was_onboard = vehicle.onboard.contains(&rider);
                    if was_onboard {
                        // Set down at the truncation point; upstream replans.
                        vehicle.onboard.retain(|e| *e != rider);
                    }
                    if let Ok((_, mut t)) = travelers.get_mut(rider) {
                        t.matched_vehicle = None;
                        if was_onboard {
                            t.state = TravelerState::Walking;
                            t.node = pos.node;
                        } else {
                            // Pickup never happened: the request reopens.
                            t.state = TravelerState::WaitingVehicle;
                            if let (Some(pickup), Some(dropoff)) = (t.pickup_node, t.dropoff_node)
                            {
                                registry.get_mut(vehicle.service).submit_request(Request {
                                    traveler: rider,
                                    pickup,
                                    dropoff,
                                    submitted_at_ms: t.requested_at_ms,
                                });
                            }
                        }
                    }
                    outbox.push(InterruptionNotice {
                        at_ms: now,
                        traveler: rider,
                        vehicle: Some(vehicle_entity),
                        reason: InterruptionReason::RouteLost,
                    });
                }

                // A pickup whose serving fell past the truncation point is
                // useless; splice it out too.
                for rider in seen {
                    if plan.position_of_traveler(rider).is_some() {
                        if let Ok(repaired) =
                            interruption::cancel_match(&plan, pos, rider, &ctx)
                        {
                            *plan = repaired;
                        }
                    }
                }
            }
        }
    }

    // Requests still sitting in a buffer can be stranded too: the trip lost
    // its route, or no fleet vehicle can reach the pickup anymore. Such a
    // request would stay open forever, so it leaves the buffer and the
    // traveler stops waiting.
    for (_, service) in registry.iter_mut() {
        let layer = service.layer.clone();
        let ctx = RouteCtx {
            network: &network,
            costs: &costs,
            layer: &layer,
            oracle: oracle.0.as_ref(),
        };
        let mut stranded = Vec::new();
        for request in &service.open_requests {
            let matchable = ctx.route(request.pickup, request.dropoff).is_ok()
                && service.fleet.iter().any(|&v| {
                    vehicles.get(v).is_ok_and(|(_, _, plan, pos)| {
                        ctx.route(plan.last_target(pos.node), request.pickup).is_ok()
                    })
                });
            if !matchable {
                stranded.push(request.traveler);
            }
        }
        for rider in stranded {
            service.take_request(rider);
            if let Ok((_, mut t)) = travelers.get_mut(rider) {
                t.state = TravelerState::Deadend;
                t.matched_vehicle = None;
            }
            telemetry.counters.requests_deadend += 1;
            outbox.push(InterruptionNotice {
                at_ms: now,
                traveler: rider,
                vehicle: None,
                reason: InterruptionReason::RouteLost,
            });
        }
    }

    // Walking travelers whose remaining walk uses a vanished link need a new
    // plan upstream.
    let walk_layer = crate::network::ServiceLayer::unrestricted();
    let ctx = RouteCtx {
        network: &network,
        costs: &costs,
        layer: &walk_layer,
        oracle: oracle.0.as_ref(),
    };
    for (entity, traveler) in travelers.iter() {
        if traveler.state == TravelerState::Walking
            && interruption::walk_path_affected(&traveler.walk_path, &ctx)
        {
            outbox.push(InterruptionNotice {
                at_ms: now,
                traveler: entity,
                vehicle: None,
                reason: InterruptionReason::RouteLost,
            });
        }
    }
}
