//! The dispatch step: vehicle movement, boarding, matching, estimation.
//!
//! One `Step` event advances every vehicle by its movement budget, applies
//! boardings and alightings from completed activities, runs the matching pass
//! of every service whose countdown fired, refreshes the zone wait board and
//! schedules the next step.

use std::collections::HashMap;

use bevy_ecs::prelude::{Entity, Query, Res, ResMut};
use h3o::CellIndex;

use crate::clock::{CurrentEvent, EventKind, SimulationClock};
use crate::ecs::{Traveler, TravelerState, Vehicle};
use crate::estimator::{WaitingTimeBoard, ZonePartition, ZoneSnapshot};
use crate::matching::{passes_filter, MatchContext, MatchProposal, OpenRequest, VehicleCandidate};
use crate::network::{LinkCosts, RoadNetwork};
use crate::plan::{Activity, ActivityPlan, VehiclePosition};
use crate::replan::CommittedRide;
use crate::routing::CostOracleResource;
use crate::scenario::{MatchRadius, StepConfig};
use crate::services::{CandidateFilter, ServiceId, ServiceRegistry};
use crate::telemetry::{CompletedRideRecord, SimTelemetry};

pub fn is_idle(plan: &ActivityPlan, pos: &VehiclePosition) -> bool {
    plan.is_empty() || plan.idle_node(pos).is_some()
}

#[allow(clippy::too_many_arguments)]
pub fn step_system(
    mut clock: ResMut<SimulationClock>,
    event: Res<CurrentEvent>,
    config: Res<StepConfig>,
    network: Res<RoadNetwork>,
    costs: Res<LinkCosts>,
    oracle: Res<CostOracleResource>,
    radius: Res<MatchRadius>,
    partition: Res<ZonePartition>,
    mut board: ResMut<WaitingTimeBoard>,
    mut registry: ResMut<ServiceRegistry>,
    mut telemetry: ResMut<SimTelemetry>,
    mut vehicles: Query<(Entity, &mut Vehicle, &mut ActivityPlan, &mut VehiclePosition)>,
    mut travelers: Query<&mut Traveler>,
) {
    if event.0.kind != EventKind::Step {
        return;
    }
    let now = clock.now();

    move_vehicles(
        now,
        &config,
        &network,
        &costs,
        &mut telemetry,
        &mut vehicles,
        &mut travelers,
    );
    retire_finished_line_vehicles(&mut registry, &vehicles);

    let commits = run_matching_passes(
        now,
        &network,
        &costs,
        &oracle,
        radius.0,
        partition.resolution,
        &mut registry,
        &vehicles,
        &travelers,
    );
    commit_proposals(
        now,
        &config,
        commits,
        &mut registry,
        &mut telemetry,
        &mut vehicles,
        &mut travelers,
    );

    refresh_wait_board(
        now,
        &network,
        &costs,
        &config,
        &partition,
        &mut board,
        &registry,
        &vehicles,
    );

    clock.schedule_in(config.dt_ms, EventKind::Step, None);
}

fn move_vehicles(
    now: u64,
    config: &StepConfig,
    network: &RoadNetwork,
    costs: &LinkCosts,
    telemetry: &mut SimTelemetry,
    vehicles: &mut Query<(Entity, &mut Vehicle, &mut ActivityPlan, &mut VehiclePosition)>,
    travelers: &mut Query<&mut Traveler>,
) {
    for (entity, mut vehicle, mut plan, mut pos) in vehicles.iter_mut() {
        let budget_ms = config.dt_ms + vehicle.carryover_ms;
        vehicle.carryover_ms = 0;
        let budget_m = config.vehicle_speed_mps * budget_ms as f64 / 1_000.0;
        let onboard_before = vehicle.onboard.clone();
        let advance = plan.advance(&mut pos, budget_m, network, costs);

        // Ride distance goes to whoever was onboard when the step began, and
        // must land before any serving completion snapshots it.
        if advance.moved_m > 0.0 {
            for &rider in &onboard_before {
                if let Ok(mut t) = travelers.get_mut(rider) {
                    t.traveled_m += advance.moved_m;
                    t.node = pos.node;
                }
            }
        }

        for done in advance.completed {
            match done {
                Activity::Pickup { traveler, node, .. } => {
                    vehicle.onboard.push(traveler);
                    if let Ok(mut t) = travelers.get_mut(traveler) {
                        t.state = TravelerState::InsideVehicle;
                        t.node = node;
                        t.pickup_at_ms = Some(now);
                    }
                }
                Activity::Serving { traveler, node, .. } => {
                    vehicle.onboard.retain(|e| *e != traveler);
                    if let Ok(mut t) = travelers.get_mut(traveler) {
                        t.state = TravelerState::Arrived;
                        t.node = node;
                        t.matched_vehicle = None;
                        telemetry.record_ride(CompletedRideRecord {
                            traveler,
                            vehicle: entity,
                            requested_at: t.requested_at_ms,
                            matched_at: t.matched_at_ms.unwrap_or(t.requested_at_ms),
                            pickup_at: t.pickup_at_ms.unwrap_or(now),
                            completed_at: now,
                            direct_m: t.planned_distance_m,
                            ridden_m: t.traveled_m,
                        });
                    }
                }
                _ => {}
            }
        }
    }
}

/// A transit vehicle that has served its whole line leaves the fleet.
fn retire_finished_line_vehicles(
    registry: &mut ServiceRegistry,
    vehicles: &Query<(Entity, &mut Vehicle, &mut ActivityPlan, &mut VehiclePosition)>,
) {
    let mut retired: Vec<(ServiceId, Entity)> = Vec::new();
    for (entity, vehicle, plan, _) in vehicles.iter() {
        let service = registry.get(vehicle.service);
        if service.line.is_some() && plan.is_empty() && service.fleet.contains(&entity) {
            retired.push((vehicle.service, entity));
        }
    }
    for (service, entity) in retired {
        registry.get_mut(service).retire_vehicle(entity);
    }
}

#[allow(clippy::too_many_arguments)]
fn run_matching_passes(
    now: u64,
    network: &RoadNetwork,
    costs: &LinkCosts,
    oracle: &CostOracleResource,
    radius: u32,
    zone_resolution: h3o::Resolution,
    registry: &mut ServiceRegistry,
    vehicles: &Query<(Entity, &mut Vehicle, &mut ActivityPlan, &mut VehiclePosition)>,
    travelers: &Query<&mut Traveler>,
) -> Vec<(ServiceId, MatchProposal)> {
    let mut commits = Vec::new();
    for (service_id, service) in registry.iter_mut() {
        if !service.tick_matching() || service.open_requests.is_empty() {
            continue;
        }

        let mut requests = Vec::new();
        for request in &service.open_requests {
            let Ok(t) = travelers.get(request.traveler) else {
                continue;
            };
            requests.push(OpenRequest {
                traveler: request.traveler,
                pickup: request.pickup,
                dropoff: request.dropoff,
                submitted_at_ms: request.submitted_at_ms,
                tolerance_ms: t.pickup_tolerance_ms,
                max_detour_ratio: t.max_detour_ratio,
            });
        }

        let idle_only = service.candidate_filter == CandidateFilter::IdleOnly;
        let mut candidates = Vec::new();
        for &vehicle_entity in &service.fleet {
            let Ok((_, vehicle, plan, pos)) = vehicles.get(vehicle_entity) else {
                continue;
            };
            let mut committed = Vec::new();
            for activity in plan.iter() {
                let Some(rider) = activity.bound_traveler() else {
                    continue;
                };
                if !activity.is_serving() {
                    continue;
                }
                if let Ok(t) = travelers.get(rider) {
                    committed.push(CommittedRide {
                        traveler: rider,
                        onboard: vehicle.onboard.contains(&rider),
                        traveled_m: t.traveled_m,
                        planned_m: t.planned_distance_m,
                        max_detour_ratio: t.max_detour_ratio,
                    });
                }
            }
            let candidate = VehicleCandidate {
                entity: vehicle_entity,
                fleet_index: vehicle.fleet_index,
                pos: *pos,
                plan: plan.clone(),
                capacity: vehicle.capacity,
                committed,
                idle: is_idle(plan, pos),
            };
            if passes_filter(&candidate, idle_only) {
                candidates.push(candidate);
            }
        }

        let ctx = MatchContext {
            now_ms: now,
            network,
            costs,
            layer: &service.layer,
            oracle: oracle.0.as_ref(),
            radius,
            zone_resolution,
            shared: service.shared,
        };
        for proposal in service.strategy.run(&requests, &candidates, &ctx) {
            commits.push((service_id, proposal));
        }
    }
    commits
}

fn commit_proposals(
    now: u64,
    config: &StepConfig,
    commits: Vec<(ServiceId, MatchProposal)>,
    registry: &mut ServiceRegistry,
    telemetry: &mut SimTelemetry,
    vehicles: &mut Query<(Entity, &mut Vehicle, &mut ActivityPlan, &mut VehiclePosition)>,
    travelers: &mut Query<&mut Traveler>,
) {
    for (service_id, proposal) in commits {
        let Ok((_, mut vehicle, mut plan, _)) = vehicles.get_mut(proposal.vehicle) else {
            continue;
        };
        let was_busy = !plan.is_empty();
        *plan = proposal.plan;
        if proposal.empty_approach {
            // The vehicle already stands at the pickup: credit the elapsed
            // wait so the matched step is not lost to the step grid.
            vehicle.carryover_ms = now.saturating_sub(proposal.submitted_at_ms).min(config.dt_ms);
        }
        if let Ok(mut t) = travelers.get_mut(proposal.traveler) {
            t.state = TravelerState::WaitingVehicle;
            t.matched_vehicle = Some(proposal.vehicle);
            t.matched_at_ms = Some(now);
            t.pickup_node = Some(proposal.pickup);
            t.dropoff_node = Some(proposal.dropoff);
            t.planned_distance_m = proposal.direct_m;
            t.traveled_m = 0.0;
        }
        let service = registry.get_mut(service_id);
        service.take_request(proposal.traveler);
        telemetry.counters.matches_committed += 1;
        if was_busy && service.shared {
            telemetry.counters.shared_insertions += 1;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn refresh_wait_board(
    now: u64,
    network: &RoadNetwork,
    costs: &LinkCosts,
    config: &StepConfig,
    partition: &ZonePartition,
    board: &mut WaitingTimeBoard,
    registry: &ServiceRegistry,
    vehicles: &Query<(Entity, &mut Vehicle, &mut ActivityPlan, &mut VehiclePosition)>,
) {
    let mut zones: HashMap<CellIndex, ZoneSnapshot> = HashMap::new();
    for (_, _, plan, pos) in vehicles.iter() {
        if is_idle(plan, pos) {
            zones
                .entry(network.cell(pos.node, partition.resolution))
                .or_default()
                .idle_vehicles += 1;
        }
    }
    for (_, service) in registry.iter() {
        for request in &service.open_requests {
            zones
                .entry(network.cell(request.pickup, partition.resolution))
                .or_default()
                .open_requests += 1;
        }
    }
    let mean_speed = costs
        .mean_speed_mps(network, (0..network.link_count() as u32).map(crate::network::LinkId))
        .unwrap_or(config.vehicle_speed_mps);
    board.refresh(now, zones, partition.detour_ratio, mean_speed);
}
