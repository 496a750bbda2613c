//! Shared test setup: canned networks, worlds and agents.

use bevy_ecs::prelude::{Entity, World};
use h3o::{LatLng, Resolution};

use crate::clock::SimulationClock;
use crate::ecs::{Traveler, Vehicle};
use crate::estimator::{WaitingTimeBoard, ZonePartition};
use crate::network::{LinkCosts, NodeId, RoadNetwork, ServiceLayer};
use crate::plan::{ActivityPlan, VehiclePosition};
use crate::routing::CostOracleResource;
use crate::scenario::{
    MatchRadius, PendingDropChanges, PendingNetworkChanges, PendingRequests, StepConfig,
};
use crate::services::{CandidateFilter, MobilityService, ServiceId, ServiceRegistry};
use crate::telemetry::{InterruptionOutbox, SimTelemetry};

const BASE_LAT: f64 = 52.50;
const BASE_LNG: f64 = 13.40;
const METERS_PER_DEG_LAT: f64 = 111_320.0;

/// A straight chain of `nodes` nodes, `spacing_m` apart, with a forward and a
/// backward link between each pair. The forward link from node `i` to `i + 1`
/// is `LinkId(2 * i)`, the backward one `LinkId(2 * i + 1)`.
pub fn line_network(nodes: usize, spacing_m: f64) -> RoadNetwork {
    let mut net = RoadNetwork::new();
    for i in 0..nodes {
        let lat = BASE_LAT + i as f64 * spacing_m / METERS_PER_DEG_LAT;
        let ll = LatLng::new(lat, BASE_LNG).expect("valid test coordinates");
        net.add_node(ll);
    }
    for i in 0..nodes.saturating_sub(1) {
        net.add_link(NodeId(i as u32), NodeId(i as u32 + 1), spacing_m);
        net.add_link(NodeId(i as u32 + 1), NodeId(i as u32), spacing_m);
    }
    net
}

/// A world carrying every resource the dispatch schedule expects, over the
/// given network with uniform link speeds.
pub fn create_test_world(network: RoadNetwork, speed_mps: f64) -> World {
    let costs = LinkCosts::uniform(&network, speed_mps);
    let mut world = World::new();
    world.insert_resource(SimulationClock::default());
    world.insert_resource(network);
    world.insert_resource(costs);
    world.insert_resource(CostOracleResource::dijkstra());
    world.insert_resource(ServiceRegistry::default());
    world.insert_resource(StepConfig {
        dt_ms: 1_000,
        vehicle_speed_mps: speed_mps,
    });
    world.insert_resource(MatchRadius(1_000));
    world.insert_resource(ZonePartition::new(Resolution::Five, 1.4));
    world.insert_resource(WaitingTimeBoard::default());
    world.insert_resource(SimTelemetry::default());
    world.insert_resource(InterruptionOutbox::default());
    world.insert_resource(PendingRequests::default());
    world.insert_resource(PendingNetworkChanges::default());
    world.insert_resource(PendingDropChanges::default());
    world
}

/// Register a FIFO service on the whole network, matching every step.
pub fn register_fifo_service(world: &mut World, shared: bool) -> ServiceId {
    let service = MobilityService::new(
        if shared { "drt" } else { "taxi" },
        Box::new(crate::matching::FifoMatching),
        shared,
        if shared {
            CandidateFilter::WithinRadius
        } else {
            CandidateFilter::IdleOnly
        },
        1,
        ServiceLayer::unrestricted(),
    );
    world.resource_mut::<ServiceRegistry>().register(service)
}

/// Spawn an idle vehicle at `node` and register it in the service's fleet.
pub fn spawn_vehicle(
    world: &mut World,
    service: ServiceId,
    node: NodeId,
    capacity: usize,
) -> Entity {
    let entity = world
        .spawn((
            Vehicle::new(service, 0, capacity),
            ActivityPlan::new(),
            VehiclePosition::at_node(node),
        ))
        .id();
    let fleet_index = world
        .resource_mut::<ServiceRegistry>()
        .get_mut(service)
        .register_vehicle(entity);
    world
        .get_mut::<Vehicle>(entity)
        .expect("just spawned")
        .fleet_index = fleet_index;
    entity
}

/// Spawn a traveler standing at `node`.
pub fn spawn_traveler(
    world: &mut World,
    node: NodeId,
    pickup_tolerance_ms: u64,
    max_detour_ratio: f64,
) -> Entity {
    world
        .spawn(Traveler::new(node, pickup_tolerance_ms, max_detour_ratio))
        .id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LinkId;

    #[test]
    fn line_network_link_numbering_is_stable() {
        let net = line_network(4, 500.0);
        assert_eq!(net.node_count(), 4);
        assert_eq!(net.link_count(), 6);
        // Forward link between 1 and 2.
        let forward = net.link(LinkId(2));
        assert_eq!((forward.from, forward.to), (NodeId(1), NodeId(2)));
        let backward = net.link(LinkId(3));
        assert_eq!((backward.from, backward.to), (NodeId(2), NodeId(1)));
        assert!((forward.length_m - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_world_carries_the_dispatch_resources() {
        let mut world = create_test_world(line_network(3, 500.0), 10.0);
        let service = register_fifo_service(&mut world, false);
        let vehicle = spawn_vehicle(&mut world, service, NodeId(0), 4);

        assert_eq!(world.resource::<ServiceRegistry>().len(), 1);
        assert_eq!(
            world.resource::<ServiceRegistry>().get(service).fleet,
            vec![vehicle]
        );
        assert_eq!(world.get::<Vehicle>(vehicle).map(|v| v.fleet_index), Some(0));
    }
}
