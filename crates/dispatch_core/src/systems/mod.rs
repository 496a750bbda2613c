//! Event-driven systems of the dispatch loop.

pub mod dropoff_changed;
pub mod network_changed;
pub mod request_cancelled;
pub mod request_submitted;
pub mod step;

#[cfg(test)]
mod tests {
    use bevy_ecs::prelude::Entity;

    use crate::clock::{EventKind, EventSubject, SimulationClock};
    use crate::ecs::{NeedsRedispatch, Traveler, TravelerState, Vehicle};
    use crate::network::{LinkCosts, LinkId, NodeId, RoadNetwork, ServiceLayer};
    use crate::plan::{ActivityPlan, RouteCtx, VehiclePosition};
    use crate::routing::CostOracleResource;
    use crate::runner::{initialize_simulation, run_until_empty, simulation_schedule};
    use crate::scenario::{
        DropChange, NetworkChange, PendingDropChanges, PendingNetworkChanges, PendingRequests,
        SimulationEndTimeMs, SubmittedRequest,
    };
    use crate::services::{line_departure_plan, ServiceId, ServiceRegistry};
    use crate::telemetry::{InterruptionOutbox, InterruptionReason, SimTelemetry};
    use crate::test_helpers::{
        create_test_world, line_network, register_fifo_service, spawn_traveler, spawn_vehicle,
    };

    /// 10 m links and 10 m/s: one link per step, so timings stay readable.
    fn world_on_line(nodes: usize) -> bevy_ecs::world::World {
        create_test_world(line_network(nodes, 10.0), 10.0)
    }

    fn submit(
        world: &mut bevy_ecs::world::World,
        traveler: Entity,
        service: ServiceId,
        pickup: NodeId,
        dropoff: NodeId,
        at_ms: u64,
    ) {
        world
            .resource_mut::<PendingRequests>()
            .0
            .push_back(SubmittedRequest {
                traveler,
                service,
                pickup,
                dropoff,
                submit_at_ms: at_ms,
            });
    }

    #[test]
    fn single_request_is_matched_picked_up_and_served() {
        let mut world = world_on_line(6);
        let service = register_fifo_service(&mut world, false);
        let vehicle = spawn_vehicle(&mut world, service, NodeId(0), 4);
        let traveler = spawn_traveler(&mut world, NodeId(2), 600_000, 3.0);
        submit(&mut world, traveler, service, NodeId(2), NodeId(5), 1_000);
        world.insert_resource(SimulationEndTimeMs(60_000));

        initialize_simulation(&mut world);
        let mut schedule = simulation_schedule();
        run_until_empty(&mut world, &mut schedule, 1_000);

        let t = world.get::<Traveler>(traveler).expect("traveler");
        assert_eq!(t.state, TravelerState::Arrived);
        assert_eq!(t.node, NodeId(5));
        assert_eq!(t.matched_vehicle, None);

        let telemetry = world.resource::<SimTelemetry>();
        assert_eq!(telemetry.counters.requests_submitted, 1);
        assert_eq!(telemetry.counters.matches_committed, 1);
        assert_eq!(telemetry.completed_rides.len(), 1);
        let record = &telemetry.completed_rides[0];
        assert_eq!(record.traveler, traveler);
        assert_eq!(record.vehicle, vehicle);
        assert!(record.waiting_time() <= 600_000);
        // Straight line, exclusive ride: no detour.
        assert!((record.detour_factor() - 1.0).abs() < 0.05);

        let v = world.get::<Vehicle>(vehicle).expect("vehicle");
        assert!(v.onboard.is_empty());
    }

    #[test]
    fn zero_tolerance_request_stays_open() {
        let mut world = world_on_line(6);
        let service = register_fifo_service(&mut world, false);
        spawn_vehicle(&mut world, service, NodeId(0), 4);
        let traveler = spawn_traveler(&mut world, NodeId(4), 0, 3.0);
        submit(&mut world, traveler, service, NodeId(4), NodeId(5), 1_000);
        world.insert_resource(SimulationEndTimeMs(10_000));

        initialize_simulation(&mut world);
        let mut schedule = simulation_schedule();
        run_until_empty(&mut world, &mut schedule, 1_000);

        let t = world.get::<Traveler>(traveler).expect("traveler");
        assert_eq!(t.state, TravelerState::WaitingVehicle);

        let telemetry = world.resource::<SimTelemetry>();
        assert_eq!(telemetry.counters.matches_committed, 0);
        assert!(telemetry.completed_rides.is_empty());
        let registry = world.resource::<ServiceRegistry>();
        assert_eq!(registry.get(service).open_requests.len(), 1);
    }

    #[test]
    fn unroutable_trip_is_a_deadend_at_submission() {
        let mut world = world_on_line(6);
        let service = register_fifo_service(&mut world, false);
        spawn_vehicle(&mut world, service, NodeId(0), 4);
        let traveler = spawn_traveler(&mut world, NodeId(2), 600_000, 3.0);
        submit(&mut world, traveler, service, NodeId(2), NodeId(5), 1_000);
        // Sever the line between 3 and 4 before the request arrives.
        world
            .resource_mut::<PendingNetworkChanges>()
            .0
            .push_back((500, NetworkChange::Ban(LinkId(6))));
        world.insert_resource(SimulationEndTimeMs(10_000));

        initialize_simulation(&mut world);
        let mut schedule = simulation_schedule();
        run_until_empty(&mut world, &mut schedule, 1_000);

        let t = world.get::<Traveler>(traveler).expect("traveler");
        assert_eq!(t.state, TravelerState::Deadend);
        let telemetry = world.resource::<SimTelemetry>();
        assert_eq!(telemetry.counters.requests_deadend, 1);
        assert_eq!(telemetry.counters.requests_submitted, 0);
    }

    #[test]
    fn mid_ride_ban_truncates_and_flags_the_vehicle() {
        let mut world = world_on_line(6);
        let service = register_fifo_service(&mut world, false);
        let vehicle = spawn_vehicle(&mut world, service, NodeId(0), 4);
        let traveler = spawn_traveler(&mut world, NodeId(2), 600_000, 3.0);
        submit(&mut world, traveler, service, NodeId(2), NodeId(5), 1_000);
        // The ban lands after the match but before the vehicle passes 3 -> 4.
        world
            .resource_mut::<PendingNetworkChanges>()
            .0
            .push_back((3_000, NetworkChange::Ban(LinkId(6))));
        world.insert_resource(SimulationEndTimeMs(8_000));

        initialize_simulation(&mut world);
        let mut schedule = simulation_schedule();
        run_until_empty(&mut world, &mut schedule, 1_000);

        assert!(world.get::<NeedsRedispatch>(vehicle).is_some());
        let telemetry = world.resource::<SimTelemetry>();
        assert_eq!(telemetry.counters.truncations, 1);
        assert!(telemetry.completed_rides.is_empty());

        let outbox = world.resource::<InterruptionOutbox>();
        assert!(!outbox.is_empty());

        // Nothing left pointing at the severed destination.
        let plan = world.get::<ActivityPlan>(vehicle).expect("plan");
        assert!(plan.position_of_serving(traveler).is_none());
    }

    #[test]
    fn shared_vehicle_never_exceeds_capacity() {
        let mut world = world_on_line(6);
        let service = register_fifo_service(&mut world, true);
        let vehicle = spawn_vehicle(&mut world, service, NodeId(0), 2);
        let travelers: Vec<Entity> = (0..3)
            .map(|_| spawn_traveler(&mut world, NodeId(1), 600_000, 4.0))
            .collect();
        for &t in &travelers {
            submit(&mut world, t, service, NodeId(1), NodeId(5), 1_000);
        }
        // Stop before any drop-off so the rejection is observable.
        world.insert_resource(SimulationEndTimeMs(3_500));

        initialize_simulation(&mut world);
        let mut schedule = simulation_schedule();
        run_until_empty(&mut world, &mut schedule, 1_000);

        let telemetry = world.resource::<SimTelemetry>();
        assert_eq!(telemetry.counters.matches_committed, 2);
        let registry = world.resource::<ServiceRegistry>();
        assert_eq!(registry.get(service).open_requests.len(), 1);

        let plan = world.get::<ActivityPlan>(vehicle).expect("plan");
        let v = world.get::<Vehicle>(vehicle).expect("vehicle");
        assert!(v.onboard_count() + plan.pending_pickups() <= v.capacity);
    }

    #[test]
    fn ban_drops_an_open_request_with_no_reachable_vehicle() {
        let mut world = world_on_line(6);
        let service = register_fifo_service(&mut world, false);
        spawn_vehicle(&mut world, service, NodeId(0), 4);
        // Zero tolerance keeps the request open past every matching pass.
        let traveler = spawn_traveler(&mut world, NodeId(4), 0, 3.0);
        submit(&mut world, traveler, service, NodeId(4), NodeId(5), 1_000);
        // Cutting 3 -> 4 strands the pickup; the trip itself stays routable.
        world
            .resource_mut::<PendingNetworkChanges>()
            .0
            .push_back((2_500, NetworkChange::Ban(LinkId(6))));
        world.insert_resource(SimulationEndTimeMs(120_000));

        initialize_simulation(&mut world);
        let mut schedule = simulation_schedule();
        run_until_empty(&mut world, &mut schedule, 1_000);

        let registry = world.resource::<ServiceRegistry>();
        assert!(registry.get(service).open_requests.is_empty());
        let t = world.get::<Traveler>(traveler).expect("traveler");
        assert_eq!(t.state, TravelerState::Deadend);
        assert_eq!(t.matched_vehicle, None);

        let telemetry = world.resource::<SimTelemetry>();
        assert_eq!(telemetry.counters.requests_deadend, 1);
        let drained = world.resource_mut::<InterruptionOutbox>().drain();
        assert!(drained
            .iter()
            .any(|n| n.reason == InterruptionReason::RouteLost && n.traveler == traveler));
    }

    #[test]
    fn station_withdrawal_bans_its_links_and_updates_lines() {
        let mut world = world_on_line(6);
        let service = register_fifo_service(&mut world, false);
        world.resource_mut::<ServiceRegistry>().get_mut(service).line =
            Some(vec![NodeId(0), NodeId(2), NodeId(4)]);
        world
            .resource_mut::<PendingNetworkChanges>()
            .0
            .push_back((2_000, NetworkChange::WithdrawStation(NodeId(2))));
        world.insert_resource(SimulationEndTimeMs(5_000));

        initialize_simulation(&mut world);
        let mut schedule = simulation_schedule();
        run_until_empty(&mut world, &mut schedule, 1_000);

        let net = world.resource::<RoadNetwork>();
        // Every link touching node 2 is gone, in both directions.
        for link in [LinkId(2), LinkId(3), LinkId(4), LinkId(5)] {
            assert!(net.is_banned(link));
        }
        let registry = world.resource::<ServiceRegistry>();
        assert_eq!(
            registry.get(service).line,
            Some(vec![NodeId(0), NodeId(4)])
        );
    }

    #[test]
    fn idle_vehicle_at_the_pickup_gets_the_waited_step_credited() {
        let mut world = world_on_line(6);
        let service = register_fifo_service(&mut world, false);
        spawn_vehicle(&mut world, service, NodeId(2), 4);
        let traveler = spawn_traveler(&mut world, NodeId(2), 600_000, 3.0);
        submit(&mut world, traveler, service, NodeId(2), NodeId(5), 1_000);
        world.insert_resource(SimulationEndTimeMs(10_000));

        initialize_simulation(&mut world);
        let mut schedule = simulation_schedule();
        run_until_empty(&mut world, &mut schedule, 1_000);

        let telemetry = world.resource::<SimTelemetry>();
        assert_eq!(telemetry.completed_rides.len(), 1);
        let record = &telemetry.completed_rides[0];
        assert_eq!(record.matched_at, 2_000);
        assert_eq!(record.pickup_at, 3_000);
        // 30 m of serving leg in two steps: the waited step's budget is
        // credited, so the ride finishes at 4 s instead of 5 s.
        assert_eq!(record.completed_at, 4_000);

        let t = world.get::<Traveler>(traveler).expect("traveler");
        assert_eq!(t.state, TravelerState::Arrived);
        assert_eq!(t.node, NodeId(5));
    }

    #[test]
    fn line_vehicle_is_retired_at_the_terminus() {
        let mut world = world_on_line(4);
        let service = register_fifo_service(&mut world, false);
        let vehicle = spawn_vehicle(&mut world, service, NodeId(0), 4);
        world.resource_mut::<ServiceRegistry>().get_mut(service).line =
            Some(vec![NodeId(0), NodeId(3)]);

        let departure = {
            let net = world.resource::<RoadNetwork>();
            let costs = world.resource::<LinkCosts>();
            let oracle = world.resource::<CostOracleResource>();
            let layer = ServiceLayer::unrestricted();
            let ctx = RouteCtx {
                network: net,
                costs,
                layer: &layer,
                oracle: oracle.0.as_ref(),
            };
            line_departure_plan(
                &[NodeId(0), NodeId(3)],
                &VehiclePosition::at_node(NodeId(0)),
                &ctx,
            )
            .expect("routable line")
        };
        *world.get_mut::<ActivityPlan>(vehicle).expect("plan") = departure;
        world.insert_resource(SimulationEndTimeMs(6_000));

        initialize_simulation(&mut world);
        let mut schedule = simulation_schedule();
        run_until_empty(&mut world, &mut schedule, 1_000);

        let pos = world.get::<VehiclePosition>(vehicle).expect("position");
        assert_eq!(pos.node, NodeId(3));
        assert!(world.get::<ActivityPlan>(vehicle).expect("plan").is_empty());
        let registry = world.resource::<ServiceRegistry>();
        assert!(registry.get(service).fleet.is_empty());
    }

    #[test]
    fn cancellation_unwinds_a_committed_match() {
        let mut world = world_on_line(6);
        let service = register_fifo_service(&mut world, false);
        let vehicle = spawn_vehicle(&mut world, service, NodeId(0), 4);
        let traveler = spawn_traveler(&mut world, NodeId(3), 600_000, 3.0);
        submit(&mut world, traveler, service, NodeId(3), NodeId(5), 1_000);
        world.insert_resource(SimulationEndTimeMs(10_000));

        initialize_simulation(&mut world);
        // Cancel shortly after the matching pass, before pickup.
        world.resource_mut::<SimulationClock>().schedule_at(
            2_500,
            EventKind::RequestCancelled,
            Some(EventSubject::Traveler(traveler)),
        );
        let mut schedule = simulation_schedule();
        run_until_empty(&mut world, &mut schedule, 1_000);

        let t = world.get::<Traveler>(traveler).expect("traveler");
        assert_eq!(t.state, TravelerState::Walking);
        assert_eq!(t.matched_vehicle, None);

        let telemetry = world.resource::<SimTelemetry>();
        assert_eq!(telemetry.counters.requests_cancelled, 1);
        assert!(telemetry.completed_rides.is_empty());

        let plan = world.get::<ActivityPlan>(vehicle).expect("plan");
        assert!(plan.position_of_traveler(traveler).is_none());

        let drained = world.resource_mut::<InterruptionOutbox>().drain();
        assert!(drained
            .iter()
            .any(|n| n.reason == InterruptionReason::MatchCancelled && n.traveler == traveler));
    }

    #[test]
    fn dropoff_change_retargets_the_serving_leg() {
        let mut world = world_on_line(6);
        let service = register_fifo_service(&mut world, false);
        spawn_vehicle(&mut world, service, NodeId(0), 4);
        let traveler = spawn_traveler(&mut world, NodeId(2), 600_000, 3.0);
        submit(&mut world, traveler, service, NodeId(2), NodeId(5), 1_000);
        world
            .resource_mut::<PendingDropChanges>()
            .0
            .push_back((3_000, DropChange {
                traveler,
                new_dropoff: NodeId(3),
            }));
        world.insert_resource(SimulationEndTimeMs(30_000));

        initialize_simulation(&mut world);
        let mut schedule = simulation_schedule();
        run_until_empty(&mut world, &mut schedule, 1_000);

        let t = world.get::<Traveler>(traveler).expect("traveler");
        assert_eq!(t.state, TravelerState::Arrived);
        assert_eq!(t.node, NodeId(3));
        assert_eq!(t.dropoff_node, Some(NodeId(3)));

        let drained = world.resource_mut::<InterruptionOutbox>().drain();
        assert!(drained
            .iter()
            .any(|n| n.reason == InterruptionReason::DropoffChanged && n.traveler == traveler));
    }
}
