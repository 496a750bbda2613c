//! Request submission: hand a pending request to its service.
//!
//! Routability on the service's sub-graph is checked once here; a traveler
//! whose trip has no route at all goes straight to `Deadend` instead of
//! waiting forever in the buffer.

use bevy_ecs::prelude::{Query, Res, ResMut};

use crate::clock::{CurrentEvent, EventKind, EventSubject};
use crate::ecs::{Traveler, TravelerState};
use crate::network::{LinkCosts, RoadNetwork};
use crate::routing::CostOracleResource;
use crate::scenario::PendingRequests;
use crate::services::{Request, ServiceRegistry};
use crate::telemetry::SimTelemetry;

pub fn request_submitted_system(
    event: Res<CurrentEvent>,
    network: Res<RoadNetwork>,
    costs: Res<LinkCosts>,
    oracle: Res<CostOracleResource>,
    mut registry: ResMut<ServiceRegistry>,
    mut pending: ResMut<PendingRequests>,
    mut telemetry: ResMut<SimTelemetry>,
    mut travelers: Query<&mut Traveler>,
) {
    if event.0.kind != EventKind::RequestSubmitted {
        return;
    }
    let Some(EventSubject::Traveler(entity)) = event.0.subject else {
        return;
    };
    let Some(index) = pending.0.iter().position(|r| r.traveler == entity) else {
        return;
    };
    let Some(submitted) = pending.0.remove(index) else {
        return;
    };
    let now = event.0.timestamp;

    let service = registry.get_mut(submitted.service);
    let routable = oracle
        .0
        .shortest_path(
            &network,
            &costs,
            &service.layer,
            submitted.pickup,
            submitted.dropoff,
        )
        .is_ok();

    if let Ok(mut t) = travelers.get_mut(entity) {
        t.requested_at_ms = now;
        t.pickup_node = Some(submitted.pickup);
        t.dropoff_node = Some(submitted.dropoff);
        t.state = if routable {
            TravelerState::WaitingVehicle
        } else {
            TravelerState::Deadend
        };
    }

    if routable {
        service.submit_request(Request {
            traveler: entity,
            pickup: submitted.pickup,
            dropoff: submitted.dropoff,
            submitted_at_ms: now,
        });
        telemetry.counters.requests_submitted += 1;
    } else {
        telemetry.counters.requests_deadend += 1;
    }
}
