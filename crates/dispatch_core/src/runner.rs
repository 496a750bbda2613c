//! Simulation runner: advances the clock and routes events into the ECS.
//!
//! Clock progression and event routing happen here, outside systems. Each step
//! pops the next event from [SimulationClock], inserts it as [CurrentEvent],
//! then runs the schedule.

use bevy_ecs::prelude::{Res, Schedule, World};
use bevy_ecs::schedule::{apply_deferred, IntoSystemConfigs};

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock};
use crate::scenario::{
    PendingDropChanges, PendingNetworkChanges, PendingRequests, SimulationEndTimeMs,
};
use crate::systems::{
    dropoff_changed::dropoff_changed_system, network_changed::network_changed_system,
    request_cancelled::request_cancelled_system, request_submitted::request_submitted_system,
    step::step_system,
};

fn is_step(event: Option<Res<CurrentEvent>>) -> bool {
    event.map(|e| e.0.kind == EventKind::Step).unwrap_or(false)
}

fn is_request_submitted(event: Option<Res<CurrentEvent>>) -> bool {
    event
        .map(|e| e.0.kind == EventKind::RequestSubmitted)
        .unwrap_or(false)
}

fn is_request_cancelled(event: Option<Res<CurrentEvent>>) -> bool {
    event
        .map(|e| e.0.kind == EventKind::RequestCancelled)
        .unwrap_or(false)
}

fn is_network_changed(event: Option<Res<CurrentEvent>>) -> bool {
    event
        .map(|e| e.0.kind == EventKind::NetworkChanged)
        .unwrap_or(false)
}

fn is_dropoff_changed(event: Option<Res<CurrentEvent>>) -> bool {
    event
        .map(|e| e.0.kind == EventKind::DropoffChanged)
        .unwrap_or(false)
}

/// Runs one simulation step: pops the next event, inserts it as
/// [CurrentEvent], then runs the schedule. Returns `true` if an event was
/// processed, `false` if the clock was empty or the next event is at or past
/// [SimulationEndTimeMs] (when that resource is present).
pub fn run_next_event(world: &mut World, schedule: &mut Schedule) -> bool {
    let stop_at = world.get_resource::<SimulationEndTimeMs>().map(|e| e.0);
    let next_ts = world
        .get_resource::<SimulationClock>()
        .and_then(|c| c.next_event_time());
    if let (Some(end_ms), Some(ts)) = (stop_at, next_ts) {
        if ts >= end_ms {
            return false;
        }
    }

    let event = match world.resource_mut::<SimulationClock>().pop_next() {
        Some(e) => e,
        None => return false,
    };
    world.insert_resource(CurrentEvent(event));
    schedule.run(world);
    true
}

/// Runs simulation steps until the event queue is empty or `max_steps` is
/// reached. Returns the number of steps executed.
pub fn run_until_empty(world: &mut World, schedule: &mut Schedule, max_steps: usize) -> usize {
    let mut steps = 0;
    while steps < max_steps && run_next_event(world, schedule) {
        steps += 1;
    }
    steps
}

/// Builds the dispatch schedule: every event-reacting system gated on its
/// event kind, plus [apply_deferred] so inserted markers are visible before
/// the next event.
pub fn simulation_schedule() -> Schedule {
    let mut schedule = Schedule::default();
    schedule.add_systems((
        step_system.run_if(is_step),
        request_submitted_system.run_if(is_request_submitted),
        request_cancelled_system.run_if(is_request_cancelled),
        network_changed_system.run_if(is_network_changed),
        dropoff_changed_system.run_if(is_dropoff_changed),
        apply_deferred,
    ));
    schedule
}

/// Schedules the first dispatch step plus one event per pending timeline
/// entry. Call after building the scenario and before running events.
pub fn initialize_simulation(world: &mut World) {
    let request_events: Vec<_> = world
        .resource::<PendingRequests>()
        .0
        .iter()
        .map(|r| (r.submit_at_ms, r.traveler))
        .collect();
    let network_events: Vec<u64> = world
        .resource::<PendingNetworkChanges>()
        .0
        .iter()
        .map(|(at, _)| *at)
        .collect();
    let drop_events: Vec<_> = world
        .resource::<PendingDropChanges>()
        .0
        .iter()
        .map(|(at, change)| (*at, change.traveler))
        .collect();

    let mut clock = world.resource_mut::<SimulationClock>();
    clock.schedule_at(0, EventKind::Step, None);
    for (at, traveler) in request_events {
        clock.schedule_at(
            at,
            EventKind::RequestSubmitted,
            Some(EventSubject::Traveler(traveler)),
        );
    }
    for at in network_events {
        clock.schedule_at(at, EventKind::NetworkChanged, None);
    }
    for (at, traveler) in drop_events {
        clock.schedule_at(
            at,
            EventKind::DropoffChanged,
            Some(EventSubject::Traveler(traveler)),
        );
    }
}
