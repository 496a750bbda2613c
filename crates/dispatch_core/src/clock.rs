use std::cmp::Ordering;
use std::collections::BinaryHeap;

use bevy_ecs::prelude::{Entity, Resource};

pub const ONE_SEC_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    /// Fixed-increment dispatch step: move vehicles, tick matching.
    Step,
    RequestSubmitted,
    RequestCancelled,
    NetworkChanged,
    DropoffChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSubject {
    Traveler(Entity),
    Vehicle(Entity),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub timestamp: u64,
    pub kind: EventKind,
    pub subject: Option<EventSubject>,
}

#[derive(Debug, Clone, Copy)]
struct ScheduledEvent {
    event: Event,
    /// Insertion order; keeps equal-timestamp pops deterministic.
    seq: u64,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledEvent {}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering to make BinaryHeap a min-heap by timestamp.
        other
            .event
            .timestamp
            .cmp(&self.event.timestamp)
            .then_with(|| other.event.kind.cmp(&self.event.kind))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The event currently being dispatched into the schedule.
#[derive(Debug, Clone, Copy, Resource)]
pub struct CurrentEvent(pub Event);

#[derive(Debug, Default, Resource)]
pub struct SimulationClock {
    now: u64,
    next_seq: u64,
    events: BinaryHeap<ScheduledEvent>,
}

impl SimulationClock {
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn schedule_at(&mut self, timestamp: u64, kind: EventKind, subject: Option<EventSubject>) {
        debug_assert!(
            timestamp >= self.now,
            "event timestamp must be >= current time"
        );
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push(ScheduledEvent {
            event: Event {
                timestamp,
                kind,
                subject,
            },
            seq,
        });
    }

    pub fn schedule_in(&mut self, delta_ms: u64, kind: EventKind, subject: Option<EventSubject>) {
        self.schedule_at(self.now + delta_ms, kind, subject);
    }

    pub fn schedule_at_secs(&mut self, secs: u64, kind: EventKind, subject: Option<EventSubject>) {
        self.schedule_at(secs * ONE_SEC_MS, kind, subject);
    }

    pub fn schedule_in_secs(&mut self, secs: u64, kind: EventKind, subject: Option<EventSubject>) {
        self.schedule_in(secs * ONE_SEC_MS, kind, subject);
    }

    pub fn next_event_time(&self) -> Option<u64> {
        self.events.peek().map(|s| s.event.timestamp)
    }

    pub fn pop_next(&mut self) -> Option<Event> {
        let scheduled = self.events.pop()?;
        self.now = scheduled.event.timestamp;
        Some(scheduled.event)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_pops_events_in_time_order() {
        let mut clock = SimulationClock::default();
        clock.schedule_at(10, EventKind::Step, None);
        clock.schedule_at(5, EventKind::RequestSubmitted, None);
        clock.schedule_at(20, EventKind::Step, None);

        let first = clock.pop_next().expect("first event");
        assert_eq!(first.timestamp, 5);
        assert_eq!(clock.now(), 5);

        let second = clock.pop_next().expect("second event");
        assert_eq!(second.timestamp, 10);
        assert_eq!(clock.now(), 10);

        let third = clock.pop_next().expect("third event");
        assert_eq!(third.timestamp, 20);
        assert_eq!(clock.now(), 20);

        assert!(clock.pop_next().is_none());
        assert!(clock.is_empty());
    }

    #[test]
    fn equal_timestamps_pop_in_insertion_order() {
        let mut clock = SimulationClock::default();
        let a = Entity::from_raw(1);
        let b = Entity::from_raw(2);
        clock.schedule_at(7, EventKind::RequestSubmitted, Some(EventSubject::Traveler(a)));
        clock.schedule_at(7, EventKind::RequestSubmitted, Some(EventSubject::Traveler(b)));

        let first = clock.pop_next().expect("first event");
        let second = clock.pop_next().expect("second event");
        assert_eq!(first.subject, Some(EventSubject::Traveler(a)));
        assert_eq!(second.subject, Some(EventSubject::Traveler(b)));
    }

    #[test]
    fn schedule_in_is_relative_to_now() {
        let mut clock = SimulationClock::default();
        clock.schedule_at(100, EventKind::Step, None);
        clock.pop_next().expect("event");
        clock.schedule_in(50, EventKind::Step, None);
        assert_eq!(clock.next_event_time(), Some(150));
    }

    #[test]
    fn second_granular_scheduling_converts_to_ms() {
        let mut clock = SimulationClock::default();
        clock.schedule_at_secs(3, EventKind::Step, None);
        assert_eq!(clock.next_event_time(), Some(3_000));
        clock.pop_next().expect("event");
        clock.schedule_in_secs(2, EventKind::Step, None);
        assert_eq!(clock.next_event_time(), Some(5_000));
    }
}
