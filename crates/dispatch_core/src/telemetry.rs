//! Telemetry / KPIs: records completed rides and dispatch outcomes.

use bevy_ecs::prelude::{Entity, Resource};

/// One completed ride, recorded when the vehicle reaches the drop-off.
/// Timestamps are simulation ms; use the helper methods for derived KPIs.
#[derive(Debug, Clone)]
pub struct CompletedRideRecord {
    pub traveler: Entity,
    pub vehicle: Entity,
    pub requested_at: u64,
    pub matched_at: u64,
    pub pickup_at: u64,
    pub completed_at: u64,
    /// Direct pickup-to-dropoff distance at match time.
    pub direct_m: f64,
    /// Distance actually ridden.
    pub ridden_m: f64,
}

impl CompletedRideRecord {
    /// Time from submission to the committing matching pass.
    pub fn time_to_match(&self) -> u64 {
        self.matched_at.saturating_sub(self.requested_at)
    }

    /// Time from submission to boarding.
    pub fn waiting_time(&self) -> u64 {
        self.pickup_at.saturating_sub(self.requested_at)
    }

    /// Time spent riding.
    pub fn ride_duration(&self) -> u64 {
        self.completed_at.saturating_sub(self.pickup_at)
    }

    /// Ridden over direct distance; 1.0 = no detour.
    pub fn detour_factor(&self) -> f64 {
        if self.direct_m > 0.0 {
            self.ridden_m / self.direct_m
        } else {
            1.0
        }
    }
}

/// Aggregate dispatch counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchCounters {
    pub requests_submitted: usize,
    pub requests_cancelled: usize,
    pub requests_deadend: usize,
    pub matches_committed: usize,
    pub shared_insertions: usize,
    pub reroutes: usize,
    pub truncations: usize,
}

/// Collects simulation telemetry. Insert as a resource to record rides.
#[derive(Debug, Default, Resource)]
pub struct SimTelemetry {
    pub completed_rides: Vec<CompletedRideRecord>,
    pub counters: DispatchCounters,
}

impl SimTelemetry {
    pub fn record_ride(&mut self, record: CompletedRideRecord) {
        self.completed_rides.push(record);
    }
}

/// Why a traveler was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionReason {
    /// Their leg became unroutable after a network change.
    RouteLost,
    /// Their match was cancelled.
    MatchCancelled,
    /// Their destination changed while en route.
    DropoffChanged,
}

/// One traveler needing attention upstream (replanning, mode choice).
#[derive(Debug, Clone, Copy)]
pub struct InterruptionNotice {
    pub at_ms: u64,
    pub traveler: Entity,
    pub vehicle: Option<Entity>,
    pub reason: InterruptionReason,
}

/// Outbox of interruption notices; upstream layers drain it after each event.
#[derive(Debug, Default, Resource)]
pub struct InterruptionOutbox {
    pending: Vec<InterruptionNotice>,
}

impl InterruptionOutbox {
    pub fn push(&mut self, notice: InterruptionNotice) {
        self.pending.push(notice);
    }

    pub fn drain(&mut self) -> Vec<InterruptionNotice> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
