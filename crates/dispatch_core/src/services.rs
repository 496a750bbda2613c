//! Mobility services and their registry.
//!
//! A service owns its open-request buffer, its matching strategy and
//! countdown, its sub-graph layer, and its fleet (vehicle entities in
//! insertion order). The registry is an explicit resource owned by the
//! simulation; services are addressed by [`ServiceId`], never through
//! static state.

use std::collections::VecDeque;

use bevy_ecs::prelude::{Entity, Resource};

use crate::matching::MatchStrategy;
use crate::network::{NodeId, ServiceLayer};
use crate::plan::{ActivityPlan, PlanError, RouteCtx, VehiclePosition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub u32);

/// Candidate vehicle policy for a matching pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateFilter {
    /// Only idle vehicles are considered.
    IdleOnly,
    /// Any fleet vehicle within the match radius, busy or not.
    WithinRadius,
}

/// An open ride request, owned by the service buffer from submission until
/// matched or cancelled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Request {
    pub traveler: Entity,
    pub pickup: NodeId,
    pub dropoff: NodeId,
    pub submitted_at_ms: u64,
}

/// Matching countdown state, advanced once per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingState {
    Idle,
    Matching,
}

pub struct MobilityService {
    pub name: String,
    pub strategy: Box<dyn MatchStrategy>,
    /// Shared-ride services splice new legs into executing plans via the
    /// insertion engine; exclusive services append at the plan tail.
    pub shared: bool,
    pub candidate_filter: CandidateFilter,
    /// Steps between matching passes.
    pub dt_matching: u32,
    countdown: u32,
    state: MatchingState,
    pub layer: ServiceLayer,
    pub open_requests: VecDeque<Request>,
    pub fleet: Vec<Entity>,
    /// Ordered stop nodes of a public-transit line, when this service is one.
    pub line: Option<Vec<NodeId>>,
}

impl MobilityService {
    pub fn new(
        name: impl Into<String>,
        strategy: Box<dyn MatchStrategy>,
        shared: bool,
        candidate_filter: CandidateFilter,
        dt_matching: u32,
        layer: ServiceLayer,
    ) -> Self {
        Self {
            name: name.into(),
            strategy,
            shared,
            candidate_filter,
            dt_matching,
            countdown: 0,
            state: MatchingState::Idle,
            layer,
            open_requests: VecDeque::new(),
            fleet: Vec::new(),
            line: None,
        }
    }

    pub fn with_line(mut self, stops: Vec<NodeId>) -> Self {
        self.line = Some(stops);
        self
    }

    pub fn submit_request(&mut self, request: Request) {
        self.open_requests.push_back(request);
    }

    /// Remove and return the open request of `traveler`, atomically with the
    /// caller's plan commit or cancellation.
    pub fn take_request(&mut self, traveler: Entity) -> Option<Request> {
        let index = self
            .open_requests
            .iter()
            .position(|r| r.traveler == traveler)?;
        self.open_requests.remove(index)
    }

    /// Advance the matching countdown one step. Returns `true` when a
    /// matching pass must run now (countdown hit zero and was reset), so a
    /// pass runs every `dt_matching` steps.
    pub fn tick_matching(&mut self) -> bool {
        if self.countdown == 0 {
            self.countdown = self.dt_matching.saturating_sub(1);
            self.state = MatchingState::Matching;
            true
        } else {
            self.countdown -= 1;
            self.state = MatchingState::Idle;
            false
        }
    }

    pub fn matching_state(&self) -> MatchingState {
        self.state
    }

    /// Register a vehicle; the returned index is the matching tie-breaker.
    pub fn register_vehicle(&mut self, vehicle: Entity) -> usize {
        self.fleet.push(vehicle);
        self.fleet.len() - 1
    }

    pub fn retire_vehicle(&mut self, vehicle: Entity) {
        self.fleet.retain(|v| *v != vehicle);
    }

    /// Drop a withdrawn station from the line, if present.
    pub fn withdraw_station(&mut self, node: NodeId) {
        if let Some(line) = self.line.as_mut() {
            line.retain(|n| *n != node);
        }
    }
}

/// Departure plan for one transit vehicle: a repositioning leg per line
/// stop, in order, from the vehicle's spawn position. A stop equal to the
/// previous target is skipped so loops through it do not produce empty legs.
pub fn line_departure_plan(
    stops: &[NodeId],
    pos: &VehiclePosition,
    ctx: &RouteCtx<'_>,
) -> Result<ActivityPlan, PlanError> {
    let mut plan = ActivityPlan::new();
    for &stop in stops {
        if plan.last_target(pos.node) == stop {
            continue;
        }
        plan.reposition_to(stop, pos, ctx)?;
    }
    Ok(plan)
}

impl std::fmt::Debug for MobilityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MobilityService")
            .field("name", &self.name)
            .field("strategy", &self.strategy.name())
            .field("shared", &self.shared)
            .field("dt_matching", &self.dt_matching)
            .field("open_requests", &self.open_requests.len())
            .field("fleet", &self.fleet.len())
            .finish()
    }
}

/// All mobility services of the simulation, owned explicitly.
#[derive(Debug, Default, Resource)]
pub struct ServiceRegistry {
    services: Vec<MobilityService>,
}

impl ServiceRegistry {
    pub fn register(&mut self, service: MobilityService) -> ServiceId {
        let id = ServiceId(self.services.len() as u32);
        self.services.push(service);
        id
    }

    pub fn get(&self, id: ServiceId) -> &MobilityService {
        &self.services[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ServiceId) -> &mut MobilityService {
        &mut self.services[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ServiceId> {
        (0..self.services.len() as u32).map(ServiceId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ServiceId, &MobilityService)> {
        self.services
            .iter()
            .enumerate()
            .map(|(i, s)| (ServiceId(i as u32), s))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ServiceId, &mut MobilityService)> {
        self.services
            .iter_mut()
            .enumerate()
            .map(|(i, s)| (ServiceId(i as u32), s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::FifoMatching;
    use crate::network::LinkCosts;
    use crate::routing::DijkstraOracle;
    use crate::test_helpers::line_network;

    fn service(dt: u32) -> MobilityService {
        MobilityService::new(
            "taxi",
            Box::new(FifoMatching),
            false,
            CandidateFilter::IdleOnly,
            dt,
            ServiceLayer::unrestricted(),
        )
    }

    #[test]
    fn countdown_fires_every_dt_steps() {
        let mut svc = service(3);
        assert!(svc.tick_matching(), "first step matches immediately");
        assert_eq!(svc.matching_state(), MatchingState::Matching);
        assert!(!svc.tick_matching());
        assert!(!svc.tick_matching());
        assert_eq!(svc.matching_state(), MatchingState::Idle);
        assert!(svc.tick_matching(), "fires again after dt steps");
    }

    #[test]
    fn dt_one_matches_on_every_step() {
        let mut svc = service(1);
        assert!(svc.tick_matching());
        assert!(svc.tick_matching());
        assert!(svc.tick_matching());
    }

    #[test]
    fn take_request_removes_exactly_one() {
        let mut svc = service(1);
        let t1 = Entity::from_raw(1);
        let t2 = Entity::from_raw(2);
        svc.submit_request(Request {
            traveler: t1,
            pickup: NodeId(0),
            dropoff: NodeId(1),
            submitted_at_ms: 0,
        });
        svc.submit_request(Request {
            traveler: t2,
            pickup: NodeId(0),
            dropoff: NodeId(2),
            submitted_at_ms: 5,
        });

        let taken = svc.take_request(t1).expect("present");
        assert_eq!(taken.traveler, t1);
        assert_eq!(svc.open_requests.len(), 1);
        assert!(svc.take_request(t1).is_none());
    }

    #[test]
    fn withdrawn_station_leaves_the_line() {
        let mut svc = service(1).with_line(vec![NodeId(0), NodeId(2), NodeId(4)]);
        svc.withdraw_station(NodeId(2));
        assert_eq!(svc.line, Some(vec![NodeId(0), NodeId(4)]));
        // Withdrawing an unknown station is a no-op.
        svc.withdraw_station(NodeId(9));
        assert_eq!(svc.line, Some(vec![NodeId(0), NodeId(4)]));
    }

    #[test]
    fn departure_plan_chains_the_line_stops() {
        let net = line_network(5, 500.0);
        let costs = LinkCosts::uniform(&net, 10.0);
        let layer = ServiceLayer::unrestricted();
        let oracle = DijkstraOracle::default();
        let ctx = RouteCtx {
            network: &net,
            costs: &costs,
            layer: &layer,
            oracle: &oracle,
        };

        let pos = VehiclePosition::at_node(NodeId(0));
        let plan = line_departure_plan(&[NodeId(0), NodeId(2), NodeId(4)], &pos, &ctx)
            .expect("routable line");

        // The spawn stop yields no leg; the others route in order.
        assert_eq!(plan.len(), 2);
        assert!(plan.is_contiguous(&net, &pos));
        assert_eq!(plan.last_target(pos.node), NodeId(4));
        assert!((plan.remaining_m() - 2_000.0).abs() < 1e-9);
    }
}
