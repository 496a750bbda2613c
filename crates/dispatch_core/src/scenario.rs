//! Scenario setup: step cadence, pending timeline inputs and service specs.

use std::collections::VecDeque;
use std::fmt;

use bevy_ecs::prelude::{Entity, Resource};
use serde::{Deserialize, Serialize};

use crate::matching::{BatchMatching, FifoMatching, MatchStrategy};
use crate::network::{LinkId, NodeId, ServiceLayer};
use crate::services::{CandidateFilter, MobilityService};

/// Dispatch step cadence and the per-step movement budget speed.
#[derive(Debug, Clone, Copy, Resource)]
pub struct StepConfig {
    pub dt_ms: u64,
    /// Upper bound on per-step travel; actual timing follows link costs.
    pub vehicle_speed_mps: f64,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            dt_ms: 1_000,
            vehicle_speed_mps: 10.0,
        }
    }
}

impl StepConfig {
    /// Meters a vehicle may cover in one step.
    pub fn step_budget_m(&self) -> f64 {
        self.vehicle_speed_mps * self.dt_ms as f64 / 1_000.0
    }
}

/// Max H3 grid distance (cells) for matching traveler to vehicle. 0 = same cell only.
#[derive(Debug, Clone, Copy, Default, Resource)]
pub struct MatchRadius(pub u32);

/// Simulation end time in milliseconds. When set, the runner stops processing
/// events once the next event would be at or after this timestamp.
#[derive(Debug, Clone, Copy, Resource)]
pub struct SimulationEndTimeMs(pub u64);

/// One request waiting for its submission event to fire.
#[derive(Debug, Clone, Copy)]
pub struct SubmittedRequest {
    pub traveler: Entity,
    pub service: crate::services::ServiceId,
    pub pickup: NodeId,
    pub dropoff: NodeId,
    pub submit_at_ms: u64,
}

/// Queue of requests to hand to their service at submission time (FIFO).
#[derive(Debug, Clone, Default, Resource)]
pub struct PendingRequests(pub VecDeque<SubmittedRequest>);

/// A scheduled edit of the road network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkChange {
    Ban(LinkId),
    Restore(LinkId),
    /// Remove a station: every link touching the node is banned and the node
    /// leaves all transit lines.
    WithdrawStation(NodeId),
}

/// Network edits keyed by their effective time.
#[derive(Debug, Clone, Default, Resource)]
pub struct PendingNetworkChanges(pub VecDeque<(u64, NetworkChange)>);

/// A destination change for a matched or riding traveler.
#[derive(Debug, Clone, Copy)]
pub struct DropChange {
    pub traveler: Entity,
    pub new_dropoff: NodeId,
}

/// Drop-off changes keyed by their effective time.
#[derive(Debug, Clone, Default, Resource)]
pub struct PendingDropChanges(pub VecDeque<(u64, DropChange)>);

/// Declarative description of one mobility service, as loaded from scenario
/// files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// `"fifo"` or `"batch"`.
    pub strategy: String,
    #[serde(default)]
    pub shared: bool,
    /// Consider busy vehicles for insertion; otherwise idle only.
    #[serde(default)]
    pub match_busy_vehicles: bool,
    /// Matching passes run every this many steps.
    #[serde(default = "default_dt_matching")]
    pub dt_matching: u32,
    /// Links this service may use; empty = whole network.
    #[serde(default)]
    pub allowed_links: Vec<u32>,
}

fn default_dt_matching() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioError {
    UnknownStrategy(String),
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioError::UnknownStrategy(name) => {
                write!(f, "unknown matching strategy '{name}' (expected fifo or batch)")
            }
        }
    }
}

impl std::error::Error for ScenarioError {}

/// Resolve a strategy name once at startup; unknown names are fatal here
/// rather than at dispatch time.
pub fn strategy_from_name(name: &str) -> Result<Box<dyn MatchStrategy>, ScenarioError> {
    match name {
        "fifo" => Ok(Box::new(FifoMatching)),
        "batch" => Ok(Box::new(BatchMatching)),
        other => Err(ScenarioError::UnknownStrategy(other.to_string())),
    }
}

/// Build a service from its spec.
pub fn build_service(spec: &ServiceSpec) -> Result<MobilityService, ScenarioError> {
    let strategy = strategy_from_name(&spec.strategy)?;
    let filter = if spec.match_busy_vehicles {
        CandidateFilter::WithinRadius
    } else {
        CandidateFilter::IdleOnly
    };
    let layer = if spec.allowed_links.is_empty() {
        ServiceLayer::unrestricted()
    } else {
        ServiceLayer::restricted_to(spec.allowed_links.iter().map(|&l| LinkId(l)))
    };
    Ok(MobilityService::new(
        spec.name.clone(),
        strategy,
        spec.shared,
        filter,
        spec.dt_matching.max(1),
        layer,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_strategy_is_a_startup_error() {
        let spec = ServiceSpec {
            name: "drt".into(),
            strategy: "greedy".into(),
            shared: true,
            match_busy_vehicles: true,
            dt_matching: 5,
            allowed_links: Vec::new(),
        };
        let err = build_service(&spec).expect_err("must fail");
        assert_eq!(err, ScenarioError::UnknownStrategy("greedy".into()));
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let spec: ServiceSpec =
            serde_json::from_str(r#"{"name": "taxi", "strategy": "fifo"}"#).expect("parse");
        assert!(!spec.shared);
        assert!(!spec.match_busy_vehicles);
        assert_eq!(spec.dt_matching, 1);
        assert!(spec.allowed_links.is_empty());

        let service = build_service(&spec).expect("build");
        assert_eq!(service.name, "taxi");
    }

    #[test]
    fn restricted_spec_builds_a_sub_graph_layer() {
        let spec = ServiceSpec {
            name: "shuttle".into(),
            strategy: "batch".into(),
            shared: true,
            match_busy_vehicles: true,
            dt_matching: 10,
            allowed_links: vec![0, 2, 4],
        };
        let service = build_service(&spec).expect("build");
        assert!(service.layer.allows(LinkId(2)));
        assert!(!service.layer.allows(LinkId(1)));
    }

    #[test]
    fn step_budget_scales_with_dt() {
        let config = StepConfig {
            dt_ms: 2_000,
            vehicle_speed_mps: 8.0,
        };
        assert!((config.step_budget_m() - 16.0).abs() < 1e-9);
    }
}
