//! Vehicle activity plans: the ordered queue of typed work items and the
//! splice primitives the matcher, replanner, and interruption flow share.
//!
//! A plan is the vehicle's current activity plus its future queue. Every
//! non-`Stop` activity owns a path of (link, remaining length) segments;
//! consecutive activities stay node-contiguous, which `insert_activity` and
//! `remove_activity` restore after every splice by re-querying the service's
//! sub-graph. Candidates are built on a clone and swapped in atomically by
//! the caller, so a rejected candidate never leaves partial mutation behind.

use std::collections::{HashSet, VecDeque};
use std::error::Error;
use std::fmt;

use bevy_ecs::prelude::{Component, Entity};

use crate::network::{LinkCosts, LinkId, NodeId, RoadNetwork, ServiceLayer};
use crate::routing::{CostOracle, RoutedPath, RoutingError};

/// One link of an activity path with the distance still to drive on it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathSegment {
    pub link: LinkId,
    pub remaining_m: f64,
}

/// A unit of vehicle work. `Pickup`/`Serving` are bound to one traveler for
/// their whole lifetime.
#[derive(Debug, Clone)]
pub enum Activity {
    Stop {
        node: NodeId,
    },
    Pickup {
        traveler: Entity,
        node: NodeId,
        path: Vec<PathSegment>,
    },
    Serving {
        traveler: Entity,
        node: NodeId,
        path: Vec<PathSegment>,
    },
    Repositioning {
        node: NodeId,
        path: Vec<PathSegment>,
    },
}

impl Activity {
    pub fn stop(node: NodeId) -> Self {
        Activity::Stop { node }
    }

    pub fn pickup(traveler: Entity, node: NodeId) -> Self {
        Activity::Pickup {
            traveler,
            node,
            path: Vec::new(),
        }
    }

    pub fn serving(traveler: Entity, node: NodeId) -> Self {
        Activity::Serving {
            traveler,
            node,
            path: Vec::new(),
        }
    }

    pub fn repositioning(node: NodeId) -> Self {
        Activity::Repositioning {
            node,
            path: Vec::new(),
        }
    }

    pub fn target_node(&self) -> NodeId {
        match self {
            Activity::Stop { node }
            | Activity::Pickup { node, .. }
            | Activity::Serving { node, .. }
            | Activity::Repositioning { node, .. } => *node,
        }
    }

    pub fn path(&self) -> &[PathSegment] {
        match self {
            Activity::Stop { .. } => &[],
            Activity::Pickup { path, .. }
            | Activity::Serving { path, .. }
            | Activity::Repositioning { path, .. } => path,
        }
    }

    fn path_mut(&mut self) -> Option<&mut Vec<PathSegment>> {
        match self {
            Activity::Stop { .. } => None,
            Activity::Pickup { path, .. }
            | Activity::Serving { path, .. }
            | Activity::Repositioning { path, .. } => Some(path),
        }
    }

    fn set_path(&mut self, segments: Vec<PathSegment>) {
        if let Some(path) = self.path_mut() {
            *path = segments;
        }
    }

    fn set_node(&mut self, new_node: NodeId) {
        match self {
            Activity::Stop { node }
            | Activity::Pickup { node, .. }
            | Activity::Serving { node, .. }
            | Activity::Repositioning { node, .. } => *node = new_node,
        }
    }

    pub fn bound_traveler(&self) -> Option<Entity> {
        match self {
            Activity::Pickup { traveler, .. } | Activity::Serving { traveler, .. } => {
                Some(*traveler)
            }
            _ => None,
        }
    }

    /// Fillers are removed rather than shifted when an insertion displaces them.
    pub fn is_filler(&self) -> bool {
        matches!(self, Activity::Stop { .. } | Activity::Repositioning { .. })
    }

    pub fn is_pickup(&self) -> bool {
        matches!(self, Activity::Pickup { .. })
    }

    pub fn is_serving(&self) -> bool {
        matches!(self, Activity::Serving { .. })
    }

    pub fn remaining_m(&self) -> f64 {
        self.path().iter().map(|s| s.remaining_m).sum()
    }

    pub fn crosses(&self, banned: &HashSet<LinkId>) -> bool {
        self.path().iter().any(|s| banned.contains(&s.link))
    }
}

/// Live vehicle position: the node ahead, plus the current link and distance
/// still to drive on it when the vehicle is mid-link.
#[derive(Debug, Clone, Copy, PartialEq, Component)]
pub struct VehiclePosition {
    pub node: NodeId,
    pub link: Option<(LinkId, f64)>,
}

impl VehiclePosition {
    pub fn at_node(node: NodeId) -> Self {
        Self { node, link: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanError {
    /// Route repair between spliced endpoints is impossible on the service's
    /// sub-graph; callers treat this as "match not possible" or truncate.
    NoPathFound { from: NodeId, to: NodeId },
    /// The addressed index or traveler has no activity in this plan.
    NotInPlan,
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::NoPathFound { from, to } => {
                write!(f, "no path from node {} to node {}", from.0, to.0)
            }
            PlanError::NotInPlan => write!(f, "activity not present in plan"),
        }
    }
}

impl Error for PlanError {}

impl From<RoutingError> for PlanError {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::NoPathFound { from, to } => PlanError::NoPathFound { from, to },
        }
    }
}

/// Everything a splice needs to re-query paths on the owning service's layer.
pub struct RouteCtx<'a> {
    pub network: &'a RoadNetwork,
    pub costs: &'a LinkCosts,
    pub layer: &'a ServiceLayer,
    pub oracle: &'a dyn CostOracle,
}

impl<'a> RouteCtx<'a> {
    pub fn route(&self, from: NodeId, to: NodeId) -> Result<RoutedPath, RoutingError> {
        self.oracle
            .shortest_path(self.network, self.costs, self.layer, from, to)
    }

    pub fn segments(&self, route: &RoutedPath) -> Vec<PathSegment> {
        route
            .links
            .iter()
            .map(|l| PathSegment {
                link: *l,
                remaining_m: self.network.link(*l).length_m,
            })
            .collect()
    }

    /// Path from the vehicle's live position. A mid-link vehicle must finish
    /// its current link first, so the partial segment is kept as prefix.
    pub fn path_from_live(
        &self,
        pos: &VehiclePosition,
        to: NodeId,
    ) -> Result<Vec<PathSegment>, RoutingError> {
        match pos.link {
            Some((link, remaining_m)) if remaining_m > 0.0 => {
                let join = self.network.link(link).to;
                let tail = self.route(join, to)?;
                let mut segments = Vec::with_capacity(tail.links.len() + 1);
                segments.push(PathSegment { link, remaining_m });
                segments.extend(self.segments(&tail));
                Ok(segments)
            }
            _ => Ok(self.segments(&self.route(pos.node, to)?)),
        }
    }
}

/// Result of one `advance` call.
#[derive(Debug, Default)]
pub struct Advance {
    pub elapsed_ms: u64,
    pub moved_m: f64,
    /// Activities finished during this call, in completion order. The caller
    /// boards/alights the bound travelers.
    pub completed: Vec<Activity>,
}

/// Repair instruction for the activity that follows a splice point.
enum NeighborRepair {
    None,
    Path(Vec<PathSegment>),
    StopNode(NodeId),
}

/// The ordered work of one vehicle: current activity (index 0 when present)
/// plus the future queue.
#[derive(Debug, Clone, Default, Component)]
pub struct ActivityPlan {
    current: Option<Activity>,
    queue: VecDeque<Activity>,
}

impl ActivityPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        usize::from(self.current.is_some()) + self.queue.len()
    }

    pub fn current_activity(&self) -> Option<&Activity> {
        self.current.as_ref()
    }

    pub fn future_activities(&self) -> impl Iterator<Item = &Activity> {
        self.queue.iter()
    }

    /// Combined view over current + future: index 0 is the current activity
    /// when one exists.
    pub fn activity(&self, index: usize) -> Option<&Activity> {
        let cur_len = usize::from(self.current.is_some());
        if index < cur_len {
            self.current.as_ref()
        } else {
            self.queue.get(index - cur_len)
        }
    }

    fn activity_mut(&mut self, index: usize) -> Option<&mut Activity> {
        let cur_len = usize::from(self.current.is_some());
        if index < cur_len {
            self.current.as_mut()
        } else {
            self.queue.get_mut(index - cur_len)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Activity> {
        self.current.iter().chain(self.queue.iter())
    }

    /// Target node of the last planned activity, or `fallback` for an empty plan.
    pub fn last_target(&self, fallback: NodeId) -> NodeId {
        self.queue
            .back()
            .or(self.current.as_ref())
            .map(|a| a.target_node())
            .unwrap_or(fallback)
    }

    /// Seed the plan of a freshly spawned vehicle.
    pub fn set_initial(&mut self, activity: Activity) {
        debug_assert!(self.is_empty(), "set_initial on a non-empty plan");
        self.current = Some(activity);
    }

    pub fn push_initial(&mut self, activity: Activity) {
        if self.current.is_none() && self.queue.is_empty() {
            self.current = Some(activity);
        } else {
            self.queue.push_back(activity);
        }
    }

    pub fn pending_pickups(&self) -> usize {
        self.iter().filter(|a| a.is_pickup()).count()
    }

    pub fn position_of_pickup(&self, traveler: Entity) -> Option<usize> {
        self.iter()
            .position(|a| a.is_pickup() && a.bound_traveler() == Some(traveler))
    }

    pub fn position_of_serving(&self, traveler: Entity) -> Option<usize> {
        self.iter()
            .position(|a| a.is_serving() && a.bound_traveler() == Some(traveler))
    }

    pub fn position_of_traveler(&self, traveler: Entity) -> Option<usize> {
        self.iter().position(|a| a.bound_traveler() == Some(traveler))
    }

    /// Index of the last pickup in the plan, if any.
    pub fn last_pickup_index(&self) -> Option<usize> {
        self.iter()
            .enumerate()
            .filter(|(_, a)| a.is_pickup())
            .map(|(i, _)| i)
            .last()
    }

    pub fn remaining_m(&self) -> f64 {
        self.iter().map(|a| a.remaining_m()).sum()
    }

    pub fn remaining_time_ms(&self, network: &RoadNetwork, costs: &LinkCosts) -> u64 {
        self.iter()
            .map(|a| path_time_ms(a.path(), network, costs))
            .sum()
    }

    /// Driving time until the activity at `index` completes.
    pub fn time_until(&self, index: usize, network: &RoadNetwork, costs: &LinkCosts) -> u64 {
        self.iter()
            .take(index + 1)
            .map(|a| path_time_ms(a.path(), network, costs))
            .sum()
    }

    /// First activity whose path crosses one of the given links.
    pub fn first_crossing(&self, banned: &HashSet<LinkId>) -> Option<usize> {
        self.iter().position(|a| a.crosses(banned))
    }

    /// The node where an idle vehicle is available, if it is idle.
    pub fn idle_node(&self, pos: &VehiclePosition) -> Option<NodeId> {
        if self.is_empty() {
            return pos.link.is_none().then_some(pos.node);
        }
        match (&self.current, self.queue.is_empty()) {
            (Some(Activity::Stop { node }), true) => Some(*node),
            _ => None,
        }
    }

    /// Move the vehicle along the current activity's path by at most
    /// `budget_m` meters. Completed activities (path exhausted) are handed
    /// back for boarding/alighting; the next queued activity becomes current.
    pub fn advance(
        &mut self,
        pos: &mut VehiclePosition,
        mut budget_m: f64,
        network: &RoadNetwork,
        costs: &LinkCosts,
    ) -> Advance {
        let mut out = Advance::default();
        loop {
            if self.current.is_none() {
                match self.queue.pop_front() {
                    Some(next) => self.current = Some(next),
                    None => break,
                }
            }

            if matches!(self.current, Some(Activity::Stop { .. })) {
                if self.queue.is_empty() {
                    break; // idle at the stop
                }
                // A stop ahead of queued work is a filler; complete it.
                if let Some(done) = self.current.take() {
                    pos.node = done.target_node();
                    pos.link = None;
                    out.completed.push(done);
                }
                continue;
            }

            let path_done = self.current.as_ref().is_some_and(|a| a.path().is_empty());
            if path_done {
                if let Some(done) = self.current.take() {
                    pos.node = done.target_node();
                    pos.link = None;
                    out.completed.push(done);
                }
                continue;
            }

            if budget_m <= 0.0 {
                break;
            }

            let Some(path) = self.current.as_mut().and_then(|a| a.path_mut()) else {
                break;
            };
            let Some(seg) = path.first_mut() else {
                continue;
            };
            let link = seg.link;
            if seg.remaining_m > budget_m {
                seg.remaining_m -= budget_m;
                out.moved_m += budget_m;
                out.elapsed_ms += costs.time_for_meters(network, link, budget_m);
                pos.node = network.link(link).to;
                pos.link = Some((link, seg.remaining_m));
                budget_m = 0.0;
            } else {
                let step = seg.remaining_m;
                out.moved_m += step;
                out.elapsed_ms += costs.time_for_meters(network, link, step);
                budget_m -= step;
                pos.node = network.link(link).to;
                pos.link = None;
                path.remove(0);
            }
        }
        out
    }

    /// Insert `activity` at `index` (0 interrupts the current activity) and
    /// repair node-continuity on both sides of the splice. A displaced
    /// `Stop`/`Repositioning` filler is removed instead of shifted.
    ///
    /// All routes are resolved before any mutation, so a failed insertion
    /// leaves the plan untouched.
    pub fn insert_activity(
        &mut self,
        index: usize,
        mut activity: Activity,
        pos: &VehiclePosition,
        ctx: &RouteCtx<'_>,
    ) -> Result<(), PlanError> {
        let index = index.min(self.len());
        let target = activity.target_node();

        let new_path = match index {
            0 => ctx.path_from_live(pos, target)?,
            i => {
                let anchor = self
                    .activity(i - 1)
                    .map(|a| a.target_node())
                    .unwrap_or(pos.node);
                ctx.segments(&ctx.route(anchor, target)?)
            }
        };

        let displaced_filler = self.activity(index).is_some_and(|a| a.is_filler());
        let succ_index = if displaced_filler { index + 1 } else { index };
        let repair = match self.activity(succ_index) {
            Some(Activity::Stop { .. }) => NeighborRepair::StopNode(target),
            Some(succ) => {
                NeighborRepair::Path(ctx.segments(&ctx.route(target, succ.target_node())?))
            }
            None => NeighborRepair::None,
        };

        if displaced_filler {
            self.remove_at(index);
        }
        self.apply_repair(index, repair);
        activity.set_path(new_path);
        self.insert_at(index, activity);
        Ok(())
    }

    /// Remove the activity at `index` and repair continuity across the gap.
    /// At index 0 the current activity is interrupted: its in-progress path is
    /// dropped at the live position and the follower's path is prefixed with
    /// the remaining partial link.
    pub fn remove_activity(
        &mut self,
        index: usize,
        pos: &VehiclePosition,
        ctx: &RouteCtx<'_>,
    ) -> Result<Activity, PlanError> {
        if self.activity(index).is_none() {
            return Err(PlanError::NotInPlan);
        }

        let anchor = if index == 0 {
            None
        } else {
            self.activity(index - 1).map(|a| a.target_node())
        };
        let repair = match self.activity(index + 1) {
            Some(Activity::Stop { .. }) => {
                NeighborRepair::StopNode(anchor.unwrap_or(pos.node))
            }
            Some(succ) => {
                let segments = match anchor {
                    None => ctx.path_from_live(pos, succ.target_node())?,
                    Some(n) => ctx.segments(&ctx.route(n, succ.target_node())?),
                };
                NeighborRepair::Path(segments)
            }
            None => NeighborRepair::None,
        };

        let removed = self.remove_at(index).ok_or(PlanError::NotInPlan)?;
        self.apply_repair(index, repair);
        Ok(removed)
    }

    /// Recompute the path of the activity at `index` from its predecessor's
    /// end node (or the live position for index 0). The one splicing
    /// primitive behind reroute-after-ban for both pickup and drop-off legs.
    pub fn reroute_activity(
        &mut self,
        index: usize,
        pos: &VehiclePosition,
        ctx: &RouteCtx<'_>,
    ) -> Result<(), PlanError> {
        let Some(activity) = self.activity(index) else {
            return Err(PlanError::NotInPlan);
        };
        if matches!(activity, Activity::Stop { .. }) {
            return Ok(());
        }
        let target = activity.target_node();
        let segments = if index == 0 {
            ctx.path_from_live(pos, target)?
        } else {
            let anchor = self
                .activity(index - 1)
                .map(|a| a.target_node())
                .unwrap_or(pos.node);
            ctx.segments(&ctx.route(anchor, target)?)
        };
        if let Some(a) = self.activity_mut(index) {
            a.set_path(segments);
        }
        Ok(())
    }

    /// Send an idle (or finishing) vehicle toward `node` with a repositioning
    /// leg appended at the tail.
    pub fn reposition_to(
        &mut self,
        node: NodeId,
        pos: &VehiclePosition,
        ctx: &RouteCtx<'_>,
    ) -> Result<(), PlanError> {
        let tail = self.len();
        self.insert_activity(tail, Activity::repositioning(node), pos, ctx)
    }

    /// Drop every activity from `index` on; returns the dropped tail. Used
    /// when route repair fails and the plan degrades to truncation.
    pub fn truncate_from(&mut self, index: usize) -> Vec<Activity> {
        let cur_len = usize::from(self.current.is_some());
        let mut dropped = Vec::new();
        if index == 0 {
            if let Some(cur) = self.current.take() {
                dropped.push(cur);
            }
            dropped.extend(self.queue.drain(..));
        } else {
            let qi = (index - cur_len).min(self.queue.len());
            dropped.extend(self.queue.drain(qi..));
        }
        dropped
    }

    /// Consecutive activities must be node-contiguous; exposed for tests and
    /// debug assertions.
    pub fn is_contiguous(&self, network: &RoadNetwork, pos: &VehiclePosition) -> bool {
        let mut prev_end = match pos.link {
            Some((link, _)) => network.link(link).from,
            None => pos.node,
        };
        for (i, activity) in self.iter().enumerate() {
            let path = activity.path();
            if let Some(first) = path.first() {
                let start = network.link(first.link).from;
                // The first activity may start mid-link at the live position.
                let live_start = i == 0
                    && pos
                        .link
                        .is_some_and(|(link, rem)| link == first.link && rem == first.remaining_m);
                if start != prev_end && !live_start {
                    return false;
                }
                if let Some(last) = path.last() {
                    if network.link(last.link).to != activity.target_node() {
                        return false;
                    }
                }
            }
            prev_end = activity.target_node();
        }
        true
    }

    fn remove_at(&mut self, index: usize) -> Option<Activity> {
        if index == 0 && self.current.is_some() {
            self.current.take()
        } else {
            let cur_len = usize::from(self.current.is_some());
            self.queue.remove(index - cur_len)
        }
    }

    fn insert_at(&mut self, index: usize, activity: Activity) {
        if index == 0 {
            if let Some(old) = self.current.take() {
                self.queue.push_front(old);
            }
            self.current = Some(activity);
        } else {
            let cur_len = usize::from(self.current.is_some());
            let qi = (index - cur_len).min(self.queue.len());
            self.queue.insert(qi, activity);
        }
    }

    fn apply_repair(&mut self, index: usize, repair: NeighborRepair) {
        match repair {
            NeighborRepair::None => {}
            NeighborRepair::Path(segments) => {
                if let Some(a) = self.activity_mut(index) {
                    a.set_path(segments);
                }
            }
            NeighborRepair::StopNode(node) => {
                if let Some(a) = self.activity_mut(index) {
                    a.set_node(node);
                }
            }
        }
    }
}

pub fn path_time_ms(path: &[PathSegment], network: &RoadNetwork, costs: &LinkCosts) -> u64 {
    path.iter()
        .map(|s| costs.time_for_meters(network, s.link, s.remaining_m))
        .sum()
}
