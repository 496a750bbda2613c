//! Shortest-path queries against a service sub-graph (the link-cost oracle).
//!
//! The engine never embeds unreachability in a numeric sentinel: a failed
//! query is an explicit [`RoutingError::NoPathFound`]. The default oracle
//! runs Dijkstra over the link graph under the current [`LinkCosts`] and
//! keeps an LRU cache keyed by (layer fingerprint, cost epoch, endpoints),
//! so cached entries die with the epoch when costs change or links get
//! banned.

use std::error::Error;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use bevy_ecs::prelude::Resource;
use lru::LruCache;
use pathfinding::prelude::dijkstra;

use crate::network::{LinkCosts, LinkId, NodeId, RoadNetwork, ServiceLayer};

/// Result of a shortest-path query: node sequence, link sequence, totals.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedPath {
    pub nodes: Vec<NodeId>,
    pub links: Vec<LinkId>,
    pub length_m: f64,
    pub time_ms: u64,
}

impl RoutedPath {
    /// `from == to` routes are empty, not errors.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn trivial(at: NodeId) -> Self {
        Self {
            nodes: vec![at],
            links: Vec::new(),
            length_m: 0.0,
            time_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingError {
    NoPathFound { from: NodeId, to: NodeId },
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingError::NoPathFound { from, to } => {
                write!(f, "no path from node {} to node {}", from.0, to.0)
            }
        }
    }
}

impl Error for RoutingError {}

/// The link-cost oracle: owned by the embedding simulation, consumed here.
pub trait CostOracle: Send + Sync {
    fn shortest_path(
        &self,
        network: &RoadNetwork,
        costs: &LinkCosts,
        layer: &ServiceLayer,
        from: NodeId,
        to: NodeId,
    ) -> Result<RoutedPath, RoutingError>;
}

/// Resource wrapper for the oracle trait object.
#[derive(Resource)]
pub struct CostOracleResource(pub Box<dyn CostOracle>);

impl CostOracleResource {
    pub fn dijkstra() -> Self {
        Self(Box::new(DijkstraOracle::default()))
    }
}

type CacheKey = (u64, u64, NodeId, NodeId);

/// Default oracle: Dijkstra over the usable links of the layer.
pub struct DijkstraOracle {
    cache: Mutex<LruCache<CacheKey, RoutedPath>>,
}

const CACHE_ENTRIES: usize = 10_000;

impl Default for DijkstraOracle {
    fn default() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_ENTRIES).expect("cache size must be non-zero"),
            )),
        }
    }
}

impl DijkstraOracle {
    fn compute(
        network: &RoadNetwork,
        costs: &LinkCosts,
        layer: &ServiceLayer,
        from: NodeId,
        to: NodeId,
    ) -> Result<RoutedPath, RoutingError> {
        if from == to {
            return Ok(RoutedPath::trivial(from));
        }

        let successors = |node: &NodeId| {
            network
                .out_links(*node)
                .iter()
                .filter(|l| network.is_usable(**l, layer))
                .map(|l| (network.link(*l).to, costs.time_ms(*l)))
                .collect::<Vec<_>>()
        };

        let (nodes, time_ms) = dijkstra(&from, successors, |n| *n == to)
            .ok_or(RoutingError::NoPathFound { from, to })?;

        // Recover the link sequence: cheapest usable link between each node pair.
        let mut links = Vec::with_capacity(nodes.len().saturating_sub(1));
        let mut length_m = 0.0;
        for pair in nodes.windows(2) {
            let link = network
                .out_links(pair[0])
                .iter()
                .filter(|l| network.is_usable(**l, layer) && network.link(**l).to == pair[1])
                .min_by_key(|l| costs.time_ms(**l))
                .copied()
                .ok_or(RoutingError::NoPathFound { from, to })?;
            length_m += network.link(link).length_m;
            links.push(link);
        }

        Ok(RoutedPath {
            nodes,
            links,
            length_m,
            time_ms,
        })
    }
}

impl CostOracle for DijkstraOracle {
    fn shortest_path(
        &self,
        network: &RoadNetwork,
        costs: &LinkCosts,
        layer: &ServiceLayer,
        from: NodeId,
        to: NodeId,
    ) -> Result<RoutedPath, RoutingError> {
        let key = (layer.fingerprint(), costs.epoch(), from, to);
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return Ok(hit.clone());
            }
        }

        let path = Self::compute(network, costs, layer, from, to)?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, path.clone());
        }
        Ok(path)
    }
}
