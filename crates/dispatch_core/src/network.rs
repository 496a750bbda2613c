//! Directed link network shared by all mobility services.
//!
//! The network is a plain adjacency structure over typed node/link ids.
//! Services see it through a [`ServiceLayer`] (the set of links their
//! vehicles may use) combined with the global ban set, which the
//! interruption flow mutates at runtime. Per-link travel times live in
//! [`LinkCosts`], updated each step by the external flow model; the cost
//! epoch lets route caches invalidate themselves without callbacks.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use bevy_ecs::prelude::Resource;
use h3o::{CellIndex, LatLng, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u32);

/// One directed road/transit link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Link {
    pub from: NodeId,
    pub to: NodeId,
    pub length_m: f64,
}

/// The full multimodal link graph.
#[derive(Debug, Clone, Default, Resource)]
pub struct RoadNetwork {
    positions: Vec<LatLng>,
    links: Vec<Link>,
    out_links: Vec<Vec<LinkId>>,
    banned: HashSet<LinkId>,
}

impl RoadNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, position: LatLng) -> NodeId {
        let id = NodeId(self.positions.len() as u32);
        self.positions.push(position);
        self.out_links.push(Vec::new());
        id
    }

    pub fn add_link(&mut self, from: NodeId, to: NodeId, length_m: f64) -> LinkId {
        debug_assert!(length_m > 0.0, "link length must be positive");
        let id = LinkId(self.links.len() as u32);
        self.links.push(Link { from, to, length_m });
        self.out_links[from.0 as usize].push(id);
        id
    }

    pub fn node_count(&self) -> usize {
        self.positions.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn link(&self, id: LinkId) -> &Link {
        &self.links[id.0 as usize]
    }

    pub fn position(&self, node: NodeId) -> LatLng {
        self.positions[node.0 as usize]
    }

    /// H3 cell of a node at the given resolution (zone membership, radius filter).
    pub fn cell(&self, node: NodeId, resolution: Resolution) -> CellIndex {
        self.position(node).to_cell(resolution)
    }

    pub fn out_links(&self, node: NodeId) -> &[LinkId] {
        &self.out_links[node.0 as usize]
    }

    /// Links entering or leaving a node; used when a station is withdrawn.
    pub fn incident_links(&self, node: NodeId) -> Vec<LinkId> {
        self.links
            .iter()
            .enumerate()
            .filter(|(_, l)| l.from == node || l.to == node)
            .map(|(i, _)| LinkId(i as u32))
            .collect()
    }

    pub fn ban_link(&mut self, id: LinkId) {
        self.banned.insert(id);
    }

    pub fn restore_link(&mut self, id: LinkId) {
        self.banned.remove(&id);
    }

    pub fn is_banned(&self, id: LinkId) -> bool {
        self.banned.contains(&id)
    }

    pub fn banned_links(&self) -> &HashSet<LinkId> {
        &self.banned
    }

    /// A link is usable by a service when its layer allows it and it is not banned.
    pub fn is_usable(&self, id: LinkId, layer: &ServiceLayer) -> bool {
        !self.is_banned(id) && layer.allows(id)
    }
}

/// Sub-graph restriction for one mobility service: the links its vehicles may
/// traverse. `unrestricted` means the whole network (minus bans).
///
/// The fingerprint discriminates route-cache entries between services that
/// share one oracle; it is computed once at construction.
#[derive(Debug, Clone, Default)]
pub struct ServiceLayer {
    allowed: Option<HashSet<LinkId>>,
    fingerprint: u64,
}

impl ServiceLayer {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn restricted_to(links: impl IntoIterator<Item = LinkId>) -> Self {
        let allowed: HashSet<LinkId> = links.into_iter().collect();
        let mut ids: Vec<u32> = allowed.iter().map(|l| l.0).collect();
        ids.sort_unstable();
        let mut hasher = DefaultHasher::new();
        ids.hash(&mut hasher);
        Self {
            fingerprint: hasher.finish().max(1),
            allowed: Some(allowed),
        }
    }

    pub fn allows(&self, link: LinkId) -> bool {
        match &self.allowed {
            None => true,
            Some(set) => set.contains(&link),
        }
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

/// Per-link travel times, written by the external flow model between steps.
///
/// The epoch must be bumped after any batch of cost updates or link bans so
/// that cached shortest paths computed under the old costs are discarded.
#[derive(Debug, Clone, Resource)]
pub struct LinkCosts {
    time_ms: Vec<u64>,
    epoch: u64,
}

impl LinkCosts {
    /// Costs derived from link lengths at a uniform speed.
    pub fn uniform(network: &RoadNetwork, speed_mps: f64) -> Self {
        let time_ms = (0..network.link_count())
            .map(|i| {
                let length = network.link(LinkId(i as u32)).length_m;
                ((length / speed_mps.max(0.1)) * 1000.0).round().max(1.0) as u64
            })
            .collect();
        Self { time_ms, epoch: 0 }
    }

    pub fn time_ms(&self, link: LinkId) -> u64 {
        self.time_ms[link.0 as usize].max(1)
    }

    pub fn set_time_ms(&mut self, link: LinkId, ms: u64) {
        self.time_ms[link.0 as usize] = ms.max(1);
    }

    /// Travel time for a partial traversal of `meters` on `link`.
    pub fn time_for_meters(&self, network: &RoadNetwork, link: LinkId, meters: f64) -> u64 {
        let length = network.link(link).length_m;
        if length <= 0.0 {
            return 0;
        }
        let fraction = (meters / length).clamp(0.0, 1.0);
        (self.time_ms(link) as f64 * fraction).round() as u64
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn bump_epoch(&mut self) {
        self.epoch += 1;
    }

    /// Mean speed over a set of links, in m/s. Zero-length input yields `None`.
    pub fn mean_speed_mps<I: IntoIterator<Item = LinkId>>(
        &self,
        network: &RoadNetwork,
        links: I,
    ) -> Option<f64> {
        let mut total_m = 0.0;
        let mut total_ms = 0u64;
        for link in links {
            total_m += network.link(link).length_m;
            total_ms += self.time_ms(link);
        }
        if total_ms == 0 {
            return None;
        }
        Some(total_m / (total_ms as f64 / 1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latlng(lat: f64, lng: f64) -> LatLng {
        LatLng::new(lat, lng).expect("valid coordinates")
    }

    #[test]
    fn ban_and_restore_toggle_usability() {
        let mut net = RoadNetwork::new();
        let a = net.add_node(latlng(52.52, 13.40));
        let b = net.add_node(latlng(52.52, 13.41));
        let link = net.add_link(a, b, 680.0);
        let layer = ServiceLayer::unrestricted();

        assert!(net.is_usable(link, &layer));
        net.ban_link(link);
        assert!(!net.is_usable(link, &layer));
        net.restore_link(link);
        assert!(net.is_usable(link, &layer));
    }

    #[test]
    fn restricted_layer_excludes_foreign_links() {
        let mut net = RoadNetwork::new();
        let a = net.add_node(latlng(52.52, 13.40));
        let b = net.add_node(latlng(52.52, 13.41));
        let c = net.add_node(latlng(52.52, 13.42));
        let ab = net.add_link(a, b, 680.0);
        let bc = net.add_link(b, c, 680.0);

        let layer = ServiceLayer::restricted_to([ab]);
        assert!(net.is_usable(ab, &layer));
        assert!(!net.is_usable(bc, &layer));
        assert_ne!(layer.fingerprint(), ServiceLayer::unrestricted().fingerprint());
    }

    #[test]
    fn incident_links_cover_both_directions() {
        let mut net = RoadNetwork::new();
        let a = net.add_node(latlng(52.52, 13.40));
        let b = net.add_node(latlng(52.52, 13.41));
        let c = net.add_node(latlng(52.52, 13.42));
        let ab = net.add_link(a, b, 680.0);
        let ba = net.add_link(b, a, 680.0);
        let bc = net.add_link(b, c, 680.0);

        // Severing a withdrawn station bans every link touching it.
        let incident = net.incident_links(b);
        assert_eq!(incident, vec![ab, ba, bc]);
        assert_eq!(net.incident_links(a), vec![ab, ba]);
    }

    #[test]
    fn uniform_costs_scale_with_length() {
        let mut net = RoadNetwork::new();
        let a = net.add_node(latlng(52.52, 13.40));
        let b = net.add_node(latlng(52.52, 13.41));
        let link = net.add_link(a, b, 500.0);
        let costs = LinkCosts::uniform(&net, 10.0);
        assert_eq!(costs.time_ms(link), 50_000);
        assert_eq!(costs.time_for_meters(&net, link, 250.0), 25_000);
    }
}
