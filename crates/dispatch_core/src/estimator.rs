//! Zone-level waiting-time estimation.
//!
//! The network is partitioned into H3 zones; each zone's expected pickup wait
//! is derived from the balance of idle vehicles against open requests. With
//! spare supply the wait is the expected approach drive from the nearest idle
//! vehicle; with excess demand the queue position is paid on top of a full
//! zone crossing per waiting request.

use std::collections::HashMap;

use bevy_ecs::prelude::Resource;
use h3o::{CellIndex, Resolution};

/// Zone layout and the demand-side detour factor applied to straight-line
/// approach distances.
#[derive(Debug, Clone, Copy, Resource)]
pub struct ZonePartition {
    pub resolution: Resolution,
    /// Road distance per unit of straight-line distance, typically 1.3-1.6.
    pub detour_ratio: f64,
}

impl ZonePartition {
    pub fn new(resolution: Resolution, detour_ratio: f64) -> Self {
        Self {
            resolution,
            detour_ratio,
        }
    }
}

/// Supply/demand counts of one zone at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneSnapshot {
    pub idle_vehicles: usize,
    pub open_requests: usize,
}

/// Expected wait until pickup for a request submitted now in this zone.
///
/// Oversupply: the nearest of `k` surplus idle vehicles is on average
/// `0.5 * sqrt(area / k)` away in a straight line. Undersupply: every request
/// ahead in the queue costs one mean approach across the whole zone.
pub fn estimate_wait_ms(
    zone_area_m2: f64,
    snapshot: ZoneSnapshot,
    detour_ratio: f64,
    mean_speed_mps: f64,
) -> u64 {
    if mean_speed_mps <= 0.0 || zone_area_m2 <= 0.0 {
        return u64::MAX;
    }
    let approach_m = |vehicle_pool: f64| detour_ratio * 0.5 * (zone_area_m2 / vehicle_pool).sqrt();

    let wait_s = if snapshot.idle_vehicles > snapshot.open_requests {
        let surplus = (snapshot.idle_vehicles - snapshot.open_requests) as f64;
        approach_m(surplus) / mean_speed_mps
    } else {
        let queue = (snapshot.open_requests - snapshot.idle_vehicles + 1) as f64;
        queue * approach_m(1.0) / mean_speed_mps
    };
    (wait_s * 1_000.0).round() as u64
}

/// Per-zone wait estimates, refreshed by the dispatch loop each step. Readers
/// (e.g. a mode-choice layer upstream) query by cell.
#[derive(Debug, Default, Resource)]
pub struct WaitingTimeBoard {
    estimates: HashMap<CellIndex, u64>,
    updated_at_ms: u64,
}

impl WaitingTimeBoard {
    /// Replace the board from fresh zone snapshots.
    pub fn refresh(
        &mut self,
        now_ms: u64,
        zones: impl IntoIterator<Item = (CellIndex, ZoneSnapshot)>,
        detour_ratio: f64,
        mean_speed_mps: f64,
    ) {
        self.estimates.clear();
        for (cell, snapshot) in zones {
            let wait = estimate_wait_ms(cell.area_m2(), snapshot, detour_ratio, mean_speed_mps);
            self.estimates.insert(cell, wait);
        }
        self.updated_at_ms = now_ms;
    }

    /// Estimated wait for `cell`; `None` when the zone saw neither supply nor
    /// demand in the last refresh.
    pub fn wait_ms(&self, cell: CellIndex) -> Option<u64> {
        self.estimates.get(&cell).copied()
    }

    pub fn updated_at_ms(&self) -> u64 {
        self.updated_at_ms
    }

    pub fn len(&self) -> usize {
        self.estimates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.estimates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use h3o::LatLng;

    use super::*;

    fn zone() -> CellIndex {
        let ll = LatLng::new(52.52, 13.405).expect("valid coords");
        ll.to_cell(Resolution::Eight)
    }

    #[test]
    fn more_idle_vehicles_shorten_the_wait() {
        let area = zone().area_m2();
        let sparse = estimate_wait_ms(
            area,
            ZoneSnapshot {
                idle_vehicles: 2,
                open_requests: 0,
            },
            1.4,
            8.0,
        );
        let dense = estimate_wait_ms(
            area,
            ZoneSnapshot {
                idle_vehicles: 20,
                open_requests: 0,
            },
            1.4,
            8.0,
        );
        assert!(dense < sparse);
        assert!(sparse > 0);
    }

    #[test]
    fn queue_position_grows_the_wait_linearly() {
        let area = zone().area_m2();
        let shot = |open| ZoneSnapshot {
            idle_vehicles: 1,
            open_requests: open,
        };
        let one_behind = estimate_wait_ms(area, shot(2), 1.4, 8.0);
        let three_behind = estimate_wait_ms(area, shot(4), 1.4, 8.0);
        // Doubling the queue doubles the wait, up to millisecond rounding.
        assert!((three_behind as i64 - 2 * one_behind as i64).abs() <= 1);
    }

    #[test]
    fn balanced_zone_pays_one_full_approach() {
        let area = zone().area_m2();
        let balanced = estimate_wait_ms(
            area,
            ZoneSnapshot {
                idle_vehicles: 3,
                open_requests: 3,
            },
            1.4,
            8.0,
        );
        let surplus_one = estimate_wait_ms(
            area,
            ZoneSnapshot {
                idle_vehicles: 4,
                open_requests: 3,
            },
            1.4,
            8.0,
        );
        assert_eq!(balanced, surplus_one);
    }

    #[test]
    fn zero_speed_means_unreachable() {
        let area = zone().area_m2();
        let wait = estimate_wait_ms(area, ZoneSnapshot::default(), 1.4, 0.0);
        assert_eq!(wait, u64::MAX);
    }

    #[test]
    fn board_refresh_replaces_stale_zones() {
        let cell = zone();
        let mut board = WaitingTimeBoard::default();
        board.refresh(
            1_000,
            [(
                cell,
                ZoneSnapshot {
                    idle_vehicles: 5,
                    open_requests: 0,
                },
            )],
            1.4,
            8.0,
        );
        assert!(board.wait_ms(cell).is_some());
        assert_eq!(board.updated_at_ms(), 1_000);

        board.refresh(2_000, [], 1.4, 8.0);
        assert!(board.wait_ms(cell).is_none());
        assert!(board.is_empty());
    }
}
