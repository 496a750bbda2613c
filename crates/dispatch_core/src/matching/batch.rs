//! Batched assignment: one Kuhn-Munkres pass over the whole request buffer.
//!
//! All open requests and all eligible vehicles of the pass are evaluated
//! pairwise under the radius/tolerance/capacity filters; the resulting
//! estimated-pickup-time matrix is solved as a minimum-cost bipartite
//! assignment, so the committed set is batch-locally optimal rather than
//! greedy. Unreachable pairs carry an explicit [`PickupEstimate::Unreachable`]
//! and only become a sentinel weight at the solver boundary.

use pathfinding::kuhn_munkres::{kuhn_munkres, Weights};

use super::strategy::{has_free_seat, MatchContext, MatchStrategy};
use super::types::{MatchProposal, OpenRequest, PickupEstimate, VehicleCandidate};

/// Weight for pairs outside radius/tolerance (never selected). Must be worse
/// than any feasible weight but far from `i64::MIN` so the solver's internal
/// negation cannot overflow.
const INFEASIBLE: i64 = -1_000_000_000_000_i64;

/// Dense i64 matrix implementing the solver's `Weights` interface.
struct I64Weights(Vec<Vec<i64>>);

impl Weights<i64> for I64Weights {
    fn rows(&self) -> usize {
        self.0.len()
    }

    fn columns(&self) -> usize {
        self.0.first().map_or(0, |r| r.len())
    }

    fn at(&self, row: usize, col: usize) -> i64 {
        self.0[row][col]
    }

    fn neg(&self) -> Self {
        I64Weights(
            self.0
                .iter()
                .map(|r| r.iter().map(|&x| x.saturating_neg()).collect())
                .collect(),
        )
    }
}

fn weight_of(estimate: PickupEstimate) -> i64 {
    match estimate.reachable_ms() {
        // Maximization problem: lower pickup time = higher weight.
        Some(time_ms) => -(time_ms.min(i64::MAX as u64) as i64).max(INFEASIBLE + 1),
        None => INFEASIBLE,
    }
}

#[derive(Debug, Default)]
pub struct BatchMatching;

impl BatchMatching {
    fn estimate(
        &self,
        request: &OpenRequest,
        candidate: &VehicleCandidate,
        ctx: &MatchContext<'_>,
    ) -> PickupEstimate {
        if !has_free_seat(candidate) || !ctx.within_radius(candidate.pos.node, request.pickup) {
            return PickupEstimate::Unreachable;
        }
        match ctx.tail_approach(candidate, request.pickup) {
            PickupEstimate::Reachable { time_ms }
                if ctx.pickup_delay_ms(request.submitted_at_ms, time_ms)
                    <= request.tolerance_ms =>
            {
                PickupEstimate::Reachable { time_ms }
            }
            _ => PickupEstimate::Unreachable,
        }
    }

    fn build_proposal(
        &self,
        request: &OpenRequest,
        candidate: &VehicleCandidate,
        ctx: &MatchContext<'_>,
    ) -> Option<MatchProposal> {
        if ctx.shared {
            // Detour feasibility can still reject the pair here.
            ctx.build_shared_proposal(request, candidate)
                .map(|(_, proposal)| proposal)
        } else {
            ctx.build_tail_proposal(request, candidate)
        }
    }
}

impl MatchStrategy for BatchMatching {
    fn name(&self) -> &'static str {
        "batch"
    }

    fn run(
        &self,
        requests: &[OpenRequest],
        candidates: &[VehicleCandidate],
        ctx: &MatchContext<'_>,
    ) -> Vec<MatchProposal> {
        if requests.is_empty() || candidates.is_empty() {
            return Vec::new();
        }

        // Kuhn-Munkres requires rows <= columns; transpose when vehicles are
        // the scarcer side.
        let requests_as_rows = requests.len() <= candidates.len();
        let (rows, cols) = if requests_as_rows {
            (requests.len(), candidates.len())
        } else {
            (candidates.len(), requests.len())
        };

        let mut matrix = vec![vec![INFEASIBLE; cols]; rows];
        let mut any_feasible = false;
        for (i, request) in requests.iter().enumerate() {
            for (j, candidate) in candidates.iter().enumerate() {
                let weight = weight_of(self.estimate(request, candidate, ctx));
                if weight > INFEASIBLE {
                    any_feasible = true;
                }
                if requests_as_rows {
                    matrix[i][j] = weight;
                } else {
                    matrix[j][i] = weight;
                }
            }
        }
        if !any_feasible {
            return Vec::new();
        }

        let weights = I64Weights(matrix);
        let (_total, assignments) = kuhn_munkres(&weights);

        let mut proposals = Vec::new();
        for (row, &col) in assignments.iter().enumerate() {
            if weights.at(row, col) <= INFEASIBLE {
                continue;
            }
            let (request, candidate) = if requests_as_rows {
                (&requests[row], &candidates[col])
            } else {
                (&requests[col], &candidates[row])
            };
            if let Some(proposal) = self.build_proposal(request, candidate, ctx) {
                proposals.push(proposal);
            }
        }
        proposals
    }
}
