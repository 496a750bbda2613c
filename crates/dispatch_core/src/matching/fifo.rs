//! FIFO matching: requests in submission order, one at a time.

use std::collections::HashSet;

use super::strategy::{has_free_seat, MatchContext, MatchStrategy};
use super::types::{MatchProposal, OpenRequest, PickupEstimate, VehicleCandidate};
use crate::replan;

/// Sequential first-come-first-served matching.
///
/// For each request (oldest first) the cheapest-in-time candidate within the
/// radius is chosen; the match is accepted only when the resulting pickup
/// delay respects the traveler's tolerance, otherwise the request stays open
/// for the next pass. Ties break by ascending estimated pickup time, then by
/// fleet insertion order, which makes the strategy fully deterministic.
#[derive(Debug, Default)]
pub struct FifoMatching;

impl MatchStrategy for FifoMatching {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn run(
        &self,
        requests: &[OpenRequest],
        candidates: &[VehicleCandidate],
        ctx: &MatchContext<'_>,
    ) -> Vec<MatchProposal> {
        let mut order: Vec<usize> = (0..requests.len()).collect();
        order.sort_by_key(|i| (requests[*i].submitted_at_ms, *i));

        let mut used: HashSet<usize> = HashSet::new();
        let mut proposals = Vec::new();

        for i in order {
            let request = &requests[i];
            let proposal = if ctx.shared {
                best_shared(request, candidates, &used, ctx)
            } else {
                best_exclusive(request, candidates, &used, ctx)
            };
            if let Some((candidate_index, proposal)) = proposal {
                used.insert(candidate_index);
                proposals.push(proposal);
            }
        }
        proposals
    }
}

fn best_exclusive(
    request: &OpenRequest,
    candidates: &[VehicleCandidate],
    used: &HashSet<usize>,
    ctx: &MatchContext<'_>,
) -> Option<(usize, MatchProposal)> {
    // Cheapest estimated pickup time, ties by fleet insertion order.
    let mut best: Option<(u64, usize, usize)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        if used.contains(&index)
            || !has_free_seat(candidate)
            || !ctx.within_radius(candidate.pos.node, request.pickup)
        {
            continue;
        }
        let PickupEstimate::Reachable { time_ms } = ctx.tail_approach(candidate, request.pickup)
        else {
            continue;
        };
        let key = (time_ms, candidate.fleet_index, index);
        if best.map_or(true, |(t, f, _)| (time_ms, candidate.fleet_index) < (t, f)) {
            best = Some(key);
        }
    }

    let (time_ms, _, index) = best?;
    if ctx.pickup_delay_ms(request.submitted_at_ms, time_ms) > request.tolerance_ms {
        return None; // request stays open for a later pass
    }
    let proposal = ctx.build_tail_proposal(request, &candidates[index])?;
    Some((index, proposal))
}

fn best_shared(
    request: &OpenRequest,
    candidates: &[VehicleCandidate],
    used: &HashSet<usize>,
    ctx: &MatchContext<'_>,
) -> Option<(usize, MatchProposal)> {
    let feasible = candidates
        .iter()
        .enumerate()
        .filter(|(index, candidate)| {
            !used.contains(index) && ctx.within_radius(candidate.pos.node, request.pickup)
        })
        .filter_map(|(index, candidate)| {
            ctx.build_shared_proposal(request, candidate)
                .map(|(disutility_m, proposal)| (index, disutility_m, proposal))
        });

    // Priority-queue selection over disutility.
    let (index, _, proposal) = replan::select_min_by(feasible, |(_, d, _)| *d)?;
    Some((index, proposal))
}
