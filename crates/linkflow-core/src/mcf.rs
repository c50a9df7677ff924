//! Capacity-aware flow solver: the second pipeline stage.
//!
//! A heuristic multi-commodity pass, not a certified optimum. Per source
//! node it runs Dijkstra over the annotated edges into a shortest-path
//! tree of forest legs, then pushes that source's demand down the tree.
//! Paths rank by cost annotation first; at equal cost the proportionally
//! freer route wins (see [`capacity_ratio`]), and remaining ties go to the
//! lower node id, which keeps runs deterministic.
//!
//! The first pass honours the configured saturation cap. Demand the cap
//! left stranded is routed by a second pass with the cap lifted, so every
//! reachable destination receives its cargo even over saturated links.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::id::NodeId;
use crate::job::{Handler, JobGraph, SolverView};
use crate::path::{INVALID_PATH, PathForest, PathIndex, capacity_ratio};

#[derive(Debug, Default)]
pub struct MultiCommodityFlow;

impl Handler for MultiCommodityFlow {
    fn name(&self) -> &'static str {
        "mcf"
    }

    fn run(&self, job: &mut JobGraph) {
        let cap = job.settings().max_saturation;
        pass(job, cap);
        if cap.is_some() {
            // Overload pass: route what the cap stranded.
            pass(job, None);
        }
    }
}

fn pass(job: &mut JobGraph, max_saturation: Option<u16>) {
    let n = job.node_count();
    for s in 0..n {
        let source = NodeId(s as u16);
        let demands = job.demand_from(source);
        if demands.is_empty() {
            continue;
        }

        let (view, forest) = job.solver_parts();
        let (legs, ranks) = build_paths(&view, forest, n, source);

        for (to, amount) in demands {
            if ranks[to.0 as usize].distance == u32::MAX {
                continue;
            }
            let pushed = job.route_flow(legs[to.0 as usize], amount, max_saturation);
            if pushed > 0 {
                job.satisfy_demand(source, to, pushed);
            }
        }

        // Legs that ended up carrying no flow are recycled right away; the
        // flow-carrying tree stays alive for the mapper.
        let forest = job.forest_mut();
        for &leg in &legs {
            forest.prune(leg);
        }
    }
}

/// Candidate ordering: lowest cumulative cost, then highest capacity
/// ratio, then lowest node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rank {
    distance: u32,
    ratio: i64,
    node: NodeId,
}

impl Rank {
    fn unreached(node: NodeId) -> Self {
        Self {
            distance: u32::MAX,
            ratio: i64::MIN,
            node,
        }
    }
}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .cmp(&other.distance)
            .then_with(|| other.ratio.cmp(&self.ratio))
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Dijkstra from `source`, forking a forest leg per reached node. Returns
/// one leg per node plus the rank each settled at; unreached nodes keep
/// `u32::MAX` distance.
fn build_paths(
    view: &SolverView<'_>,
    forest: &mut PathForest,
    n: usize,
    source: NodeId,
) -> (Vec<PathIndex>, Vec<Rank>) {
    let legs: Vec<PathIndex> = (0..n)
        .map(|i| forest.alloc(NodeId(i as u16), NodeId(i as u16) == source))
        .collect();
    let mut ranks: Vec<Rank> = (0..n).map(|i| Rank::unreached(NodeId(i as u16))).collect();

    ranks[source.0 as usize] = Rank {
        distance: 0,
        ratio: i64::MAX,
        node: source,
    };
    let mut heap: BinaryHeap<std::cmp::Reverse<Rank>> = BinaryHeap::new();
    heap.push(std::cmp::Reverse(ranks[source.0 as usize]));

    while let Some(std::cmp::Reverse(rank)) = heap.pop() {
        let u = rank.node;
        if rank != ranks[u.0 as usize] {
            // Stale entry superseded by a better relaxation.
            continue;
        }
        for edge in view.edges_from(u) {
            let v = edge.to;
            if v == source {
                continue;
            }
            let base = forest.link(legs[u.0 as usize]);
            let cand_cap = base.capacity.min(edge.capacity);
            let cand_free = base
                .free_capacity
                .min(edge.capacity as i64 - edge.flow as i64);
            let cand = Rank {
                distance: rank.distance.saturating_add(edge.cost),
                ratio: capacity_ratio(cand_free, cand_cap),
                node: v,
            };
            if cand < ranks[v.0 as usize] {
                forest.fork(
                    legs[v.0 as usize],
                    legs[u.0 as usize],
                    edge.capacity,
                    edge.capacity as i64 - edge.flow as i64,
                    edge.cost,
                );
                ranks[v.0 as usize] = cand;
                heap.push(std::cmp::Reverse(cand));
            }
        }
    }

    (legs, ranks)
}

// ===========================================================================
// Tests
// ===========================================================================
