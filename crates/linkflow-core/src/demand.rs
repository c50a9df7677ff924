//! Demand distribution: the first pipeline stage.
//!
//! Turns per-node supply and demand figures into a pairwise demand matrix
//! for the solver. Supply is divided among accepting nodes by a running
//! proportional split, weighted by demand size and damped by distance, so
//! the full supply is assigned without rounding residue. Symmetric
//! distribution mirrors every assignment back and caps it by the other
//! side's remaining supply; manual distribution produces no demand at all.

use crate::id::NodeId;
use crate::job::{Handler, JobGraph};
use crate::settings::DistributionType;

/// Distance damping scale. A target `SCALE` weighted distance units away
/// keeps half its base weight.
const SCALE: u64 = 100;

#[derive(Debug, Default)]
pub struct DemandHandler;

impl Handler for DemandHandler {
    fn name(&self) -> &'static str {
        "demand"
    }

    fn run(&self, job: &mut JobGraph) {
        match job.settings().distribution(job.class()) {
            DistributionType::Manual => {}
            DistributionType::Asymmetric => distribute(job, false),
            DistributionType::Symmetric => distribute(job, true),
        }
    }
}

/// Base weight damped by distance: `base * SCALE / (SCALE + d * mod / SCALE)`,
/// floored at 1 so a distant accepting node is dimmed, never dropped.
fn weigh(base: u64, distance: u32, modifier: u16) -> u64 {
    (base * SCALE / (SCALE + distance as u64 * modifier as u64 / SCALE)).max(1)
}

fn distribute(job: &mut JobGraph, symmetric: bool) {
    let n = job.node_count();
    let modifier = job.settings().demand_distance_modifier;
    let mut remaining: Vec<u64> = (0..n)
        .map(|i| job.annotation(NodeId(i as u16)).undelivered_supply as u64)
        .collect();

    for s in 0..n {
        let source = NodeId(s as u16);
        let mut supply = remaining[s];
        if supply == 0 {
            continue;
        }
        let accepts_back = job.node(source).demand > 0;

        // Candidate targets with their damped weights, in node order.
        let mut targets: Vec<(NodeId, u64)> = Vec::new();
        let mut total = 0u64;
        for t in 0..n {
            if t == s {
                continue;
            }
            let target = NodeId(t as u16);
            let node = job.node(target);
            if node.demand == 0 {
                continue;
            }
            // Symmetric flow needs a return load, so the target's demand is
            // proxied by its supply.
            let base = if symmetric {
                if remaining[t] == 0 {
                    continue;
                }
                remaining[t]
            } else {
                node.demand as u64
            };
            let distance = job.node(source).location.distance(node.location);
            let weight = weigh(base, distance, modifier);
            targets.push((target, weight));
            total += weight;
        }

        // Running proportional split: dividing the remainder by the
        // remaining weight at each step assigns the whole supply with no
        // rounding residue left over.
        for (target, weight) in targets {
            if supply == 0 || total == 0 {
                break;
            }
            let mut share = supply * weight / total;
            total -= weight;
            if symmetric {
                share = share.min(remaining[target.0 as usize]);
            }
            if share == 0 {
                continue;
            }
            supply -= share;
            job.add_demand(source, target, share as u32);
            if symmetric && accepts_back {
                job.add_demand(target, source, share as u32);
                remaining[target.0 as usize] -= share;
            }
        }
        remaining[s] = supply;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::LinkGraph;
    use crate::id::{CargoClass, CargoId, StationId, TileIndex};
    use crate::settings::DistributionSettings;
    use slotmap::SlotMap;

    fn build(
        spots: &[(u32, u32, u32)], // (x, supply, demand)
        class: CargoClass,
        settings: DistributionSettings,
    ) -> (JobGraph, Vec<NodeId>) {
        let mut stations: SlotMap<StationId, ()> = SlotMap::with_key();
        let mut graph = LinkGraph::new(CargoId(0), settings, 0);
        let mut nodes = Vec::new();
        for &(x, supply, demand) in spots {
            let id = graph.add_node(stations.insert(()), TileIndex::new(x, 0), 0);
            graph.update_node_supply(id, supply, 0);
            graph.set_node_demand(id, demand);
            nodes.push(id);
        }
        let mut job = JobGraph::new(&graph, class, 1);
        job.init();
        (job, nodes)
    }

    fn settings(policy: DistributionType) -> DistributionSettings {
        DistributionSettings {
            distribution_pax: policy,
            distribution_mail: policy,
            distribution_default: policy,
            ..DistributionSettings::default()
        }
    }

    // -----------------------------------------------------------------------
    // Test 1: manual distribution leaves the demand matrix empty
    // -----------------------------------------------------------------------
    #[test]
    fn manual_produces_no_demand() {
        let (mut job, n) = build(
            &[(0, 100, 10), (10, 100, 10)],
            CargoClass::Bulk,
            settings(DistributionType::Manual),
        );
        DemandHandler.run(&mut job);
        assert_eq!(job.demand(n[0], n[1]), 0);
        assert_eq!(job.demand(n[1], n[0]), 0);
    }

    // -----------------------------------------------------------------------
    // Test 2: asymmetric split is proportional to demand at equal distance
    // -----------------------------------------------------------------------
    #[test]
    fn asymmetric_splits_by_demand() {
        // Both targets 10 tiles out, demands 60 and 20.
        let (mut job, n) = build(
            &[(10, 100, 0), (0, 0, 60), (20, 0, 20)],
            CargoClass::Bulk,
            settings(DistributionType::Asymmetric),
        );
        DemandHandler.run(&mut job);
        let a = job.demand(n[0], n[1]);
        let b = job.demand(n[0], n[2]);
        assert_eq!(a + b, 100, "all supply is assigned");
        assert_eq!(a, 75);
        assert_eq!(b, 25);
    }

    // -----------------------------------------------------------------------
    // Test 3: equal demands, unequal distance: the closer node gets more
    // -----------------------------------------------------------------------
    #[test]
    fn asymmetric_prefers_closer_targets() {
        let (mut job, n) = build(
            &[(0, 100, 0), (10, 0, 30), (20, 0, 30)],
            CargoClass::Bulk,
            settings(DistributionType::Asymmetric),
        );
        DemandHandler.run(&mut job);
        let near = job.demand(n[0], n[1]);
        let far = job.demand(n[0], n[2]);
        assert_eq!(near + far, 100);
        assert!(near > far, "distance damps the farther target: {near} vs {far}");
    }

    // -----------------------------------------------------------------------
    // Test 4: symmetric mirrors every assignment
    // -----------------------------------------------------------------------
    #[test]
    fn symmetric_mirrors() {
        let (mut job, n) = build(
            &[(0, 40, 10), (10, 40, 10)],
            CargoClass::Passenger,
            settings(DistributionType::Symmetric),
        );
        DemandHandler.run(&mut job);
        assert_eq!(job.demand(n[0], n[1]), 40);
        assert_eq!(job.demand(n[1], n[0]), 40);
    }

    // -----------------------------------------------------------------------
    // Test 5: symmetric assignment is capped by the far side's supply
    // -----------------------------------------------------------------------
    #[test]
    fn symmetric_caps_by_return_supply() {
        let (mut job, n) = build(
            &[(0, 100, 10), (10, 25, 10)],
            CargoClass::Passenger,
            settings(DistributionType::Symmetric),
        );
        DemandHandler.run(&mut job);
        assert_eq!(job.demand(n[0], n[1]), 25);
        assert_eq!(job.demand(n[1], n[0]), 25);
    }

    // -----------------------------------------------------------------------
    // Test 6: nodes that accept nothing receive nothing
    // -----------------------------------------------------------------------
    #[test]
    fn zero_demand_nodes_are_skipped() {
        let (mut job, n) = build(
            &[(0, 100, 0), (10, 0, 0), (20, 0, 50)],
            CargoClass::Bulk,
            settings(DistributionType::Asymmetric),
        );
        DemandHandler.run(&mut job);
        assert_eq!(job.demand(n[0], n[1]), 0);
        assert_eq!(job.demand(n[0], n[2]), 100);
    }

    // -----------------------------------------------------------------------
    // Test 7: the split honours the per-class distribution override
    // -----------------------------------------------------------------------
    #[test]
    fn per_class_override_applies() {
        let s = DistributionSettings {
            distribution_pax: DistributionType::Manual,
            distribution_default: DistributionType::Asymmetric,
            ..DistributionSettings::default()
        };
        let (mut job, n) = build(&[(0, 100, 10), (10, 50, 10)], CargoClass::Passenger, s);
        DemandHandler.run(&mut job);
        assert_eq!(job.demand(n[0], n[1]), 0, "passengers are set to manual");
    }
}
