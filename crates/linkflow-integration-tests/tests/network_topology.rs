//! Integration tests for topology churn while jobs are in flight.
//!
//! Components merge, stations vanish, and links die while a background
//! job is still computing on its private frame. Reconciliation at join
//! time must keep the live flow tables consistent with whatever the
//! world looks like by then.

use linkflow_core::id::{CargoClass, CargoId, DAY_TICKS, TileIndex};
use linkflow_core::network::Network;
use linkflow_core::settings::DistributionSettings;
use linkflow_core::test_utils::*;

fn cycle_days(net: &Network) -> u64 {
    net.settings().recalc_interval / DAY_TICKS + 2
}

fn pair(net: &mut Network, x: u32, y: u32) -> (
    linkflow_core::id::StationId,
    linkflow_core::id::StationId,
) {
    let a = net.add_station(TileIndex::new(x, y));
    let b = net.add_station(TileIndex::new(x + 10, y));
    net.refresh_link(a, b, 100, 0, 10, link_mode());
    net.update_station_supply(a, 100);
    net.set_station_demand(b, 100);
    (a, b)
}

// ============================================================================
// Test 1: Components merged while a job runs
// ============================================================================

/// Start a job on each of two disjoint pairs, then bridge them into one
/// component while the jobs are still running. The stale frames must
/// reconcile against the merged world without installing garbage, and
/// the merged component must compute end-to-end routes on its own cycle.
#[test]
fn merge_during_running_jobs() {
    let mut net = Network::new(
        CargoId(0),
        CargoClass::Bulk,
        DistributionSettings::default(),
    );
    let (a, b) = pair(&mut net, 0, 0);
    let (c, d) = pair(&mut net, 100, 0);
    assert_eq!(net.graphs().len(), 2);

    net.spawn_all_jobs();
    // Bridge while both jobs compute; the smaller component is absorbed.
    net.refresh_link(b, c, 100, 0, 10, link_mode());
    assert_eq!(net.graphs().len(), 1);

    let days = 2 * cycle_days(&net);
    run_days(&mut net, days);

    // All four stations live in one component and routing works across
    // the former boundary.
    let gid = net.station(a).unwrap().link_graph;
    assert!(gid.is_some());
    for s in [b, c, d] {
        assert_eq!(net.station(s).unwrap().link_graph, gid);
    }
    assert_eq!(net.next_hop(a, a, 0), Some(b));
    assert_eq!(net.next_hop(c, c, 0), Some(d));
}

// ============================================================================
// Test 2: Station removed while its job runs
// ============================================================================

#[test]
fn station_removed_during_running_job() {
    let (mut net, st) = chain_network(3);
    net.spawn_all_jobs();
    net.remove_station(st[2]);

    let days = cycle_days(&net);
    run_days(&mut net, days);

    // The job's frame still contained the removed tail; its flows must
    // not surface on the survivors.
    assert!(net.station(st[2]).is_none());
    assert_ne!(net.next_hop(st[1], st[0], 0), Some(st[2]));
    let gid = net.station(st[0]).unwrap().link_graph.unwrap();
    assert_eq!(net.graphs()[gid].node_count(), 2);
}

// ============================================================================
// Test 3: Whole component destroyed while its job runs
// ============================================================================

#[test]
fn component_destroyed_during_running_job() {
    let mut net = Network::new(
        CargoId(0),
        CargoClass::Bulk,
        DistributionSettings::default(),
    );
    let (a, b) = pair(&mut net, 0, 0);
    net.spawn_all_jobs();

    net.remove_station(a);
    net.remove_station(b);
    assert_eq!(net.graphs().len(), 0);

    // The orphaned job result is discarded at join time; the network
    // keeps stepping without incident.
    let days = cycle_days(&net);
    run_days(&mut net, days);
    assert_eq!(net.stations().len(), 0);
    assert_eq!(net.schedule().running_len(), 0);
}

// ============================================================================
// Test 4: Link direction matters
// ============================================================================

/// Only the a -> b direction exists. Cargo routes forward but there is
/// never a computed route backwards.
#[test]
fn one_way_link_routes_one_way() {
    let mut net = Network::new(
        CargoId(0),
        CargoClass::Bulk,
        DistributionSettings::default(),
    );
    let a = net.add_station(TileIndex::new(0, 0));
    let b = net.add_station(TileIndex::new(10, 0));
    net.refresh_link(a, b, 100, 0, 10, link_mode());
    net.update_station_supply(a, 100);
    net.set_station_demand(b, 100);
    // Demand back at the head cannot be served without a return link.
    net.set_station_demand(a, 100);
    net.update_station_supply(b, 100);

    let days = cycle_days(&net);
    run_days(&mut net, days);

    assert_eq!(net.next_hop(a, a, 0), Some(b));
    assert_eq!(net.next_hop(b, b, 0), None);
}
