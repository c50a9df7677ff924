//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use slotmap::SlotMap;

use crate::graph::{EdgeUpdateMode, LinkGraph};
use crate::id::{CargoClass, CargoId, DAY_TICKS, NodeId, StationId, TileIndex};
use crate::network::Network;
use crate::settings::DistributionSettings;

// ===========================================================================
// Link modes
// ===========================================================================

pub fn link_mode() -> EdgeUpdateMode {
    EdgeUpdateMode::REFRESH | EdgeUpdateMode::UNRESTRICTED
}

pub fn restricted_mode() -> EdgeUpdateMode {
    EdgeUpdateMode::REFRESH | EdgeUpdateMode::RESTRICTED
}

// ===========================================================================
// Graph fixtures
// ===========================================================================

/// A standalone chain component: `count` nodes in a row, each linked to
/// the next with the given capacity. Returns the graph, its node handles
/// and the backing station handles.
pub fn chain_graph(count: u16, capacity: u32) -> (LinkGraph, Vec<NodeId>, Vec<StationId>) {
    let mut stations: SlotMap<StationId, ()> = SlotMap::with_key();
    let mut graph = LinkGraph::new(CargoId(0), DistributionSettings::default(), 0);
    let mut nodes = Vec::new();
    let mut sids = Vec::new();
    for i in 0..count {
        let sid = stations.insert(());
        nodes.push(graph.add_node(sid, TileIndex::new(i as u32 * 10, 0), 0));
        sids.push(sid);
    }
    for pair in nodes.windows(2) {
        graph.update_edge(pair[0], pair[1], capacity, 0, 10, link_mode(), 1);
    }
    (graph, nodes, sids)
}

// ===========================================================================
// Network fixtures
// ===========================================================================

/// A live network with `count` stations chained by links, supply at the
/// head and demand at the tail.
pub fn chain_network(count: u32) -> (Network, Vec<StationId>) {
    let mut net = Network::new(
        CargoId(0),
        CargoClass::Bulk,
        DistributionSettings::default(),
    );
    let stations: Vec<StationId> = (0..count)
        .map(|i| net.add_station(TileIndex::new(i * 10, 0)))
        .collect();
    for pair in stations.windows(2) {
        net.refresh_link(pair[0], pair[1], 100, 0, 10, link_mode());
    }
    if let (Some(&head), Some(&tail)) = (stations.first(), stations.last()) {
        net.update_station_supply(head, 100);
        net.set_station_demand(tail, 100);
    }
    (net, stations)
}

/// Advance the network by whole simulated days.
pub fn run_days(net: &mut Network, days: u64) {
    for _ in 0..(days * DAY_TICKS) {
        net.step();
    }
}
