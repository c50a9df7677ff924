//! Reconciliation: folding a finished job's results back into the live
//! world.
//!
//! The live graph kept mutating while the job ran, so every snapshot fact
//! is re-validated against the present before it is applied. Stations may
//! have vanished, node handles may have been recycled onto other stations,
//! edges may have died or lost their unrestricted capacity. Anything that
//! no longer checks out is dropped or downgraded; the rest is swapped into
//! the station flow tables in one step per station.

use slotmap::SlotMap;

use crate::flows::FlowStat;
use crate::graph::LinkGraph;
use crate::id::{GraphId, NodeId, StationId};
use crate::job::LinkGraphJob;
use crate::network::Station;
use crate::settings::DistributionType;

/// Join the job's worker and apply its results. Returns whether anything
/// was applied.
///
/// An aborted job is joined and discarded without touching any live state.
/// A job whose component was destroyed while it ran is discarded the same
/// way; individual stations whose graph or node linkage drifted are
/// skipped one by one.
pub fn finalise_job(
    graphs: &SlotMap<GraphId, LinkGraph>,
    stations: &mut SlotMap<StationId, Station>,
    job: &LinkGraphJob,
) -> bool {
    job.join_thread();
    if job.flags().is_aborted() {
        let _ = job.take_data();
        return false;
    }
    let Some(mut data) = job.take_data() else {
        return false;
    };
    let graph_id = job.graph_id();
    let Some(graph) = graphs.get(graph_id) else {
        return false;
    };

    let policy = data.settings().distribution(data.class());
    let mut applied = false;

    for i in 0..data.node_count() {
        let node = NodeId(i as u16);
        let snap_station = data.node(node).station;

        // Linkage check: the station must still exist, still sit in this
        // component, and still own this handle.
        let intact = stations
            .get(snap_station)
            .is_some_and(|st| st.link_graph == Some(graph_id) && st.node == node);
        if !intact {
            continue;
        }

        let mut new_flows = std::mem::take(&mut data.annotation_mut(node).flows);

        for edge in data.edges_from(node) {
            if edge.flow == 0 {
                continue;
            }
            let to_station = data.node(edge.to).station;
            let to_intact = stations
                .get(to_station)
                .is_some_and(|st| st.link_graph == Some(graph_id) && st.node == edge.to);
            let live = if to_intact {
                graph.get_edge(node, edge.to)
            } else {
                None
            };
            match live {
                None => {
                    // The planned next hop no longer exists; drop every
                    // share pointing at it and the whole stat keyed by it.
                    new_flows.erase_destination(to_station);
                }
                Some(live) if live.is_restricted() => {
                    new_flows.restrict_destination(to_station);
                }
                Some(_) => {}
            }
        }

        let station = &mut stations[snap_station];
        let old_flows = std::mem::replace(&mut station.flows, new_flows);

        // Cargo already moving under an origin the new plan dropped would
        // strand at this station. Unless routing is manual, let it be
        // re-decided here by pointing it at the station itself.
        if policy != DistributionType::Manual {
            for (origin, stat) in old_flows.iter() {
                if station.flows.get(origin).is_none() && stat.total() > 0 {
                    let amount = stat.total().min(u32::MAX as u64) as u32;
                    station
                        .flows
                        .insert(origin, FlowStat::new(snap_station, amount, false));
                }
            }
        }
        applied = true;
    }

    applied
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demand::DemandHandler;
    use crate::flows::FlowStatMap;
    use crate::graph::EdgeUpdateMode;
    use crate::id::{CargoClass, CargoId, TileIndex};
    use crate::job::{Handler, run_pipeline};
    use crate::mapper::FlowMapper;
    use crate::mcf::MultiCommodityFlow;
    use crate::settings::DistributionSettings;

    struct World {
        graphs: SlotMap<GraphId, LinkGraph>,
        stations: SlotMap<StationId, Station>,
        graph_id: GraphId,
        st: Vec<StationId>,
        n: Vec<NodeId>,
    }

    /// A three-station chain with supply at the head and demand at the
    /// tail, fully linked into one component.
    fn chain_world() -> World {
        let mut graphs: SlotMap<GraphId, LinkGraph> = SlotMap::with_key();
        let mut stations: SlotMap<StationId, Station> = SlotMap::with_key();
        let mut graph = LinkGraph::new(CargoId(0), DistributionSettings::default(), 0);

        let mut st = Vec::new();
        let mut n = Vec::new();
        for i in 0..3u32 {
            let location = TileIndex::new(i * 10, 0);
            let sid = stations.insert(Station {
                location,
                link_graph: None,
                node: NodeId(0),
                flows: FlowStatMap::default(),
            });
            let node = graph.add_node(sid, location, 0);
            st.push(sid);
            n.push(node);
        }
        graph.update_node_supply(n[0], 100, 0);
        graph.set_node_demand(n[2], 100);
        let mode = EdgeUpdateMode::REFRESH | EdgeUpdateMode::UNRESTRICTED;
        graph.update_edge(n[0], n[1], 100, 0, 10, mode, 1);
        graph.update_edge(n[1], n[2], 100, 0, 10, mode, 1);

        let graph_id = graphs.insert(graph);
        for (i, &sid) in st.iter().enumerate() {
            let station = &mut stations[sid];
            station.link_graph = Some(graph_id);
            station.node = n[i];
        }
        World { graphs, stations, graph_id, st, n }
    }

    fn pipeline() -> Vec<Box<dyn Handler>> {
        vec![
            Box::new(DemandHandler),
            Box::new(MultiCommodityFlow),
            Box::new(FlowMapper),
        ]
    }

    fn spawn_and_run(world: &World) -> LinkGraphJob {
        let job = LinkGraphJob::new(
            world.graph_id,
            &world.graphs[world.graph_id],
            CargoClass::Bulk,
            1,
            0,
        );
        let (flags, data) = job.work_handles();
        run_pipeline(&flags, &data, &pipeline());
        job
    }

    // -----------------------------------------------------------------------
    // Test 1: a clean run installs flow tables on the stations
    // -----------------------------------------------------------------------
    #[test]
    fn installs_flow_tables() {
        let mut world = chain_world();
        let job = spawn_and_run(&world);

        assert!(finalise_job(&world.graphs, &mut world.stations, &job));
        let head = &world.stations[world.st[0]].flows;
        let stat = head.get(world.st[0]).unwrap();
        assert_eq!(stat.shares()[0].via, world.st[1]);
        assert_eq!(stat.total(), 100);

        let mid = &world.stations[world.st[1]].flows;
        assert_eq!(mid.get(world.st[0]).unwrap().shares()[0].via, world.st[2]);
    }

    // -----------------------------------------------------------------------
    // Test 2: an aborted job changes nothing
    // -----------------------------------------------------------------------
    #[test]
    fn aborted_job_is_discarded() {
        let mut world = chain_world();
        let job = spawn_and_run(&world);
        job.abort();

        assert!(!finalise_job(&world.graphs, &mut world.stations, &job));
        for &sid in &world.st {
            assert!(world.stations[sid].flows.is_empty());
        }
    }

    // -----------------------------------------------------------------------
    // Test 3: a next hop whose live edge died leaves no stale share
    // -----------------------------------------------------------------------
    #[test]
    fn dead_edge_erases_shares() {
        let mut world = chain_world();
        let job = spawn_and_run(&world);

        // The mid-to-tail link vanished while the job ran.
        let (from, to) = (world.n[1], world.n[2]);
        world.graphs[world.graph_id].remove_edge(from, to);

        assert!(finalise_job(&world.graphs, &mut world.stations, &job));
        let mid = &world.stations[world.st[1]].flows;
        let stat = mid.get(world.st[0]);
        assert!(
            stat.is_none_or(|s| s.shares().iter().all(|sh| sh.via != world.st[2])),
            "no share may point at the dead hop"
        );
    }

    // -----------------------------------------------------------------------
    // Test 4: a hop that lost unrestricted capacity is downgraded
    // -----------------------------------------------------------------------
    #[test]
    fn restricted_edge_downgrades_shares() {
        let mut world = chain_world();
        let job = spawn_and_run(&world);

        // The link survives, but only with restricted capacity.
        let (from, to) = (world.n[1], world.n[2]);
        let graph = &mut world.graphs[world.graph_id];
        graph.remove_edge(from, to);
        graph.update_edge(from, to, 100, 0, 10, EdgeUpdateMode::RESTRICTED, 2);

        assert!(finalise_job(&world.graphs, &mut world.stations, &job));
        let mid = &world.stations[world.st[1]].flows;
        let stat = mid.get(world.st[0]).unwrap();
        assert!(stat.shares().iter().all(|sh| sh.restricted));
        assert_eq!(stat.unrestricted_total(), 0);
    }

    // -----------------------------------------------------------------------
    // Test 5: vanished or re-linked stations are skipped
    // -----------------------------------------------------------------------
    #[test]
    fn drifted_stations_are_skipped() {
        let mut world = chain_world();
        let job = spawn_and_run(&world);

        // The tail station disappeared entirely.
        world.stations.remove(world.st[2]);
        // The mid station was rebuilt into a different component.
        world.stations[world.st[1]].link_graph = None;

        assert!(finalise_job(&world.graphs, &mut world.stations, &job));
        // The mid station is skipped outright; the head station is still
        // processed, but its only planned hop pointed at the drifted mid
        // station and is erased with it.
        assert!(world.stations[world.st[1]].flows.is_empty());
        let head = &world.stations[world.st[0]].flows;
        assert!(
            head.get(world.st[0])
                .is_none_or(|s| s.shares().iter().all(|sh| sh.via != world.st[1]))
        );
    }

    // -----------------------------------------------------------------------
    // Test 6: origins the new plan dropped are rerouted via the station
    // -----------------------------------------------------------------------
    #[test]
    fn orphaned_origins_reroute_locally() {
        let mut world = chain_world();
        // Pretend an earlier run left flows from a now-silent origin.
        let ghost = world.st[2];
        world.stations[world.st[0]]
            .flows
            .insert(ghost, FlowStat::new(world.st[1], 40, false));

        let job = spawn_and_run(&world);
        assert!(finalise_job(&world.graphs, &mut world.stations, &job));

        let head = &world.stations[world.st[0]].flows;
        let rerouted = head.get(ghost).unwrap();
        assert_eq!(rerouted.shares()[0].via, world.st[0], "redirected to itself");
        assert_eq!(rerouted.total(), 40);
    }

    // -----------------------------------------------------------------------
    // Test 7: under manual distribution orphans are simply dropped
    // -----------------------------------------------------------------------
    #[test]
    fn manual_policy_drops_orphans() {
        let mut world = chain_world();
        let manual = DistributionSettings {
            distribution_pax: DistributionType::Manual,
            distribution_mail: DistributionType::Manual,
            distribution_default: DistributionType::Manual,
            ..DistributionSettings::default()
        };
        // Rebuild the component with manual settings.
        let graph = &mut world.graphs[world.graph_id];
        *graph = {
            let mut g = LinkGraph::new(CargoId(0), manual, 0);
            let mut nodes = Vec::new();
            for (i, &sid) in world.st.iter().enumerate() {
                nodes.push(g.add_node(sid, TileIndex::new(i as u32 * 10, 0), 0));
            }
            g
        };
        let ghost = world.st[2];
        world.stations[world.st[0]]
            .flows
            .insert(ghost, FlowStat::new(world.st[1], 40, false));

        let job = spawn_and_run(&world);
        assert!(finalise_job(&world.graphs, &mut world.stations, &job));
        assert!(world.stations[world.st[0]].flows.get(ghost).is_none());
    }

    // -----------------------------------------------------------------------
    // Test 8: a destroyed component discards the whole job
    // -----------------------------------------------------------------------
    #[test]
    fn destroyed_component_discards_job() {
        let mut world = chain_world();
        let job = spawn_and_run(&world);
        world.graphs.remove(world.graph_id);

        assert!(!finalise_job(&world.graphs, &mut world.stations, &job));
        for &sid in &world.st {
            assert!(world.stations[sid].flows.is_empty());
        }
    }
}
