//! The live world: one cargo's stations, components and schedule.
//!
//! This is the single-threaded mutation surface. Vehicles report observed
//! link statistics through [`Network::refresh_link`], stations come and
//! go, and [`Network::step`] advances the clock, running compression and
//! the daily spawn/join exchange with the scheduler. Everything the
//! background jobs produce lands back here, in the per-station flow
//! tables.

use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

use crate::flows::FlowStatMap;
use crate::graph::{EdgeUpdateMode, LinkGraph};
use crate::id::{
    CargoClass, CargoId, DAY_TICKS, GraphId, INVALID_NODE, NodeId, StationId, TileIndex,
    Ticks,
};
use crate::scheduler::{LinkGraphSchedule, SPAWN_JOIN_TICK};
use crate::settings::DistributionSettings;

/// A station's view of the distribution system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub location: TileIndex,
    /// Component this station is linked into, if any.
    pub link_graph: Option<GraphId>,
    /// This station's node handle within its component. Only meaningful
    /// while `link_graph` is set.
    pub node: NodeId,
    /// Computed flow shares, keyed by cargo origin station.
    pub flows: FlowStatMap,
}

impl Station {
    fn new(location: TileIndex) -> Self {
        Self {
            location,
            link_graph: None,
            node: INVALID_NODE,
            flows: FlowStatMap::default(),
        }
    }
}

/// One cargo's complete distribution state.
#[derive(Debug)]
pub struct Network {
    cargo: CargoId,
    class: CargoClass,
    settings: DistributionSettings,
    tick: Ticks,
    graphs: SlotMap<GraphId, LinkGraph>,
    stations: SlotMap<StationId, Station>,
    schedule: LinkGraphSchedule,
}

impl Network {
    pub fn new(cargo: CargoId, class: CargoClass, settings: DistributionSettings) -> Self {
        Self {
            cargo,
            class,
            settings,
            tick: 0,
            graphs: SlotMap::with_key(),
            stations: SlotMap::with_key(),
            schedule: LinkGraphSchedule::new(class),
        }
    }

    pub(crate) fn from_parts(
        cargo: CargoId,
        class: CargoClass,
        settings: DistributionSettings,
        tick: Ticks,
        graphs: SlotMap<GraphId, LinkGraph>,
        stations: SlotMap<StationId, Station>,
        queue: Vec<GraphId>,
    ) -> Self {
        let mut schedule = LinkGraphSchedule::new(class);
        schedule.restore_queue(queue);
        Self {
            cargo,
            class,
            settings,
            tick,
            graphs,
            stations,
            schedule,
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn cargo(&self) -> CargoId {
        self.cargo
    }

    pub fn class(&self) -> CargoClass {
        self.class
    }

    pub fn settings(&self) -> &DistributionSettings {
        &self.settings
    }

    pub fn tick(&self) -> Ticks {
        self.tick
    }

    pub fn graphs(&self) -> &SlotMap<GraphId, LinkGraph> {
        &self.graphs
    }

    pub fn stations(&self) -> &SlotMap<StationId, Station> {
        &self.stations
    }

    pub fn schedule(&self) -> &LinkGraphSchedule {
        &self.schedule
    }

    pub fn station(&self, id: StationId) -> Option<&Station> {
        self.stations.get(id)
    }

    /// The computed next hop for cargo from `origin` sitting at `station`.
    /// `None` means no computed route; the caller falls back to a local
    /// decision.
    pub fn next_hop(
        &self,
        station: StationId,
        origin: StationId,
        scrambler: u32,
    ) -> Option<StationId> {
        self.stations
            .get(station)?
            .flows
            .get(origin)
            .and_then(|stat| stat.via(scrambler))
    }

    // -----------------------------------------------------------------------
    // Station lifecycle
    // -----------------------------------------------------------------------

    pub fn add_station(&mut self, location: TileIndex) -> StationId {
        self.stations.insert(Station::new(location))
    }

    pub fn remove_station(&mut self, id: StationId) {
        self.remove_station_from_graph(id);
        self.stations.remove(id);
    }

    /// Detach a station from its component, destroying the component when
    /// it empties. The station itself stays.
    pub fn remove_station_from_graph(&mut self, id: StationId) {
        let Some(station) = self.stations.get_mut(id) else {
            return;
        };
        let Some(graph_id) = station.link_graph.take() else {
            return;
        };
        let node = station.node;
        station.node = INVALID_NODE;

        let Some(graph) = self.graphs.get_mut(graph_id) else {
            return;
        };
        if graph.remove_node(node).is_some() {
            // The former last node was swapped into the freed handle; fix
            // its station's backreference.
            let owner = graph.node(node).station;
            if let Some(owner) = self.stations.get_mut(owner) {
                owner.node = node;
            }
        }
        if graph.node_count() == 0 {
            self.graphs.remove(graph_id);
            self.schedule.unqueue_graph(graph_id);
        }
    }

    // -----------------------------------------------------------------------
    // Link statistics
    // -----------------------------------------------------------------------

    /// Fold an observed link sample into the graph store, linking both
    /// stations into one component first. When the link bridges two
    /// components, the smaller one is absorbed and destroyed.
    pub fn refresh_link(
        &mut self,
        from: StationId,
        to: StationId,
        capacity: u32,
        usage: u32,
        travel_time: u64,
        mode: EdgeUpdateMode,
    ) {
        if from == to {
            return;
        }
        let Some(graph_from) = self.ensure_node(from) else {
            return;
        };
        let Some(graph_to) = self.ensure_node(to) else {
            return;
        };
        let graph_id = if graph_from == graph_to {
            graph_from
        } else {
            self.merge_components(graph_from, graph_to)
        };

        let from_node = self.stations[from].node;
        let to_node = self.stations[to].node;
        if let Some(graph) = self.graphs.get_mut(graph_id) {
            graph.update_edge(
                from_node, to_node, capacity, usage, travel_time, mode, self.tick,
            );
        }
    }

    /// Drop a directed link whose last carrier is gone. The component is
    /// never split back apart; reconciliation cleans up flow shares that
    /// still point over the dead link.
    pub fn remove_link(&mut self, from: StationId, to: StationId) {
        let (Some(station_from), Some(station_to)) =
            (self.stations.get(from), self.stations.get(to))
        else {
            return;
        };
        let (Some(graph_from), Some(graph_to)) =
            (station_from.link_graph, station_to.link_graph)
        else {
            return;
        };
        if graph_from != graph_to {
            return;
        }
        let (from_node, to_node) = (station_from.node, station_to.node);
        if let Some(graph) = self.graphs.get_mut(graph_from) {
            graph.remove_edge(from_node, to_node);
        }
    }

    /// Report generated supply at a station.
    pub fn update_station_supply(&mut self, id: StationId, amount: u32) {
        let Some(graph_id) = self.ensure_node(id) else {
            return;
        };
        let node = self.stations[id].node;
        if let Some(graph) = self.graphs.get_mut(graph_id) {
            graph.update_node_supply(node, amount, self.tick);
        }
    }

    /// Report the demand figure at a station.
    pub fn set_station_demand(&mut self, id: StationId, demand: u32) {
        let Some(graph_id) = self.ensure_node(id) else {
            return;
        };
        let node = self.stations[id].node;
        if let Some(graph) = self.graphs.get_mut(graph_id) {
            graph.set_node_demand(node, demand);
        }
    }

    /// Make sure the station has a node in some component, creating a new
    /// single-node component when it has none.
    fn ensure_node(&mut self, id: StationId) -> Option<GraphId> {
        let station = self.stations.get(id)?;
        if let Some(graph_id) = station.link_graph {
            return Some(graph_id);
        }
        let location = station.location;
        let mut graph = LinkGraph::new(self.cargo, self.settings.clone(), self.tick);
        let node = graph.add_node(id, location, self.tick);
        let graph_id = self.graphs.insert(graph);
        let station = self.stations.get_mut(id)?;
        station.link_graph = Some(graph_id);
        station.node = node;
        self.schedule.queue_graph(graph_id);
        Some(graph_id)
    }

    /// Merge two components, absorbing the smaller into the larger.
    /// Backreferences of the moved stations are rewritten and the absorbed
    /// component is destroyed and unscheduled.
    fn merge_components(&mut self, a: GraphId, b: GraphId) -> GraphId {
        let size_a = self.graphs[a].node_count();
        let size_b = self.graphs[b].node_count();
        let (keep, absorb) = if size_a >= size_b { (a, b) } else { (b, a) };

        let Some(absorbed) = self.graphs.remove(absorb) else {
            return keep;
        };
        let remap = self.graphs[keep].merge(absorbed, self.tick);
        for &new_node in &remap {
            let owner = self.graphs[keep].node(new_node).station;
            if let Some(station) = self.stations.get_mut(owner) {
                station.link_graph = Some(keep);
                station.node = new_node;
            }
        }
        self.schedule.unqueue_graph(absorb);
        keep
    }

    // -----------------------------------------------------------------------
    // Clock
    // -----------------------------------------------------------------------

    /// Advance one tick: run due compressions and, once per simulated day,
    /// exchange one job with the scheduler in each direction.
    pub fn step(&mut self) {
        self.tick += 1;
        for graph in self.graphs.values_mut() {
            graph.compress(self.tick);
        }
        if self.tick % DAY_TICKS == SPAWN_JOIN_TICK {
            self.schedule.spawn_next(&self.graphs, self.tick);
            self.schedule.join_next(&self.graphs, &mut self.stations, self.tick);
        }
    }

    /// Start jobs for every queued component at once. Used after a load,
    /// when all results are missing simultaneously.
    pub fn spawn_all_jobs(&mut self) {
        self.schedule.spawn_all(&self.graphs, self.tick);
    }

    /// Abort and join all in-flight jobs, discarding their results.
    pub fn abort_jobs(&mut self) {
        self.schedule.abort_all();
    }

    /// Shift every stored timestamp when the outer clock renormalizes.
    pub fn shift_dates(&mut self, delta: i64) {
        self.tick = self.tick.saturating_add_signed(delta);
        for graph in self.graphs.values_mut() {
            graph.shift_dates(delta);
        }
        self.schedule.shift_dates(delta);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
