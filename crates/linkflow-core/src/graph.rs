//! The Graph Store: one connected component of the per-cargo link graph.
//!
//! Nodes are stations participating in a cargo's distribution; edges are
//! observed traffic between ordered station pairs. Edges live in a sparse
//! `BTreeMap` keyed by `(from, to)` node handles, so memory is proportional
//! to existing traffic, and the outgoing edges of a node are one contiguous
//! prefix range scan.
//!
//! This structure is owned by the main simulation thread. Jobs never touch
//! it directly; they work on a deep copy taken at spawn (see [`crate::job`]).
//!
//! # Contract
//!
//! Node handles passed to the hot-path accessors must be valid. Indexing
//! with a stale or out-of-range handle is a programming error (checked by
//! `debug_assert!`/panic), not a recoverable one. The only deliberately
//! forgiving operation is [`LinkGraph::remove_node`], which ignores invalid
//! handles so that teardown paths need no ordering discipline.

use std::collections::BTreeMap;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::id::{CargoId, INVALID_TICK, NodeId, StationId, Ticks, TileIndex};
use crate::settings::DistributionSettings;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Minimum ticks between two compressions of the same component. Bounds the
/// numeric growth of accumulated capacity/usage between decays.
pub const COMPRESSION_INTERVAL: Ticks = 2048;

/// Age at which an old observation contributes half weight when blending
/// an `INCREASE` update into an existing edge. Policy constant; the exact
/// curve is tunable, only "recent observations dominate" is load-bearing.
pub const EDGE_BLEND_HALF_LIFE: Ticks = 1024;

// ---------------------------------------------------------------------------
// Edge update modes
// ---------------------------------------------------------------------------

/// Flag set selecting how [`LinkGraph::update_edge`] treats the incoming
/// sample. Flags combine with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeUpdateMode(u8);

impl EdgeUpdateMode {
    /// Overwrite capacity/usage/travel time with the new sample.
    pub const REFRESH: EdgeUpdateMode = EdgeUpdateMode(1 << 0);
    /// Accumulate the new sample onto the stored values, decaying the
    /// stored values by age first.
    pub const INCREASE: EdgeUpdateMode = EdgeUpdateMode(1 << 1);
    /// Stamp the restricted-capacity timestamp (loading forbidden at the
    /// source; the link still carries through-traffic).
    pub const RESTRICTED: EdgeUpdateMode = EdgeUpdateMode(1 << 2);
    /// Stamp the unrestricted-capacity timestamp.
    pub const UNRESTRICTED: EdgeUpdateMode = EdgeUpdateMode(1 << 3);
    /// Stamp the aircraft-capacity timestamp.
    pub const AIRCRAFT: EdgeUpdateMode = EdgeUpdateMode(1 << 4);

    pub fn contains(self, other: EdgeUpdateMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EdgeUpdateMode {
    type Output = EdgeUpdateMode;

    fn bitor(self, rhs: EdgeUpdateMode) -> EdgeUpdateMode {
        EdgeUpdateMode(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// Node and edge data
// ---------------------------------------------------------------------------

/// Per-node data: one station's participation in this cargo's graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData {
    /// Units offered per period.
    pub supply: u32,
    /// Units wanted per period.
    pub demand: u32,
    /// The owning station.
    pub station: StationId,
    /// Map location, for distance estimates.
    pub location: TileIndex,
    /// Last supply/demand update.
    pub last_update: Ticks,
}

/// Per-edge data: accumulated traffic statistics for one ordered node pair.
///
/// The three timestamps decay independently; the edge is alive while at
/// least one of them is valid. An edge whose unrestricted timestamp died
/// but whose restricted (or aircraft) timestamp lives is "restricted":
/// existing flows may continue over it but no new loading is planned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeData {
    /// Units per period the link can carry.
    pub capacity: u32,
    /// Units actually carried.
    pub usage: u32,
    /// Capacity-weighted running sum of travel times, so that
    /// `travel_time_sum / capacity` is the average observed travel time.
    pub travel_time_sum: u64,
    /// Last update carrying unrestricted capacity, or [`INVALID_TICK`].
    pub last_unrestricted_update: Ticks,
    /// Last update carrying restricted capacity, or [`INVALID_TICK`].
    pub last_restricted_update: Ticks,
    /// Last update from an aircraft link, or [`INVALID_TICK`].
    pub last_aircraft_update: Ticks,
}

impl EdgeData {
    fn empty() -> Self {
        Self {
            capacity: 0,
            usage: 0,
            travel_time_sum: 0,
            last_unrestricted_update: INVALID_TICK,
            last_restricted_update: INVALID_TICK,
            last_aircraft_update: INVALID_TICK,
        }
    }

    /// An edge survives while any of its three aspects is live.
    pub fn is_alive(&self) -> bool {
        self.last_unrestricted_update != INVALID_TICK
            || self.last_restricted_update != INVALID_TICK
            || self.last_aircraft_update != INVALID_TICK
    }

    /// Alive, but with no unrestricted capacity left.
    pub fn is_restricted(&self) -> bool {
        self.last_unrestricted_update == INVALID_TICK && self.is_alive()
    }

    /// Whether the most recent life sign came from an aircraft link.
    pub fn is_aircraft(&self) -> bool {
        self.last_aircraft_update != INVALID_TICK
    }

    /// Average observed travel time, or `None` when no sample exists.
    pub fn average_travel_time(&self) -> Option<u64> {
        if self.capacity > 0 && self.travel_time_sum > 0 {
            Some(self.travel_time_sum / self.capacity as u64)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// LinkGraph
// ---------------------------------------------------------------------------

/// One connected component of a cargo's link graph.
///
/// Components are created when a route first connects unconnected stations,
/// merged when a new route bridges two components, and destroyed when
/// emptied. Splitting a component back apart is never implemented: letting
/// merged components grow is cheaper than detecting and reversing temporary
/// disconnections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkGraph {
    cargo: CargoId,
    /// Settings in effect when this component was created. Never refreshed.
    settings: DistributionSettings,
    last_compression: Ticks,
    nodes: Vec<NodeData>,
    edges: BTreeMap<(NodeId, NodeId), EdgeData>,
}

impl LinkGraph {
    pub fn new(cargo: CargoId, settings: DistributionSettings, now: Ticks) -> Self {
        Self {
            cargo,
            settings,
            last_compression: now,
            nodes: Vec::new(),
            edges: BTreeMap::new(),
        }
    }

    pub fn cargo(&self) -> CargoId {
        self.cargo
    }

    pub fn settings(&self) -> &DistributionSettings {
        &self.settings
    }

    pub fn last_compression(&self) -> Ticks {
        self.last_compression
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Access a node's data. Panics on an out-of-range handle.
    pub fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0 as usize]
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        (id.0 as usize) < self.nodes.len()
    }

    pub fn get_edge(&self, from: NodeId, to: NodeId) -> Option<&EdgeData> {
        self.edges.get(&(from, to))
    }

    /// Iterate all edges in key order.
    pub fn edges(&self) -> impl Iterator<Item = (NodeId, NodeId, &EdgeData)> {
        self.edges.iter().map(|(&(f, t), e)| (f, t, e))
    }

    /// Outgoing edges of `from`, by prefix scan over the sorted edge map.
    pub fn edges_from(&self, from: NodeId) -> impl Iterator<Item = (NodeId, &EdgeData)> {
        self.edges
            .range((from, NodeId(0))..=(from, NodeId(u16::MAX)))
            .map(|(&(_, t), e)| (t, e))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &NodeData)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u16), n))
    }

    // -----------------------------------------------------------------------
    // Node mutation
    // -----------------------------------------------------------------------

    /// Append a zero-initialized node for `station`. Returns its handle.
    pub fn add_node(&mut self, station: StationId, location: TileIndex, now: Ticks) -> NodeId {
        assert!(
            self.nodes.len() < u16::MAX as usize,
            "component exceeds the node handle space"
        );
        let id = NodeId(self.nodes.len() as u16);
        self.nodes.push(NodeData {
            supply: 0,
            demand: 0,
            station,
            location,
            last_update: now,
        });
        id
    }

    /// Accumulate supply onto a node and stamp its update time.
    pub fn update_node_supply(&mut self, id: NodeId, supply: u32, now: Ticks) {
        let node = &mut self.nodes[id.0 as usize];
        node.supply = node.supply.saturating_add(supply);
        node.last_update = now;
    }

    /// Replace a node's demand figure.
    pub fn set_node_demand(&mut self, id: NodeId, demand: u32) {
        self.nodes[id.0 as usize].demand = demand;
    }

    /// Remove a node's row. Fails silently on an invalid handle.
    ///
    /// The last node is swapped into the hole and its edges re-keyed, so the
    /// removed handle is immediately recycled. Returns the handle whose node
    /// moved (the former last handle), or `None` when nothing moved. Edges
    /// incident to the removed node are erased from the sparse map; flow
    /// tables elsewhere that still name the departed station are the
    /// caller's pruning duty (reconciliation cleans them on the next join).
    pub fn remove_node(&mut self, id: NodeId) -> Option<NodeId> {
        let idx = id.0 as usize;
        if idx >= self.nodes.len() {
            return None;
        }
        let last = NodeId((self.nodes.len() - 1) as u16);

        // Drop edges touching the removed handle.
        self.edges.retain(|&(f, t), _| f != id && t != id);

        if id != last {
            // Re-key the moved node's edges from `last` to `id`.
            let moved: Vec<((NodeId, NodeId), EdgeData)> = self
                .edges
                .iter()
                .filter(|&(&(f, t), _)| f == last || t == last)
                .map(|(&k, e)| (k, e.clone()))
                .collect();
            for ((f, t), edge) in moved {
                self.edges.remove(&(f, t));
                let nf = if f == last { id } else { f };
                let nt = if t == last { id } else { t };
                self.edges.insert((nf, nt), edge);
            }
        }

        self.nodes.swap_remove(idx);
        if id != last { Some(last) } else { None }
    }

    // -----------------------------------------------------------------------
    // Edge mutation
    // -----------------------------------------------------------------------

    /// Fold one observed sample into the edge `from -> to`, creating the
    /// sparse entry if absent.
    ///
    /// `INCREASE` blends rather than replaces: the stored values are decayed
    /// by their age (half weight after [`EDGE_BLEND_HALF_LIFE`] ticks) before
    /// the new sample is added, so old data cannot dominate forever.
    /// `REFRESH` overwrites. The three `last_*_update` stamps are set
    /// according to the restriction flags in `mode`.
    pub fn update_edge(
        &mut self,
        from: NodeId,
        to: NodeId,
        capacity: u32,
        usage: u32,
        travel_time: u64,
        mode: EdgeUpdateMode,
        now: Ticks,
    ) {
        debug_assert!(from != to, "self-edges are not real links");
        debug_assert!(self.contains_node(from) && self.contains_node(to));
        if from == to {
            return;
        }

        let edge = self.edges.entry((from, to)).or_insert_with(EdgeData::empty);

        if mode.contains(EdgeUpdateMode::INCREASE) {
            let age = now.saturating_sub(edge.last_stamp());
            edge.capacity = decay(edge.capacity, age).saturating_add(capacity.max(1));
            edge.usage = decay(edge.usage, age).saturating_add(usage);
            edge.travel_time_sum = decay64(edge.travel_time_sum, age)
                .saturating_add(travel_time * capacity.max(1) as u64);
        } else if mode.contains(EdgeUpdateMode::REFRESH) || edge.capacity == 0 {
            edge.capacity = capacity.max(1);
            edge.usage = usage;
            edge.travel_time_sum = travel_time * capacity.max(1) as u64;
        }

        if mode.contains(EdgeUpdateMode::UNRESTRICTED) {
            edge.last_unrestricted_update = now;
        }
        if mode.contains(EdgeUpdateMode::RESTRICTED) {
            edge.last_restricted_update = now;
        }
        if mode.contains(EdgeUpdateMode::AIRCRAFT) {
            edge.last_aircraft_update = now;
        }
    }

    /// Erase the sparse entry for `from -> to`, if any.
    pub fn remove_edge(&mut self, from: NodeId, to: NodeId) {
        self.edges.remove(&(from, to));
    }

    // -----------------------------------------------------------------------
    // Compression
    // -----------------------------------------------------------------------

    /// Decay every capacity/usage/supply statistic by the elapsed-time ratio
    /// since the last compression, keeping positive values at least 1.
    ///
    /// A no-op until [`COMPRESSION_INTERVAL`] ticks have elapsed, which
    /// bounds both the cost and the numeric growth between runs.
    pub fn compress(&mut self, now: Ticks) {
        let elapsed = now.saturating_sub(self.last_compression);
        if elapsed < COMPRESSION_INTERVAL {
            return;
        }

        for node in &mut self.nodes {
            node.supply = scale_down(node.supply, elapsed);
        }
        for edge in self.edges.values_mut() {
            edge.capacity = scale_down(edge.capacity, elapsed);
            edge.usage = scale_down(edge.usage, elapsed);
            edge.travel_time_sum = scale_down64(edge.travel_time_sum, elapsed);
        }
        self.last_compression = now;
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Absorb `other`'s nodes and edges, re-numbering its node handles into
    /// this component's handle space. Returns the handle remap, indexed by
    /// `other`'s old handles. The caller destroys `other` (it is consumed).
    pub fn merge(&mut self, other: LinkGraph, now: Ticks) -> Vec<NodeId> {
        debug_assert_eq!(self.cargo, other.cargo);
        let remap: Vec<NodeId> = other
            .nodes
            .iter()
            .map(|n| self.add_node(n.station, n.location, now))
            .collect();
        for (i, n) in other.nodes.into_iter().enumerate() {
            let id = remap[i];
            let slot = &mut self.nodes[id.0 as usize];
            slot.supply = n.supply;
            slot.demand = n.demand;
            slot.last_update = n.last_update;
        }
        for ((f, t), edge) in other.edges {
            self.edges
                .insert((remap[f.0 as usize], remap[t.0 as usize]), edge);
        }
        self.last_compression = self.last_compression.min(other.last_compression);
        remap
    }

    // -----------------------------------------------------------------------
    // Date renormalization
    // -----------------------------------------------------------------------

    /// Shift every stored timestamp by `delta`, skipping [`INVALID_TICK`]
    /// sentinels. Used when the game's date epoch is renormalized.
    pub fn shift_dates(&mut self, delta: i64) {
        self.last_compression = shift(self.last_compression, delta);
        for node in &mut self.nodes {
            node.last_update = shift(node.last_update, delta);
        }
        for edge in self.edges.values_mut() {
            edge.last_unrestricted_update = shift(edge.last_unrestricted_update, delta);
            edge.last_restricted_update = shift(edge.last_restricted_update, delta);
            edge.last_aircraft_update = shift(edge.last_aircraft_update, delta);
        }
    }
}

impl EdgeData {
    /// Most recent valid life sign, or 0 when the edge was never stamped.
    fn last_stamp(&self) -> Ticks {
        [
            self.last_unrestricted_update,
            self.last_restricted_update,
            self.last_aircraft_update,
        ]
        .into_iter()
        .filter(|&t| t != INVALID_TICK)
        .max()
        .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Scaling helpers
// ---------------------------------------------------------------------------

/// Halve the weight of a stored value for every `EDGE_BLEND_HALF_LIFE` of age.
fn decay(value: u32, age: Ticks) -> u32 {
    decay64(value as u64, age) as u32
}

fn decay64(value: u64, age: Ticks) -> u64 {
    if value == 0 {
        return 0;
    }
    (value * EDGE_BLEND_HALF_LIFE / (EDGE_BLEND_HALF_LIFE + age)).max(1)
}

/// Elapsed-ratio compression scaling. Positive stays positive.
fn scale_down(value: u32, elapsed: Ticks) -> u32 {
    scale_down64(value as u64, elapsed) as u32
}

fn scale_down64(value: u64, elapsed: Ticks) -> u64 {
    if value == 0 {
        return 0;
    }
    (value * COMPRESSION_INTERVAL / (COMPRESSION_INTERVAL + elapsed)).max(1)
}

fn shift(stamp: Ticks, delta: i64) -> Ticks {
    if stamp == INVALID_TICK {
        INVALID_TICK
    } else {
        stamp.saturating_add_signed(delta).min(INVALID_TICK - 1)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
