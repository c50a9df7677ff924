//! Job snapshots: the private computation unit of one scheduled run.
//!
//! A [`LinkGraphJob`] owns a deep copy of one component plus run-scoped
//! annotations. The copy is taken on the main thread at spawn; from then on
//! the snapshot belongs exclusively to whichever thread runs the pipeline,
//! and the live graph keeps mutating underneath without coordination. The
//! only cross-thread state is a pair of lifecycle flags ([`JobFlags`]) and
//! the shared worker-thread handle — no locks anywhere near the hot path;
//! the data mutex is touched exactly twice, at handoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use crate::flows::FlowStatMap;
use crate::graph::LinkGraph;
use crate::id::{
    CargoClass, CargoId, DAY_TICKS, GraphId, NodeId, TILE_TRAVEL_TICKS, Ticks,
};
use crate::path::{FlowEdges, INVALID_PATH, PathForest, PathIndex};
use crate::settings::DistributionSettings;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Annotations
// ---------------------------------------------------------------------------

/// Run-scoped per-node bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct NodeAnnotation {
    /// Supply not yet assigned to any path.
    pub undelivered_supply: u32,
    /// Demand assigned to this node that has not been satisfied by flow yet.
    pub received_demand: u32,
    /// Flow shares computed for cargo passing through this node.
    pub flows: FlowStatMap,
    /// Legs with nonzero flow leaving this node.
    pub paths: Vec<PathIndex>,
}

/// One flattened edge of the snapshot: capacity plus the precomputed cost
/// annotation and the running flow tally. Stored per-node-contiguous so the
/// solver scans a node's candidates from one cache line run.
#[derive(Debug, Clone)]
pub struct EdgeAnnotation {
    pub from: NodeId,
    pub to: NodeId,
    pub capacity: u32,
    /// Travel-time-based cost for time-sensitive cargo, tile distance for
    /// bulk cargo.
    pub cost: u32,
    pub flow: u32,
}

// ---------------------------------------------------------------------------
// Lifecycle flags
// ---------------------------------------------------------------------------

/// Cross-thread lifecycle state, readable without a lock.
///
/// `completed` may be read stale: a false negative just means "check again
/// next tick". `aborted` must never be missed: once stored, the release
/// store plus the acquire load (or the thread join) guarantees observation,
/// and the sole legal follow-up is finalise-and-discard.
#[derive(Debug, Default)]
pub struct JobFlags {
    completed: AtomicBool,
    aborted: AtomicBool,
}

impl JobFlags {
    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Pipeline contract
// ---------------------------------------------------------------------------

/// One stage of the job pipeline.
///
/// A handler receives exclusive access to one job's private data and must
/// not read or write anything outside it — that isolation is what makes
/// cross-job parallelism safe without locks. Handlers are stateless and
/// shared across jobs and threads.
pub trait Handler: Send + Sync + std::fmt::Debug {
    /// Stage name, for profiling and diagnostics.
    fn name(&self) -> &'static str;

    /// Run this stage over the job's private snapshot.
    fn run(&self, job: &mut JobGraph);
}

// ---------------------------------------------------------------------------
// JobGraph — the private snapshot handlers operate on
// ---------------------------------------------------------------------------

/// Deep copy of one component plus all run-scoped annotations.
#[derive(Debug)]
pub struct JobGraph {
    cargo: CargoId,
    class: CargoClass,
    settings: DistributionSettings,
    duration_multiplier: u32,

    nodes: Vec<crate::graph::NodeData>,
    edges: BTreeMap<(NodeId, NodeId), crate::graph::EdgeData>,

    annotations: Vec<NodeAnnotation>,
    edge_annotations: Vec<EdgeAnnotation>,
    /// CSR offsets: edges of node `n` live at
    /// `edge_annotations[first_edge[n]..first_edge[n + 1]]`.
    first_edge: Vec<u32>,

    /// Demand assigned between node pairs, consumed by the solver in sorted
    /// order for determinism.
    demand: BTreeMap<(NodeId, NodeId), u32>,

    forest: PathForest,
}

impl JobGraph {
    /// Snapshot `graph`. Cheap enough for the main thread; the expensive
    /// [`JobGraph::init`] may run on the worker.
    pub fn new(graph: &LinkGraph, class: CargoClass, duration_multiplier: u32) -> Self {
        Self {
            cargo: graph.cargo(),
            class,
            settings: graph.settings().clone(),
            duration_multiplier: duration_multiplier.max(1),
            nodes: graph.nodes().map(|(_, n)| n.clone()).collect(),
            edges: graph
                .edges()
                .map(|(f, t, e)| ((f, t), e.clone()))
                .collect(),
            annotations: Vec::new(),
            edge_annotations: Vec::new(),
            first_edge: Vec::new(),
            demand: BTreeMap::new(),
            forest: PathForest::new(),
        }
    }

    /// Allocate annotations and flatten the usable edges into the CSR
    /// array, precomputing each edge's cost annotation. Run once, possibly
    /// off the main thread.
    ///
    /// Only edges with live unrestricted capacity become candidates: a
    /// restricted link may keep carrying flows planned in earlier periods,
    /// but no new flow is planned over it.
    pub fn init(&mut self) {
        self.annotations = self
            .nodes
            .iter()
            .map(|n| NodeAnnotation {
                undelivered_supply: n.supply,
                ..NodeAnnotation::default()
            })
            .collect();

        self.first_edge = Vec::with_capacity(self.nodes.len() + 1);
        self.edge_annotations = Vec::with_capacity(self.edges.len());
        self.first_edge.push(0);
        for (&(from, to), edge) in &self.edges {
            debug_assert!(from != to, "self-loops are not real edges");
            // Close the ranges of every node before `from`, including the
            // ones without outgoing edges.
            while self.first_edge.len() <= from.0 as usize {
                self.first_edge.push(self.edge_annotations.len() as u32);
            }
            if !edge.is_alive() || edge.is_restricted() {
                continue;
            }
            let cost = self.cost_annotation(from, to, edge);
            self.edge_annotations.push(EdgeAnnotation {
                from,
                to,
                capacity: edge.capacity,
                cost,
                flow: 0,
            });
        }
        while self.first_edge.len() < self.nodes.len() + 1 {
            self.first_edge.push(self.edge_annotations.len() as u32);
        }
    }

    /// The per-edge routing cost. Time-sensitive cargo routes by observed
    /// travel time (falling back to a tile-distance estimate, shortened for
    /// aircraft links when their speed advantage is configured) plus a
    /// per-hop day offset; bulk cargo routes by raw tile distance.
    fn cost_annotation(
        &self,
        from: NodeId,
        to: NodeId,
        edge: &crate::graph::EdgeData,
    ) -> u32 {
        let dist = self.nodes[from.0 as usize]
            .location
            .distance(self.nodes[to.0 as usize].location);
        if !self.class.is_time_sensitive() {
            return dist;
        }
        let time = edge.average_travel_time().unwrap_or_else(|| {
            let est = dist as u64 * TILE_TRAVEL_TICKS;
            if edge.is_aircraft() && self.settings.aircraft_time_factor > 0 {
                est / self.settings.aircraft_time_factor as u64
            } else {
                est
            }
        });
        (time + DAY_TICKS).min(u32::MAX as u64) as u32
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

    pub fn duration_multiplier(&self) -> u32 {
        self.duration_multiplier
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &crate::graph::NodeData {
        &self.nodes[id.0 as usize]
    }

    pub fn annotation(&self, id: NodeId) -> &NodeAnnotation {
        &self.annotations[id.0 as usize]
    }

    pub fn annotation_mut(&mut self, id: NodeId) -> &mut NodeAnnotation {
        &mut self.annotations[id.0 as usize]
    }

    pub fn forest(&self) -> &PathForest {
        &self.forest
    }

    pub fn forest_mut(&mut self) -> &mut PathForest {
        &mut self.forest
    }

    /// Annotated outgoing edges of `from` (contiguous CSR slice).
    pub fn edges_from(&self, from: NodeId) -> &[EdgeAnnotation] {
        let lo = self.first_edge[from.0 as usize] as usize;
        let hi = self.first_edge[from.0 as usize + 1] as usize;
        &self.edge_annotations[lo..hi]
    }

    pub fn edge_annotations(&self) -> &[EdgeAnnotation] {
        &self.edge_annotations
    }

    fn edge_annotation_index(&self, from: NodeId, to: NodeId) -> Option<usize> {
        let lo = self.first_edge[from.0 as usize] as usize;
        let hi = self.first_edge[from.0 as usize + 1] as usize;
        self.edge_annotations[lo..hi]
            .binary_search_by_key(&to, |e| e.to)
            .ok()
            .map(|i| lo + i)
    }

    // -----------------------------------------------------------------------
    // Demand
    // -----------------------------------------------------------------------

    pub fn add_demand(&mut self, from: NodeId, to: NodeId, amount: u32) {
        if amount == 0 {
            return;
        }
        *self.demand.entry((from, to)).or_default() += amount;
        self.annotations[to.0 as usize].received_demand = self.annotations
            [to.0 as usize]
            .received_demand
            .saturating_add(amount);
    }

    pub fn demand(&self, from: NodeId, to: NodeId) -> u32 {
        *self.demand.get(&(from, to)).unwrap_or(&0)
    }

    /// Destinations with open demand from `from`, in node order.
    pub fn demand_from(&self, from: NodeId) -> Vec<(NodeId, u32)> {
        self.demand
            .range((from, NodeId(0))..=(from, NodeId(u16::MAX)))
            .map(|(&(_, t), &d)| (t, d))
            .collect()
    }

    /// Consume satisfied demand and the matching supply/demand counters.
    pub fn satisfy_demand(&mut self, from: NodeId, to: NodeId, amount: u32) {
        if let Some(d) = self.demand.get_mut(&(from, to)) {
            *d = d.saturating_sub(amount);
            if *d == 0 {
                self.demand.remove(&(from, to));
            }
        }
        let src = &mut self.annotations[from.0 as usize];
        src.undelivered_supply = src.undelivered_supply.saturating_sub(amount);
        let dst = &mut self.annotations[to.0 as usize];
        dst.received_demand = dst.received_demand.saturating_sub(amount);
    }

    // -----------------------------------------------------------------------
    // Flow routing
    // -----------------------------------------------------------------------

    /// Push `amount` along the path ending at `path` through the forest,
    /// respecting `max_saturation`. Returns the amount actually routed.
    pub fn route_flow(
        &mut self,
        path: PathIndex,
        amount: u32,
        max_saturation: Option<u16>,
    ) -> u32 {
        debug_assert!(path != INVALID_PATH);
        let Self {
            forest,
            annotations,
            edge_annotations,
            first_edge,
            ..
        } = self;
        let mut edges = AnnotatedEdges {
            annotations,
            edge_annotations,
            first_edge,
        };
        forest.add_flow(path, amount, &mut edges, max_saturation)
    }
}

/// Read-only CSR view handed to the solver together with exclusive forest
/// access, so path building can fork legs while scanning edges.
pub struct SolverView<'a> {
    edge_annotations: &'a [EdgeAnnotation],
    first_edge: &'a [u32],
}

impl SolverView<'_> {
    pub fn edges_from(&self, from: NodeId) -> &[EdgeAnnotation] {
        let lo = self.first_edge[from.0 as usize] as usize;
        let hi = self.first_edge[from.0 as usize + 1] as usize;
        &self.edge_annotations[lo..hi]
    }
}

impl JobGraph {
    pub fn solver_parts(&mut self) -> (SolverView<'_>, &mut PathForest) {
        (
            SolverView {
                edge_annotations: &self.edge_annotations,
                first_edge: &self.first_edge,
            },
            &mut self.forest,
        )
    }
}

/// Split-borrow view over the annotated edges, the seam [`PathForest`]
/// pushes flow through.
struct AnnotatedEdges<'a> {
    annotations: &'a mut Vec<NodeAnnotation>,
    edge_annotations: &'a mut Vec<EdgeAnnotation>,
    first_edge: &'a Vec<u32>,
}

impl AnnotatedEdges<'_> {
    fn index(&self, from: NodeId, to: NodeId) -> Option<usize> {
        let lo = self.first_edge[from.0 as usize] as usize;
        let hi = self.first_edge[from.0 as usize + 1] as usize;
        self.edge_annotations[lo..hi]
            .binary_search_by_key(&to, |e| e.to)
            .ok()
            .map(|i| lo + i)
    }
}

impl FlowEdges for AnnotatedEdges<'_> {
    fn capacity(&self, from: NodeId, to: NodeId) -> u32 {
        self.index(from, to)
            .map(|i| self.edge_annotations[i].capacity)
            .unwrap_or(0)
    }

    fn flow(&self, from: NodeId, to: NodeId) -> u32 {
        self.index(from, to)
            .map(|i| self.edge_annotations[i].flow)
            .unwrap_or(0)
    }

    fn add_flow(&mut self, from: NodeId, to: NodeId, amount: u32) {
        if let Some(i) = self.index(from, to) {
            self.edge_annotations[i].flow += amount;
        }
    }

    fn register_path(&mut self, node: NodeId, path: PathIndex) {
        self.annotations[node.0 as usize].paths.push(path);
    }
}

// ---------------------------------------------------------------------------
// LinkGraphJob
// ---------------------------------------------------------------------------

/// Persisted scheduling facts of a job, kept beside the queue so a reload
/// re-spawns equivalent jobs deterministically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSchedule {
    pub start_tick: Ticks,
    pub join_tick: Ticks,
}

/// One scheduled computation run over a private snapshot.
pub struct LinkGraphJob {
    graph: GraphId,
    schedule: JobSchedule,
    flags: Arc<JobFlags>,
    /// The snapshot travels to the worker and back through this slot; the
    /// mutex is locked exactly once on each side of the handoff.
    data: Arc<Mutex<Option<JobGraph>>>,
    /// Worker thread handle, shared with the owning [`JobGroup`] so that
    /// the last of {scheduler join, job drop} joins it exactly once.
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for LinkGraphJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkGraphJob")
            .field("graph", &self.graph)
            .field("schedule", &self.schedule)
            .field("completed", &self.flags.is_completed())
            .field("aborted", &self.flags.is_aborted())
            .finish()
    }
}

impl LinkGraphJob {
    /// Snapshot `graph` into a new job due `recalc_interval *
    /// duration_multiplier` ticks from `now`.
    pub fn new(
        graph_id: GraphId,
        graph: &LinkGraph,
        class: CargoClass,
        duration_multiplier: u32,
        now: Ticks,
    ) -> Self {
        let data = JobGraph::new(graph, class, duration_multiplier);
        let join_tick =
            now + graph.settings().recalc_interval * duration_multiplier.max(1) as Ticks;
        Self {
            graph: graph_id,
            schedule: JobSchedule {
                start_tick: now,
                join_tick,
            },
            flags: Arc::new(JobFlags::default()),
            data: Arc::new(Mutex::new(Some(data))),
            thread: Arc::new(Mutex::new(None)),
        }
    }

    pub fn graph_id(&self) -> GraphId {
        self.graph
    }

    pub fn schedule(&self) -> &JobSchedule {
        &self.schedule
    }

    pub fn flags(&self) -> &Arc<JobFlags> {
        &self.flags
    }

    pub fn is_due(&self, now: Ticks) -> bool {
        self.schedule.join_tick <= now
    }

    pub fn is_finished(&self) -> bool {
        self.flags.is_completed()
    }

    /// Request cancellation. The worker checks between pipeline stages;
    /// after this the only legal operation is finalise-and-discard.
    pub fn abort(&self) {
        self.flags.abort();
    }

    /// Shift the schedule on date renormalization.
    pub fn shift_dates(&mut self, delta: i64) {
        self.schedule.start_tick = self.schedule.start_tick.saturating_add_signed(delta);
        self.schedule.join_tick = self.schedule.join_tick.saturating_add_signed(delta);
    }

    /// Handles the worker shares with its [`JobGroup`].
    pub(crate) fn work_handles(
        &self,
    ) -> (Arc<JobFlags>, Arc<Mutex<Option<JobGraph>>>) {
        (Arc::clone(&self.flags), Arc::clone(&self.data))
    }

    /// Share a worker thread's handle slot with this job. All jobs of one
    /// group point at the same slot.
    pub(crate) fn attach_thread(&mut self, slot: Arc<Mutex<Option<JoinHandle<()>>>>) {
        self.thread = slot;
    }

    /// Join the worker thread if one was used. Idempotent; also runs from
    /// `Drop` so an abnormal shutdown never leaks a running worker.
    pub fn join_thread(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            panic!("link graph worker thread panicked");
        }
    }

    /// Take the snapshot back after the worker finished (or never ran).
    pub fn take_data(&self) -> Option<JobGraph> {
        self.data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Drop for LinkGraphJob {
    fn drop(&mut self) {
        self.join_thread();
    }
}

// ---------------------------------------------------------------------------
// Pipeline runner
// ---------------------------------------------------------------------------

/// Run the full pipeline over one job's snapshot: init, then each handler
/// in order, checking for abort between stages only. Marks the job
/// completed afterwards, whether it ran to the end or bailed on abort.
pub fn run_pipeline(
    flags: &JobFlags,
    data: &Mutex<Option<JobGraph>>,
    handlers: &[Box<dyn Handler>],
) {
    let taken = data
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    if let Some(mut graph) = taken {
        graph.init();
        for handler in handlers {
            if flags.is_aborted() {
                break;
            }
            #[cfg(feature = "profiling")]
            let timer = crate::profiling::StageTimer::start(handler.name());
            handler.run(&mut graph);
            #[cfg(feature = "profiling")]
            timer.finish();
        }
        *data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(graph);
    }
    flags.mark_completed();
}

// ===========================================================================
// Tests
// ===========================================================================
