//! Scheduling: the round-robin between live components and running jobs.
//!
//! Components queue for recalculation; once per simulated day one is taken
//! off the queue, snapshotted into a job and started, and the oldest
//! running job is joined back in if its interval elapsed. Joining blocks
//! on the worker thread when the job is due but unfinished, which is the
//! backpressure that keeps results from going stale unboundedly.
//!
//! Cheap jobs run inline on the calling thread. Expensive ones are bin
//! packed by estimated cost into a [`JobGroup`], one spawned thread that
//! works through its jobs sequentially. Jobs in different groups run in
//! parallel without locks because each owns a private snapshot.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;

use slotmap::SlotMap;

use crate::demand::DemandHandler;
use crate::graph::LinkGraph;
use crate::id::{CargoClass, GraphId, StationId, Ticks};
use crate::job::{Handler, LinkGraphJob, run_pipeline};
use crate::mapper::FlowMapper;
use crate::mcf::MultiCommodityFlow;
use crate::merge::finalise_job;
use crate::network::Station;

/// Tick within the simulated day on which jobs are spawned and joined.
pub const SPAWN_JOIN_TICK: Ticks = 58;

/// Nodes one recalculation interval is budgeted for; larger components get
/// proportionally longer intervals.
const NODES_PER_INTERVAL: u32 = 75;

/// Estimated cost (nodes squared) below which a job runs inline.
const INLINE_COST_THRESHOLD: u64 = 64 * 64;

/// Estimated cost one worker thread is loaded up with before the next
/// group is opened.
const GROUP_COST_BUDGET: u64 = 1 << 16;

fn job_cost(nodes: usize) -> u64 {
    (nodes as u64).saturating_mul(nodes as u64)
}

fn duration_multiplier(nodes: usize) -> u32 {
    (nodes as u32).div_ceil(NODES_PER_INTERVAL).max(1)
}

// ---------------------------------------------------------------------------
// JobGroup
// ---------------------------------------------------------------------------

/// One worker thread shared by a batch of jobs.
///
/// The thread handle is stored into every member job's shared slot, so the
/// first party that needs the thread gone (scheduler join or job drop)
/// joins it and the rest see an empty slot. If spawning the thread fails,
/// the batch runs inline instead of being dropped.
struct JobGroup;

impl JobGroup {
    fn spawn(jobs: &mut [LinkGraphJob], handlers: Arc<Vec<Box<dyn Handler>>>) {
        if jobs.is_empty() {
            return;
        }
        let work: Vec<_> = jobs.iter().map(|j| j.work_handles()).collect();
        let slot: Arc<Mutex<Option<thread::JoinHandle<()>>>> = Arc::new(Mutex::new(None));
        for job in jobs.iter_mut() {
            job.attach_thread(Arc::clone(&slot));
        }

        let thread_work = work.clone();
        let thread_handlers = Arc::clone(&handlers);
        let spawned = thread::Builder::new()
            .name("linkflow-worker".into())
            .spawn(move || {
                for (flags, data) in &thread_work {
                    run_pipeline(flags, data, &thread_handlers);
                }
            });
        match spawned {
            Ok(handle) => {
                *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
                    Some(handle);
            }
            Err(_) => {
                for (flags, data) in &work {
                    run_pipeline(flags, data, &handlers);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LinkGraphSchedule
// ---------------------------------------------------------------------------

/// Queue of components awaiting recalculation plus the jobs in flight.
pub struct LinkGraphSchedule {
    class: CargoClass,
    queue: VecDeque<GraphId>,
    running: VecDeque<LinkGraphJob>,
    handlers: Arc<Vec<Box<dyn Handler>>>,
}

impl std::fmt::Debug for LinkGraphSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkGraphSchedule")
            .field("class", &self.class)
            .field("queue", &self.queue)
            .field("running", &self.running.len())
            .finish()
    }
}

impl LinkGraphSchedule {
    pub fn new(class: CargoClass) -> Self {
        let handlers: Vec<Box<dyn Handler>> = vec![
            Box::new(DemandHandler),
            Box::new(MultiCommodityFlow),
            Box::new(FlowMapper),
        ];
        Self {
            class,
            queue: VecDeque::new(),
            running: VecDeque::new(),
            handlers: Arc::new(handlers),
        }
    }

    pub fn queue_graph(&mut self, graph: GraphId) {
        if !self.queue.contains(&graph) {
            self.queue.push_back(graph);
        }
    }

    /// Forget a destroyed or merged-away component: drop it from the queue
    /// and abort any job still computing over its stale snapshot.
    pub fn unqueue_graph(&mut self, graph: GraphId) {
        self.queue.retain(|&g| g != graph);
        for job in &self.running {
            if job.graph_id() == graph {
                job.abort();
            }
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// Component handles that would need requeueing on a reload: the
    /// waiting queue plus the components of in-flight jobs.
    pub fn persistable_queue(&self) -> Vec<GraphId> {
        self.queue
            .iter()
            .copied()
            .chain(self.running.iter().map(|j| j.graph_id()))
            .collect()
    }

    pub fn restore_queue(&mut self, queue: Vec<GraphId>) {
        self.queue = queue.into();
    }

    /// Take the next queued component and start a job over it. Components
    /// destroyed while queued are dropped; single-node components go to
    /// the back of the queue until they grow a link partner.
    pub fn spawn_next(&mut self, graphs: &SlotMap<GraphId, LinkGraph>, now: Ticks) {
        let Some(graph_id) = self.queue.pop_front() else {
            return;
        };
        let Some(graph) = graphs.get(graph_id) else {
            return;
        };
        if graph.node_count() < 2 {
            self.queue.push_back(graph_id);
            return;
        }

        let nodes = graph.node_count();
        let mut job = LinkGraphJob::new(
            graph_id,
            graph,
            self.class,
            duration_multiplier(nodes),
            now,
        );
        if job_cost(nodes) <= INLINE_COST_THRESHOLD {
            let (flags, data) = job.work_handles();
            run_pipeline(&flags, &data, &self.handlers);
        } else {
            JobGroup::spawn(
                std::slice::from_mut(&mut job),
                Arc::clone(&self.handlers),
            );
        }
        self.running.push_back(job);
    }

    /// Drain the whole queue into worker groups at once, packing jobs into
    /// threads up to a cost budget. Used on load, when every component's
    /// results are missing at the same time.
    pub fn spawn_all(&mut self, graphs: &SlotMap<GraphId, LinkGraph>, now: Ticks) {
        let mut jobs: Vec<LinkGraphJob> = Vec::new();
        let mut costs: Vec<u64> = Vec::new();
        let mut requeue: Vec<GraphId> = Vec::new();
        while let Some(graph_id) = self.queue.pop_front() {
            let Some(graph) = graphs.get(graph_id) else {
                continue;
            };
            if graph.node_count() < 2 {
                requeue.push(graph_id);
                continue;
            }
            let nodes = graph.node_count();
            jobs.push(LinkGraphJob::new(
                graph_id,
                graph,
                self.class,
                duration_multiplier(nodes),
                now,
            ));
            costs.push(job_cost(nodes));
        }
        self.queue.extend(requeue);

        let mut start = 0;
        let mut budget = 0u64;
        for i in 0..jobs.len() {
            if budget > 0 && budget + costs[i] > GROUP_COST_BUDGET {
                JobGroup::spawn(&mut jobs[start..i], Arc::clone(&self.handlers));
                start = i;
                budget = 0;
            }
            budget += costs[i];
        }
        JobGroup::spawn(&mut jobs[start..], Arc::clone(&self.handlers));
        self.running.extend(jobs);
    }

    /// Whether the oldest running job reached its join tick without its
    /// worker having finished, i.e. whether joining now would block.
    pub fn is_join_with_unfinished_job_due(&self, now: Ticks) -> bool {
        self.running
            .front()
            .is_some_and(|job| job.is_due(now) && !job.is_finished())
    }

    /// Join and reconcile the oldest running job if it is due, blocking on
    /// its worker when necessary, then requeue its component unless it was
    /// destroyed or merged away in the meantime.
    pub fn join_next(
        &mut self,
        graphs: &SlotMap<GraphId, LinkGraph>,
        stations: &mut SlotMap<StationId, Station>,
        now: Ticks,
    ) {
        if !self.running.front().is_some_and(|job| job.is_due(now)) {
            return;
        }
        let Some(job) = self.running.pop_front() else {
            return;
        };
        finalise_job(graphs, stations, &job);
        if graphs.contains_key(job.graph_id()) {
            self.queue_graph(job.graph_id());
        }
    }

    /// Abort everything in flight and join the workers. Queued components
    /// stay queued.
    pub fn abort_all(&mut self) {
        for job in &self.running {
            job.abort();
        }
        for job in &self.running {
            job.join_thread();
        }
    }

    pub fn shift_dates(&mut self, delta: i64) {
        for job in &mut self.running {
            job.shift_dates(delta);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
