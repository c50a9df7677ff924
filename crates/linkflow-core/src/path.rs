//! The flow-assignment primitive: an arena-allocated forest of path legs.
//!
//! Every leg has zero or one parent; roots carry the [`INVALID_PATH`]
//! sentinel. A leg inherits capacity and free capacity as the minimum over
//! all its ancestors and accumulates distance, so a tree of alternative
//! routes can share trunk legs without recomputing trunk totals.
//!
//! [`PathForest::add_flow`] pushes flow in two phases: clamp-and-recurse to
//! the root first, commit on the way back down. An edge's counted flow can
//! therefore never exceed what every ancestor edge also carries, which is
//! what keeps flow conserved along the whole path rather than just locally.
//!
//! Legs are uniformly sized and short-lived (one job run), so they live in
//! a plain `Vec` arena with an index free list and are discarded wholesale
//! with the job.

use crate::id::NodeId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Sentinel index for "no path".
pub const INVALID_PATH: PathIndex = u32::MAX;

/// Multiplier of the capacity-ratio heuristic.
const CAP_RATIO_MULTIPLIER: i64 = 16;

/// Clamp bounds chosen so `clamped * CAP_RATIO_MULTIPLIER` cannot overflow.
const CAP_RATIO_MIN: i64 = i32::MIN as i64;
const CAP_RATIO_MAX: i64 = i32::MAX as i64;

pub type PathIndex = u32;

// ---------------------------------------------------------------------------
// Capacity ratio
// ---------------------------------------------------------------------------

/// Free capacity expressed per unit of total capacity, comparable across
/// wildly different path scales without fractional arithmetic:
/// `clamp(free, MIN, MAX) * 16 / max(total, 1)`.
pub fn capacity_ratio(free_capacity: i64, total_capacity: u32) -> i64 {
    free_capacity.clamp(CAP_RATIO_MIN, CAP_RATIO_MAX) * CAP_RATIO_MULTIPLIER
        / (total_capacity.max(1) as i64)
}

// ---------------------------------------------------------------------------
// Edge access seam
// ---------------------------------------------------------------------------

/// The annotated-edge view `add_flow` operates through. Implemented by the
/// job snapshot; tests substitute a toy map.
pub trait FlowEdges {
    /// Capacity of the annotated edge `from -> to`.
    fn capacity(&self, from: NodeId, to: NodeId) -> u32;
    /// Flow already counted on the annotated edge.
    fn flow(&self, from: NodeId, to: NodeId) -> u32;
    /// Commit flow onto the annotated edge.
    fn add_flow(&mut self, from: NodeId, to: NodeId, amount: u32);
    /// Record that `path` now carries nonzero flow out of `node`.
    fn register_path(&mut self, node: NodeId, path: PathIndex);
}

// ---------------------------------------------------------------------------
// Path links
// ---------------------------------------------------------------------------

/// One leg of a flow assignment.
#[derive(Debug, Clone)]
pub struct PathLink {
    /// Node this leg ends at.
    pub node: NodeId,
    /// Root node of the whole path.
    pub origin: NodeId,
    /// Cumulative distance/cost from the root.
    pub distance: u32,
    /// `min` capacity over all ancestor legs.
    pub capacity: u32,
    /// `min` free capacity over all ancestor legs. Signed: the overload
    /// pass may drive it negative.
    pub free_capacity: i64,
    /// Flow committed along this leg.
    pub flow: u32,
    /// Parent leg, or [`INVALID_PATH`] for roots.
    pub parent: PathIndex,
    /// Number of legs whose parent is this leg.
    pub num_children: u32,
    /// Set while the leg sits on the free list, so pruning a chain that
    /// was already recycled through another descendant is harmless.
    pub flag: bool,
}

/// Arena of path legs with an index free list.
#[derive(Debug, Default)]
pub struct PathForest {
    links: Vec<PathLink>,
    free: Vec<PathIndex>,
}

impl PathForest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.links.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn link(&self, idx: PathIndex) -> &PathLink {
        &self.links[idx as usize]
    }

    pub fn link_mut(&mut self, idx: PathIndex) -> &mut PathLink {
        &mut self.links[idx as usize]
    }

    /// Allocate a fresh leg at `node`. Source legs start with unlimited
    /// capacity so the first fork takes the edge's own limits; non-source
    /// legs start worse than any real candidate so the first comparison
    /// always improves them.
    pub fn alloc(&mut self, node: NodeId, source: bool) -> PathIndex {
        let link = PathLink {
            node,
            origin: node,
            distance: if source { 0 } else { u32::MAX },
            capacity: if source { u32::MAX } else { 0 },
            free_capacity: if source { i64::MAX } else { i64::MIN },
            flow: 0,
            parent: INVALID_PATH,
            num_children: 0,
            flag: false,
        };
        match self.free.pop() {
            Some(idx) => {
                self.links[idx as usize] = link;
                idx
            }
            None => {
                self.links.push(link);
                (self.links.len() - 1) as PathIndex
            }
        }
    }

    /// Re-parent `child` under `base`, inheriting `min` capacity and free
    /// capacity and accumulating distance. Detaching from a previous parent
    /// decrements that parent's child count.
    ///
    /// Forking a path onto itself is a contract violation.
    pub fn fork(
        &mut self,
        child: PathIndex,
        base: PathIndex,
        capacity: u32,
        free_capacity: i64,
        distance: u32,
    ) {
        assert!(child != base, "cannot fork a path onto itself");
        let (base_cap, base_free, base_dist, base_origin) = {
            let b = &self.links[base as usize];
            (b.capacity, b.free_capacity, b.distance, b.origin)
        };
        let old_parent = self.links[child as usize].parent;
        if old_parent != base {
            if old_parent != INVALID_PATH {
                self.links[old_parent as usize].num_children -= 1;
            }
            self.links[base as usize].num_children += 1;
            self.links[child as usize].parent = base;
        }
        let c = &mut self.links[child as usize];
        c.capacity = base_cap.min(capacity);
        c.free_capacity = base_free.min(free_capacity);
        c.distance = base_dist.saturating_add(distance);
        c.origin = base_origin;
    }

    /// Push up to `amount` of flow along the path ending at `idx`.
    ///
    /// Phase up: clamp to this leg's edge allowance under `max_saturation`
    /// (`usable = capacity * max_saturation / 100`, only enforced for a
    /// finite cap), then recurse to the parent — flow cannot be committed
    /// to a leg whose ancestor cannot also carry it. Phase down: register
    /// the leg in its source node's path list on first flow and count the
    /// flow on the edge. Returns the amount actually pushed.
    pub fn add_flow(
        &mut self,
        idx: PathIndex,
        amount: u32,
        edges: &mut impl FlowEdges,
        max_saturation: Option<u16>,
    ) -> u32 {
        let parent = self.links[idx as usize].parent;
        let mut amount = amount;
        if parent != INVALID_PATH {
            let from = self.links[parent as usize].node;
            let to = self.links[idx as usize].node;
            if let Some(saturation) = max_saturation {
                let usable =
                    (edges.capacity(from, to) as u64 * saturation as u64 / 100) as u32;
                let committed = edges.flow(from, to);
                if usable <= committed {
                    return 0;
                }
                amount = amount.min(usable - committed);
            }
            amount = self.add_flow(parent, amount, edges, max_saturation);
            if amount > 0 {
                if self.links[idx as usize].flow == 0 {
                    edges.register_path(from, idx);
                }
                edges.add_flow(from, to, amount);
            }
        }
        let link = &mut self.links[idx as usize];
        link.flow = link.flow.saturating_add(amount);
        link.free_capacity -= amount as i64;
        amount
    }

    /// Recycle the chain starting at `idx` as long as each leg carries no
    /// flow and has no children, walking detached parents upward. Legs with
    /// flow stay alive until the whole forest is dropped with the job.
    ///
    /// Idempotent: legs already recycled (through another descendant's
    /// prune, say) are skipped.
    pub fn prune(&mut self, mut idx: PathIndex) {
        while idx != INVALID_PATH {
            let link = &mut self.links[idx as usize];
            if link.flag || link.flow != 0 || link.num_children != 0 {
                return;
            }
            link.flag = true;
            let parent = link.parent;
            if parent != INVALID_PATH {
                self.links[parent as usize].num_children -= 1;
            }
            self.free.push(idx);
            idx = parent;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
