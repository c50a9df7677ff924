//! Flow mapper: the last pipeline stage.
//!
//! Folds the solver's path forest into per-node [`FlowStatMap`] share
//! tables, the only artifact that survives the job. Each flow-carrying leg
//! registered at a node becomes one share there: cargo from the leg's
//! origin station continues via the leg's end station. Amounts are divided
//! by the job's duration multiplier (rounding up, so no planned route
//! vanishes) to keep shares per-period comparable across job lengths.

use crate::id::NodeId;
use crate::job::{Handler, JobGraph};

#[derive(Debug, Default)]
pub struct FlowMapper;

impl Handler for FlowMapper {
    fn name(&self) -> &'static str {
        "mapper"
    }

    fn run(&self, job: &mut JobGraph) {
        let multiplier = job.duration_multiplier() as u64;
        for i in 0..job.node_count() {
            let node = NodeId(i as u16);
            let legs = std::mem::take(&mut job.annotation_mut(node).paths);
            for &leg in &legs {
                let link = job.forest().link(leg);
                debug_assert!(link.flow > 0, "only flow-carrying legs are registered");
                let amount = (link.flow as u64).div_ceil(multiplier).min(u32::MAX as u64) as u32;
                let origin = job.node(link.origin).station;
                let via = job.node(link.node).station;
                job.annotation_mut(node).flows.add_share(origin, via, amount, false);
            }
            job.annotation_mut(node).paths = legs;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
