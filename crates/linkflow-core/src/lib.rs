//! Linkflow Core -- cargo distribution over observed transport links.
//!
//! This crate maintains per-cargo graphs of station-to-station link
//! statistics, periodically recomputes how cargo should flow over them in
//! background jobs, and folds the results back into per-station routing
//! tables that vehicles consult one hop at a time.
//!
//! # Recalculation Cycle
//!
//! Each call to [`network::Network::step`] advances the clock by one tick.
//! Once per simulated day the scheduler takes one connected component off
//! its queue, snapshots it into a job and starts the three-stage pipeline
//! over the private copy:
//!
//! 1. **Demand** -- Pair supply with demand into a pairwise demand matrix.
//! 2. **Solver** -- Route the demand over annotated edges along a path
//!    forest, respecting the saturation cap where possible.
//! 3. **Mapper** -- Fold the forest into per-station flow shares.
//!
//! When a job's interval elapses it is joined (blocking if the worker is
//! still running) and reconciled against the live world, which kept
//! mutating in the meantime.
//!
//! # Key Types
//!
//! - [`network::Network`] -- The live world: stations, components, clock
//!   and schedule for one cargo.
//! - [`graph::LinkGraph`] -- One connected component of decaying link
//!   statistics.
//! - [`job::LinkGraphJob`] -- A scheduled run over a private snapshot,
//!   with lock-free lifecycle flags.
//! - [`path::PathForest`] -- The arena-allocated flow-assignment
//!   primitive.
//! - [`flows::FlowStatMap`] -- Per-station routing shares, keyed by cargo
//!   origin.
//! - [`scheduler::LinkGraphSchedule`] -- Round-robin of components and
//!   in-flight jobs, with worker-thread job groups.
//! - [`serialize`] -- Versioned snapshot support via bitcode.

pub mod demand;
pub mod flows;
pub mod graph;
pub mod id;
pub mod job;
pub mod mapper;
pub mod mcf;
pub mod merge;
pub mod network;
pub mod path;
pub mod profiling;
pub mod scheduler;
pub mod serialize;
pub mod settings;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
