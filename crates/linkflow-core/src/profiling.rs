//! Timing instrumentation for distribution jobs.
//!
//! Workers record one [`StageSample`] per pipeline stage into a global
//! registry; [`JobProfile`] aggregates them per stage. Recording is only
//! wired up when the `profiling` feature is enabled, but the types are
//! always available.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One timed pipeline stage run.
#[derive(Debug, Clone)]
pub struct StageSample {
    pub stage: &'static str,
    pub elapsed: Duration,
}

static SAMPLES: Mutex<Vec<StageSample>> = Mutex::new(Vec::new());

/// Times one stage from construction to [`StageTimer::finish`].
#[derive(Debug)]
pub struct StageTimer {
    stage: &'static str,
    start: Instant,
}

impl StageTimer {
    pub fn start(stage: &'static str) -> Self {
        Self {
            stage,
            start: Instant::now(),
        }
    }

    /// Record the elapsed time into the global registry.
    pub fn finish(self) {
        let sample = StageSample {
            stage: self.stage,
            elapsed: self.start.elapsed(),
        };
        SAMPLES
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(sample);
    }
}

/// Take all recorded samples, leaving the registry empty.
pub fn drain_samples() -> Vec<StageSample> {
    std::mem::take(
        &mut *SAMPLES
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()),
    )
}

/// Per-stage timing aggregated over a batch of samples.
#[derive(Debug, Clone, Default)]
pub struct JobProfile {
    pub demand: Duration,
    pub mcf: Duration,
    pub mapper: Duration,
    pub total: Duration,
}

impl JobProfile {
    pub fn from_samples(samples: &[StageSample]) -> Self {
        let mut profile = Self::default();
        for sample in samples {
            match sample.stage {
                "demand" => profile.demand += sample.elapsed,
                "mcf" => profile.mcf += sample.elapsed,
                "mapper" => profile.mapper += sample.elapsed,
                _ => {}
            }
            profile.total += sample.elapsed;
        }
        profile
    }

    /// Name and duration of the slowest stage.
    pub fn bottleneck_stage(&self) -> (&'static str, Duration) {
        let stages = [
            ("demand", self.demand),
            ("mcf", self.mcf),
            ("mapper", self.mapper),
        ];
        stages
            .into_iter()
            .max_by_key(|(_, d)| *d)
            .unwrap_or(("demand", Duration::ZERO))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
