//! Per-phase timing of the bond manager tick.
//!
//! A manager tick runs up to four phases in a fixed order: the broken-bond
//! sweep every tick, then on check ticks the hash rebuild, the candidate
//! search and the greedy commit. [`TickProfiler`] accumulates wall time per
//! phase plus the number of candidates scored, so the report can show cost
//! per candidate as the population grows.
//!
//! On by default with the `profile` feature:
//! ```bash
//! cargo test --release --features profile
//! ```
//! or at runtime with `DynamicBondManager::set_profiling(true)`.

use std::fmt::Write;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TickPhase {
    BrokenSweep,
    SpatialHash,
    CandidateSearch,
    Commit,
}

impl TickPhase {
    /// Execution order within a tick.
    pub const ALL: [TickPhase; 4] = [
        TickPhase::BrokenSweep,
        TickPhase::SpatialHash,
        TickPhase::CandidateSearch,
        TickPhase::Commit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TickPhase::BrokenSweep => "broken_sweep",
            TickPhase::SpatialHash => "spatial_hash",
            TickPhase::CandidateSearch => "candidate_search",
            TickPhase::Commit => "commit",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PhaseStats {
    pub total: Duration,
    pub runs: u64,
    pub slowest: Duration,
}

impl PhaseStats {
    pub fn mean(&self) -> Duration {
        match self.runs {
            0 => Duration::ZERO,
            n => self.total / n as u32,
        }
    }
}

/// Wall time per [`TickPhase`], with tick and candidate counters.
#[derive(Debug, Default, Clone)]
pub struct TickProfiler {
    phases: [PhaseStats; 4],
    running: Option<(TickPhase, Instant)>,
    ticks: u64,
    candidates_scored: u64,
}

impl TickProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the clock for `phase`. A phase still running is discarded.
    pub fn start(&mut self, phase: TickPhase) {
        self.running = Some((phase, Instant::now()));
    }

    pub fn stop(&mut self) {
        if let Some((phase, started)) = self.running.take() {
            self.record(phase, started.elapsed());
        }
    }

    pub fn record(&mut self, phase: TickPhase, elapsed: Duration) {
        let stats = &mut self.phases[phase.index()];
        stats.total += elapsed;
        stats.runs += 1;
        stats.slowest = stats.slowest.max(elapsed);
    }

    /// Close a manager tick that scored `candidates` site pairs.
    pub fn finish_tick(&mut self, candidates: usize) {
        self.ticks += 1;
        self.candidates_scored += candidates as u64;
    }

    pub fn phase(&self, phase: TickPhase) -> &PhaseStats {
        &self.phases[phase.index()]
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn candidates_scored(&self) -> u64 {
        self.candidates_scored
    }

    /// Time spent across all phases.
    pub fn total(&self) -> Duration {
        self.phases.iter().map(|s| s.total).sum()
    }

    /// One line per phase in tick order, then per-tick and per-candidate cost.
    pub fn report(&self) -> String {
        let total = self.total();
        let mut out = String::new();
        let _ = writeln!(out, "bond manager: {} ticks, {} candidates scored", self.ticks, self.candidates_scored);
        for phase in TickPhase::ALL {
            let stats = self.phase(phase);
            let share = if total.is_zero() {
                0.0
            } else {
                stats.total.as_secs_f64() / total.as_secs_f64() * 100.0
            };
            let _ = writeln!(
                out,
                "  {:<17} {:>5} runs  mean {:>9.2?}  slowest {:>9.2?}  {:>5.1}%",
                phase.name(),
                stats.runs,
                stats.mean(),
                stats.slowest,
                share
            );
        }
        if self.ticks > 0 {
            let _ = write!(out, "  per tick {:.2?}", total.div_f64(self.ticks as f64));
        }
        if self.candidates_scored > 0 {
            let scoring = self.phase(TickPhase::CandidateSearch).total;
            let _ = write!(out, "  per candidate {:.2?}", scoring.div_f64(self.candidates_scored as f64));
        }
        out
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
