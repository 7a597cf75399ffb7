//! Lifecycle (C2): append-only log of phase-runs, mutated only by the
//! Phaser under its transition lock.

use chrono::{DateTime, Utc};

use crate::phase::RunState;

/// A single traversal record, created each time the Phaser transitions to a
/// new phase.
#[derive(Clone, Debug, PartialEq)]
pub struct PhaseRun {
    pub phase_id: String,
    pub run_state: RunState,
    pub started_at: DateTime<Utc>,
}

impl PhaseRun {
    pub fn new(phase_id: impl Into<String>, run_state: RunState, started_at: DateTime<Utc>) -> Self {
        Self {
            phase_id: phase_id.into(),
            run_state,
            started_at,
        }
    }
}

/// Ordered, append-only sequence of `PhaseRun` entries.
///
/// Copies are independent: appending to the original after a copy was taken
/// never mutates the copy (`Vec::clone` already gives us this; kept
/// explicit here because callers rely on it for hook snapshotting).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Lifecycle {
    runs: Vec<PhaseRun>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self { runs: Vec::new() }
    }

    pub fn add_phase_run(&mut self, run: PhaseRun) {
        self.runs.push(run);
    }

    pub fn phase_runs(&self) -> &[PhaseRun] {
        &self.runs
    }

    pub fn phase_count(&self) -> usize {
        self.runs.len()
    }

    pub fn current_run(&self) -> Option<&PhaseRun> {
        self.runs.last()
    }

    pub fn previous_run(&self) -> Option<&PhaseRun> {
        if self.runs.len() < 2 {
            None
        } else {
            self.runs.get(self.runs.len() - 2)
        }
    }
}
