//! phase-golem: a phased job runner.
//!
//! A `Phaser` drives a job through an ordered list of named phases,
//! recording a lifecycle of phase-runs and producing one terminal
//! `TerminationInfo` at the end. An `OutputToTask` adapter parses a phase's
//! output lines into a hierarchical task/operation tracker.

pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod log;
pub mod output_task;
pub mod phase;
pub mod phaser;
pub mod termination;
pub mod tracker;

pub use context::{LogSeverity, OutputHook, RunContext};
pub use error::PhaserError;
pub use lifecycle::{Lifecycle, PhaseRun};
pub use output_task::{Field, FieldValue, OutputToTask, Parser};
pub use phase::{InitPhase, Phase, PhaseInfo, PhaseOutcome, PhaseRunException, RunState, TerminalPhase, WaitWrapper};
pub use phaser::{Phaser, RunFailure, TransitionHook};
pub use termination::{Fault, Run, RunError, TerminationInfo, TerminationStatus};
pub use tracker::{Operation, Task, TaskTracker, Value};
