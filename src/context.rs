//! RunContext (C3): handed to each phase at `run` entry.
//!
//! Factored out of the Phaser's `run` loop as a small value object holding
//! back-references to the phase's identity and the Phaser's output hook, per
//! the "Nested RunContext class" design note in §9 of the spec — the source
//! defines this type inline inside `Phaser.run`; here it is a standalone
//! struct whose only behavior is delegation.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::log_warn;
use crate::phase::PhaseInfo;
use crate::tracker::TaskTracker;

/// Callable `(phase_info, line, is_err) -> void` satisfied by the bundled
/// Output→Task adapter, or any other observer.
pub type OutputHook = Arc<dyn Fn(&PhaseInfo, &str, bool) + Send + Sync>;

/// Log severities recognized by `RunContext::create_logging_handler`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogSeverity {
    Debug,
    Info,
    Warn,
    Error,
}

/// A handle bound to a specific phase. Exposes the shared task tracker (if
/// any), a way to forward output lines through the Phaser's output hook, and
/// a logging handler that routes formatted records through the same path.
///
/// A phase must not retain a `RunContext` past its own `run` return.
pub struct RunContext {
    phase_info: PhaseInfo,
    task_tracker: Option<Arc<TaskTracker>>,
    output_hook: Option<OutputHook>,
}

impl RunContext {
    pub fn new(
        phase_info: PhaseInfo,
        task_tracker: Option<Arc<TaskTracker>>,
        output_hook: Option<OutputHook>,
    ) -> Self {
        Self {
            phase_info,
            task_tracker,
            output_hook,
        }
    }

    /// A context with no tracker and no output hook — for phases that don't
    /// need either (tests, trivial phases).
    pub fn detached() -> Self {
        Self {
            phase_info: PhaseInfo {
                id: String::new(),
                r#type: String::new(),
                run_state: crate::phase::RunState::None,
                name: None,
                protection_id: None,
                last_protected_phase: None,
            },
            task_tracker: None,
            output_hook: None,
        }
    }

    pub fn task_tracker(&self) -> Option<&Arc<TaskTracker>> {
        self.task_tracker.as_ref()
    }

    /// Forward a line to the Phaser's output hook, tagged with the current
    /// phase's identity. No-op if no hook is installed. The hook is
    /// sandboxed: a panic inside it is caught and discarded so it can never
    /// be misclassified as the phase's own unexpected error (§4.4.2/§7).
    pub fn new_output(&self, line: &str, is_err: bool) {
        if let Some(hook) = &self.output_hook {
            let result = panic::catch_unwind(AssertUnwindSafe(|| hook(&self.phase_info, line, is_err)));
            if result.is_err() {
                log_warn!("Warning: output hook panicked; ignoring");
            }
        }
    }

    /// Returns a log sink that forwards formatted records through
    /// `new_output`, with `is_err = (severity >= Error)`.
    pub fn create_logging_handler(&self) -> LoggingHandler<'_> {
        LoggingHandler { ctx: self }
    }
}

/// Log sink bound to a `RunContext`, returned by `create_logging_handler`.
pub struct LoggingHandler<'a> {
    ctx: &'a RunContext,
}

impl LoggingHandler<'_> {
    pub fn emit(&self, severity: LogSeverity, message: &str) {
        self.ctx.new_output(message, severity >= LogSeverity::Error);
    }

    pub fn debug(&self, message: &str) {
        self.emit(LogSeverity::Debug, message);
    }
    pub fn info(&self, message: &str) {
        self.emit(LogSeverity::Info, message);
    }
    pub fn warn(&self, message: &str) {
        self.emit(LogSeverity::Warn, message);
    }
    pub fn error(&self, message: &str) {
        self.emit(LogSeverity::Error, message);
    }
}
