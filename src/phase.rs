//! Phase contract (C1) and the two built-in phases (C6).

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::context::RunContext;
use crate::termination::{Fault, RunError, TerminationStatus};

/// Member of the run-state enumeration a phase occupies while it runs.
///
/// The original spec names `NONE, CREATED, EXECUTING, ENDED` as the minimum
/// set; this enum matches that and leaves room for callers to model
/// additional states by wrapping rather than extending this type (see the
/// capability-set design note in §9 of the spec).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    None,
    Created,
    Executing,
    Ended,
}

/// Value snapshot of a Phase's identity, produced on demand for observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseInfo {
    pub id: String,
    pub r#type: String,
    pub run_state: RunState,
    pub name: Option<String>,
    pub protection_id: Option<String>,
    pub last_protected_phase: Option<String>,
}

/// Outcome of a completed `Phase::run` call, classified per the exception
/// table in §4.4.1 of the spec. Phase-signalled outcomes (`Terminated`) are
/// not errors — they are domain signals the Phaser converts into
/// termination without re-raising.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    /// The phase ran to completion; the Phaser advances to the next phase.
    Advanced,
    /// The phase signalled `terminate-run(status)`.
    Terminated(TerminationStatus),
    /// The phase signalled `failed-run(fault)`.
    Failed(Fault),
}

/// An exceptional condition from `Phase::run` that the Phaser must re-raise
/// after recording termination — the "any other unexpected error",
/// "user interrupt", and "process-exit" rows of the §4.4.1 table.
#[derive(Debug)]
pub enum PhaseRunException {
    /// Any other unexpected error: recorded as `ERROR`, re-raised.
    Unexpected(RunError),
    /// A user interrupt signal: recorded as `INTERRUPTED`, re-raised, and
    /// `phase.stop()` is called before re-raising.
    Interrupted,
    /// A process-exit signal with the given code: `COMPLETED` if `0` else
    /// `FAILED`, re-raised.
    ProcessExit(i32),
}

impl std::fmt::Display for PhaseRunException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseRunException::Unexpected(e) => write!(f, "{}: {}", e.category, e.message),
            PhaseRunException::Interrupted => write!(f, "interrupted"),
            PhaseRunException::ProcessExit(c) => write!(f, "process exit with code {}", c),
        }
    }
}

impl std::error::Error for PhaseRunException {}

/// Abstract unit of work with id/type/run-state/stop-status and a
/// `run(ctx)`/`stop()` pair.
///
/// `run` must not block forever without periodically checking for a
/// cooperative stop; the contract between `stop` and `run` is
/// phase-specific. `stop` is a best-effort asynchronous nudge that may be
/// called from another thread while `run` is in progress, and must be
/// idempotent and safe after `run` has already returned.
pub trait Phase: Send + Sync {
    fn id(&self) -> &str;
    fn phase_type(&self) -> &str;
    fn run_state(&self) -> RunState;
    fn name(&self) -> Option<&str> {
        None
    }
    fn protection_id(&self) -> Option<&str> {
        None
    }
    fn last_protected_phase(&self) -> Option<&str> {
        None
    }
    fn stop_status(&self) -> TerminationStatus;

    /// True only for the Phaser's own built-in `InitPhase` sentinel, never
    /// for a user-defined phase — even one that reuses its id/type. Used by
    /// `Phaser::stop` to decide whether the run has progressed past Init.
    fn is_init_phase(&self) -> bool {
        false
    }

    fn info(&self) -> PhaseInfo {
        PhaseInfo {
            id: self.id().to_string(),
            r#type: self.phase_type().to_string(),
            run_state: self.run_state(),
            name: self.name().map(str::to_string),
            protection_id: self.protection_id().map(str::to_string),
            last_protected_phase: self.last_protected_phase().map(str::to_string),
        }
    }

    /// Run the phase to completion, or raise one of the `PhaseRunException`
    /// signals. Normal / `Terminated` / `Failed` returns go through
    /// `Ok(PhaseOutcome)`.
    fn run(&self, ctx: &RunContext) -> Result<PhaseOutcome, PhaseRunException>;

    /// Best-effort asynchronous nudge. May be called from another thread
    /// while `run` is in progress; must be idempotent and safe after `run`
    /// has already returned.
    fn stop(&self);
}

/// No-op phase marking pre-start.
pub struct InitPhase;

impl InitPhase {
    pub const ID: &'static str = "Init";
    pub const TYPE: &'static str = "INIT";
}

impl Phase for InitPhase {
    fn id(&self) -> &str {
        Self::ID
    }
    fn phase_type(&self) -> &str {
        Self::TYPE
    }
    fn run_state(&self) -> RunState {
        RunState::Created
    }
    fn stop_status(&self) -> TerminationStatus {
        TerminationStatus::Stopped
    }
    fn is_init_phase(&self) -> bool {
        true
    }
    fn run(&self, _ctx: &RunContext) -> Result<PhaseOutcome, PhaseRunException> {
        Ok(PhaseOutcome::Advanced)
    }
    fn stop(&self) {}
}

/// No-op phase marking post-end.
pub struct TerminalPhase;

impl TerminalPhase {
    pub const ID: &'static str = "term";
    pub const TYPE: &'static str = "TERMINAL";
}

impl Phase for TerminalPhase {
    fn id(&self) -> &str {
        Self::ID
    }
    fn phase_type(&self) -> &str {
        Self::TYPE
    }
    fn run_state(&self) -> RunState {
        RunState::Ended
    }
    fn stop_status(&self) -> TerminationStatus {
        TerminationStatus::None
    }
    fn run(&self, _ctx: &RunContext) -> Result<PhaseOutcome, PhaseRunException> {
        Ok(PhaseOutcome::Advanced)
    }
    fn stop(&self) {}
}

/// Decorates any phase with an additional `wait(timeout)` that completes as
/// soon as the wrapped phase's `run` has been entered.
///
/// Used by tests and coordinators that must synchronize with phase entry.
/// Grounded in the original's `WaitWrapperPhase`, which uses a one-shot
/// `Event` independent of the Phaser's transition lock.
pub struct WaitWrapper<P: Phase> {
    wrapped: P,
    entered: Arc<(Mutex<bool>, Condvar)>,
}

impl<P: Phase> WaitWrapper<P> {
    pub fn new(wrapped: P) -> Self {
        Self {
            wrapped,
            entered: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Blocks until the wrapped phase's `run` has been entered, or the
    /// timeout elapses. Returns whether entry was observed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.entered;
        let guard = lock.lock().unwrap();
        if *guard {
            return true;
        }
        let (_guard, result) = cvar.wait_timeout_while(guard, timeout, |e| !*e).unwrap();
        !result.timed_out()
    }
}

impl<P: Phase> Phase for WaitWrapper<P> {
    fn id(&self) -> &str {
        self.wrapped.id()
    }
    fn phase_type(&self) -> &str {
        self.wrapped.phase_type()
    }
    fn run_state(&self) -> RunState {
        self.wrapped.run_state()
    }
    fn name(&self) -> Option<&str> {
        self.wrapped.name()
    }
    fn protection_id(&self) -> Option<&str> {
        self.wrapped.protection_id()
    }
    fn last_protected_phase(&self) -> Option<&str> {
        self.wrapped.last_protected_phase()
    }
    fn stop_status(&self) -> TerminationStatus {
        self.wrapped.stop_status()
    }
    fn is_init_phase(&self) -> bool {
        self.wrapped.is_init_phase()
    }
    fn run(&self, ctx: &RunContext) -> Result<PhaseOutcome, PhaseRunException> {
        {
            let (lock, cvar) = &*self.entered;
            let mut guard = lock.lock().unwrap();
            *guard = true;
            cvar.notify_all();
        }
        self.wrapped.run(ctx)
    }
    fn stop(&self) {
        self.wrapped.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;

    #[test]
    fn init_phase_identity() {
        let p = InitPhase;
        assert_eq!(p.id(), "Init");
        assert_eq!(p.phase_type(), "INIT");
        assert_eq!(p.run_state(), RunState::Created);
        assert_eq!(p.stop_status(), TerminationStatus::Stopped);
    }

    #[test]
    fn terminal_phase_identity() {
        let p = TerminalPhase;
        assert_eq!(p.id(), "term");
        assert_eq!(p.phase_type(), "TERMINAL");
        assert_eq!(p.run_state(), RunState::Ended);
        assert_eq!(p.stop_status(), TerminationStatus::None);
    }

    #[test]
    fn wait_wrapper_unblocks_on_entry() {
        let wrapper = Arc::new(WaitWrapper::new(InitPhase));
        let w2 = Arc::clone(&wrapper);
        let handle = std::thread::spawn(move || {
            let ctx = RunContext::detached();
            w2.run(&ctx).unwrap();
        });
        assert!(wrapper.wait(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn wait_wrapper_times_out_without_entry() {
        let wrapper = WaitWrapper::new(InitPhase);
        assert!(!wrapper.wait(Duration::from_millis(20)));
    }
}
