//! Phaser (C4): the state machine that owns the phase sequence, the run
//! lifecycle, the transition lock, and the termination decision.
//!
//! Concurrency model per §5: a single transition lock (mutex + condvar)
//! guards `current_phase`, `lifecycle`, `stop_status`, `abort`, and
//! `termination`. The lock is held only for O(1) bookkeeping — it must
//! never be held across a call to `phase.run` or `phase.stop`. Grounded in
//! `phase-golem`'s `agent.rs` process registry, which uses the same
//! "std::sync::Mutex guards fast state, long-running work happens outside
//! the lock" shape.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::context::{OutputHook, RunContext};
use crate::error::PhaserError;
use crate::lifecycle::{Lifecycle, PhaseRun};
use crate::phase::{InitPhase, Phase, PhaseInfo, PhaseOutcome, PhaseRunException, RunState, TerminalPhase};
use crate::termination::{Run, RunError, TerminationInfo, TerminationStatus};
use crate::tracker::TaskTracker;
use crate::log_warn;

/// Callable `(previous_run, current_run, phase_count) -> void`.
pub type TransitionHook =
    Arc<dyn Fn(Option<&PhaseRun>, Option<&PhaseRun>, usize) + Send + Sync>;

/// Callable `() -> timestamp`, injected for deterministic testing. Defaults
/// to UTC wall clock.
pub type TimestampSource = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// An exceptional outcome from `run`: either caller misuse (not primed) or
/// the re-raised phase exception per §4.4.1's "re-raised after terminating"
/// rows.
#[derive(Debug)]
pub enum RunFailure {
    NotPrimed,
    Phase(PhaseRunException),
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunFailure::NotPrimed => write!(f, "Prime not executed before run"),
            RunFailure::Phase(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RunFailure {}

struct PhaserState {
    lifecycle: Lifecycle,
    current_phase: Option<Arc<dyn Phase>>,
    stop_status: Option<TerminationStatus>,
    abort: bool,
    termination: Option<TerminationInfo>,
}

/// Orchestrator: primes, advances, classifies exceptions, records
/// termination, fires hooks, serves waiters.
pub struct Phaser {
    phases: Vec<Arc<dyn Phase>>,
    timestamp_generator: TimestampSource,
    transition_hook: Option<TransitionHook>,
    output_hook: Option<OutputHook>,
    state: Mutex<PhaserState>,
    condvar: Condvar,
}

impl Phaser {
    /// Builds a Phaser from an ordered phase list. Fails with
    /// `InvalidArgument` if two phases share an id.
    pub fn new(
        phases: Vec<Arc<dyn Phase>>,
        lifecycle: Option<Lifecycle>,
        timestamp_generator: Option<TimestampSource>,
    ) -> Result<Self, PhaserError> {
        let mut seen = std::collections::HashSet::new();
        for phase in &phases {
            if !seen.insert(phase.id().to_string()) {
                return Err(PhaserError::invalid_argument(format!(
                    "Duplicate phase found: {}",
                    phase.id()
                )));
            }
        }

        Ok(Self {
            phases,
            timestamp_generator: timestamp_generator.unwrap_or_else(|| Arc::new(Utc::now)),
            transition_hook: None,
            output_hook: None,
            state: Mutex::new(PhaserState {
                lifecycle: lifecycle.unwrap_or_default(),
                current_phase: None,
                stop_status: None,
                abort: false,
                termination: None,
            }),
            condvar: Condvar::new(),
        })
    }

    pub fn with_transition_hook(mut self, hook: TransitionHook) -> Self {
        self.transition_hook = Some(hook);
        self
    }

    pub fn with_output_hook(mut self, hook: OutputHook) -> Self {
        self.output_hook = Some(hook);
        self
    }

    fn term_info(&self, status: TerminationStatus) -> TerminationInfo {
        TerminationInfo::new(status, (self.timestamp_generator)())
    }

    /// Lookup a configured phase by id. `phase_type`, if given, must match
    /// or this fails with `InvalidArgument`.
    pub fn get_phase(
        &self,
        id: &str,
        phase_type: Option<&str>,
    ) -> Result<Arc<dyn Phase>, PhaserError> {
        let phase = self
            .phases
            .iter()
            .find(|p| p.id() == id)
            .cloned()
            .ok_or_else(|| PhaserError::not_found(format!("No phase found with id '{}'", id)))?;

        if let Some(expected) = phase_type {
            if phase.phase_type() != expected {
                return Err(PhaserError::invalid_argument(format!(
                    "Phase type mismatch: Expected '{}', but found '{}'",
                    expected,
                    phase.phase_type()
                )));
            }
        }
        Ok(phase)
    }

    /// Snapshot `(phases, lifecycle copy, termination)` under the lock.
    pub fn run_info(&self) -> Run {
        let state = self.state.lock().unwrap();
        Run {
            phases: self.phases.iter().map(|p| p.info()).collect(),
            lifecycle: state.lifecycle.clone(),
            termination: state.termination.clone(),
        }
    }

    /// Snapshot of whichever phase is current, if priming has happened.
    pub fn current_phase(&self) -> Option<PhaseInfo> {
        let state = self.state.lock().unwrap();
        state.current_phase.as_ref().map(|p| p.info())
    }

    /// Transition to Init. Fails with `InvalidState` if already primed.
    pub fn prime(&self) -> Result<(), PhaserError> {
        let mut state = self.state.lock().unwrap();
        if state.current_phase.is_some() {
            return Err(PhaserError::invalid_state("Primed already"));
        }
        self.next_phase_locked(&mut state, Arc::new(InitPhase));
        Ok(())
    }

    /// `_next_phase`: must be called under the transition lock. Appends a
    /// PhaseRun, fires the transition hook (sandboxed), and notifies
    /// waiters.
    fn next_phase_locked(&self, state: &mut PhaserState, phase: Arc<dyn Phase>) {
        state.current_phase = Some(Arc::clone(&phase));
        state.lifecycle.add_phase_run(PhaseRun::new(
            phase.id(),
            phase.run_state(),
            (self.timestamp_generator)(),
        ));

        if let Some(hook) = &self.transition_hook {
            let snapshot = state.lifecycle.clone();
            let previous = snapshot.previous_run().cloned();
            let current = snapshot.current_run().cloned();
            let count = snapshot.phase_count();
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                hook(previous.as_ref(), current.as_ref(), count)
            }));
            if result.is_err() {
                log_warn!("Warning: transition hook panicked; ignoring");
            }
        }

        self.condvar.notify_all();
    }

    /// Requires a prior `prime`. Iterates the configured phases in
    /// declaration order; see §4.4 for the full algorithm.
    pub fn run(&self, task_tracker: Option<Arc<TaskTracker>>) -> Result<(), RunFailure> {
        {
            let state = self.state.lock().unwrap();
            if state.current_phase.is_none() {
                return Err(RunFailure::NotPrimed);
            }
        }

        for phase in self.phases.clone() {
            {
                let mut state = self.state.lock().unwrap();
                if state.abort {
                    return Ok(());
                }
                self.next_phase_locked(&mut state, Arc::clone(&phase));
            }

            let ctx = RunContext::new(phase.info(), task_tracker.clone(), self.output_hook.clone());
            let (term_info, reraise) = self.run_phase_classified(phase.as_ref(), &ctx);

            let mut state = self.state.lock().unwrap();
            if let Some(stop_status) = state.stop_status {
                state.termination = Some(self.term_info(stop_status));
            } else if let Some(ti) = term_info {
                state.termination = Some(ti);
            }

            if let Some(exc) = reraise {
                debug_assert!(state.termination.is_some());
                self.next_phase_locked(&mut state, Arc::new(TerminalPhase));
                return Err(RunFailure::Phase(exc));
            }

            if state.termination.is_some() {
                self.next_phase_locked(&mut state, Arc::new(TerminalPhase));
                return Ok(());
            }
        }

        let mut state = self.state.lock().unwrap();
        state.termination = Some(self.term_info(TerminationStatus::Completed));
        self.next_phase_locked(&mut state, Arc::new(TerminalPhase));
        Ok(())
    }

    /// Run a phase outside the lock and classify the outcome per the
    /// exception table in §4.4.1.
    fn run_phase_classified(
        &self,
        phase: &dyn Phase,
        ctx: &RunContext,
    ) -> (Option<TerminationInfo>, Option<PhaseRunException>) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| phase.run(ctx)));

        match result {
            Ok(Ok(PhaseOutcome::Advanced)) => (None, None),
            Ok(Ok(PhaseOutcome::Terminated(status))) => (Some(self.term_info(status)), None),
            Ok(Ok(PhaseOutcome::Failed(fault))) => {
                (Some(self.term_info(TerminationStatus::Failed).with_failure(fault)), None)
            }
            Ok(Err(PhaseRunException::Unexpected(err))) => (
                Some(self.term_info(TerminationStatus::Error).with_error(err.clone())),
                Some(PhaseRunException::Unexpected(err)),
            ),
            Ok(Err(PhaseRunException::Interrupted)) => {
                log_warn!("keyboard_interruption");
                phase.stop();
                (
                    Some(self.term_info(TerminationStatus::Interrupted)),
                    Some(PhaseRunException::Interrupted),
                )
            }
            Ok(Err(PhaseRunException::ProcessExit(code))) => {
                let status = if code == 0 {
                    TerminationStatus::Completed
                } else {
                    TerminationStatus::Failed
                };
                (
                    Some(self.term_info(status)),
                    Some(PhaseRunException::ProcessExit(code)),
                )
            }
            Err(panic_payload) => {
                let message = panic_message(panic_payload);
                let err = RunError::new("panic", message);
                (
                    Some(self.term_info(TerminationStatus::Error).with_error(err.clone())),
                    Some(PhaseRunException::Unexpected(err)),
                )
            }
        }
    }

    /// Edge-triggered: only the first call has effect. Never blocks on
    /// `phase.stop` internals.
    pub fn stop(&self) {
        let phase_to_stop = {
            let mut state = self.state.lock().unwrap();
            if state.termination.is_some() {
                return;
            }

            let stop_status = match &state.current_phase {
                Some(p) => p.stop_status(),
                None => TerminationStatus::Stopped,
            };
            state.stop_status = Some(stop_status);

            let not_past_init = match &state.current_phase {
                None => true,
                Some(p) => p.is_init_phase(),
            };

            let phase_to_stop = state.current_phase.clone();

            if not_past_init {
                state.abort = true;
                state.termination = Some(self.term_info(stop_status));
                self.next_phase_locked(&mut state, Arc::new(TerminalPhase));
            }

            phase_to_stop
        };

        if let Some(phase) = phase_to_stop {
            phase.stop();
        }
    }

    /// Scan the lifecycle for any prior run matching `phase_id` or
    /// `run_state`. If found, return `true` immediately. Otherwise wait on
    /// the condition variable up to `timeout`. On spurious wake with no
    /// criteria given, return `true`. On timeout, return `false`.
    pub fn wait_for_transition(
        &self,
        phase_id: Option<&str>,
        run_state: Option<RunState>,
        timeout: Option<Duration>,
    ) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            if state
                .lifecycle
                .phase_runs()
                .iter()
                .any(|run| phase_id.is_some_and(|id| run.phase_id == id) || run_state == Some(run.run_state))
            {
                return true;
            }

            match timeout {
                Some(t) => {
                    let (guard, wait_result) = self.condvar.wait_timeout(state, t).unwrap();
                    state = guard;
                    if wait_result.timed_out() {
                        return false;
                    }
                }
                None => {
                    state = self.condvar.wait(state).unwrap();
                }
            }

            if phase_id.is_none() && run_state.is_none() {
                return true;
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::termination::Fault;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FnPhase<F> {
        id: &'static str,
        stop_status: TerminationStatus,
        run_state: RunState,
        f: F,
        stopped: AtomicBool,
    }

    impl<F> FnPhase<F>
    where
        F: Fn(&RunContext) -> Result<PhaseOutcome, PhaseRunException> + Send + Sync,
    {
        fn new(id: &'static str, f: F) -> Self {
            Self {
                id,
                stop_status: TerminationStatus::Stopped,
                run_state: RunState::Executing,
                f,
                stopped: AtomicBool::new(false),
            }
        }
    }

    impl<F> Phase for FnPhase<F>
    where
        F: Fn(&RunContext) -> Result<PhaseOutcome, PhaseRunException> + Send + Sync,
    {
        fn id(&self) -> &str {
            self.id
        }
        fn phase_type(&self) -> &str {
            "EXEC"
        }
        fn run_state(&self) -> RunState {
            self.run_state
        }
        fn stop_status(&self) -> TerminationStatus {
            self.stop_status
        }
        fn run(&self, ctx: &RunContext) -> Result<PhaseOutcome, PhaseRunException> {
            (self.f)(ctx)
        }
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn advancing(id: &'static str) -> Arc<dyn Phase> {
        Arc::new(FnPhase::new(id, |_ctx| Ok(PhaseOutcome::Advanced)))
    }

    #[test]
    fn happy_path_two_phases() {
        let phases = vec![advancing("A"), advancing("B")];
        let phaser = Phaser::new(phases, None, None).unwrap();
        phaser.prime().unwrap();
        phaser.run(None).unwrap();

        let info = phaser.run_info();
        let ids: Vec<_> = info
            .lifecycle
            .phase_runs()
            .iter()
            .map(|r| r.phase_id.as_str())
            .collect();
        assert_eq!(ids, vec!["Init", "A", "B", "term"]);
        assert_eq!(info.termination.unwrap().status, TerminationStatus::Completed);
    }

    #[test]
    fn failed_run_signal() {
        let phase: Arc<dyn Phase> = Arc::new(FnPhase::new("A", |_ctx| {
            Ok(PhaseOutcome::Failed(Fault::new("Validation", "bad input")))
        }));
        let phaser = Phaser::new(vec![phase], None, None).unwrap();
        phaser.prime().unwrap();
        phaser.run(None).unwrap();

        let info = phaser.run_info();
        let ids: Vec<_> = info
            .lifecycle
            .phase_runs()
            .iter()
            .map(|r| r.phase_id.as_str())
            .collect();
        assert_eq!(ids, vec!["Init", "A", "term"]);
        let term = info.termination.unwrap();
        assert_eq!(term.status, TerminationStatus::Failed);
        assert_eq!(term.failure.unwrap().message, "bad input");
    }

    #[test]
    fn unexpected_error_reraises_after_recording_termination() {
        let phase: Arc<dyn Phase> = Arc::new(FnPhase::new("A", |_ctx| {
            Err(PhaseRunException::Unexpected(RunError::new(
                "ValueError",
                "boom",
            )))
        }));
        let phaser = Phaser::new(vec![phase], None, None).unwrap();
        phaser.prime().unwrap();
        let result = phaser.run(None);

        let info = phaser.run_info();
        let ids: Vec<_> = info
            .lifecycle
            .phase_runs()
            .iter()
            .map(|r| r.phase_id.as_str())
            .collect();
        assert_eq!(ids, vec!["Init", "A", "term"]);
        let term = info.termination.unwrap();
        assert_eq!(term.status, TerminationStatus::Error);
        assert_eq!(term.error.as_ref().unwrap().category, "ValueError");

        match result {
            Err(RunFailure::Phase(PhaseRunException::Unexpected(e))) => {
                assert_eq!(e.message, "boom");
            }
            other => panic!("expected re-raised unexpected error, got {:?}", other),
        }
    }

    #[test]
    fn external_stop_mid_phase_wins_over_natural_outcome() {
        let entered = Arc::new((Mutex::new(false), Condvar::new()));
        let release = Arc::new((Mutex::new(false), Condvar::new()));
        let e2 = Arc::clone(&entered);
        let r2 = Arc::clone(&release);

        let phase: Arc<dyn Phase> = Arc::new(FnPhase::new("A", move |_ctx| {
            {
                let (lock, cvar) = &*e2;
                let mut g = lock.lock().unwrap();
                *g = true;
                cvar.notify_all();
            }
            let (lock, cvar) = &*r2;
            let g = lock.lock().unwrap();
            drop(cvar.wait_while(g, |released| !*released).unwrap());
            Ok(PhaseOutcome::Advanced)
        }));

        let phaser = Arc::new(Phaser::new(vec![phase], None, None).unwrap());
        phaser.prime().unwrap();

        let p2 = Arc::clone(&phaser);
        let handle = std::thread::spawn(move || p2.run(None));

        {
            let (lock, cvar) = &*entered;
            let mut g = lock.lock().unwrap();
            while !*g {
                g = cvar.wait(g).unwrap();
            }
        }

        phaser.stop();

        {
            let (lock, cvar) = &*release;
            let mut g = lock.lock().unwrap();
            *g = true;
            cvar.notify_all();
        }

        handle.join().unwrap().unwrap();

        let info = phaser.run_info();
        assert_eq!(
            info.lifecycle.current_run().unwrap().phase_id,
            TerminalPhase::ID
        );
        assert_eq!(info.termination.unwrap().status, TerminationStatus::Stopped);
    }

    #[test]
    fn wait_for_transition_unblocks_no_earlier_than_entry() {
        let hit = Arc::new(AtomicUsize::new(0));
        let h2 = Arc::clone(&hit);
        let phase_a: Arc<dyn Phase> = advancing("A");
        let phase_b: Arc<dyn Phase> = Arc::new(FnPhase::new("B", move |_ctx| {
            h2.fetch_add(1, Ordering::SeqCst);
            Ok(PhaseOutcome::Advanced)
        }));

        let phaser = Arc::new(Phaser::new(vec![phase_a, phase_b], None, None).unwrap());
        let p2 = Arc::clone(&phaser);

        let waiter = std::thread::spawn(move || p2.wait_for_transition(Some("B"), None, Some(Duration::from_secs(5))));

        phaser.prime().unwrap();
        phaser.run(None).unwrap();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn second_stop_is_a_no_op() {
        let phases = vec![advancing("A")];
        let phaser = Phaser::new(phases, None, None).unwrap();
        phaser.prime().unwrap();
        phaser.run(None).unwrap();
        let before = phaser.run_info().termination;
        phaser.stop();
        let after = phaser.run_info().termination;
        assert_eq!(before, after);
    }

    #[test]
    fn prime_twice_fails() {
        let phaser = Phaser::new(vec![advancing("A")], None, None).unwrap();
        phaser.prime().unwrap();
        let err = phaser.prime().unwrap_err();
        assert!(matches!(err, PhaserError::InvalidState(_)));
    }

    #[test]
    fn run_without_prime_fails() {
        let phaser = Phaser::new(vec![advancing("A")], None, None).unwrap();
        assert!(matches!(phaser.run(None), Err(RunFailure::NotPrimed)));
    }

    #[test]
    fn current_phase_tracks_transitions() {
        let phaser = Phaser::new(vec![advancing("A"), advancing("B")], None, None).unwrap();
        assert!(phaser.current_phase().is_none());
        phaser.prime().unwrap();
        assert_eq!(phaser.current_phase().unwrap().id, "Init");
        phaser.run(None).unwrap();
        assert_eq!(phaser.current_phase().unwrap().id, TerminalPhase::ID);
    }

    #[test]
    fn duplicate_phase_ids_rejected_at_construction() {
        let result = Phaser::new(vec![advancing("A"), advancing("A")], None, None);
        assert!(matches!(result, Err(PhaserError::InvalidArgument(_))));
    }

    #[test]
    fn stop_before_prime_terminates_immediately_and_blocks_further_use() {
        let phaser = Phaser::new(vec![advancing("A")], None, None).unwrap();
        phaser.stop();

        let info = phaser.run_info();
        assert_eq!(info.termination.unwrap().status, TerminationStatus::Stopped);
        assert_eq!(info.lifecycle.current_run().unwrap().phase_id, TerminalPhase::ID);

        assert!(matches!(phaser.prime(), Err(PhaserError::InvalidState(_))));
    }

    #[test]
    fn get_phase_lookup_errors() {
        let phaser = Phaser::new(vec![advancing("A")], None, None).unwrap();
        assert!(phaser.get_phase("A", None).is_ok());
        assert!(matches!(
            phaser.get_phase("missing", None),
            Err(PhaserError::NotFound(_))
        ));
        assert!(matches!(
            phaser.get_phase("A", Some("OTHER")),
            Err(PhaserError::InvalidArgument(_))
        ));
    }

    #[test]
    fn hook_panic_does_not_disrupt_run() {
        let hook: TransitionHook = Arc::new(|_prev, _cur, _count| {
            panic!("observer exploded");
        });
        let phaser = Phaser::new(vec![advancing("A")], None, None)
            .unwrap()
            .with_transition_hook(hook);
        phaser.prime().unwrap();
        phaser.run(None).unwrap();
        assert_eq!(
            phaser.run_info().termination.unwrap().status,
            TerminationStatus::Completed
        );
    }
}
