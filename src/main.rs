use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use phase_golem::config;
use phase_golem::log::parse_log_level;
use phase_golem::{
    log_error, log_info, Fault, OutputToTask, Parser as LineParser, Phase, PhaseInfo,
    PhaseOutcome, PhaseRunException, Phaser, RunContext, RunFailure, RunState, TaskTracker,
    TerminationStatus,
};

#[derive(Parser)]
#[command(name = "phase-golem", about = "Phased job runner")]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/phase-golem.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a toy pipeline of step phases and print the resulting run info
    Run {
        /// Fail the step at this position (1-based); omit to run clean
        #[arg(long)]
        fail_at: Option<u32>,
    },
}

/// A phase that emits parser-friendly `key=value;...` output lines, letting
/// the demo exercise the bundled Output→Task adapter end to end.
struct StepPhase {
    id: String,
    fail: bool,
}

impl Phase for StepPhase {
    fn id(&self) -> &str {
        &self.id
    }
    fn phase_type(&self) -> &str {
        "STEP"
    }
    fn run_state(&self) -> RunState {
        RunState::Executing
    }
    fn stop_status(&self) -> TerminationStatus {
        TerminationStatus::Stopped
    }
    fn run(&self, ctx: &RunContext) -> Result<PhaseOutcome, PhaseRunException> {
        ctx.new_output(&format!("task={};event=start", self.id), false);
        if self.fail {
            ctx.new_output(&format!("task={};result=failed", self.id), false);
            return Ok(PhaseOutcome::Failed(Fault::new(
                "DemoFailure",
                format!("{} was configured to fail", self.id),
            )));
        }
        ctx.new_output(&format!("task={};result=ok", self.id), false);
        Ok(PhaseOutcome::Advanced)
    }
    fn stop(&self) {}
}

/// Splits `key=value;key=value` lines into a raw field map.
fn kv_parser() -> LineParser {
    Arc::new(|line: &str| {
        let mut kv = std::collections::HashMap::new();
        for part in line.split(';') {
            let (k, v) = part.split_once('=')?;
            kv.insert(k.to_string(), v.to_string());
        }
        Some(kv)
    })
}

fn main() {
    let cli = Cli::parse();

    let config = match config::load_config_from(cli.config.as_deref(), &cli.root) {
        Ok(c) => c,
        Err(e) => {
            log_error!("{}", e);
            std::process::exit(1);
        }
    };

    let level_str = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    match parse_log_level(level_str) {
        Ok(level) => phase_golem::log::set_log_level(level),
        Err(e) => {
            log_error!("{}", e);
            std::process::exit(1);
        }
    }

    match cli.command {
        Commands::Run { fail_at } => run_demo(&config, fail_at),
    }
}

fn run_demo(config: &config::RunnerConfig, fail_at: Option<u32>) {
    let phases: Vec<Arc<dyn Phase>> = (1..=config.pipeline.step_count)
        .map(|n| {
            Arc::new(StepPhase {
                id: format!("step-{}", n),
                fail: fail_at == Some(n),
            }) as Arc<dyn Phase>
        })
        .collect();

    let tracker = TaskTracker::new_root();
    let o2t = Arc::new(OutputToTask::new(Arc::clone(&tracker), vec![kv_parser()]));
    let output_hook = {
        let o2t = Arc::clone(&o2t);
        Arc::new(move |_info: &PhaseInfo, line: &str, is_err: bool| {
            o2t.new_output(line, is_err);
        })
    };

    let phaser = match Phaser::new(phases, None, None) {
        Ok(p) => p,
        Err(e) => {
            log_error!("failed to build pipeline: {}", e);
            std::process::exit(1);
        }
    }
    .with_output_hook(output_hook);

    if let Err(e) = phaser.prime() {
        log_error!("failed to prime: {}", e);
        std::process::exit(1);
    }

    match phaser.run(Some(Arc::clone(&tracker))) {
        Ok(()) => log_info!("run finished"),
        Err(RunFailure::Phase(e)) => log_error!("run raised: {}", e),
        Err(RunFailure::NotPrimed) => unreachable!("primed above"),
    }

    let info = phaser.run_info();
    for run in info.lifecycle.phase_runs() {
        println!("{:<12} {:?}", run.phase_id, run.run_state);
    }
    if let Some(term) = info.termination {
        println!("termination: {:?}", term.status);
        if let Some(fault) = term.failure {
            println!("fault: {} - {}", fault.category, fault.message);
        }
    }

    for subtask in tracker.subtasks() {
        println!(
            "task {:<10} finished={} result={:?}",
            subtask.name(),
            subtask.is_finished(),
            subtask.result()
        );
    }
}
