use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tracing::warn;

use reforge_core::context::RunContext;
use reforge_core::executor::PytestRunner;
use reforge_core::generate::generator_from_config;
use reforge_core::orchestrator::{Orchestrator, RunOutcome, RunRequest};
use reforge_core::progress::{IndicatifReporter, NoopReporter, ProgressReporter};
use reforge_core::types::{TargetDisposition, Verdict};
use reforge_core::vcs::GitCli;

use super::Global;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// File defining the function, relative to the project root
    #[arg(long)]
    pub target: PathBuf,

    /// Name of the function to refactor
    #[arg(long)]
    pub symbol: String,

    /// Maximum verify/fix attempts (overrides run.max_iterations)
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Scan and build the oracle in memory; execute and modify nothing
    #[arg(long)]
    pub dry_run: bool,
}

/// Exit code for a finished run.
pub fn verdict_exit_code(verdict: &Verdict) -> i32 {
    match verdict {
        Verdict::Converged | Verdict::DryRun => 0,
        Verdict::Aborted(reason) if reason.before_attempt() => 3,
        Verdict::Aborted(_) => 4,
        Verdict::Exhausted => 5,
    }
}

pub async fn run(args: RunArgs, global: &Global) -> anyhow::Result<i32> {
    let root = super::resolve_root(&global.root)?;
    let config = super::load_config(&root)?;

    let ctx = RunContext::new(&root, &config.run.artifacts_dir);
    let generator = generator_from_config(&config.llm, &config.executor.switch_var);
    let runner = PytestRunner::new(
        &root,
        config.executor.program.clone(),
        config.executor.args.clone(),
    );
    let vcs = match GitCli::discover(&root) {
        Ok(git) => Some(git),
        Err(e) => {
            warn!(error = %e, "No git repository; cleanliness checks skipped");
            None
        }
    };

    let progress: Box<dyn ProgressReporter> = if global.quiet {
        Box::new(NoopReporter)
    } else if std::io::stderr().is_terminal() {
        Box::new(IndicatifReporter::new())
    } else {
        Box::new(IndicatifReporter::hidden())
    };

    let mut orchestrator = Orchestrator::new(&config, &ctx, generator.as_ref(), &runner)
        .with_progress(progress.as_ref());
    if let Some(git) = &vcs {
        orchestrator = orchestrator.with_vcs(git);
    }

    let request = RunRequest {
        target: args.target,
        symbol: args.symbol,
        max_iterations: args.max_iterations,
        dry_run: args.dry_run,
    };
    let outcome = orchestrator
        .run(&request)
        .await
        .context("Refactor run failed")?;

    if !global.quiet {
        print_outcome(&outcome, &ctx);
    }
    if let Verdict::Aborted(reason) = &outcome.verdict {
        eprintln!("Aborted {reason}");
    }
    Ok(verdict_exit_code(&outcome.verdict))
}

fn print_outcome(outcome: &RunOutcome, ctx: &RunContext) {
    if let Some(impact) = &outcome.impact {
        println!(
            "Impact: {} usages in {} files ({} call sites, {} test files, {} other)",
            impact.summary.total_usages,
            impact.summary.total_files,
            impact.summary.call_sites,
            impact.summary.test_files,
            impact.summary.other_files
        );
    }

    match &outcome.verdict {
        Verdict::DryRun => {
            if let Some(oracle) = &outcome.oracle {
                println!(
                    "Oracle: {} characterization cases, {} dual-mode cases (not written)",
                    oracle.case_count, oracle.dual_mode_count
                );
            }
            println!("Dry run complete.");
        }
        Verdict::Converged => println!(
            "Converged after {} attempt(s).",
            outcome.iterations.len()
        ),
        Verdict::Exhausted => println!(
            "Exhausted {} attempt(s) without converging.",
            outcome.iterations.len()
        ),
        Verdict::Aborted(_) => {}
    }

    for record in &outcome.iterations {
        println!(
            "  attempt {}: baseline {}/{}/{}  alternate {}/{}/{}",
            record.attempt,
            record.baseline.passed,
            record.baseline.failed,
            record.baseline.errors,
            record.alternate.passed,
            record.alternate.failed,
            record.alternate.errors
        );
    }
    if outcome.target != TargetDisposition::Untouched {
        println!("Target file: {}", outcome.target);
    }
    if !outcome.artifacts.is_empty() {
        println!("Artifacts: {}", ctx.artifacts_dir().display());
    }
}
