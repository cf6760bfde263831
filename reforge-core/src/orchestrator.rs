//! Refactor → verify → fix state machine.
//!
//! One [`Orchestrator`] drives one run. Phases are awaited strictly in
//! sequence; the target file is only ever written through
//! [`PatchApplier`]. Collaborators are trait objects so tests can script
//! them.

use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::config::ReforgeConfig;
use crate::context::{ArtifactKind, RunContext};
use crate::error::{GenerationError, PatchError, ReforgeError, Result};
use crate::evidence::{self, EvidenceInputs};
use crate::executor::{DualModeExecutor, TestRunner};
use crate::generate::CodeGenerator;
use crate::impact::{ImpactAnalyzer, ImpactPolicy};
use crate::oracle::{self, Catalogue, OracleSuite, OracleTarget};
use crate::patch::PatchApplier;
use crate::progress::{NoopReporter, ProgressReporter};
use crate::types::{
    AbortReason, ImpactReport, IterationRecord, Mode, ModeSwitch, Plan, RunResult, RunState,
    Symbol, TargetDisposition, Verdict,
};
use crate::vcs::{self, VersionControl};

const TOTAL_STEPS: u32 = 6;

// ── State machine ───────────────────────────────────────────────────

/// Run states plus the table of legal moves between them.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: RunState,
    history: Vec<RunState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: RunState::Init,
            history: vec![RunState::Init],
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Every state entered so far, starting with `Init`.
    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    pub fn can_transition(from: RunState, to: RunState) -> bool {
        use RunState::{
            Aborted, BaselineVerified, Converged, Done, Exhausted, Init, Iterating, Patching,
            Planning, Reporting, Scanning,
        };
        match (from, to) {
            (from, Aborted) => !from.is_terminal(),
            (Init, Scanning)
            | (Scanning, BaselineVerified | Done)
            | (BaselineVerified, Planning)
            | (Planning, Patching)
            | (Patching, Iterating)
            | (Iterating, Converged | Exhausted)
            | (Converged | Exhausted, Reporting)
            | (Reporting, Done) => true,
            _ => false,
        }
    }

    pub fn transition_to(&mut self, next: RunState) -> Result<()> {
        let from = self.state;
        if !Self::can_transition(from, next) {
            return Err(ReforgeError::InvalidTransition { from, to: next });
        }
        debug!(?from, to = ?next, "State transition");
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

// ── Run request / outcome ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Target file, absolute or relative to the project root.
    pub target: PathBuf,
    pub symbol: String,
    /// Overrides `run.max_iterations` when set.
    pub max_iterations: Option<u32>,
    /// Scan, report impact and materialize the oracle in memory only.
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub verdict: Verdict,
    /// What the target file holds after the run.
    pub target: TargetDisposition,
    pub state: RunState,
    pub states: Vec<RunState>,
    pub iterations: Vec<IterationRecord>,
    pub impact: Option<ImpactReport>,
    pub plan: Option<Plan>,
    pub oracle: Option<OracleSuite>,
    /// Baseline run that gated the attempt, before any rewrite.
    pub baseline_check: Option<RunResult>,
    pub artifacts: Vec<PathBuf>,
}

impl RunOutcome {
    /// Latest results under each configuration.
    pub fn latest_results(&self) -> (Option<&RunResult>, Option<&RunResult>) {
        match self.iterations.last() {
            Some(last) => (Some(&last.baseline), Some(&last.alternate)),
            None => (self.baseline_check.as_ref(), None),
        }
    }
}

// ── Orchestrator ────────────────────────────────────────────────────

#[derive(Debug)]
struct ResolvedTarget {
    path: PathBuf,
    relative: String,
    symbol: Symbol,
    max_iterations: u32,
    original_code: String,
}

pub struct Orchestrator<'a> {
    config: &'a ReforgeConfig,
    ctx: &'a RunContext,
    generator: &'a dyn CodeGenerator,
    runner: &'a dyn TestRunner,
    vcs: Option<&'a dyn VersionControl>,
    progress: &'a dyn ProgressReporter,
    catalogue: Option<Catalogue>,
    machine: StateMachine,
    outcome: RunOutcome,
    current_code: Option<String>,
    mutated: bool,
}

impl std::fmt::Debug for Orchestrator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("run_id", &self.ctx.run_id)
            .field("state", &self.machine.state())
            .field("mutated", &self.mutated)
            .finish_non_exhaustive()
    }
}

static NOOP: NoopReporter = NoopReporter;

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a ReforgeConfig,
        ctx: &'a RunContext,
        generator: &'a dyn CodeGenerator,
        runner: &'a dyn TestRunner,
    ) -> Self {
        Self {
            config,
            ctx,
            generator,
            runner,
            vcs: None,
            progress: &NOOP,
            catalogue: None,
            machine: StateMachine::new(),
            outcome: RunOutcome {
                verdict: Verdict::DryRun,
                target: TargetDisposition::Untouched,
                state: RunState::Init,
                states: Vec::new(),
                iterations: Vec::new(),
                impact: None,
                plan: None,
                oracle: None,
                baseline_check: None,
                artifacts: Vec::new(),
            },
            current_code: None,
            mutated: false,
        }
    }

    #[must_use]
    pub fn with_vcs(mut self, vcs: &'a dyn VersionControl) -> Self {
        self.vcs = Some(vcs);
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: &'a dyn ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    /// Use `catalogue` instead of the one named in config.
    #[must_use]
    pub fn with_catalogue(mut self, catalogue: Catalogue) -> Self {
        self.catalogue = Some(catalogue);
        self
    }

    fn switch(&self) -> ModeSwitch {
        ModeSwitch::new(
            &self.config.executor.switch_var,
            &self.config.executor.switch_value,
        )
    }

    /// Drive a full run. Aborts and exhaustion are verdicts, not errors;
    /// `Err` is reserved for configuration, artifact and I/O failures that
    /// happen before the target is touched or while writing evidence.
    #[instrument(skip_all, name = "refactor_run")]
    pub async fn run(mut self, request: &RunRequest) -> Result<RunOutcome> {
        let start = Instant::now();
        info!(run_id = %self.ctx.run_id, target = %request.target.display(), "Run started");
        let verdict = match self.preflight(request) {
            Ok(target) => {
                let verdict = match self.drive(&target, request.dry_run).await {
                    Ok(verdict) => verdict,
                    // Once the target is rewritten every exit goes through
                    // settle, so a failed run never leaves the rewrite behind.
                    Err(e) if self.mutated => self.abort(AbortReason::Artifact(e.to_string())),
                    Err(e) => return Err(e),
                };
                self.outcome.target = self.settle(&target, &verdict);
                if !matches!(verdict, Verdict::DryRun) {
                    self.report(&target, &verdict)?;
                }
                verdict
            }
            Err(reason) => self.abort(reason),
        };

        self.progress.finish();
        info!(
            verdict = ?verdict,
            iterations = self.outcome.iterations.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Run finished"
        );
        self.outcome.verdict = verdict;
        self.outcome.state = self.machine.state();
        self.outcome.states = self.machine.history().to_vec();
        Ok(self.outcome)
    }

    fn abort(&mut self, reason: AbortReason) -> Verdict {
        if let Err(e) = self.machine.transition_to(RunState::Aborted) {
            warn!(error = %e, "Abort from terminal state");
        }
        warn!(reason = %reason, "Run aborted");
        self.progress.message(&format!("Aborted {reason}"));
        Verdict::Aborted(reason)
    }

    // ── Init ────────────────────────────────────────────────────────

    fn preflight(&self, request: &RunRequest) -> std::result::Result<ResolvedTarget, AbortReason> {
        let root = self.ctx.project_root();
        let symbol = Symbol::new(request.symbol.clone()).map_err(|e| match e {
            ReforgeError::Precondition(msg) => AbortReason::Precondition(msg),
            other => AbortReason::Precondition(other.to_string()),
        })?;

        let path = if request.target.is_absolute() {
            request.target.clone()
        } else {
            root.join(&request.target)
        };
        let relative = self.ctx.relative(&path);
        if !path.is_file() {
            return Err(AbortReason::Precondition(format!(
                "target file not found: {relative}"
            )));
        }
        if path.extension().and_then(|e| e.to_str()) != Some("py") {
            return Err(AbortReason::Precondition(format!(
                "target is not a Python file: {relative}"
            )));
        }

        let max_iterations = request
            .max_iterations
            .unwrap_or(self.config.run.max_iterations);
        if max_iterations == 0 {
            return Err(AbortReason::Precondition(
                "max iterations must be at least 1".to_string(),
            ));
        }

        if !request.dry_run {
            self.generator
                .check_available()
                .map_err(|e| AbortReason::Precondition(e.to_string()))?;
        }

        if let Some(vcs) = self.vcs {
            match vcs.is_clean() {
                Ok(true) => {}
                Ok(false) => warn!("Working tree has uncommitted changes"),
                Err(e) => warn!(error = %e, "Cannot check working tree status"),
            }
        }

        let original_code = std::fs::read_to_string(&path).map_err(|e| {
            AbortReason::Precondition(format!("cannot read {relative}: {e}"))
        })?;

        Ok(ResolvedTarget {
            path,
            relative,
            symbol,
            max_iterations,
            original_code,
        })
    }

    // ── Scan → baseline → plan → patch → iterate ────────────────────

    async fn drive(&mut self, target: &ResolvedTarget, dry_run: bool) -> Result<Verdict> {
        self.machine.transition_to(RunState::Scanning)?;
        let suite = self.scan(target)?;

        if dry_run {
            self.outcome.oracle = Some(suite);
            self.machine.transition_to(RunState::Done)?;
            info!("Dry run complete; nothing executed or modified");
            return Ok(Verdict::DryRun);
        }

        let written = suite.write(self.ctx.project_root())?;
        debug!(files = written.len(), "Oracle written");
        let executor =
            DualModeExecutor::new(self.runner, self.ctx, suite.relative_paths(), self.switch());
        self.outcome.oracle = Some(suite);

        self.progress.step(2, TOTAL_STEPS, "Verifying baseline");
        let baseline = executor.run(Mode::Baseline).await?;
        let green = baseline.is_green();
        let detail = format!(
            "oracle does not pass against the untouched implementation ({} passed, {} failed, {} errors)",
            baseline.passed, baseline.failed, baseline.errors
        );
        self.outcome.baseline_check = Some(baseline);
        if !green {
            return Ok(self.abort(AbortReason::BaselineUnverified(detail)));
        }
        self.machine.transition_to(RunState::BaselineVerified)?;

        self.create_branch(target);

        self.machine.transition_to(RunState::Planning)?;
        self.progress.step(3, TOTAL_STEPS, "Requesting refactoring plan");
        let plan = match self.request_plan(target).await {
            Ok(plan) => plan,
            Err(e) => return Ok(self.abort(AbortReason::Generation(e.to_string()))),
        };
        let plan_path = self.ctx.write_json(ArtifactKind::Plan, &plan)?;
        self.outcome.artifacts.push(plan_path);

        self.machine.transition_to(RunState::Patching)?;
        self.progress.step(4, TOTAL_STEPS, "Applying rewrite");
        let rewrite = match self
            .generator
            .patch(&target.original_code, &target.symbol, &plan)
            .await
        {
            Ok(code) => code,
            Err(e) => return Ok(self.abort(AbortReason::Generation(e.to_string()))),
        };
        self.outcome.plan = Some(plan);
        if let Err(reason) = self.install(target, rewrite, 1, true).await {
            return Ok(self.abort(reason));
        }

        self.machine.transition_to(RunState::Iterating)?;
        self.iterate(target, &executor).await
    }

    #[instrument(skip_all, name = "scan_phase")]
    fn scan(&mut self, target: &ResolvedTarget) -> Result<OracleSuite> {
        self.progress.step(1, TOTAL_STEPS, "Scanning for usages");
        let root = self.ctx.project_root();
        let scan = ImpactAnalyzer::new(root, &self.config.impact).scan(&target.symbol)?;
        for skipped in &scan.skipped {
            debug!(file = %skipped.path, reason = %skipped.reason, "Skipped during scan");
        }
        let policy = ImpactPolicy::from(&self.config.impact);
        let report = scan.into_report(&target.relative, &target.symbol, &policy);
        info!(
            files = report.summary.total_files,
            usages = report.summary.total_usages,
            call_sites = report.summary.call_sites,
            "Impact report built"
        );
        let impact_path = self.ctx.write_json(ArtifactKind::ImpactReport, &report)?;
        self.outcome.artifacts.push(impact_path);
        self.outcome.impact = Some(report);

        let catalogue = match self.catalogue.take() {
            Some(catalogue) => catalogue,
            None => {
                let configured = self.config.oracle.catalogue.as_ref().map(|p| root.join(p));
                Catalogue::resolve(configured.as_deref())?
            }
        };
        let oracle_target = OracleTarget {
            module: self
                .config
                .oracle
                .module
                .clone()
                .unwrap_or_else(|| oracle::module_from_path(&target.relative)),
            symbol: target.symbol.clone(),
            switch: self.switch(),
            tolerance: self.config.oracle.tolerance,
            output_dir: self.config.oracle.output_dir.clone(),
        };
        Ok(oracle::materialize(&catalogue, &oracle_target, Utc::now()))
    }

    fn create_branch(&self, target: &ResolvedTarget) {
        if !self.config.vcs.create_branch {
            return;
        }
        let Some(vcs) = self.vcs else {
            warn!("Branch creation requested but no repository is available");
            return;
        };
        let name = vcs::branch_name(
            &self.config.vcs.branch_prefix,
            target.symbol.as_str(),
            self.ctx.started_at,
        );
        match vcs.create_branch(&name) {
            Ok(()) => info!(branch = %name, "Working on new branch"),
            Err(e) => warn!(branch = %name, error = %e, "Branch creation failed"),
        }
    }

    /// Plan request with exactly one retry on a malformed or empty response.
    async fn request_plan(
        &self,
        target: &ResolvedTarget,
    ) -> std::result::Result<Plan, GenerationError> {
        let call_sites = self
            .outcome
            .impact
            .as_ref()
            .map(ImpactReport::call_site_paths)
            .unwrap_or_default();
        let first = self
            .generator
            .plan(&target.original_code, &target.symbol, &call_sites)
            .await;
        match first {
            Err(e @ (GenerationError::Malformed(_) | GenerationError::Empty(_))) => {
                warn!(error = %e, "Plan response unusable, retrying once");
                self.generator
                    .plan(&target.original_code, &target.symbol, &call_sites)
                    .await
            }
            other => other,
        }
    }

    /// Validate and write `code`. A syntax error earns exactly one fix
    /// request carrying the diagnostic; a second invalid response aborts.
    async fn install(
        &mut self,
        target: &ResolvedTarget,
        code: String,
        attempt: u32,
        backup: bool,
    ) -> std::result::Result<(), AbortReason> {
        let applier = PatchApplier::new(self.ctx);
        let code = match applier.apply(&target.path, &code, backup) {
            Ok(()) => code,
            Err(PatchError::InvalidSyntax {
                line,
                column,
                message,
            }) => {
                let diagnostic =
                    format!("SyntaxError at line {line}, column {column}: {message}");
                warn!(%diagnostic, attempt, "Rewrite does not parse, requesting remediation");
                let fixed = self
                    .generator
                    .fix(&code, &target.symbol, &diagnostic, attempt)
                    .await
                    .map_err(|e| AbortReason::Generation(e.to_string()))?;
                match applier.apply(&target.path, &fixed, backup) {
                    Ok(()) => fixed,
                    Err(e @ PatchError::InvalidSyntax { .. }) => {
                        return Err(AbortReason::Generation(format!(
                            "rewrite still invalid after remediation: {e}"
                        )));
                    }
                    Err(e) => return Err(AbortReason::Patch(e.to_string())),
                }
            }
            Err(e) => return Err(AbortReason::Patch(e.to_string())),
        };
        self.mutated = true;
        self.current_code = Some(code);
        Ok(())
    }

    async fn iterate(
        &mut self,
        target: &ResolvedTarget,
        executor: &DualModeExecutor<'_>,
    ) -> Result<Verdict> {
        self.progress
            .start("Verifying attempts", Some(u64::from(target.max_iterations)));
        for attempt in 1..=target.max_iterations {
            self.progress.step(
                5,
                TOTAL_STEPS,
                &format!("Verifying attempt {attempt}/{}", target.max_iterations),
            );
            let baseline = executor.run(Mode::Baseline).await?;
            let alternate = executor.run(Mode::Alternate).await?;
            let record = IterationRecord {
                attempt,
                code_snapshot: self.current_code.clone().unwrap_or_default(),
                baseline,
                alternate,
            };
            let converged = record.converged();
            info!(
                attempt,
                baseline_green = record.baseline.is_green(),
                alternate_green = record.alternate.is_green(),
                "Attempt verified"
            );

            let failure_log = if record.baseline.is_green() {
                record.alternate.raw_log.clone()
            } else {
                record.baseline.raw_log.clone()
            };
            self.outcome.iterations.push(record);
            self.progress.advance(1);

            if converged {
                self.machine.transition_to(RunState::Converged)?;
                return Ok(Verdict::Converged);
            }
            if attempt == target.max_iterations {
                break;
            }

            let current = self.current_code.clone().unwrap_or_default();
            let fixed = match self
                .generator
                .fix(&current, &target.symbol, &failure_log, attempt)
                .await
            {
                Ok(code) => code,
                Err(e) => return Ok(self.abort(AbortReason::Generation(e.to_string()))),
            };
            if let Err(reason) = self.install(target, fixed, attempt, false).await {
                return Ok(self.abort(reason));
            }
        }

        self.machine.transition_to(RunState::Exhausted)?;
        warn!(attempts = target.max_iterations, "Iteration budget exhausted");
        Ok(Verdict::Exhausted)
    }

    // ── Settle and report ───────────────────────────────────────────

    /// Put the target back after a failed run, or apply the retention
    /// policy after a converged one.
    fn settle(&self, target: &ResolvedTarget, verdict: &Verdict) -> TargetDisposition {
        if !self.mutated {
            return TargetDisposition::Untouched;
        }
        let applier = PatchApplier::new(self.ctx);
        match verdict {
            Verdict::Converged => {
                if let Err(e) = applier.retain(&target.path, self.config.patch.retention) {
                    warn!(error = %e, "Backup retention failed");
                }
                TargetDisposition::Rewritten
            }
            Verdict::Exhausted | Verdict::Aborted(_) if self.config.run.restore_on_failure => {
                match applier.restore(&target.path) {
                    Ok(()) => {
                        info!(file = %target.relative, "Target restored");
                        TargetDisposition::Restored
                    }
                    Err(e) => {
                        warn!(error = %e, "Restore from backup failed");
                        TargetDisposition::Retained
                    }
                }
            }
            _ => TargetDisposition::Retained,
        }
    }

    #[instrument(skip_all, name = "report_phase")]
    fn report(&mut self, target: &ResolvedTarget, verdict: &Verdict) -> Result<()> {
        let reporting = matches!(verdict, Verdict::Converged | Verdict::Exhausted);
        if reporting {
            self.machine.transition_to(RunState::Reporting)?;
        }
        self.progress.step(6, TOTAL_STEPS, "Assembling evidence");

        let final_code = self
            .current_code
            .clone()
            .unwrap_or_else(|| target.original_code.clone());
        let diff = if self.mutated {
            let applier = PatchApplier::new(self.ctx);
            let path = applier.save_diff(&target.path, &target.original_code, &final_code)?;
            let text = std::fs::read_to_string(&path)?;
            self.outcome.artifacts.push(path);
            Some(text)
        } else {
            None
        };

        let iterations_path = self
            .ctx
            .write_json(ArtifactKind::Iterations, &self.outcome.iterations)?;
        self.outcome.artifacts.push(iterations_path);

        let usage = self.generator.usage();
        let (baseline, alternate) = self.outcome.latest_results();
        let inputs = EvidenceInputs {
            target_file: &target.relative,
            symbol: &target.symbol,
            generated_at: Utc::now(),
            verdict,
            disposition: self.outcome.target,
            max_iterations: target.max_iterations,
            original_code: &target.original_code,
            final_code: &final_code,
            plan: self.outcome.plan.as_ref(),
            baseline,
            alternate,
            iterations: &self.outcome.iterations,
            impact: self.outcome.impact.as_ref().map(|r| &r.summary),
            usage: usage.as_ref(),
            diff: diff.as_deref(),
        };
        let document = evidence::render(&inputs);
        let evidence_path = self.ctx.write_text(ArtifactKind::Evidence, &document)?;
        self.outcome.artifacts.push(evidence_path);

        if reporting {
            self.machine.transition_to(RunState::Done)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RunState::*;

    #[test]
    fn happy_path_is_legal() {
        let mut machine = StateMachine::new();
        for next in [
            Scanning,
            BaselineVerified,
            Planning,
            Patching,
            Iterating,
            Converged,
            Reporting,
            Done,
        ] {
            machine.transition_to(next).unwrap();
        }
        assert_eq!(machine.state(), Done);
        assert_eq!(machine.history().len(), 9);
    }

    #[test]
    fn patching_is_never_reentered() {
        let mut machine = StateMachine::new();
        for next in [Scanning, BaselineVerified, Planning, Patching, Iterating] {
            machine.transition_to(next).unwrap();
        }
        let err = machine.transition_to(Patching).unwrap_err();
        assert!(matches!(
            err,
            ReforgeError::InvalidTransition {
                from: Iterating,
                to: Patching
            }
        ));
        assert_eq!(machine.state(), Iterating);
    }

    #[test]
    fn abort_only_from_live_states() {
        for state in [
            Init,
            Scanning,
            BaselineVerified,
            Planning,
            Patching,
            Iterating,
            Converged,
            Exhausted,
            Reporting,
        ] {
            assert!(StateMachine::can_transition(state, Aborted), "{state:?}");
        }
        assert!(!StateMachine::can_transition(Done, Aborted));
        assert!(!StateMachine::can_transition(Aborted, Aborted));
        assert!(!StateMachine::can_transition(Aborted, Scanning));
    }

    #[test]
    fn skipping_phases_is_rejected() {
        assert!(!StateMachine::can_transition(Init, Patching));
        assert!(!StateMachine::can_transition(Scanning, Iterating));
        assert!(!StateMachine::can_transition(Converged, Done));
        assert!(!StateMachine::can_transition(Exhausted, Iterating));
    }
}
