use reforge_core::config::{BackupRetention, ReforgeConfig};
use reforge_core::context::{ArtifactKind, RunContext};
use reforge_core::error::GenerationError;
use reforge_core::orchestrator::{Orchestrator, RunRequest};
use reforge_core::progress::IndicatifReporter;
use reforge_core::types::{AbortReason, Mode, RunState, TargetDisposition, Verdict};
use reforge_core::vcs::{GitCli, VersionControl};
use reforge_test::{
    BILLING_PY, ScriptedGenerator, ScriptedRunner, TARGET, TestProject, V2_REFACTORED,
    billing_with_v2, pytest_output, read_artifact_json, run_refactor, v2_with_shipping_bug,
};

const INVALID_PYTHON: &str = "def _compute_invoice_total_v2(order:\n    return order\n";

/// Baseline always passes; the alternate passes only with the correct
/// free-shipping threshold in place.
fn shipping_runner(project: &TestProject) -> ScriptedRunner {
    ScriptedRunner::new(project.target(), |mode, code| match mode {
        Mode::Baseline => pytest_output(24, 0),
        Mode::Alternate if code.contains("FREE_SHIPPING_OVER = 50") => pytest_output(22, 2),
        Mode::Alternate => pytest_output(24, 0),
    })
}

// ── Convergence ─────────────────────────────────────────────────────

#[tokio::test]
async fn converges_on_first_attempt_without_fixes() {
    let project = TestProject::billing();
    let config = ReforgeConfig::default();
    let refactored = billing_with_v2(V2_REFACTORED);
    let generator = ScriptedGenerator::new().patch(refactored.clone());
    let runner = ScriptedRunner::always_green(project.target());

    let (outcome, ctx) = run_refactor(&project, &config, &generator, &runner, 5, false).await;

    assert_eq!(outcome.verdict, Verdict::Converged);
    assert_eq!(outcome.state, RunState::Done);
    assert_eq!(
        outcome.states,
        vec![
            RunState::Init,
            RunState::Scanning,
            RunState::BaselineVerified,
            RunState::Planning,
            RunState::Patching,
            RunState::Iterating,
            RunState::Converged,
            RunState::Reporting,
            RunState::Done,
        ]
    );
    assert_eq!(outcome.iterations.len(), 1);
    assert!(generator.fix_calls().is_empty());
    assert_eq!(project.read(TARGET), refactored);
    assert_eq!(outcome.target, TargetDisposition::Rewritten);

    for kind in [
        ArtifactKind::ImpactReport,
        ArtifactKind::Plan,
        ArtifactKind::Diff,
        ArtifactKind::BaselineLog,
        ArtifactKind::AlternateLog,
        ArtifactKind::Iterations,
        ArtifactKind::Evidence,
    ] {
        assert!(ctx.artifact_path(kind).is_file(), "missing {kind:?}");
    }
    assert!(
        project
            .path()
            .join("tests/test_characterization_compute_invoice_total.py")
            .is_file()
    );
    assert!(
        project
            .path()
            .join("tests/test_dual_mode_compute_invoice_total.py")
            .is_file()
    );

    let evidence = std::fs::read_to_string(ctx.artifact_path(ArtifactKind::Evidence)).unwrap();
    assert!(evidence.contains("SUCCESS"));
    let diff = std::fs::read_to_string(ctx.artifact_path(ArtifactKind::Diff)).unwrap();
    assert!(diff.contains("+FREE_SHIPPING_OVER = 100"));
}

#[tokio::test]
async fn fix_loop_converges_on_second_attempt() {
    let project = TestProject::billing();
    let config = ReforgeConfig::default();
    let generator = ScriptedGenerator::new()
        .patch(billing_with_v2(&v2_with_shipping_bug()))
        .fix(billing_with_v2(V2_REFACTORED));
    let runner = shipping_runner(&project);

    let (outcome, _ctx) = run_refactor(&project, &config, &generator, &runner, 5, false).await;

    assert_eq!(outcome.verdict, Verdict::Converged);
    assert_eq!(outcome.iterations.len(), 2);
    assert!(!outcome.iterations[0].converged());
    assert!(outcome.iterations[1].converged());
    assert_eq!(
        outcome.iterations.iter().map(|r| r.attempt).collect::<Vec<_>>(),
        vec![1, 2]
    );

    let fixes = generator.fix_calls();
    assert_eq!(fixes.len(), 1);
    assert_eq!(fixes[0].0, 1);
    // Baseline was green, so the alternate log is the one sent back.
    assert!(fixes[0].1.contains("# Test Run: alternate"));
    assert!(fixes[0].1.contains("2 failed, 22 passed"));
}

#[tokio::test]
async fn mode_switch_reaches_only_alternate_runs() {
    let project = TestProject::billing();
    let config = ReforgeConfig::default();
    let generator = ScriptedGenerator::new().patch(billing_with_v2(V2_REFACTORED));
    let runner = ScriptedRunner::always_green(project.target());

    run_refactor(&project, &config, &generator, &runner, 5, false).await;

    let calls = runner.calls();
    assert_eq!(
        calls,
        vec![
            (Mode::Baseline, None),
            (Mode::Baseline, None),
            (Mode::Alternate, Some("1".to_string())),
        ]
    );
    assert!(std::env::var_os("BILLING_V2").is_none());
}

// ── Exhaustion ──────────────────────────────────────────────────────

#[tokio::test]
async fn exhausts_budget_and_restores_target() {
    let project = TestProject::billing();
    let config = ReforgeConfig::default();
    let buggy = billing_with_v2(&v2_with_shipping_bug());
    let generator = ScriptedGenerator::new()
        .patch(buggy.clone())
        .fix(buggy.clone())
        .fix(buggy);
    let runner = shipping_runner(&project);

    let (outcome, ctx) = run_refactor(&project, &config, &generator, &runner, 3, false).await;

    assert_eq!(outcome.verdict, Verdict::Exhausted);
    assert_eq!(outcome.state, RunState::Done);
    assert_eq!(outcome.iterations.len(), 3);
    assert_eq!(generator.fix_calls().len(), 2);
    assert_eq!(project.read(TARGET), BILLING_PY);

    // One slot, however many applies happened.
    let slots: Vec<_> = std::fs::read_dir(ctx.backup_dir()).unwrap().collect();
    assert_eq!(slots.len(), 1);

    let evidence = std::fs::read_to_string(ctx.artifact_path(ArtifactKind::Evidence)).unwrap();
    assert!(evidence.contains("NOT VERIFIED"));
    assert!(evidence.contains("| 3 of 3 |"));
    assert_eq!(outcome.target, TargetDisposition::Restored);
    assert!(evidence.contains("| Target file | restored from backup |"));

    let iterations = read_artifact_json(&ctx, ArtifactKind::Iterations).unwrap();
    assert_eq!(iterations.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn exhausted_run_keeps_rewrite_when_restore_disabled() {
    let project = TestProject::billing();
    let mut config = ReforgeConfig::default();
    config.run.restore_on_failure = false;
    let buggy = billing_with_v2(&v2_with_shipping_bug());
    let generator = ScriptedGenerator::new().patch(buggy.clone());
    let runner = shipping_runner(&project);

    let (outcome, _ctx) = run_refactor(&project, &config, &generator, &runner, 1, false).await;

    assert_eq!(outcome.verdict, Verdict::Exhausted);
    assert!(generator.fix_calls().is_empty());
    assert_eq!(project.read(TARGET), buggy);
    assert_eq!(outcome.target, TargetDisposition::Retained);
}

#[tokio::test]
async fn each_attempt_advances_progress() {
    let project = TestProject::billing();
    let config = ReforgeConfig::default();
    let buggy = billing_with_v2(&v2_with_shipping_bug());
    let generator = ScriptedGenerator::new()
        .patch(buggy.clone())
        .fix(buggy.clone())
        .fix(buggy);
    let runner = shipping_runner(&project);
    let ctx = RunContext::new(project.path(), &config.run.artifacts_dir);
    let reporter = IndicatifReporter::hidden();

    let outcome = Orchestrator::new(&config, &ctx, &generator, &runner)
        .with_progress(&reporter)
        .run(&RunRequest {
            target: TARGET.into(),
            symbol: "compute_invoice_total".into(),
            max_iterations: Some(3),
            dry_run: false,
        })
        .await
        .unwrap();

    assert_eq!(outcome.verdict, Verdict::Exhausted);
    assert_eq!(reporter.completed(), 3);
}

// ── Aborts ──────────────────────────────────────────────────────────

#[tokio::test]
async fn red_baseline_aborts_before_planning() {
    let project = TestProject::billing();
    let config = ReforgeConfig::default();
    let generator = ScriptedGenerator::new();
    let runner = ScriptedRunner::new(project.target(), |_, _| pytest_output(20, 4));

    let (outcome, _ctx) = run_refactor(&project, &config, &generator, &runner, 5, false).await;

    assert!(matches!(
        outcome.verdict,
        Verdict::Aborted(AbortReason::BaselineUnverified(_))
    ));
    assert_eq!(outcome.state, RunState::Aborted);
    assert!(generator.calls().is_empty());
    assert!(outcome.iterations.is_empty());
    assert_eq!(project.read(TARGET), BILLING_PY);
}

#[tokio::test]
async fn unavailable_generator_is_a_precondition() {
    let project = TestProject::billing();
    let config = ReforgeConfig::default();
    let generator = ScriptedGenerator::unavailable("no API key (set GEMINI_API_KEY)");
    let runner = ScriptedRunner::always_green(project.target());

    let (outcome, ctx) = run_refactor(&project, &config, &generator, &runner, 5, false).await;

    match &outcome.verdict {
        Verdict::Aborted(reason @ AbortReason::Precondition(_)) => {
            assert!(reason.to_string().starts_with("[precondition]"));
            assert!(reason.detail().contains("GEMINI_API_KEY"));
        }
        other => panic!("unexpected verdict {other:?}"),
    }
    assert_eq!(outcome.states, vec![RunState::Init, RunState::Aborted]);
    assert!(runner.calls().is_empty());
    assert!(!ctx.artifacts_dir().exists());
}

#[tokio::test]
async fn generation_failure_after_baseline_aborts_untouched() {
    let project = TestProject::billing();
    let config = ReforgeConfig::default();
    let generator =
        ScriptedGenerator::new().patch_error(GenerationError::Empty("gemini".to_string()));
    let runner = ScriptedRunner::always_green(project.target());

    let (outcome, ctx) = run_refactor(&project, &config, &generator, &runner, 5, false).await;

    assert!(matches!(
        outcome.verdict,
        Verdict::Aborted(AbortReason::Generation(_))
    ));
    assert_eq!(project.read(TARGET), BILLING_PY);
    assert!(!ctx.backup_dir().exists());
    let evidence = std::fs::read_to_string(ctx.artifact_path(ArtifactKind::Evidence)).unwrap();
    assert!(evidence.contains("aborted [generation]"));
}

#[tokio::test]
async fn artifact_failure_after_rewrite_restores_target() {
    let project = TestProject::billing();
    let config = ReforgeConfig::default();
    let generator = ScriptedGenerator::new().patch(billing_with_v2(V2_REFACTORED));
    let alternate_log = project
        .path()
        .join(&config.run.artifacts_dir)
        .join(ArtifactKind::AlternateLog.file_name());
    // A directory in place of the alternate log makes that write fail
    // after the rewrite is already installed.
    let runner = ScriptedRunner::new(project.target(), move |mode, _| {
        if mode == Mode::Alternate {
            std::fs::create_dir_all(&alternate_log).unwrap();
        }
        pytest_output(24, 0)
    });

    let (outcome, ctx) = run_refactor(&project, &config, &generator, &runner, 5, false).await;

    match &outcome.verdict {
        Verdict::Aborted(reason @ AbortReason::Artifact(_)) => {
            assert!(reason.to_string().starts_with("[artifact]"));
            assert!(!reason.before_attempt());
        }
        other => panic!("unexpected verdict {other:?}"),
    }
    assert_eq!(outcome.state, RunState::Aborted);
    assert_eq!(outcome.target, TargetDisposition::Restored);
    assert_eq!(project.read(TARGET), BILLING_PY);
    assert!(outcome.iterations.is_empty());

    let evidence = std::fs::read_to_string(ctx.artifact_path(ArtifactKind::Evidence)).unwrap();
    assert!(evidence.contains("aborted [artifact]"));
    assert!(evidence.contains("| Target file | restored from backup |"));
}

// ── Plan retry and syntax remediation ───────────────────────────────

#[tokio::test]
async fn malformed_plan_is_retried_once() {
    let project = TestProject::billing();
    let config = ReforgeConfig::default();
    let generator = ScriptedGenerator::new()
        .plan(Err(GenerationError::Malformed("expected value at line 1".into())))
        .patch(billing_with_v2(V2_REFACTORED));
    let runner = ScriptedRunner::always_green(project.target());

    let (outcome, _ctx) = run_refactor(&project, &config, &generator, &runner, 5, false).await;

    assert_eq!(outcome.verdict, Verdict::Converged);
    assert_eq!(generator.plan_calls(), 2);
}

#[tokio::test]
async fn second_malformed_plan_aborts() {
    let project = TestProject::billing();
    let config = ReforgeConfig::default();
    let generator = ScriptedGenerator::new()
        .plan(Err(GenerationError::Malformed("first".into())))
        .plan(Err(GenerationError::Malformed("second".into())));
    let runner = ScriptedRunner::always_green(project.target());

    let (outcome, _ctx) = run_refactor(&project, &config, &generator, &runner, 5, false).await;

    assert!(matches!(
        outcome.verdict,
        Verdict::Aborted(AbortReason::Generation(ref d)) if d.contains("second")
    ));
    assert_eq!(generator.plan_calls(), 2);
}

#[tokio::test]
async fn invalid_syntax_gets_one_remediation() {
    let project = TestProject::billing();
    let config = ReforgeConfig::default();
    let generator = ScriptedGenerator::new()
        .patch(INVALID_PYTHON)
        .fix(billing_with_v2(V2_REFACTORED));
    let runner = ScriptedRunner::always_green(project.target());

    let (outcome, _ctx) = run_refactor(&project, &config, &generator, &runner, 5, false).await;

    assert_eq!(outcome.verdict, Verdict::Converged);
    let fixes = generator.fix_calls();
    assert_eq!(fixes.len(), 1);
    assert!(fixes[0].1.starts_with("SyntaxError at line"));
    assert_eq!(project.read(TARGET), billing_with_v2(V2_REFACTORED));
}

#[tokio::test]
async fn invalid_syntax_twice_aborts_without_writing() {
    let project = TestProject::billing();
    let config = ReforgeConfig::default();
    let generator = ScriptedGenerator::new()
        .patch(INVALID_PYTHON)
        .fix(INVALID_PYTHON);
    let runner = ScriptedRunner::always_green(project.target());

    let (outcome, _ctx) = run_refactor(&project, &config, &generator, &runner, 5, false).await;

    assert!(matches!(
        outcome.verdict,
        Verdict::Aborted(AbortReason::Generation(_))
    ));
    assert_eq!(generator.fix_calls().len(), 1);
    assert_eq!(project.read(TARGET), BILLING_PY);
    assert!(outcome.iterations.is_empty());
}

#[tokio::test]
async fn invalid_fix_inside_loop_aborts_and_restores() {
    let project = TestProject::billing();
    let config = ReforgeConfig::default();
    let generator = ScriptedGenerator::new()
        .patch(billing_with_v2(&v2_with_shipping_bug()))
        .fix(INVALID_PYTHON)
        .fix(INVALID_PYTHON);
    let runner = shipping_runner(&project);

    let (outcome, _ctx) = run_refactor(&project, &config, &generator, &runner, 5, false).await;

    assert!(matches!(
        outcome.verdict,
        Verdict::Aborted(AbortReason::Generation(_))
    ));
    assert_eq!(outcome.iterations.len(), 1);
    assert_eq!(project.read(TARGET), BILLING_PY);
}

// ── Dry run, retention, version control ─────────────────────────────

#[tokio::test]
async fn dry_run_executes_and_modifies_nothing() {
    let project = TestProject::billing();
    let config = ReforgeConfig::default();
    let generator = ScriptedGenerator::unavailable("not needed for a dry run");
    let runner = ScriptedRunner::always_green(project.target());

    let (outcome, ctx) = run_refactor(&project, &config, &generator, &runner, 5, true).await;

    assert_eq!(outcome.verdict, Verdict::DryRun);
    assert_eq!(outcome.state, RunState::Done);
    assert!(runner.calls().is_empty());
    assert!(generator.calls().is_empty());
    assert_eq!(project.read(TARGET), BILLING_PY);

    let oracle = outcome.oracle.expect("oracle materialized in memory");
    assert_eq!(oracle.case_count, 20);
    assert_eq!(oracle.dual_mode_count, 4);
    assert!(!project.path().join(&oracle.characterization.path).exists());

    let impact = outcome.impact.expect("impact report");
    assert_eq!(
        impact.definition_file.as_ref().map(|u| u.file.as_str()),
        Some(TARGET)
    );
    assert_eq!(impact.call_site_paths(), vec!["app/api.py".to_string()]);
    assert_eq!(impact.test_files.len(), 1);
    assert_eq!(impact.other_files[0].file, "scripts/report.py");
    assert!(!impact.all_usages.keys().any(|f| f.starts_with(".venv")));
    assert!(!impact.all_usages.keys().any(|f| f.starts_with("node_modules")));

    let persisted = read_artifact_json(&ctx, ArtifactKind::ImpactReport).unwrap();
    assert_eq!(persisted["summary"]["call_sites"], 1);
    assert!(!ctx.artifact_path(ArtifactKind::Evidence).exists());
}

#[tokio::test]
async fn discard_on_success_clears_backup_slot() {
    let project = TestProject::billing();
    let mut config = ReforgeConfig::default();
    config.patch.retention = BackupRetention::DiscardOnSuccess;
    let generator = ScriptedGenerator::new().patch(billing_with_v2(V2_REFACTORED));
    let runner = ScriptedRunner::always_green(project.target());

    let (outcome, ctx) = run_refactor(&project, &config, &generator, &runner, 5, false).await;

    assert_eq!(outcome.verdict, Verdict::Converged);
    let slots = std::fs::read_dir(ctx.backup_dir()).unwrap().count();
    assert_eq!(slots, 0);
}

#[tokio::test]
async fn run_on_new_branch() {
    let project = TestProject::billing();
    let mut config = ReforgeConfig::default();
    config.vcs.create_branch = true;
    let generator = ScriptedGenerator::new().patch(billing_with_v2(V2_REFACTORED));
    let runner = ScriptedRunner::always_green(project.target());
    let git = GitCli::discover(project.path()).unwrap();
    let ctx = RunContext::new(project.path(), "artifacts");

    let outcome = Orchestrator::new(&config, &ctx, &generator, &runner)
        .with_vcs(&git)
        .run(&RunRequest {
            target: TARGET.into(),
            symbol: "compute_invoice_total".into(),
            max_iterations: None,
            dry_run: false,
        })
        .await
        .unwrap();

    assert_eq!(outcome.verdict, Verdict::Converged);
    let branch = git.current_branch().unwrap().unwrap();
    assert!(branch.starts_with("reforge/compute_invoice_total-"), "{branch}");
}
