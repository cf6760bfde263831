//! Dual-mode oracle execution.
//!
//! The configuration switch is handed to the runner explicitly and applied
//! to the child process environment only. The tool's own environment is
//! never touched, so one mode cannot leak into the next run.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::context::{ArtifactKind, RunContext};
use crate::error::ExecError;
use crate::types::{Mode, ModeSwitch, RunResult, TestCounts};

/// Raw output of one test-runner invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Test-execution collaborator.
#[async_trait::async_trait]
pub trait TestRunner: Send + Sync + std::fmt::Debug {
    /// Run the suite files (relative to the project root) under `mode`.
    async fn execute(
        &self,
        suite: &[PathBuf],
        mode: Mode,
        switch: &ModeSwitch,
    ) -> Result<ExecOutput, ExecError>;
}

// ── Pytest ──────────────────────────────────────────────────────────

/// Runs `python -m pytest <suite> -v --tb=short` in the project root.
#[derive(Debug, Clone)]
pub struct PytestRunner {
    root: PathBuf,
    program: String,
    args: Vec<String>,
}

impl PytestRunner {
    pub fn new(root: &Path, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            root: root.to_path_buf(),
            program: program.into(),
            args,
        }
    }

    fn command(&self, suite: &[PathBuf], mode: Mode, switch: &ModeSwitch) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(suite)
            .args(["-v", "--tb=short"])
            .current_dir(&self.root)
            .kill_on_drop(true);
        match switch.value_for(mode) {
            Some(value) => {
                cmd.env(&switch.var, value);
            }
            None => {
                cmd.env_remove(&switch.var);
            }
        }
        cmd
    }
}

#[async_trait::async_trait]
impl TestRunner for PytestRunner {
    async fn execute(
        &self,
        suite: &[PathBuf],
        mode: Mode,
        switch: &ModeSwitch,
    ) -> Result<ExecOutput, ExecError> {
        for file in suite {
            if !self.root.join(file).is_file() {
                return Err(ExecError::SuiteMissing(file.clone()));
            }
        }

        debug!(program = %self.program, %mode, "Spawning test runner");
        let output = self
            .command(suite, mode, switch)
            .output()
            .await
            .map_err(|source| ExecError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

// ── Executor ────────────────────────────────────────────────────────

/// Runs the oracle suite under a named mode and records the report.
#[derive(Debug)]
pub struct DualModeExecutor<'a> {
    runner: &'a dyn TestRunner,
    ctx: &'a RunContext,
    suite: Vec<PathBuf>,
    switch: ModeSwitch,
}

impl<'a> DualModeExecutor<'a> {
    pub fn new(
        runner: &'a dyn TestRunner,
        ctx: &'a RunContext,
        suite: Vec<PathBuf>,
        switch: ModeSwitch,
    ) -> Self {
        Self {
            runner,
            ctx,
            suite,
            switch,
        }
    }

    /// Execute under `mode`, write the per-mode log artifact and return
    /// the parsed result. A runner that cannot start yields a zero-count
    /// result carrying the failure in its log, which is never green.
    #[instrument(skip_all, name = "oracle_run", fields(mode = %mode))]
    pub async fn run(&self, mode: Mode) -> crate::error::Result<RunResult> {
        let output = match self.runner.execute(&self.suite, mode, &self.switch).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Test runner failed to start");
                ExecOutput {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: e.to_string(),
                }
            }
        };

        let counts = parse_counts(&format!("{}\n{}", output.stdout, output.stderr));
        let green = counts.passed > 0 && counts.failed == 0 && counts.errors == 0;
        let raw_log = self.render_log(mode, &output, green);

        let kind = match mode {
            Mode::Baseline => ArtifactKind::BaselineLog,
            Mode::Alternate => ArtifactKind::AlternateLog,
        };
        self.ctx.write_text(kind, &raw_log)?;

        info!(
            passed = counts.passed,
            failed = counts.failed,
            errors = counts.errors,
            exit_code = ?output.exit_code,
            "Oracle run complete"
        );
        Ok(RunResult::from_counts(mode, counts, output.exit_code, raw_log))
    }

    fn render_log(&self, mode: Mode, output: &ExecOutput, green: bool) -> String {
        let suite = self
            .suite
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let switch = match self.switch.value_for(mode) {
            Some(value) => format!("{}={value}", self.switch.var),
            None => format!("{} unset", self.switch.var),
        };
        let exit = output
            .exit_code
            .map_or_else(|| "none".to_string(), |c| c.to_string());

        let mut log = String::new();
        let _ = writeln!(log, "# Test Run: {mode}");
        let _ = writeln!(log, "Timestamp: {}", Utc::now().to_rfc3339());
        let _ = writeln!(log, "Suite: {suite}");
        let _ = writeln!(log, "Switch: {switch}");
        let _ = writeln!(log, "Exit Code: {exit}");
        let _ = writeln!(log, "Success: {green}");
        let _ = writeln!(log);
        let _ = writeln!(log, "## STDOUT");
        log.push_str(&output.stdout);
        if !output.stdout.ends_with('\n') {
            log.push('\n');
        }
        let _ = writeln!(log);
        let _ = writeln!(log, "## STDERR");
        log.push_str(&output.stderr);
        log
    }
}

// ── Summary parsing ─────────────────────────────────────────────────

static PASSED: LazyLock<Regex> = LazyLock::new(|| count_pattern("passed"));
static FAILED: LazyLock<Regex> = LazyLock::new(|| count_pattern("failed"));
static ERRORS: LazyLock<Regex> = LazyLock::new(|| count_pattern("errors?"));

fn count_pattern(word: &str) -> Regex {
    Regex::new(&format!(r"\b(\d+) {word}\b")).expect("count pattern is a valid regex")
}

fn capture(re: &Regex, line: &str) -> Option<u32> {
    re.captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Extract summary counts from the last summary line of a test report.
///
/// No summary line means zeros, which the green check treats as failure.
pub fn parse_counts(raw_log: &str) -> TestCounts {
    for line in raw_log.lines().rev() {
        let passed = capture(&PASSED, line);
        let failed = capture(&FAILED, line);
        let errors = capture(&ERRORS, line);
        if passed.is_some() || failed.is_some() || errors.is_some() {
            return TestCounts {
                passed: passed.unwrap_or(0),
                failed: failed.unwrap_or(0),
                errors: errors.unwrap_or(0),
            };
        }
    }
    TestCounts::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    #[test]
    fn parses_mixed_summary() {
        let counts = parse_counts("7 passed, 2 failed");
        assert_eq!(
            counts,
            TestCounts {
                passed: 7,
                failed: 2,
                errors: 0
            }
        );
    }

    #[test]
    fn no_summary_is_zero() {
        assert_eq!(parse_counts("collected 0 items\nno tests ran"), TestCounts::default());
        assert_eq!(parse_counts(""), TestCounts::default());
    }

    #[test]
    fn uses_last_summary_line() {
        let log = "tests/a.py::test_one PASSED\n\
                   ===== 3 passed, 1 error in 0.20s =====\n\
                   rerun:\n\
                   ===== 24 passed in 0.31s =====\n";
        assert_eq!(
            parse_counts(log),
            TestCounts {
                passed: 24,
                failed: 0,
                errors: 0
            }
        );
    }

    #[test]
    fn ignores_uppercase_status_and_xfailed() {
        let log = "tests/a.py::test_x FAILED\n=== 1 passed, 2 xfailed, 3 errors in 1s ===";
        assert_eq!(
            parse_counts(log),
            TestCounts {
                passed: 1,
                failed: 0,
                errors: 3
            }
        );
    }

    #[derive(Debug, Default)]
    struct RecordingRunner {
        seen: Mutex<Vec<(Mode, Option<String>)>>,
    }

    #[async_trait::async_trait]
    impl TestRunner for RecordingRunner {
        async fn execute(
            &self,
            _suite: &[PathBuf],
            mode: Mode,
            switch: &ModeSwitch,
        ) -> Result<ExecOutput, ExecError> {
            self.seen
                .lock()
                .unwrap()
                .push((mode, switch.value_for(mode).map(str::to_string)));
            Ok(ExecOutput {
                exit_code: Some(0),
                stdout: "===== 24 passed in 0.05s =====".into(),
                stderr: String::new(),
            })
        }
    }

    #[derive(Debug)]
    struct BrokenRunner;

    #[async_trait::async_trait]
    impl TestRunner for BrokenRunner {
        async fn execute(
            &self,
            _suite: &[PathBuf],
            _mode: Mode,
            _switch: &ModeSwitch,
        ) -> Result<ExecOutput, ExecError> {
            Err(ExecError::Spawn {
                program: "python".into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            })
        }
    }

    #[tokio::test]
    async fn run_writes_mode_log() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(dir.path(), "artifacts");
        let runner = RecordingRunner::default();
        let exec = DualModeExecutor::new(
            &runner,
            &ctx,
            vec![PathBuf::from("tests/test_x.py")],
            ModeSwitch::new("BILLING_V2", "1"),
        );

        let baseline = exec.run(Mode::Baseline).await.unwrap();
        let alternate = exec.run(Mode::Alternate).await.unwrap();
        assert!(baseline.is_green() && alternate.is_green());
        assert_eq!(alternate.mode, Mode::Alternate);

        let seen = runner.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![(Mode::Baseline, None), (Mode::Alternate, Some("1".into()))]
        );

        let log = std::fs::read_to_string(ctx.artifact_path(ArtifactKind::AlternateLog)).unwrap();
        assert!(log.starts_with("# Test Run: alternate"));
        assert!(log.contains("Switch: BILLING_V2=1"));
        assert!(log.contains("Success: true"));
        assert!(ctx.artifact_path(ArtifactKind::BaselineLog).exists());
        assert!(std::env::var("BILLING_V2").is_err());
    }

    #[tokio::test]
    async fn spawn_failure_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(dir.path(), "artifacts");
        let exec = DualModeExecutor::new(&BrokenRunner, &ctx, vec![], ModeSwitch::new("V2", "1"));
        let result = exec.run(Mode::Baseline).await.unwrap();
        assert!(!result.is_green());
        assert_eq!(result.passed, 0);
        assert!(result.raw_log.contains("Cannot spawn `python`"));
    }

    #[tokio::test]
    async fn pytest_runner_reports_missing_suite() {
        let dir = tempfile::tempdir().unwrap();
        let runner = PytestRunner::new(dir.path(), "python", vec!["-m".into(), "pytest".into()]);
        let err = runner
            .execute(&[PathBuf::from("tests/none.py")], Mode::Baseline, &ModeSwitch::new("V2", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::SuiteMissing(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn recovers_pytest_summary(passed in 0u32..500, failed in 0u32..50, errors in 0u32..50) {
            let mut parts = Vec::new();
            if failed > 0 { parts.push(format!("{failed} failed")); }
            if passed > 0 { parts.push(format!("{passed} passed")); }
            if errors > 0 { parts.push(format!("{errors} errors")); }
            prop_assume!(!parts.is_empty());
            let log = format!("noise line\n===== {} in 0.42s =====\n", parts.join(", "));
            prop_assert_eq!(parse_counts(&log), TestCounts { passed, failed, errors });
        }
    }
}
