use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ReforgeError;

// ── Symbol ──────────────────────────────────────────────────────────

/// Identifier of the function under refactor. Fixed for a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn new(name: impl Into<String>) -> crate::error::Result<Self> {
        let name = name.into();
        if !is_identifier(&name) {
            return Err(ReforgeError::Precondition(format!(
                "`{name}` is not a valid identifier"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// ASCII identifier: a letter or `_`, then letters, digits or `_`.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Symbol {
    type Error = ReforgeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Symbol> for String {
    fn from(value: Symbol) -> Self {
        value.0
    }
}

// ── Impact ──────────────────────────────────────────────────────────

/// Relative `/`-separated path → ascending 1-based line numbers.
pub type UsageMap = BTreeMap<String, Vec<usize>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUsage {
    pub file: String,
    pub lines: Vec<usize>,
    pub usage_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactTarget {
    pub file: String,
    pub symbol: Symbol,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactSummary {
    pub total_files: usize,
    pub total_usages: usize,
    pub call_sites: usize,
    pub test_files: usize,
    pub other_files: usize,
}

/// Classified view of a [`UsageMap`]. Every file of `all_usages` lands in
/// exactly one of `call_sites`, `test_files`, `other_files` or
/// `definition_file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactReport {
    pub target: ImpactTarget,
    pub summary: ImpactSummary,
    pub call_sites: Vec<FileUsage>,
    pub test_files: Vec<FileUsage>,
    pub other_files: Vec<FileUsage>,
    pub definition_file: Option<FileUsage>,
    pub all_usages: UsageMap,
    /// Paths the scan could not read; their usages are unknown.
    #[serde(default)]
    pub skipped: Vec<SkippedFile>,
}

/// A file or directory the walk could not read. The scan continues past it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

impl ImpactReport {
    /// Call-site paths, in report order.
    pub fn call_site_paths(&self) -> Vec<String> {
        self.call_sites.iter().map(|u| u.file.clone()).collect()
    }
}

// ── Verification ────────────────────────────────────────────────────

/// The two named runtime configurations the oracle runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Baseline,
    Alternate,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Alternate => "alternate",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit configuration switch: the environment variable that selects the
/// alternate implementation. Only child processes ever see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeSwitch {
    pub var: String,
    pub value: String,
}

impl ModeSwitch {
    pub fn new(var: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            value: value.into(),
        }
    }

    /// Value the variable must have under `mode`; `None` means unset.
    pub fn value_for(&self, mode: Mode) -> Option<&str> {
        match mode {
            Mode::Baseline => None,
            Mode::Alternate => Some(&self.value),
        }
    }
}

/// Summary counts pulled from a test report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
}

/// Outcome of one oracle execution under one configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub mode: Mode,
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub raw_log: String,
}

impl RunResult {
    pub fn from_counts(
        mode: Mode,
        counts: TestCounts,
        exit_code: Option<i32>,
        raw_log: String,
    ) -> Self {
        Self {
            mode,
            passed: counts.passed,
            failed: counts.failed,
            errors: counts.errors,
            exit_code,
            raw_log,
        }
    }

    /// Green means at least one pass and nothing failed or errored. A log
    /// without a summary line parses to zeros and is therefore never green.
    pub fn is_green(&self) -> bool {
        self.passed > 0 && self.failed == 0 && self.errors == 0
    }

    pub fn counts(&self) -> TestCounts {
        TestCounts {
            passed: self.passed,
            failed: self.failed,
            errors: self.errors,
        }
    }
}

/// One fix-loop attempt. Records are append-only and ordered by `attempt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub attempt: u32,
    pub code_snapshot: String,
    pub baseline: RunResult,
    pub alternate: RunResult,
}

impl IterationRecord {
    pub fn converged(&self) -> bool {
        self.baseline.is_green() && self.alternate.is_green()
    }
}

// ── Plan ────────────────────────────────────────────────────────────

/// Refactoring plan returned by the planning collaborator. Only passed
/// through to later prompts and the evidence report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Plan {
    pub summary: String,
    pub issues: Vec<serde_json::Value>,
    pub improvements: Vec<serde_json::Value>,
    pub constants: serde_json::Map<String, serde_json::Value>,
    pub helper_functions: Vec<serde_json::Value>,
    pub risks: Vec<serde_json::Value>,
}

impl Plan {
    /// True when the response carried none of the plan's keys, as for `{}`
    /// or an object of some other shape.
    pub fn is_empty(&self) -> bool {
        self.summary.trim().is_empty()
            && self.issues.is_empty()
            && self.improvements.is_empty()
            && self.constants.is_empty()
            && self.helper_functions.is_empty()
            && self.risks.is_empty()
    }
}

/// Plain text for a plan entry: strings as-is, anything else as compact JSON.
pub fn plan_entry_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Run state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Init,
    Scanning,
    BaselineVerified,
    Planning,
    Patching,
    Iterating,
    Converged,
    Exhausted,
    Reporting,
    Done,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

/// Why a run stopped before reaching a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", content = "detail", rename_all = "snake_case")]
pub enum AbortReason {
    /// Checks before any mutation failed.
    Precondition(String),
    /// The oracle did not pass against the untouched implementation.
    BaselineUnverified(String),
    /// The generation collaborator failed past its remediation request.
    Generation(String),
    /// The patch applier could not install a validated rewrite.
    Patch(String),
    /// Writing an artifact or running the oracle failed after the target
    /// was rewritten.
    Artifact(String),
}

impl AbortReason {
    pub fn category(&self) -> &'static str {
        match self {
            Self::Precondition(_) => "precondition",
            Self::BaselineUnverified(_) => "baseline",
            Self::Generation(_) => "generation",
            Self::Patch(_) => "patch",
            Self::Artifact(_) => "artifact",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::Precondition(d)
            | Self::BaselineUnverified(d)
            | Self::Generation(d)
            | Self::Patch(d)
            | Self::Artifact(d) => d,
        }
    }

    /// True when the run stopped before any attempt to rewrite the target.
    pub fn before_attempt(&self) -> bool {
        matches!(self, Self::Precondition(_) | Self::BaselineUnverified(_))
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category(), self.detail())
    }
}

/// What the target file holds once a run has settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetDisposition {
    /// Never written.
    #[default]
    Untouched,
    /// Holds the converged rewrite.
    Rewritten,
    /// Put back from the backup slot after a failed run.
    Restored,
    /// Still holds the last rewrite of a failed run.
    Retained,
}

impl fmt::Display for TargetDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Untouched => "unchanged",
            Self::Rewritten => "rewritten",
            Self::Restored => "restored from backup",
            Self::Retained => "left holding the last rewrite",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Converged,
    Exhausted,
    Aborted(AbortReason),
    /// Discovery-only run; nothing was mutated or executed.
    DryRun,
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Converged | Self::DryRun)
    }
}
