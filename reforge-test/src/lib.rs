// Integration test utilities and fixture management for Reforge.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use reforge_core::config::ReforgeConfig;
use reforge_core::context::{ArtifactKind, RunContext};
use reforge_core::error::{ExecError, GenerationError};
use reforge_core::executor::{ExecOutput, TestRunner};
use reforge_core::generate::CodeGenerator;
use reforge_core::orchestrator::{Orchestrator, RunOutcome, RunRequest};
use reforge_core::types::{Mode, ModeSwitch, Plan, Symbol};

pub const TARGET: &str = "app/legacy/billing.py";
pub const SYMBOL: &str = "compute_invoice_total";

/// A test fixture with a temporary Python project under git.
#[derive(Debug)]
pub struct TestProject {
    pub dir: tempfile::TempDir,
}

impl TestProject {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn target(&self) -> PathBuf {
        self.path().join(TARGET)
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.path().join(rel)).unwrap()
    }

    /// The billing project: a legacy `compute_invoice_total` behind a
    /// `BILLING_V2` router, an API module calling it, a test file, a script
    /// and a virtualenv that must never be scanned.
    pub fn billing() -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        let root = dir.path();

        write_file(root, "app/__init__.py", "");
        write_file(root, "app/legacy/__init__.py", "");
        write_file(root, TARGET, BILLING_PY);
        write_file(root, "app/api.py", API_PY);
        write_file(root, "tests/test_billing.py", TESTS_PY);
        write_file(
            root,
            "scripts/report.py",
            "# one-off report built on compute_invoice_total\nfrom app.legacy.billing import compute_invoice_total\n",
        );
        write_file(
            root,
            ".venv/lib/site-packages/shim.py",
            "compute_invoice_total = None\n",
        );
        write_file(
            root,
            "node_modules/pkg/gen.py",
            "compute_invoice_total = 0\n",
        );
        write_file(root, ".gitignore", ".venv/\nnode_modules/\nartifacts/\n");

        git(root, &["init", "-q"]);
        git(root, &["config", "user.email", "test@reforge.dev"]);
        git(root, &["config", "user.name", "Test"]);
        git(root, &["add", "."]);
        git(root, &["commit", "-q", "-m", "Billing project"]);

        Self { dir }
    }
}

pub fn git(root: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .status()
        .expect("run git");
    assert!(status.success(), "git {args:?} failed");
}

pub fn write_file(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// Read a JSON artifact of a finished run.
pub fn read_artifact_json(ctx: &RunContext, kind: ArtifactKind) -> anyhow::Result<serde_json::Value> {
    let text = std::fs::read_to_string(ctx.artifact_path(kind))?;
    Ok(serde_json::from_str(&text)?)
}

/// Drive one run against `project` with scripted collaborators.
pub async fn run_refactor(
    project: &TestProject,
    config: &ReforgeConfig,
    generator: &dyn CodeGenerator,
    runner: &dyn TestRunner,
    max_iterations: u32,
    dry_run: bool,
) -> (RunOutcome, RunContext) {
    let ctx = RunContext::new(project.path(), &config.run.artifacts_dir);
    let request = RunRequest {
        target: PathBuf::from(TARGET),
        symbol: SYMBOL.to_string(),
        max_iterations: Some(max_iterations),
        dry_run,
    };
    let outcome = Orchestrator::new(config, &ctx, generator, runner)
        .run(&request)
        .await
        .expect("run completes");
    (outcome, ctx)
}

// ── Python fixture sources ──────────────────────────────────────────

pub const BILLING_PY: &str = r#""""Billing: invoice totals for checkout."""

import os


def _compute_invoice_total_legacy(order: dict) -> dict:
    s = 0
    has_physical = False
    for i in order.get("items", []):
        s += i["qty"] * i["price"]
        if i.get("type") == "physical":
            has_physical = True

    d = 0
    c = order.get("coupon")
    if c:
        if c == "SAVE10":
            d = s * 0.1
        elif c == "WELCOME5":
            if s > 20:
                d = 5.0
        elif c == "HALF":
            d = s * 0.5
            if d > 50:
                d = 50

    m = order.get("member")
    if m:
        if m == "gold":
            d = d + (s * 0.02)
        elif m == "platinum":
            d = d + (s * 0.05)

    sh = 0
    if has_physical:
        if s > 100:
            sh = 0
        else:
            sh = 5.99

    st = order.get("state", "")
    t = 0
    after = s - d
    if st == "CA":
        t = after * 0.0825
    elif st == "NY":
        t = after * 0.07
    elif st == "TX":
        t = 0
    else:
        t = after * 0.05

    total = s - d + sh + t
    return {
        "currency": "USD",
        "subtotal": round(s, 2),
        "discount": round(d, 2),
        "shipping": round(sh, 2),
        "tax": round(t, 2),
        "total": round(total, 2),
    }


def _compute_invoice_total_v2(order: dict) -> dict:
    return _compute_invoice_total_legacy(order)


def compute_invoice_total(order: dict) -> dict:
    """Route to the refactored implementation when BILLING_V2 is set."""
    if os.environ.get("BILLING_V2"):
        return _compute_invoice_total_v2(order)
    return _compute_invoice_total_legacy(order)
"#;

const API_PY: &str = r#""""Checkout endpoints."""

from app.legacy.billing import compute_invoice_total


def handle_checkout_request(request_data: dict) -> dict:
    return {"status": "success", "invoice": compute_invoice_total(request_data)}
"#;

const TESTS_PY: &str = r#"from app.legacy.billing import compute_invoice_total


def test_empty_order():
    assert compute_invoice_total({"items": []})["total"] == 0
"#;

/// `BILLING_PY` with the v2 path replaced by `v2_body` (indented source).
pub fn billing_with_v2(v2_body: &str) -> String {
    BILLING_PY.replace(
        "    return _compute_invoice_total_legacy(order)\n\n\ndef compute_invoice_total",
        &format!("{v2_body}\n\n\ndef compute_invoice_total"),
    )
}

/// A refactored v2 that matches the legacy behavior.
pub const V2_REFACTORED: &str = r#"    subtotal = sum(item["qty"] * item["price"] for item in order.get("items", []))
    has_physical = any(item.get("type") == "physical" for item in order.get("items", []))
    discount = _coupon_discount(order.get("coupon"), subtotal)
    discount += subtotal * MEMBER_RATES.get(order.get("member"), 0)
    shipping = 0 if not has_physical or subtotal > FREE_SHIPPING_OVER else FLAT_SHIPPING
    tax = (subtotal - discount) * TAX_RATES.get(order.get("state", ""), DEFAULT_TAX_RATE)
    total = subtotal - discount + shipping + tax
    return {
        "currency": "USD",
        "subtotal": round(subtotal, 2),
        "discount": round(discount, 2),
        "shipping": round(shipping, 2),
        "tax": round(tax, 2),
        "total": round(total, 2),
    }


FREE_SHIPPING_OVER = 100
FLAT_SHIPPING = 5.99
MEMBER_RATES = {"gold": 0.02, "platinum": 0.05}
TAX_RATES = {"CA": 0.0825, "NY": 0.07, "TX": 0}
DEFAULT_TAX_RATE = 0.05


def _coupon_discount(coupon, subtotal):
    if coupon == "SAVE10":
        return subtotal * 0.1
    if coupon == "WELCOME5":
        return 5.0 if subtotal > 20 else 0
    if coupon == "HALF":
        return min(subtotal * 0.5, 50)
    return 0"#;

/// Same as [`V2_REFACTORED`] but with the free-shipping threshold moved,
/// which the dual-mode suite catches.
pub fn v2_with_shipping_bug() -> String {
    V2_REFACTORED.replace("FREE_SHIPPING_OVER = 100", "FREE_SHIPPING_OVER = 50")
}

// ── Scripted generator ──────────────────────────────────────────────

/// One request the generator received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratorCall {
    Plan,
    Patch,
    Fix { attempt: u32, failure_log: String },
}

/// Code generator that replays queued responses and records every call.
/// An empty queue answers plans with a default plan and code requests
/// with an empty-response error.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    unavailable: Option<String>,
    plans: Mutex<VecDeque<Result<Plan, GenerationError>>>,
    patches: Mutex<VecDeque<Result<String, GenerationError>>>,
    fixes: Mutex<VecDeque<Result<String, GenerationError>>>,
    calls: Mutex<Vec<GeneratorCall>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable(reason: &str) -> Self {
        Self {
            unavailable: Some(reason.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn plan(self, plan: Result<Plan, GenerationError>) -> Self {
        self.plans.lock().unwrap().push_back(plan);
        self
    }

    #[must_use]
    pub fn patch(self, code: impl Into<String>) -> Self {
        self.patches.lock().unwrap().push_back(Ok(code.into()));
        self
    }

    #[must_use]
    pub fn patch_error(self, err: GenerationError) -> Self {
        self.patches.lock().unwrap().push_back(Err(err));
        self
    }

    #[must_use]
    pub fn fix(self, code: impl Into<String>) -> Self {
        self.fixes.lock().unwrap().push_back(Ok(code.into()));
        self
    }

    pub fn calls(&self) -> Vec<GeneratorCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn plan_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, GeneratorCall::Plan))
            .count()
    }

    pub fn fix_calls(&self) -> Vec<(u32, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GeneratorCall::Fix {
                    attempt,
                    failure_log,
                } => Some((attempt, failure_log)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: GeneratorCall) {
        self.calls.lock().unwrap().push(call);
    }
}

fn next_code(
    queue: &Mutex<VecDeque<Result<String, GenerationError>>>,
) -> Result<String, GenerationError> {
    queue
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(GenerationError::Empty("scripted generator".into())))
}

#[async_trait::async_trait]
impl CodeGenerator for ScriptedGenerator {
    fn check_available(&self) -> Result<(), GenerationError> {
        match &self.unavailable {
            Some(reason) => Err(GenerationError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    async fn plan(&self, _: &str, _: &Symbol, _: &[String]) -> Result<Plan, GenerationError> {
        self.record(GeneratorCall::Plan);
        self.plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(Plan {
                    summary: "extract constants and helpers".into(),
                    ..Plan::default()
                })
            })
    }

    async fn patch(&self, _: &str, _: &Symbol, _: &Plan) -> Result<String, GenerationError> {
        self.record(GeneratorCall::Patch);
        next_code(&self.patches)
    }

    async fn fix(
        &self,
        _: &str,
        _: &Symbol,
        failure_log: &str,
        attempt: u32,
    ) -> Result<String, GenerationError> {
        self.record(GeneratorCall::Fix {
            attempt,
            failure_log: failure_log.to_string(),
        });
        next_code(&self.fixes)
    }
}

// ── Scripted runner ─────────────────────────────────────────────────

type Judge = dyn Fn(Mode, &str) -> ExecOutput + Send + Sync;

/// Test runner that decides the outcome from the mode and the target
/// file's current content, and records what it was asked to run.
pub struct ScriptedRunner {
    target: PathBuf,
    judge: Box<Judge>,
    calls: Mutex<Vec<(Mode, Option<String>)>>,
}

impl std::fmt::Debug for ScriptedRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedRunner")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl ScriptedRunner {
    pub fn new(
        target: PathBuf,
        judge: impl Fn(Mode, &str) -> ExecOutput + Send + Sync + 'static,
    ) -> Self {
        Self {
            target,
            judge: Box::new(judge),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every run passes.
    pub fn always_green(target: PathBuf) -> Self {
        Self::new(target, |_, _| pytest_output(24, 0))
    }

    /// `(mode, switch value the child would see)` for each execution.
    pub fn calls(&self) -> Vec<(Mode, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl TestRunner for ScriptedRunner {
    async fn execute(
        &self,
        _suite: &[PathBuf],
        mode: Mode,
        switch: &ModeSwitch,
    ) -> Result<ExecOutput, ExecError> {
        self.calls
            .lock()
            .unwrap()
            .push((mode, switch.value_for(mode).map(str::to_string)));
        let code = std::fs::read_to_string(&self.target).unwrap_or_default();
        Ok((self.judge)(mode, &code))
    }
}

/// Output shaped like a pytest run with the given counts.
pub fn pytest_output(passed: u32, failed: u32) -> ExecOutput {
    let summary = match (passed, failed) {
        (p, 0) => format!("============================== {p} passed in 0.12s =============================="),
        (0, f) => format!("============================== {f} failed in 0.12s =============================="),
        (p, f) => format!("========================= {f} failed, {p} passed in 0.15s ========================="),
    };
    let mut stdout = String::from("============================= test session starts ==============================\n");
    if failed > 0 {
        stdout.push_str("FAILED tests/test_dual_mode_compute_invoice_total.py::test_dual_mode_save10_coupon - AssertionError: mode mismatch\n");
    }
    stdout.push_str(&summary);
    stdout.push('\n');
    ExecOutput {
        exit_code: Some(i32::from(failed > 0)),
        stdout,
        stderr: String::new(),
    }
}

/// True when `python -m pytest` can run here.
pub fn pytest_available() -> bool {
    Command::new("python")
        .args(["-m", "pytest", "--version"])
        .output()
        .is_ok_and(|o| o.status.success())
}
