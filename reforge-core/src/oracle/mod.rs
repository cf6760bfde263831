//! Characterization oracle generation.
//!
//! [`materialize`] turns a [`Catalogue`] into two pytest modules: one test
//! per case checking required fields and the `total` consistency law, and a
//! smaller dual-mode module asserting both configurations return the same
//! result. Output depends only on its inputs; the generation timestamp is
//! confined to a single header line.

pub mod catalogue;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::types::{ModeSwitch, Symbol};

pub use catalogue::{Catalogue, TestCase};

/// Prefix of the only line allowed to differ between two materializations.
pub const GENERATED_AT_PREFIX: &str = "Generated by reforge at ";

/// Where and how the generated tests reach the target.
#[derive(Debug, Clone)]
pub struct OracleTarget {
    /// Python import path, e.g. `app.legacy.billing`.
    pub module: String,
    pub symbol: Symbol,
    pub switch: ModeSwitch,
    pub tolerance: f64,
    /// Directory, relative to the project root, receiving the suite files.
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteFile {
    /// Relative to the project root.
    pub path: PathBuf,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleSuite {
    pub characterization: SuiteFile,
    pub dual_mode: SuiteFile,
    pub case_count: usize,
    pub dual_mode_count: usize,
}

impl OracleSuite {
    pub fn relative_paths(&self) -> Vec<PathBuf> {
        vec![
            self.characterization.path.clone(),
            self.dual_mode.path.clone(),
        ]
    }

    /// Write both files under `root`, replacing earlier generations.
    pub fn write(&self, root: &Path) -> crate::error::Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(2);
        for file in [&self.characterization, &self.dual_mode] {
            let path = root.join(&file.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, &file.content)?;
            written.push(path);
        }
        info!(
            cases = self.case_count,
            dual_mode = self.dual_mode_count,
            "Oracle suite written"
        );
        Ok(written)
    }
}

/// `app/legacy/billing.py` → `app.legacy.billing`.
pub fn module_from_path(target_file: &str) -> String {
    let base = target_file.trim_start_matches("./");
    let module = base.strip_suffix(".py").unwrap_or(base).replace(['/', '\\'], ".");
    match module.strip_suffix(".__init__") {
        Some(package) => package.to_string(),
        None => module,
    }
}

/// Build the oracle suite for `target` from `catalogue`.
pub fn materialize(
    catalogue: &Catalogue,
    target: &OracleTarget,
    generated_at: DateTime<Utc>,
) -> OracleSuite {
    let stamp = generated_at.format("%Y-%m-%d %H:%M:%S UTC");
    let symbol = target.symbol.as_str();

    let characterization = SuiteFile {
        path: target
            .output_dir
            .join(format!("test_characterization_{symbol}.py")),
        content: render_characterization(catalogue, target, &stamp.to_string()),
    };
    let dual_mode = SuiteFile {
        path: target.output_dir.join(format!("test_dual_mode_{symbol}.py")),
        content: render_dual_mode(catalogue, target, &stamp.to_string()),
    };

    OracleSuite {
        characterization,
        dual_mode,
        case_count: catalogue.cases.len(),
        dual_mode_count: catalogue.dual_mode_cases().count(),
    }
}

fn header(out: &mut String, title: &str, target: &OracleTarget, stamp: &str) {
    let _ = writeln!(out, "\"\"\"");
    let _ = writeln!(out, "{title} for {}.{}", target.module, target.symbol);
    let _ = writeln!(out);
    let _ = writeln!(out, "{GENERATED_AT_PREFIX}{stamp}");
    let _ = writeln!(out, "Do not edit by hand; regenerate with `reforge oracle`.");
    let _ = writeln!(out, "\"\"\"");
    let _ = writeln!(out);
}

fn render_characterization(catalogue: &Catalogue, target: &OracleTarget, stamp: &str) -> String {
    let symbol = target.symbol.as_str();
    let mut out = String::new();
    header(&mut out, "Characterization tests", target, stamp);

    let _ = writeln!(out, "from {} import {symbol}", target.module);
    let _ = writeln!(out);
    let fields: Vec<String> = catalogue.required_fields.iter().map(|f| python_str(f)).collect();
    let _ = writeln!(out, "REQUIRED_FIELDS = {}", python_tuple(&fields));
    let _ = writeln!(out, "TOLERANCE = {}", python_float(target.tolerance));
    out.push_str(CHECK_HELPER);

    for case in &catalogue.cases {
        let _ = writeln!(out);
        let _ = writeln!(out);
        let _ = writeln!(out, "def test_{}():", case.name);
        let _ = writeln!(out, "    \"\"\"{}", docstring_text(&case.description));
        if !case.note.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "    Note: {}", docstring_text(&case.note));
        }
        let _ = writeln!(out, "    \"\"\"");
        let _ = writeln!(out, "    order = {}", python_literal(&case.input));
        let _ = writeln!(out, "    _check_consistency({symbol}(order))");
    }
    out
}

const CHECK_HELPER: &str = r#"

def _check_consistency(result):
    for field in REQUIRED_FIELDS:
        assert field in result, f"missing field {field!r}"
    expected = result["subtotal"] - result["discount"] + result["shipping"] + result["tax"]
    assert abs(result["total"] - expected) < TOLERANCE, (
        f"total {result['total']} != {expected}"
    )
"#;

fn render_dual_mode(catalogue: &Catalogue, target: &OracleTarget, stamp: &str) -> String {
    let symbol = target.symbol.as_str();
    let mut out = String::new();
    header(&mut out, "Dual-mode equivalence tests", target, stamp);

    let _ = writeln!(out, "from {} import {symbol}", target.module);
    let _ = writeln!(out);
    let _ = writeln!(out, "SWITCH_VAR = {}", python_str(&target.switch.var));
    let _ = writeln!(out, "SWITCH_VALUE = {}", python_str(&target.switch.value));
    let _ = write!(
        out,
        r#"

def _both_modes(monkeypatch, order):
    monkeypatch.delenv(SWITCH_VAR, raising=False)
    baseline = {symbol}(order)
    monkeypatch.setenv(SWITCH_VAR, SWITCH_VALUE)
    alternate = {symbol}(order)
    return baseline, alternate
"#
    );

    for case in catalogue.dual_mode_cases() {
        let _ = writeln!(out);
        let _ = writeln!(out);
        let _ = writeln!(out, "def test_dual_mode_{}(monkeypatch):", case.name);
        let _ = writeln!(out, "    \"\"\"{}", docstring_text(&case.description));
        let _ = writeln!(out, "    \"\"\"");
        let _ = writeln!(out, "    order = {}", python_literal(&case.input));
        let _ = writeln!(out, "    baseline, alternate = _both_modes(monkeypatch, order)");
        let _ = writeln!(
            out,
            "    assert baseline == alternate, f\"mode mismatch:\\nbaseline:  {{baseline}}\\nalternate: {{alternate}}\""
        );
    }
    out
}

// ── Python literal rendering ────────────────────────────────────────

/// Render a JSON value as the equivalent Python literal.
pub fn python_literal(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Null => "None".into(),
        Value::Bool(true) => "True".into(),
        Value::Bool(false) => "False".into(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => python_str(s),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(python_literal).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", python_str(k), python_literal(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

/// JSON string escapes are valid Python string escapes.
fn python_str(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn python_tuple(items: &[String]) -> String {
    match items {
        [single] => format!("({single},)"),
        _ => format!("({})", items.join(", ")),
    }
}

fn python_float(f: f64) -> String {
    let text = f.to_string();
    if text.contains(['.', 'e', 'E']) {
        text
    } else {
        format!("{text}.0")
    }
}

fn docstring_text(s: &str) -> String {
    s.replace('\\', "\\\\").replace("\"\"\"", "\\\"\\\"\\\"")
}
