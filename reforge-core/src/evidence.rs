//! Markdown evidence report for a finished run.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::llm::CostTracker;
use crate::types::{
    ImpactSummary, IterationRecord, Plan, RunResult, Symbol, TargetDisposition, Verdict,
    plan_entry_text,
};

/// Everything the report needs. Only references; rendering never fails.
#[derive(Debug, Clone, Copy)]
pub struct EvidenceInputs<'a> {
    pub target_file: &'a str,
    pub symbol: &'a Symbol,
    pub generated_at: DateTime<Utc>,
    pub verdict: &'a Verdict,
    pub disposition: TargetDisposition,
    pub max_iterations: u32,
    pub original_code: &'a str,
    pub final_code: &'a str,
    pub plan: Option<&'a Plan>,
    pub baseline: Option<&'a RunResult>,
    pub alternate: Option<&'a RunResult>,
    pub iterations: &'a [IterationRecord],
    pub impact: Option<&'a ImpactSummary>,
    pub usage: Option<&'a CostTracker>,
    pub diff: Option<&'a str>,
}

impl EvidenceInputs<'_> {
    /// Both latest results green. The report never claims success otherwise.
    pub fn verified(&self) -> bool {
        self.baseline.is_some_and(RunResult::is_green)
            && self.alternate.is_some_and(RunResult::is_green)
    }
}

pub fn render(inputs: &EvidenceInputs<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Refactoring Evidence: `{}`\n", inputs.symbol);
    let _ = writeln!(
        out,
        "Generated: {}\n",
        inputs.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    render_summary(&mut out, inputs);
    render_results(&mut out, inputs);
    render_iterations(&mut out, inputs.iterations);
    if let Some(impact) = inputs.impact {
        render_impact(&mut out, impact);
    }
    if let Some(plan) = inputs.plan {
        render_plan(&mut out, plan);
    }
    if let Some(usage) = inputs.usage {
        render_usage(&mut out, usage);
    }
    render_changes(&mut out, inputs);
    out
}

fn verdict_label(verdict: &Verdict) -> String {
    match verdict {
        Verdict::Converged => "converged".to_string(),
        Verdict::Exhausted => "exhausted".to_string(),
        Verdict::Aborted(reason) => format!("aborted {reason}"),
        Verdict::DryRun => "dry run".to_string(),
    }
}

fn render_summary(out: &mut String, inputs: &EvidenceInputs<'_>) {
    let _ = writeln!(out, "## Summary\n");
    let _ = writeln!(out, "| Field | Value |");
    let _ = writeln!(out, "|-------|-------|");
    let _ = writeln!(out, "| Target | `{}` |", inputs.target_file);
    let _ = writeln!(out, "| Symbol | `{}` |", inputs.symbol);
    let _ = writeln!(out, "| Verdict | {} |", verdict_label(inputs.verdict));
    let _ = writeln!(out, "| Target file | {} |", inputs.disposition);
    let _ = writeln!(
        out,
        "| Iterations | {} of {} |",
        inputs.iterations.len(),
        inputs.max_iterations
    );
    let status = if inputs.verified() {
        "SUCCESS: both configurations pass the oracle"
    } else {
        "NOT VERIFIED: at least one configuration is failing"
    };
    let _ = writeln!(out, "| Status | {status} |\n");
}

fn result_line(label: &str, result: Option<&RunResult>) -> String {
    match result {
        Some(r) => format!(
            "| {label} | {} | {} | {} | {} |",
            if r.is_green() { "PASS" } else { "FAIL" },
            r.passed,
            r.failed,
            r.errors
        ),
        None => format!("| {label} | NOT RUN | - | - | - |"),
    }
}

fn render_results(out: &mut String, inputs: &EvidenceInputs<'_>) {
    let _ = writeln!(out, "## Test Results\n");
    let _ = writeln!(out, "| Configuration | Status | Passed | Failed | Errors |");
    let _ = writeln!(out, "|---------------|--------|--------|--------|--------|");
    let _ = writeln!(out, "{}", result_line("Baseline", inputs.baseline));
    let _ = writeln!(out, "{}\n", result_line("Alternate", inputs.alternate));
}

fn render_iterations(out: &mut String, iterations: &[IterationRecord]) {
    let _ = writeln!(out, "## Iterations\n");
    if iterations.is_empty() {
        let _ = writeln!(out, "No verification attempts were made.\n");
        return;
    }
    let _ = writeln!(out, "| Attempt | Baseline | Alternate | Converged |");
    let _ = writeln!(out, "|---------|----------|-----------|-----------|");
    for record in iterations {
        let _ = writeln!(
            out,
            "| {} | {}/{}/{} | {}/{}/{} | {} |",
            record.attempt,
            record.baseline.passed,
            record.baseline.failed,
            record.baseline.errors,
            record.alternate.passed,
            record.alternate.failed,
            record.alternate.errors,
            if record.converged() { "yes" } else { "no" }
        );
    }
    let _ = writeln!(out, "\nCounts are passed/failed/errors.\n");
}

fn render_impact(out: &mut String, impact: &ImpactSummary) {
    let _ = writeln!(out, "## Impact\n");
    let _ = writeln!(out, "- Files referencing the symbol: {}", impact.total_files);
    let _ = writeln!(out, "- Total usages: {}", impact.total_usages);
    let _ = writeln!(out, "- Call sites: {}", impact.call_sites);
    let _ = writeln!(out, "- Test files: {}", impact.test_files);
    let _ = writeln!(out, "- Other files: {}\n", impact.other_files);
}

fn render_list(out: &mut String, title: &str, items: &[serde_json::Value]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "### {title}\n");
    for item in items {
        let _ = writeln!(out, "- {}", plan_entry_text(item));
    }
    out.push('\n');
}

fn render_plan(out: &mut String, plan: &Plan) {
    let _ = writeln!(out, "## Plan\n");
    if !plan.summary.is_empty() {
        let _ = writeln!(out, "{}\n", plan.summary);
    }
    render_list(out, "Issues", &plan.issues);
    render_list(out, "Improvements", &plan.improvements);
    if !plan.constants.is_empty() {
        let _ = writeln!(out, "### Constants\n");
        for (name, value) in &plan.constants {
            let _ = writeln!(out, "- `{name}` = {}", plan_entry_text(value));
        }
        out.push('\n');
    }
    render_list(out, "Helper Functions", &plan.helper_functions);
    render_list(out, "Risks", &plan.risks);
}

fn render_usage(out: &mut String, usage: &CostTracker) {
    let _ = writeln!(out, "## LLM Usage\n");
    let _ = writeln!(out, "- Requests: {}", usage.total_requests);
    let _ = writeln!(out, "- Failed requests: {}", usage.failed_requests);
    let _ = writeln!(out, "- Input tokens: {}", usage.total_input_tokens);
    let _ = writeln!(out, "- Output tokens: {}", usage.total_output_tokens);
    let _ = writeln!(out, "- Estimated cost: ${:.4}\n", usage.estimated_cost_usd);
}

fn render_changes(out: &mut String, inputs: &EvidenceInputs<'_>) {
    let _ = writeln!(out, "## Changes\n");
    let original_lines = inputs.original_code.lines().count();
    let final_lines = inputs.final_code.lines().count();
    let _ = writeln!(
        out,
        "Original: {original_lines} lines. Final: {final_lines} lines.\n"
    );
    match inputs.diff {
        Some(diff) if !diff.is_empty() => {
            match inputs.disposition {
                TargetDisposition::Restored => {
                    let _ = writeln!(
                        out,
                        "The target was restored from its backup. The diff is the last attempted rewrite.\n"
                    );
                }
                TargetDisposition::Retained => {
                    let _ = writeln!(
                        out,
                        "The target still holds the last attempted rewrite shown below.\n"
                    );
                }
                TargetDisposition::Untouched | TargetDisposition::Rewritten => {}
            }
            let _ = writeln!(out, "```diff\n{}```", ensure_newline(diff));
        }
        _ => {
            let _ = writeln!(out, "No changes to the target file.");
        }
    }
}

fn ensure_newline(text: &str) -> String {
    if text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}\n")
    }
}
