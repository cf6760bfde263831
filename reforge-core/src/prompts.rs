//! Prompt templates for the planner, patcher and fixer requests.

use std::fmt::Write as _;

use crate::types::{Plan, Symbol};

pub const PLANNER_SYSTEM: &str = "You are an expert software engineer specializing in legacy code refactoring.

Analyze legacy Python code and produce a refactoring plan that:
- improves readability and maintainability
- follows PEP 8 and idiomatic Python
- preserves ALL existing behavior exactly
- introduces small, focused helper functions
- adds docstrings and type hints

The refactored code MUST produce IDENTICAL outputs for all inputs. This is a
behavior-preserving refactor, not a feature change.

Look for magic numbers that should be constants, repeated logic to extract,
complex conditionals to simplify, missing type hints and docstrings, and
poor variable names.";

pub const FIXER_SYSTEM: &str = "You are an expert Python debugger fixing test failures.

A refactored function fails its characterization tests. Fix the implementation
so that the tests pass:
- read the failure output carefully and identify the behavior that changed
- restore the original behavior; the original code is correct by definition
- never change the tests
- output ONLY the complete fixed Python module, without explanations";

/// System prompt for the patch request. The module keeps a legacy path and
/// a router selected by `switch_var`; only the alternate path is rewritten.
pub fn patcher_system(symbol: &Symbol, switch_var: &str) -> String {
    format!(
        "You are an expert Python developer who writes clean, refactored code.

Implement a refactoring plan for `{symbol}` while preserving the module's
structure. `{symbol}` routes between the legacy implementation and the
refactored one based on the `{switch_var}` environment variable:
1. keep the legacy implementation EXACTLY as written
2. keep the public `{symbol}` router EXACTLY as written, including its signature
3. keep the module's public exports unchanged
4. put new constants after the imports and new helpers before their first use
5. replace ONLY the body of the implementation selected when `{switch_var}` is set

The refactored path must return IDENTICAL results to the legacy path for every input.

Output ONLY the complete Python module. No markdown, no explanations."
    )
}

pub fn planner_prompt(code: &str, symbol: &Symbol, call_sites: &[String]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Refactoring Task\n");
    let _ = writeln!(out, "## Target Function\n`{symbol}`\n");
    let _ = writeln!(out, "## Current Implementation\n\n```python\n{code}\n```\n");
    if !call_sites.is_empty() {
        let _ = writeln!(out, "## Call Sites\n");
        let _ = writeln!(out, "This function is called from:");
        for site in call_sites {
            let _ = writeln!(out, "- {site}");
        }
        let _ = writeln!(
            out,
            "\nThe refactored code must stay compatible with every call site.\n"
        );
    }
    out.push_str(
        "## Your Task

Create a refactoring plan as a JSON object with these keys:
- `summary`: brief description of the approach
- `issues`: code quality issues found
- `improvements`: specific improvements to make
- `constants`: magic numbers to extract, as an object of name to value
- `helper_functions`: helper functions to create
- `risks`: edge cases to watch for

Respond with ONLY valid JSON.",
    );
    out
}

pub fn patcher_prompt(code: &str, symbol: &Symbol, plan: &Plan) -> String {
    let plan_json = serde_json::to_string_pretty(plan).unwrap_or_else(|_| plan.summary.clone());
    format!(
        "# Code Refactoring Task

## Original Code

```python
{code}
```

## Refactoring Plan

```json
{plan_json}
```

## Your Task

Implement the plan by producing the complete refactored Python module.
- include all imports at the top and define constants at module level
- place helper functions before the function that uses them
- add docstrings and type hints
- `{symbol}` must keep its EXACT signature and return the EXACT same output for any input

Output ONLY the complete Python code. No markdown, no explanations."
    )
}

pub fn fixer_prompt(code: &str, symbol: &Symbol, failure_log: &str, attempt: u32) -> String {
    format!(
        "# Fix Test Failures for `{symbol}` - Attempt {attempt}

## Current Code (FAILING)

```python
{code}
```

## Failure Output

```
{failure_log}
```

## Your Task

Fix the code so every test passes. The tests check that the refactored code
produces IDENTICAL output to the legacy implementation.

Common causes:
- floating point rounding (apply round() where the legacy code does)
- order of operations
- edge cases such as empty lists, zero values and missing keys
- int versus float results

Output ONLY the complete fixed Python code. No markdown, no explanations."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym() -> Symbol {
        Symbol::new("compute_invoice_total").unwrap()
    }

    #[test]
    fn planner_lists_call_sites() {
        let prompt = planner_prompt("def f(): pass", &sym(), &["app/api.py".into()]);
        assert!(prompt.contains("- app/api.py"));
        assert!(prompt.contains("`compute_invoice_total`"));
        assert!(prompt.contains("Respond with ONLY valid JSON."));

        let bare = planner_prompt("def f(): pass", &sym(), &[]);
        assert!(!bare.contains("## Call Sites"));
    }

    #[test]
    fn patcher_embeds_plan() {
        let plan = Plan {
            summary: "extract tax table".into(),
            ..Plan::default()
        };
        let prompt = patcher_prompt("x = 1", &sym(), &plan);
        assert!(prompt.contains("\"summary\": \"extract tax table\""));
        assert!(patcher_system(&sym(), "BILLING_V2").contains("`BILLING_V2`"));
    }

    #[test]
    fn fixer_carries_log_and_attempt() {
        let prompt = fixer_prompt("x = 1", &sym(), "1 failed", 3);
        assert!(prompt.contains("Attempt 3"));
        assert!(prompt.contains("1 failed"));
    }
}
