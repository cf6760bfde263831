pub mod extract;
pub mod providers;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Token usage from an LLM call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Tracks cumulative LLM costs across a run.
#[allow(clippy::cast_precision_loss)]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostTracker {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub estimated_cost_usd: f64,
}

#[allow(clippy::cast_precision_loss)]
impl CostTracker {
    pub fn record_call(
        &mut self,
        usage: &TokenUsage,
        cost_per_1k_input: f64,
        cost_per_1k_output: f64,
    ) {
        self.total_input_tokens += usage.input_tokens;
        self.total_output_tokens += usage.output_tokens;
        self.total_requests += 1;
        self.estimated_cost_usd += (usage.input_tokens as f64 / 1000.0) * cost_per_1k_input
            + (usage.output_tokens as f64 / 1000.0) * cost_per_1k_output;
    }

    pub fn record_failure(&mut self) {
        self.failed_requests += 1;
    }

    pub fn is_over_budget(&self, budget: f64) -> bool {
        budget > 0.0 && self.estimated_cost_usd >= budget
    }
}

/// Expected shape of a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

/// One completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub format: ResponseFormat,
}

/// Common interface for LLM providers.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync + std::fmt::Debug {
    /// Human-readable provider name.
    fn name(&self) -> &str;

    /// The model ID being used.
    fn model_id(&self) -> &str;

    /// Send a completion request and return the response text and token usage.
    async fn call(&self, request: &CompletionRequest) -> Result<(String, TokenUsage), LlmError>;

    /// Cost per 1K input tokens (USD).
    fn cost_per_1k_input(&self) -> f64;

    /// Cost per 1K output tokens (USD).
    fn cost_per_1k_output(&self) -> f64;
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_tracker_basics() {
        let mut tracker = CostTracker::default();
        assert!(!tracker.is_over_budget(0.0)); // 0 = unlimited

        let usage = TokenUsage {
            input_tokens: 1000,
            output_tokens: 500,
        };
        tracker.record_call(&usage, 0.003, 0.015);

        assert_eq!(tracker.total_requests, 1);
        assert_eq!(tracker.total_input_tokens, 1000);
        assert_eq!(tracker.total_output_tokens, 500);
        // 1K * 0.003 + 0.5K * 0.015 = 0.003 + 0.0075 = 0.0105
        assert!((tracker.estimated_cost_usd - 0.0105).abs() < 0.0001);
        assert!(!tracker.is_over_budget(1.0));
        assert!(tracker.is_over_budget(0.01));
    }

    #[test]
    fn failures_do_not_count_as_requests() {
        let mut tracker = CostTracker::default();
        tracker.record_failure();
        assert_eq!(tracker.failed_requests, 1);
        assert_eq!(tracker.total_requests, 0);
        assert!(tracker.estimated_cost_usd.abs() < f64::EPSILON);
    }
}
