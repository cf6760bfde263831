//! Code-generation collaborator.
//!
//! The orchestrator talks to [`CodeGenerator`] only. [`LlmGenerator`] backs
//! it with an [`LlmProvider`] through a single typed `generate` call; all
//! response-shape handling happens inside that call.

use std::sync::{Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::config::LlmSection;
use crate::error::{GenerationError, LlmError};
use crate::llm::extract::{json_fragment, strip_code_fences};
use crate::llm::providers::create_provider;
use crate::llm::{CompletionRequest, CostTracker, LlmProvider, ResponseFormat};
use crate::prompts;
use crate::types::{Plan, Symbol};

#[async_trait::async_trait]
pub trait CodeGenerator: Send + Sync + std::fmt::Debug {
    /// Cheap local check that requests can be made at all. No network.
    fn check_available(&self) -> Result<(), GenerationError>;

    async fn plan(
        &self,
        code: &str,
        symbol: &Symbol,
        call_sites: &[String],
    ) -> Result<Plan, GenerationError>;

    async fn patch(&self, code: &str, symbol: &Symbol, plan: &Plan)
    -> Result<String, GenerationError>;

    async fn fix(
        &self,
        code: &str,
        symbol: &Symbol,
        failure_log: &str,
        attempt: u32,
    ) -> Result<String, GenerationError>;

    /// Accumulated usage, when the generator tracks it.
    fn usage(&self) -> Option<CostTracker> {
        None
    }
}

/// What the caller wants back from `generate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Python source; fences are stripped.
    Code,
    /// A single JSON object; surrounding chatter is dropped.
    Json,
}

#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub system: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub kind: OutputKind,
}

// ── LLM-backed generator ────────────────────────────────────────────

#[derive(Debug)]
pub struct LlmGenerator {
    provider: Box<dyn LlmProvider>,
    plan_temperature: f64,
    code_temperature: f64,
    max_tokens: u32,
    budget_usd: f64,
    switch_var: String,
    tracker: Mutex<CostTracker>,
}

impl LlmGenerator {
    pub fn new(provider: Box<dyn LlmProvider>, config: &LlmSection, switch_var: &str) -> Self {
        Self {
            provider,
            plan_temperature: config.plan_temperature,
            code_temperature: config.code_temperature,
            max_tokens: config.max_tokens,
            budget_usd: config.cost_budget,
            switch_var: switch_var.to_string(),
            tracker: Mutex::new(CostTracker::default()),
        }
    }

    /// Build a provider from config, reading the API key from the
    /// configured environment variable.
    pub fn from_config(config: &LlmSection, switch_var: &str) -> Result<Self, GenerationError> {
        let api_key = std::env::var(&config.api_key_env).unwrap_or_default();
        let provider = create_provider(
            &config.provider,
            &config.model,
            &api_key,
            config.base_url.as_deref(),
        )
        .map_err(|e| match e {
            LlmError::Config(msg) if api_key.trim().is_empty() => GenerationError::Unavailable(
                format!("{msg} (set {})", config.api_key_env),
            ),
            other => GenerationError::Unavailable(other.to_string()),
        })?;
        Ok(Self::new(provider, config, switch_var))
    }

    /// The one typed entry point: prompt in, cleaned text out.
    pub async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, GenerationError> {
        {
            let tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
            if tracker.is_over_budget(self.budget_usd) {
                return Err(GenerationError::Provider(LlmError::BudgetExceeded(format!(
                    "${:.4} spent of ${:.2}",
                    tracker.estimated_cost_usd, self.budget_usd
                ))));
            }
        }

        let request = CompletionRequest {
            system: options.system.clone(),
            prompt: prompt.to_string(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            format: match options.kind {
                OutputKind::Json => ResponseFormat::Json,
                OutputKind::Code => ResponseFormat::Text,
            },
        };

        debug!(provider = self.provider.name(), kind = ?options.kind, "Generation request");
        let result = self.provider.call(&request).await;
        let (text, usage) = {
            let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
            match result {
                Ok((text, usage)) => {
                    tracker.record_call(
                        &usage,
                        self.provider.cost_per_1k_input(),
                        self.provider.cost_per_1k_output(),
                    );
                    (text, usage)
                }
                Err(e) => {
                    tracker.record_failure();
                    warn!(provider = self.provider.name(), error = %e, "Generation request failed");
                    return Err(GenerationError::Provider(e));
                }
            }
        };
        info!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Generation response received"
        );

        if text.trim().is_empty() {
            return Err(GenerationError::Empty(self.provider.name().to_string()));
        }
        match options.kind {
            OutputKind::Code => Ok(strip_code_fences(&text)),
            OutputKind::Json => json_fragment(&text).ok_or_else(|| {
                GenerationError::Malformed("response contains no JSON object".into())
            }),
        }
    }

    fn options(&self, system: String, temperature: f64, kind: OutputKind) -> GenerationOptions {
        GenerationOptions {
            system,
            temperature,
            max_tokens: self.max_tokens,
            kind,
        }
    }
}

#[async_trait::async_trait]
impl CodeGenerator for LlmGenerator {
    fn check_available(&self) -> Result<(), GenerationError> {
        Ok(())
    }

    async fn plan(
        &self,
        code: &str,
        symbol: &Symbol,
        call_sites: &[String],
    ) -> Result<Plan, GenerationError> {
        let prompt = prompts::planner_prompt(code, symbol, call_sites);
        let options = self.options(
            prompts::PLANNER_SYSTEM.to_string(),
            self.plan_temperature,
            OutputKind::Json,
        );
        let json = self.generate(&prompt, &options).await?;
        let plan: Plan =
            serde_json::from_str(&json).map_err(|e| GenerationError::Malformed(e.to_string()))?;
        if plan.is_empty() {
            return Err(GenerationError::Malformed(
                "plan carries no summary or entries".into(),
            ));
        }
        Ok(plan)
    }

    async fn patch(
        &self,
        code: &str,
        symbol: &Symbol,
        plan: &Plan,
    ) -> Result<String, GenerationError> {
        let prompt = prompts::patcher_prompt(code, symbol, plan);
        let options = self.options(
            prompts::patcher_system(symbol, &self.switch_var),
            self.code_temperature,
            OutputKind::Code,
        );
        self.generate(&prompt, &options).await
    }

    async fn fix(
        &self,
        code: &str,
        symbol: &Symbol,
        failure_log: &str,
        attempt: u32,
    ) -> Result<String, GenerationError> {
        let prompt = prompts::fixer_prompt(code, symbol, failure_log, attempt);
        let options = self.options(
            prompts::FIXER_SYSTEM.to_string(),
            self.code_temperature,
            OutputKind::Code,
        );
        self.generate(&prompt, &options).await
    }

    fn usage(&self) -> Option<CostTracker> {
        Some(
            self.tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        )
    }
}

// ── Unavailable generator ───────────────────────────────────────────

/// Stand-in used when no provider could be built. The orchestrator reports
/// it as a failed precondition before touching anything.
#[derive(Debug, Clone)]
pub struct UnavailableGenerator {
    reason: String,
}

impl UnavailableGenerator {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn err(&self) -> GenerationError {
        GenerationError::Unavailable(self.reason.clone())
    }
}

#[async_trait::async_trait]
impl CodeGenerator for UnavailableGenerator {
    fn check_available(&self) -> Result<(), GenerationError> {
        Err(self.err())
    }

    async fn plan(&self, _: &str, _: &Symbol, _: &[String]) -> Result<Plan, GenerationError> {
        Err(self.err())
    }

    async fn patch(&self, _: &str, _: &Symbol, _: &Plan) -> Result<String, GenerationError> {
        Err(self.err())
    }

    async fn fix(&self, _: &str, _: &Symbol, _: &str, _: u32) -> Result<String, GenerationError> {
        Err(self.err())
    }
}

/// Build the configured generator, or an [`UnavailableGenerator`] carrying
/// the reason it could not be built.
pub fn generator_from_config(config: &LlmSection, switch_var: &str) -> Box<dyn CodeGenerator> {
    match LlmGenerator::from_config(config, switch_var) {
        Ok(generator) => Box::new(generator),
        Err(e) => {
            warn!(error = %e, "Code generator unavailable");
            Box::new(UnavailableGenerator::new(e.to_string()))
        }
    }
}
