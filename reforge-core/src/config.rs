use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Directory holding per-project Reforge state.
pub const CONFIG_DIR: &str = ".reforge";
/// File name of the project configuration inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "config.toml";

/// Top-level Reforge configuration, matching `.reforge/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReforgeConfig {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub impact: ImpactSection,
    #[serde(default)]
    pub oracle: OracleSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub patch: PatchSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub vcs: VcsSection,
}

impl ReforgeConfig {
    /// Path of the config file for a project root.
    pub fn path_for(root: &Path) -> PathBuf {
        root.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Load `.reforge/config.toml` under `root`, falling back to defaults
    /// when the file does not exist. The result is validated.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = Self::path_for(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    /// Load and validate a specific config file. Missing files are an error.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::NotFound(path.display().to_string()))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML (used by `reforge init`).
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "run.max_iterations must be at least 1".into(),
            ));
        }
        if self.impact.extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "impact.extensions must name at least one extension".into(),
            ));
        }
        if self.executor.switch_var.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "executor.switch_var must not be empty".into(),
            ));
        }
        if self.executor.program.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "executor.program must not be empty".into(),
            ));
        }
        if self.oracle.tolerance <= 0.0 {
            return Err(ConfigError::Invalid(
                "oracle.tolerance must be positive".into(),
            ));
        }
        match self.llm.provider.as_str() {
            "gemini" | "anthropic" | "openai" | "custom" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown llm.provider `{other}` (use gemini, anthropic, openai, custom)"
                )));
            }
        }
        if self.llm.provider == "custom" && self.llm.base_url.is_none() {
            return Err(ConfigError::Invalid(
                "llm.base_url is required for the custom provider".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    pub max_iterations: u32,
    /// Artifact directory, relative to the project root.
    pub artifacts_dir: PathBuf,
    /// Copy the backup slot back over the target when a run does not converge.
    pub restore_on_failure: bool,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            artifacts_dir: PathBuf::from("artifacts"),
            restore_on_failure: true,
        }
    }
}

/// Impact discovery and classification policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactSection {
    pub extensions: Vec<String>,
    pub skip_dirs: Vec<String>,
    /// Path substrings marking a file as a test file.
    pub test_markers: Vec<String>,
    /// Application source roots; a file under one of them is a call site.
    pub app_roots: Vec<String>,
}

impl Default for ImpactSection {
    fn default() -> Self {
        Self {
            extensions: vec!["py".into()],
            skip_dirs: [
                ".git",
                ".venv",
                "venv",
                "__pycache__",
                "node_modules",
                ".pytest_cache",
                ".mypy_cache",
                "build",
                "dist",
                "artifacts",
                CONFIG_DIR,
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            test_markers: vec!["tests/".into(), "/test".into(), "test_".into()],
            app_roots: vec!["app".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleSection {
    /// Directory (relative to the root) receiving the generated suites.
    pub output_dir: PathBuf,
    /// Python import path of the target module. Derived from the target
    /// file when unset.
    pub module: Option<String>,
    /// JSON catalogue replacing the built-in one.
    pub catalogue: Option<PathBuf>,
    /// Absolute tolerance of the `total` consistency law.
    pub tolerance: f64,
}

impl Default for OracleSection {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("tests"),
            module: None,
            catalogue: None,
            tolerance: 0.02,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    pub program: String,
    /// Arguments placed before the suite paths.
    pub args: Vec<String>,
    /// Environment variable selecting the alternate implementation.
    pub switch_var: String,
    /// Value given to `switch_var` in alternate mode.
    pub switch_value: String,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            program: "python".into(),
            args: vec!["-m".into(), "pytest".into()],
            switch_var: "BILLING_V2".into(),
            switch_value: "1".into(),
        }
    }
}

/// What happens to the backup slot after a converged run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackupRetention {
    #[default]
    Keep,
    DiscardOnSuccess,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchSection {
    pub retention: BackupRetention,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    pub provider: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub plan_temperature: f64,
    pub code_temperature: f64,
    pub max_tokens: u32,
    /// USD budget for one run; 0 disables the check.
    pub cost_budget: f64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "gemini".into(),
            model: "gemini-3-flash-preview".into(),
            api_key_env: "GEMINI_API_KEY".into(),
            base_url: None,
            plan_temperature: 0.3,
            code_temperature: 0.2,
            max_tokens: 16_384,
            cost_budget: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsSection {
    /// Create a working branch before patching.
    pub create_branch: bool,
    pub branch_prefix: String,
}

impl Default for VcsSection {
    fn default() -> Self {
        Self {
            create_branch: false,
            branch_prefix: "reforge/".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ReforgeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.run.max_iterations, 5);
        assert_eq!(config.executor.switch_var, "BILLING_V2");
        assert_eq!(config.llm.max_tokens, 16_384);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml_str = r#"
[run]
max_iterations = 3
artifacts_dir = "out"
restore_on_failure = false

[llm]
provider = "anthropic"
model = "claude-sonnet-4-20250514"
api_key_env = "ANTHROPIC_API_KEY"
plan_temperature = 0.3
code_temperature = 0.2
max_tokens = 8192
cost_budget = 1.5
"#;
        let config: ReforgeConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.run.max_iterations, 3);
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.impact.extensions, vec!["py".to_string()]);
        assert_eq!(config.patch.retention, BackupRetention::Keep);
    }

    #[test]
    fn zero_iterations_rejected() {
        let mut config = ReforgeConfig::default();
        config.run.max_iterations = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_provider_rejected() {
        let mut config = ReforgeConfig::default();
        config.llm.provider = "mystery".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn custom_provider_needs_base_url() {
        let mut config = ReforgeConfig::default();
        config.llm.provider = "custom".into();
        assert!(config.validate().is_err());
        config.llm.base_url = Some("http://localhost:8080".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_round_trip() {
        let config = ReforgeConfig::default();
        let text = config.to_toml().unwrap();
        let back: ReforgeConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.impact.skip_dirs, config.impact.skip_dirs);
        assert_eq!(back.patch.retention, BackupRetention::Keep);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReforgeConfig::load(dir.path()).unwrap();
        assert_eq!(config.run.max_iterations, 5);
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(ReforgeConfig::path_for(dir.path()), "[run\nbroken").unwrap();
        assert!(matches!(
            ReforgeConfig::load(dir.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
