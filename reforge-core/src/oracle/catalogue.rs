use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::is_identifier;

const BILLING_CATALOGUE: &str = include_str!("billing_catalogue.json");

/// One representative input for the target function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Becomes part of the generated test name; must be an identifier.
    pub name: String,
    pub description: String,
    /// The behavioral nuance the case exercises.
    #[serde(default)]
    pub note: String,
    /// Literal input, passed to the target as its single argument.
    pub input: serde_json::Value,
}

/// Fixed, version-controlled set of test cases. A run never adds to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalogue {
    /// Fields every result must carry.
    pub required_fields: Vec<String>,
    /// Names of the cases that also get a dual-mode equality test.
    pub dual_mode: Vec<String>,
    pub cases: Vec<TestCase>,
}

impl Catalogue {
    /// The built-in invoice catalogue (20 cases, 4 dual-mode).
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_json(BILLING_CATALOGUE)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let catalogue: Self = serde_json::from_str(text)
            .map_err(|e| ConfigError::Parse(format!("test catalogue: {e}")))?;
        catalogue.validate()?;
        Ok(catalogue)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::NotFound(path.display().to_string()))?;
        Self::from_json(&text)
    }

    /// Built-in catalogue unless a path is configured.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => Self::builtin(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&TestCase> {
        self.cases.iter().find(|c| c.name == name)
    }

    /// Dual-mode cases, in the order `dual_mode` lists them.
    pub fn dual_mode_cases(&self) -> impl Iterator<Item = &TestCase> {
        self.dual_mode.iter().filter_map(|name| self.get(name))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cases.is_empty() {
            return Err(ConfigError::Invalid("test catalogue has no cases".into()));
        }
        let mut seen = HashSet::new();
        for case in &self.cases {
            if !is_identifier(&case.name) {
                return Err(ConfigError::Invalid(format!(
                    "test case name `{}` is not an identifier",
                    case.name
                )));
            }
            if !seen.insert(case.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate test case `{}`",
                    case.name
                )));
            }
        }
        if let Some(missing) = self.dual_mode.iter().find(|n| !seen.contains(n.as_str())) {
            return Err(ConfigError::Invalid(format!(
                "dual-mode case `{missing}` is not in the catalogue"
            )));
        }
        if let Some(bad) = self.required_fields.iter().find(|f| f.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "required field name {bad:?} is empty"
            )));
        }
        Ok(())
    }
}
