use std::path::PathBuf;

use crate::types::RunState;

/// Top-level Reforge error type.
///
/// All fallible operations in `reforge-core` return [`Result<T, ReforgeError>`](Result).
/// Each variant wraps a domain-specific error enum so callers can match on
/// the failing component without losing type information.
#[derive(thiserror::Error, Debug)]
pub enum ReforgeError {
    /// Error in configuration parsing or validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A run could not start (missing target, unavailable collaborator, ...).
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Error writing or reading run artifacts.
    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Error staging, validating or swapping the target implementation.
    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),

    /// Error running the oracle suite.
    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    /// Error from the code-generation collaborator.
    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    /// Error communicating with an LLM provider.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Error from the version-control collaborator.
    #[error("VCS error: {0}")]
    Vcs(#[from] VcsError),

    /// The orchestrator was asked to make a move its state table forbids.
    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// State the orchestrator was in.
        from: RunState,
        /// State that was requested.
        to: RunState,
    },

    /// Filesystem I/O error outside a more specific component.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors in Reforge configuration parsing and validation.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration file does not exist at the expected path.
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Configuration values are present but semantically invalid.
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Configuration file syntax could not be parsed (TOML error).
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Errors from the per-run artifact namespace.
#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    #[error("Cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the patch applier.
#[derive(thiserror::Error, Debug)]
pub enum PatchError {
    /// The proposed source does not parse. Nothing was written.
    #[error("Invalid syntax at line {line}, column {column}: {message}")]
    InvalidSyntax {
        line: usize,
        column: usize,
        message: String,
    },

    /// The target file could not be read.
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Writing the new content failed. `restored` records whether the
    /// backup slot was copied back before returning.
    #[error("Cannot write {path} (restored from backup: {restored}): {source}")]
    Write {
        path: PathBuf,
        restored: bool,
        source: std::io::Error,
    },

    /// Backup slot operation failed.
    #[error("Backup error for {path}: {message}")]
    Backup { path: PathBuf, message: String },
}

/// Errors from the test-execution collaborator.
#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    /// The test runner process could not be spawned.
    #[error("Cannot spawn `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// The oracle suite has not been written to disk.
    #[error("Suite file missing: {0}")]
    SuiteMissing(PathBuf),
}

/// Errors from the code-generation collaborator.
///
/// Malformed and empty responses are expected failure modes; the
/// orchestrator spends one remediation request on them before aborting.
#[derive(thiserror::Error, Debug)]
pub enum GenerationError {
    /// The collaborator is not usable (no provider, missing credentials).
    #[error("Generator unavailable: {0}")]
    Unavailable(String),

    /// The underlying provider call failed.
    #[error("Provider failure: {0}")]
    Provider(#[from] LlmError),

    /// The response contained no usable text.
    #[error("Empty response from {0}")]
    Empty(String),

    /// A structured response could not be decoded.
    #[error("Malformed structured response: {0}")]
    Malformed(String),
}

/// Errors from LLM provider interactions.
#[derive(thiserror::Error, Debug)]
pub enum LlmError {
    /// Network-level failure connecting to the LLM provider.
    #[error("Network error: {0}")]
    Network(String),

    /// LLM API returned a non-success HTTP status.
    #[error("API error (HTTP {status}): {body}")]
    ApiError {
        /// HTTP status code from the provider.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// LLM response could not be parsed into the expected format.
    #[error("Response parse error: {0}")]
    Parse(String),

    /// LLM configuration is missing or invalid (API key, model, etc.).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cumulative LLM cost has exceeded the configured budget.
    #[error("Cost budget exceeded: {0}")]
    BudgetExceeded(String),
}

/// Errors from the version-control collaborator.
#[derive(thiserror::Error, Debug)]
pub enum VcsError {
    /// The path is not inside a git repository.
    #[error("Not a git repository: {0}")]
    NotARepository(String),

    /// A git command exited unsuccessfully.
    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for `Result<T, ReforgeError>`.
pub type Result<T> = std::result::Result<T, ReforgeError>;
