//! Reforge core library: impact analysis, characterization oracles,
//! dual-mode verification, patching, and the refactor orchestrator.
//!
//! The main entry point is [`orchestrator::Orchestrator`], which runs
//! Scan → Baseline → Plan → Patch → Iterate → Report for one target
//! function, talking to its collaborators through
//! [`generate::CodeGenerator`], [`executor::TestRunner`] and
//! [`vcs::VersionControl`].

pub mod config;
pub mod context;
pub mod error;
pub mod evidence;
pub mod executor;
pub mod generate;
pub mod impact;
pub mod llm;
pub mod oracle;
pub mod orchestrator;
pub mod patch;
pub mod progress;
pub mod prompts;
pub mod syntax;
pub mod types;
pub mod vcs;
