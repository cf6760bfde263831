pub mod init;
pub mod oracle;
pub mod run;
pub mod scan;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Subcommand;

use reforge_core::config::ReforgeConfig;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Refactor a function: scan, verify baseline, patch, iterate, report
    Run(run::RunArgs),
    /// Report where a symbol is used across the project
    Scan(scan::ScanArgs),
    /// Generate the characterization oracle for a function
    Oracle(oracle::OracleArgs),
    /// Write a default .reforge/config.toml
    Init(init::InitArgs),
}

/// Options shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Global {
    pub root: PathBuf,
    pub quiet: bool,
}

/// Run a subcommand and return the process exit code.
pub async fn run(cmd: Command, global: &Global) -> anyhow::Result<i32> {
    match cmd {
        Command::Run(args) => run::run(args, global).await,
        Command::Scan(args) => scan::run(args, global).map(|()| 0),
        Command::Oracle(args) => oracle::run(args, global).map(|()| 0),
        Command::Init(args) => init::run(args, global).map(|()| 0),
    }
}

pub(crate) fn resolve_root(root: &Path) -> anyhow::Result<PathBuf> {
    std::fs::canonicalize(root)
        .with_context(|| format!("Cannot resolve path: {}", root.display()))
}

/// Load `.reforge/config.toml` (defaults when absent) and validate it.
pub(crate) fn load_config(root: &Path) -> anyhow::Result<ReforgeConfig> {
    let config = ReforgeConfig::load(root).with_context(|| {
        format!(
            "Cannot load config: {}",
            ReforgeConfig::path_for(root).display()
        )
    })?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}
