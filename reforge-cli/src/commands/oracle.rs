use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::Args;

use reforge_core::oracle::{self, Catalogue, OracleTarget};
use reforge_core::types::{ModeSwitch, Symbol};

use super::Global;

#[derive(Args, Debug)]
pub struct OracleArgs {
    /// File defining the function, relative to the project root
    #[arg(long)]
    pub target: PathBuf,

    /// Name of the function under test
    #[arg(long)]
    pub symbol: String,

    /// Print the generated suite instead of writing it
    #[arg(long)]
    pub print: bool,
}

pub fn run(args: OracleArgs, global: &Global) -> anyhow::Result<()> {
    let root = super::resolve_root(&global.root)?;
    let config = super::load_config(&root)?;
    let symbol = Symbol::new(args.symbol)?;

    let catalogue_path = config.oracle.catalogue.as_ref().map(|p| root.join(p));
    let catalogue =
        Catalogue::resolve(catalogue_path.as_deref()).context("Cannot load test catalogue")?;

    let target_file = args.target.to_string_lossy().replace('\\', "/");
    let target = OracleTarget {
        module: config
            .oracle
            .module
            .clone()
            .unwrap_or_else(|| oracle::module_from_path(&target_file)),
        symbol,
        switch: ModeSwitch::new(
            config.executor.switch_var.clone(),
            config.executor.switch_value.clone(),
        ),
        tolerance: config.oracle.tolerance,
        output_dir: config.oracle.output_dir.clone(),
    };
    let suite = oracle::materialize(&catalogue, &target, Utc::now());

    if args.print {
        for file in [&suite.characterization, &suite.dual_mode] {
            println!("# ── {} ──", file.path.display());
            println!("{}", file.content);
        }
        return Ok(());
    }

    let written = suite.write(&root).context("Cannot write oracle suite")?;
    println!(
        "Oracle for `{}` ({}): {} cases, {} dual-mode",
        target.symbol, target.module, suite.case_count, suite.dual_mode_count
    );
    for path in written {
        println!("  {}", path.display());
    }
    Ok(())
}
