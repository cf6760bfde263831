use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use reforge_core::impact::{ImpactAnalyzer, ImpactPolicy};
use reforge_core::types::{FileUsage, Symbol};

use super::Global;

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Symbol to look for (whole-word match)
    #[arg(long)]
    pub symbol: String,

    /// File defining the symbol; it is reported separately from call sites
    #[arg(long)]
    pub target: Option<PathBuf>,

    /// Print the impact report as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: ScanArgs, global: &Global) -> anyhow::Result<()> {
    let root = super::resolve_root(&global.root)?;
    let config = super::load_config(&root)?;
    let symbol = Symbol::new(args.symbol)?;

    let scan = ImpactAnalyzer::new(&root, &config.impact)
        .scan(&symbol)
        .context("Scan failed")?;
    let target = args
        .target
        .map(|t| t.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();
    let files_scanned = scan.files_scanned;
    let report = scan.into_report(&target, &symbol, &ImpactPolicy::from(&config.impact));

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "`{symbol}`: {} usages in {} files ({} scanned, {} skipped)",
        report.summary.total_usages,
        report.summary.total_files,
        files_scanned,
        report.skipped.len()
    );
    if let Some(definition) = &report.definition_file {
        println!();
        println!("  Definition:");
        print_usage(definition);
    }
    for (title, usages) in [
        ("Call sites", &report.call_sites),
        ("Test files", &report.test_files),
        ("Other files", &report.other_files),
    ] {
        if usages.is_empty() {
            continue;
        }
        println!();
        println!("  {title}:");
        for usage in usages {
            print_usage(usage);
        }
    }
    if !report.skipped.is_empty() {
        println!();
        println!("  Skipped:");
        for skipped in &report.skipped {
            println!("    {:<40} {}", skipped.path, skipped.reason);
        }
    }
    Ok(())
}

fn print_usage(usage: &FileUsage) {
    let lines = usage
        .lines
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    println!("    {:<40} lines {lines}", usage.file);
}
