use anyhow::Context;
use clap::Args;

use reforge_core::config::ReforgeConfig;

use super::Global;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config file
    #[arg(long)]
    pub force: bool,
}

pub fn run(args: InitArgs, global: &Global) -> anyhow::Result<()> {
    let root = super::resolve_root(&global.root)?;
    let path = ReforgeConfig::path_for(&root);
    if path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
    }

    let text = ReforgeConfig::default().to_toml()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create {}", parent.display()))?;
    }
    std::fs::write(&path, text).with_context(|| format!("Cannot write {}", path.display()))?;

    if !global.quiet {
        println!("Wrote {}", path.display());
    }
    Ok(())
}
