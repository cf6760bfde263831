use std::path::PathBuf;

use clap::Parser;

use reforge_core::error::{ConfigError, ReforgeError};

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "reforge",
    version,
    about = "Impact-aware refactoring with a frozen characterization oracle"
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    /// Project root (default: current directory)
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

/// Classify an error into an exit code.
///
/// Exit codes:
///   0  — converged, or a completed dry run
///   1  — general/unknown error
///   2  — configuration error
///   3  — could not attempt (precondition or baseline unverified)
///   4  — attempted but aborted (generation or patch failure)
///   5  — attempted and exhausted the iteration budget
///
/// Codes 3 to 5 normally come from a run verdict; errors only reach 3
/// when the project root itself cannot be resolved.
fn classify_exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<ConfigError>().is_some()
            || matches!(cause.downcast_ref::<ReforgeError>(), Some(ReforgeError::Config(_)))
        {
            return 2;
        }
        if matches!(
            cause.downcast_ref::<ReforgeError>(),
            Some(ReforgeError::Precondition(_))
        ) {
            return 3;
        }
    }
    if format!("{err:#}").contains("Cannot resolve path") {
        3
    } else {
        1
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (_, 0) => "warn",
        (_, 1) => "info",
        (_, 2) => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // reqwest is built without a default crypto provider
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: Failed to create runtime: {e}");
            std::process::exit(1);
        }
    };

    let global = commands::Global {
        root: cli.root,
        quiet: cli.quiet,
    };
    match runtime.block_on(commands::run(cli.command, &global)) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(classify_exit_code(&e));
        }
    }
}
