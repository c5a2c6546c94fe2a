//! mailprobe: Bayesian junk-mail classifier CLI
//!
//! Thin binary over the engine crate: loads the environment, initializes
//! tracing to stderr, and dispatches the parsed command line. See
//! [`mailprobe::cli`] for the command surface and [`mailprobe::classifier`]
//! for the programmatic API.

use std::process::ExitCode;

use clap::Parser;
use mailprobe::cli::{self, Cli};
use tracing_subscriber::EnvFilter;

/// Process entry point
///
/// `RUST_LOG` controls the log filter when set; otherwise `--verbose`
/// selects debug detail and the default stays quiet.
fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let fallback = if cli.verbose { "mailprobe=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .init();

    cli::run(cli)
}
