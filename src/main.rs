//! fleetmon binary entrypoint.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fleetmon::cli_app::{Cli, run};

fn main() -> ExitCode {
    // Protocol frames own stdout in worker mode; diagnostics always go to
    // stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fleetmon: {e}");
            ExitCode::FAILURE
        }
    }
}
