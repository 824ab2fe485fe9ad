// SPDX-License-Identifier: Apache-2.0

//! TempDb CLI binary entrypoint.

mod commands;
pub mod paths;

use clap::Parser;
use commands::Commands;
use tracing_subscriber::EnvFilter;

/// TempDb: disposable MySQL servers for tests and local tinkering
#[derive(Parser)]
#[command(name = "tempdb", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Parses CLI arguments and dispatches to command handlers.
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tempdb=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    commands::execute(cli.command);
}
