// Copyright 2026 Bazaar Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{Parser, Subcommand};

use bazaar::cli;

#[derive(Parser)]
#[command(
    name = "bazaar",
    about = "Bazaar, a resilient marketplace listing collector",
    version,
    after_help = "Run 'bazaar <command> --help' for details on each command."
)]
struct Cli {
    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect a marketplace listing into CSV
    Collect(cli::collect_cmd::CollectArgs),
    /// Check environment and diagnose issues
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "bazaar=debug" } else { "bazaar=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse()?),
        )
        .init();

    match cli.command {
        Commands::Collect(args) => cli::collect_cmd::run(args).await,
        Commands::Doctor => cli::doctor::run().await,
    }
}
