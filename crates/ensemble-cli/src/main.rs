mod cli;
mod commands;
mod config;
mod error;
mod launcher;
mod logging;
mod signals;
mod simulation;
mod utils;

use crate::cli::{Cli, Commands};
use crate::commands::run::RunOptions;
use crate::error::Result;
use cadee_ensemble::engine::termination::TerminationFlag;
use clap::Parser;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = run_app().await {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        eprintln!("\n❌ Error: {}", e);
        std::process::exit(1);
    }
}

async fn run_app() -> Result<()> {
    let cli = Cli::parse();
    let forwarder = logging::setup_logging(cli.verbose, cli.quiet, cli.log_file.clone())?;

    let termination = TerminationFlag::new();
    let signal_listener = signals::install(termination.clone())?;

    let command_result = async {
        info!(
            "🚀 CADEE ensemble v{} starting up.",
            env!("CARGO_PKG_VERSION")
        );
        debug!("Full CLI arguments parsed: {:?}", &cli);

        match cli.command {
            Commands::Run(args) => {
                info!("Dispatching to 'run' command.");
                let options = RunOptions {
                    verbosity: cli.verbose,
                    quiet: cli.quiet,
                    termination: termination.clone(),
                };
                commands::run::run(args, options).await
            }
            Commands::Worker(args) => {
                info!("Dispatching to 'worker' command.");
                commands::worker::run(args, forwarder, termination.clone()).await
            }
            Commands::Scan(args) => {
                info!("Dispatching to 'scan' command.");
                commands::scan::run(args).await
            }
        }
    }
    .await;

    signal_listener.abort();

    match &command_result {
        Ok(_) => {
            info!("✅ Command completed successfully.");
            println!("✅ Command completed successfully.");
        }
        Err(e) => {
            error!("❌ Command failed: {}", e);
            eprintln!("❌ Command failed: {}", e);
        }
    }

    command_result
}
