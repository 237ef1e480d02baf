//! Funnelflow CLI entry point.
//!
//! Binary name: `ffw`
//!
//! Parses CLI arguments, initializes tracing, the database and the workflow
//! engine, then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use funnelflow_observe::tracing_setup::{
    LogFormat, TracingOptions, init_tracing, shutdown_tracing,
};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&TracingOptions {
        verbosity: cli.verbose,
        quiet: cli.quiet,
        format: if cli.log_json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
        enable_otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "ffw", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;

    let result = match cli.command {
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, cli.json).await
        }
        Commands::Contact { action } => {
            cli::contact::handle_contact_command(action, &state, cli.json).await
        }
        Commands::Run { action } => cli::run::handle_run_command(action, &state, cli.json).await,
        Commands::Worker {
            poll_interval,
            once,
        } => cli::worker::run_worker(state, poll_interval, once, cli.json).await,
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    shutdown_tracing();
    result
}
