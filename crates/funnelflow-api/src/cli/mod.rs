//! CLI command definitions for the `ffw` binary.
//!
//! Uses clap derive macros. Commands are grouped by noun
//! (`ffw workflow import`, `ffw run start`, `ffw contact add`).

pub mod contact;
pub mod run;
pub mod worker;
pub mod workflow;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use funnelflow_types::workflow::ExecutionStatus;
use uuid::Uuid;

/// Run per-contact marketing workflows.
#[derive(Parser)]
#[command(name = "ffw", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit log lines as JSON objects.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans to stdout via OpenTelemetry.
    #[arg(long, global = true, env = "FUNNELFLOW_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Import, inspect and (de)activate workflow definitions.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Manage contacts.
    Contact {
        #[command(subcommand)]
        action: contact::ContactCommand,
    },

    /// Start, inspect and cancel workflow executions.
    Run {
        #[command(subcommand)]
        action: run::RunCommand,
    },

    /// Resume due executions and drive spawned children until Ctrl+C.
    Worker {
        /// Override the configured poll interval, in seconds.
        #[arg(long)]
        poll_interval: Option<u64>,

        /// Run a single scheduler tick and exit.
        #[arg(long)]
        once: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    raw.trim()
        .parse()
        .with_context(|| format!("Invalid {what} ID: '{raw}'"))
}

pub(crate) fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

pub(crate) fn format_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub(crate) fn format_status(status: ExecutionStatus) -> Cell {
    let cell = Cell::new(status.as_str().to_lowercase());
    match status {
        ExecutionStatus::Running => cell.fg(Color::Blue),
        ExecutionStatus::Waiting => cell.fg(Color::Yellow),
        ExecutionStatus::Completed => cell.fg(Color::Green),
        ExecutionStatus::Failed => cell.fg(Color::Red),
        ExecutionStatus::Canceled => cell.fg(Color::DarkYellow),
    }
}

pub(crate) fn styled_status(status: ExecutionStatus) -> console::StyledObject<String> {
    let text = status.as_str().to_lowercase();
    match status {
        ExecutionStatus::Running => console::style(text).blue(),
        ExecutionStatus::Waiting => console::style(text).yellow(),
        ExecutionStatus::Completed => console::style(text).green(),
        ExecutionStatus::Failed => console::style(text).red(),
        ExecutionStatus::Canceled => console::style(text).dim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_start_with_data() {
        let cli = Cli::try_parse_from([
            "ffw",
            "--json",
            "run",
            "start",
            "0190f5c2-7a4b-7cc0-8f00-000000000001",
            "--data",
            r#"{"source":"webinar"}"#,
        ])
        .unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Run {
                action: run::RunCommand::Start { .. }
            }
        ));
    }

    #[test]
    fn test_parse_id_rejects_garbage() {
        assert!(parse_id("not-a-uuid", "execution").is_err());
        let id = Uuid::now_v7();
        assert_eq!(parse_id(&format!(" {id} "), "execution").unwrap(), id);
        assert_eq!(short_id(&id).len(), 8);
    }
}
