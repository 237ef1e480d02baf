//! `ffw run` subcommands: start, drive, status, logs, cancel, list.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use funnelflow_core::workflow::executor::EngineError;
use funnelflow_core::workflow::ledger::DRIVE_LEASE_SECS;
use funnelflow_types::workflow::{DataBag, StepLogStatus, WorkflowExecution};

use super::{format_status, format_time, parse_id, short_id, styled_status};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum RunCommand {
    /// Start an execution of a workflow and drive it until it waits or finishes.
    Start {
        /// Workflow UUID.
        workflow_id: String,

        /// Contact UUID the execution runs for.
        #[arg(long)]
        contact: Option<String>,

        /// Initial data bag as a JSON object.
        #[arg(long)]
        data: Option<String>,

        /// Create the execution without dispatching any step.
        #[arg(long)]
        no_drive: bool,
    },

    /// Drive a RUNNING execution (e.g. one created with --no-drive).
    Drive {
        /// Execution UUID.
        execution_id: String,
    },

    /// Show an execution.
    Status {
        /// Execution UUID.
        execution_id: String,
    },

    /// Show the step log of an execution.
    Logs {
        /// Execution UUID.
        execution_id: String,
    },

    /// Cancel a RUNNING or WAITING execution.
    Cancel {
        /// Execution UUID.
        execution_id: String,
    },

    /// List recent executions of a workflow.
    #[command(alias = "ls")]
    List {
        /// Workflow UUID.
        workflow_id: String,

        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

pub async fn handle_run_command(cmd: RunCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        RunCommand::Start {
            workflow_id,
            contact,
            data,
            no_drive,
        } => {
            let workflow_id = parse_id(&workflow_id, "workflow")?;
            let contact_id = contact
                .as_deref()
                .map(|raw| parse_id(raw, "contact"))
                .transpose()?;
            let data = parse_data(data.as_deref())?;
            handle_start(workflow_id, contact_id, data, no_drive, state, json).await
        }
        RunCommand::Drive { execution_id } => {
            let id = parse_id(&execution_id, "execution")?;
            let exec = match state.engine.run_execution(id).await {
                Ok(exec) => exec,
                Err(EngineError::AlreadyClaimed(_)) => bail!(
                    "Execution is being driven by another worker. Retry once it stops, \
                     or after {}s if that worker died.",
                    DRIVE_LEASE_SECS
                ),
                Err(e) => return Err(e.into()),
            };
            let children = drive_spawned(state).await;
            print_outcome("Drove", &exec, &children, json)
        }
        RunCommand::Status { execution_id } => {
            let id = parse_id(&execution_id, "execution")?;
            let exec = state.engine.get_execution(id).await?;
            print_execution(&exec, json)
        }
        RunCommand::Logs { execution_id } => {
            handle_logs(parse_id(&execution_id, "execution")?, state, json).await
        }
        RunCommand::Cancel { execution_id } => {
            let id = parse_id(&execution_id, "execution")?;
            let exec = match state.engine.cancel_execution(id).await {
                Ok(exec) => exec,
                Err(EngineError::InvalidState { status, .. }) => {
                    bail!("Execution has already finished (status: {status}). Cannot cancel.")
                }
                Err(e) => return Err(e.into()),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&exec)?);
            } else {
                println!();
                println!(
                    "  {} Canceled execution {}",
                    style("*").green().bold(),
                    style(short_id(&id)).cyan()
                );
                println!();
            }
            Ok(())
        }
        RunCommand::List { workflow_id, limit } => {
            handle_list(parse_id(&workflow_id, "workflow")?, limit, state, json).await
        }
    }
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

async fn handle_start(
    workflow_id: Uuid,
    contact_id: Option<Uuid>,
    data: DataBag,
    no_drive: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    if let Some(contact_id) = contact_id
        && state.contacts.find(&contact_id).await?.is_none()
    {
        bail!("Contact '{contact_id}' not found");
    }

    if no_drive {
        let exec = state
            .engine
            .start_execution(workflow_id, contact_id, data)
            .await?;
        return print_outcome("Created", &exec, &[], json);
    }

    let exec = state.engine.trigger(workflow_id, contact_id, data).await?;
    let children = drive_spawned(state).await;
    print_outcome("Started", &exec, &children, json)
}

/// Drive children queued by START_WORKFLOW steps during this command.
///
/// Children may spawn further children; the queue is drained until empty.
pub(crate) async fn drive_spawned(state: &AppState) -> Vec<WorkflowExecution> {
    let mut driven = Vec::new();
    loop {
        let next = state.spawn_queue.lock().await.try_recv();
        let Ok(child_id) = next else { break };
        match state.engine.run_execution(child_id).await {
            Ok(exec) => driven.push(exec),
            Err(e) => {
                tracing::warn!(execution_id = %child_id, error = %e, "spawned execution not driven")
            }
        }
    }
    driven
}

fn parse_data(raw: Option<&str>) -> Result<DataBag> {
    let Some(raw) = raw else {
        return Ok(DataBag::new());
    };
    let value: serde_json::Value =
        serde_json::from_str(raw).context("Invalid JSON for --data")?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => bail!("--data must be a JSON object"),
    }
}

fn print_outcome(
    verb: &str,
    exec: &WorkflowExecution,
    children: &[WorkflowExecution],
    json: bool,
) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "execution": exec,
            "children": children,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {verb} execution {}",
        style("*").green().bold(),
        style(short_id(&exec.id)).cyan()
    );
    print_execution_body(exec);
    for child in children {
        println!(
            "  Child {} -> {}",
            style(short_id(&child.id)).cyan(),
            styled_status(child.status)
        );
    }
    println!();
    println!(
        "  Step log: {}",
        style(format!("ffw run logs {}", exec.id)).dim()
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

fn print_execution(exec: &WorkflowExecution, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(exec)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style("Execution:").bold(),
        style(exec.id).cyan()
    );
    print_execution_body(exec);
    println!();
    Ok(())
}

fn print_execution_body(exec: &WorkflowExecution) {
    println!("  Workflow: {}", exec.workflow_id);
    if let Some(contact_id) = exec.contact_id {
        println!("  Contact: {contact_id}");
    }
    println!("  Status: {}", styled_status(exec.status));
    if let Some(step) = &exec.current_step_id {
        println!("  Current step: {step}");
    }
    if let Some(resume_at) = exec.resume_at {
        println!("  Resumes at: {}", format_time(&resume_at));
    }
    if let (Some(driver), Some(claimed)) = (exec.driver_id, exec.claimed_at) {
        println!(
            "  Driven by: {} (since {})",
            short_id(&driver),
            format_time(&claimed)
        );
    }
    println!("  Started: {}", format_time(&exec.created_at));
    if let Some(completed) = exec.completed_at {
        println!("  Finished: {}", format_time(&completed));
    }
    if let Some(err) = &exec.error {
        println!("  Error: {}", style(err).red());
    }
    if !exec.data.is_empty() {
        println!(
            "  Data: {}",
            serde_json::Value::Object(exec.data.clone())
        );
    }
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

async fn handle_logs(id: Uuid, state: &AppState, json: bool) -> Result<()> {
    // Surface "not found" rather than an empty log.
    state.engine.get_execution(id).await?;
    let logs = state.engine.step_logs(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&logs)?);
        return Ok(());
    }

    if logs.is_empty() {
        println!();
        println!("  No steps dispatched for execution {}.", short_id(&id));
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Started"),
            Cell::new("Error"),
        ]);

    for log in &logs {
        let status = match log.status {
            StepLogStatus::Running => Cell::new("running").fg(Color::Blue),
            StepLogStatus::Completed => Cell::new("completed").fg(Color::Green),
            StepLogStatus::Waiting => Cell::new("waiting").fg(Color::Yellow),
            StepLogStatus::Failed => Cell::new("failed").fg(Color::Red),
        };
        let error = log
            .error
            .as_ref()
            .map(|e| e.chars().take(60).collect::<String>())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&log.step_id),
            Cell::new(&log.step_type),
            status,
            Cell::new(log.started_at.format("%H:%M:%S").to_string()),
            Cell::new(error),
        ]);
    }

    println!();
    println!("  Step log for execution {}", style(short_id(&id)).cyan());
    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(workflow_id: Uuid, limit: u32, state: &AppState, json: bool) -> Result<()> {
    let def = state.engine.get_definition(&workflow_id).await?;
    let runs = state.engine.list_executions(workflow_id, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No executions of '{}'.", def.name);
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Contact"),
            Cell::new("Status"),
            Cell::new("Step"),
            Cell::new("Started"),
            Cell::new("Resumes"),
        ]);

    for r in &runs {
        table.add_row(vec![
            Cell::new(short_id(&r.id)),
            Cell::new(r.contact_id.as_ref().map(short_id).unwrap_or_else(|| "-".to_string())),
            format_status(r.status),
            Cell::new(r.current_step_id.as_deref().unwrap_or("-")),
            Cell::new(format_time(&r.created_at)),
            Cell::new(
                r.resume_at
                    .as_ref()
                    .map(format_time)
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ]);
    }

    println!();
    println!("  Executions of '{}'", style(&def.name).cyan());
    println!();
    println!("{table}");
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_data_requires_object() {
        assert!(parse_data(None).unwrap().is_empty());
        let data = parse_data(Some(r#"{"source":"webinar","score":7}"#)).unwrap();
        assert_eq!(data["score"], json!(7));
        assert!(parse_data(Some("[1,2]")).is_err());
        assert!(parse_data(Some("{oops")).is_err());
    }
}
