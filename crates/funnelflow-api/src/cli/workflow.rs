//! `ffw workflow` subcommands: import, list, show, activate, deactivate.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use funnelflow_core::workflow::definition::{
    WorkflowError, lint_definition, load_workflow_file, serialize_workflow_yaml,
};
use funnelflow_types::workflow::WorkflowDefinition;

use super::{parse_id, short_id};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Import (or replace) a workflow from a YAML or JSON file.
    Import {
        /// Path to the workflow file.
        file: PathBuf,
    },

    /// List imported workflows.
    #[command(alias = "ls")]
    List,

    /// Show a workflow's steps.
    Show {
        /// Workflow UUID.
        id: String,

        /// Print the definition as YAML.
        #[arg(long)]
        yaml: bool,
    },

    /// Allow new executions of a workflow.
    Activate {
        /// Workflow UUID.
        id: String,
    },

    /// Block new executions of a workflow. Running ones are unaffected.
    Deactivate {
        /// Workflow UUID.
        id: String,
    },
}

pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Import { file } => handle_import(&file, state, json).await,
        WorkflowCommand::List => handle_list(state, json).await,
        WorkflowCommand::Show { id, yaml } => handle_show(&id, yaml, state, json).await,
        WorkflowCommand::Activate { id } => handle_set_active(&id, true, state, json).await,
        WorkflowCommand::Deactivate { id } => handle_set_active(&id, false, state, json).await,
    }
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

async fn handle_import(file: &PathBuf, state: &AppState, json: bool) -> Result<()> {
    let def = load_workflow_file(file).map_err(|e| match e {
        WorkflowError::ParseError(msg) => anyhow::anyhow!("Failed to parse workflow: {msg}"),
        WorkflowError::ValidationError(msg) => anyhow::anyhow!("Workflow validation failed: {msg}"),
        other => anyhow::anyhow!("Failed to load workflow: {other}"),
    })?;

    let def = state
        .engine
        .import_definition(def)
        .await
        .context("Failed to save workflow")?;
    let warnings = lint_definition(&def);

    if json {
        let out = serde_json::json!({
            "id": def.id.to_string(),
            "name": def.name,
            "version": def.version,
            "active": def.active,
            "steps": def.steps.len(),
            "warnings": warnings,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Imported workflow '{}'",
        style("*").green().bold(),
        style(&def.name).cyan()
    );
    println!("  ID: {}", def.id);
    println!("  Steps: {}", def.steps.len());
    for warning in &warnings {
        println!("  {} {}", style("!").yellow().bold(), warning);
    }
    println!();
    println!(
        "  Start a run: {}",
        style(format!("ffw run start {} --contact <contact-id>", def.id)).dim()
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let defs = state
        .engine
        .list_definitions()
        .await
        .context("Failed to list workflows")?;

    if json {
        let out: Vec<_> = defs.iter().map(summary_json).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows imported.");
        println!(
            "  Import one with: {}",
            style("ffw workflow import <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Version"),
            Cell::new("Steps"),
            Cell::new("Active"),
        ]);

    for d in &defs {
        let active = if d.active {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::DarkGrey)
        };
        table.add_row(vec![
            Cell::new(d.id),
            Cell::new(&d.name),
            Cell::new(d.version),
            Cell::new(d.steps.len()),
            active,
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn summary_json(def: &WorkflowDefinition) -> serde_json::Value {
    serde_json::json!({
        "id": def.id.to_string(),
        "name": def.name,
        "version": def.version,
        "active": def.active,
        "steps": def.steps.len(),
    })
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(raw_id: &str, yaml: bool, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(raw_id, "workflow")?;
    let def = state.engine.get_definition(&id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&def)?);
        return Ok(());
    }
    if yaml {
        print!("{}", serialize_workflow_yaml(&def)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} ({})",
        style("Workflow:").bold(),
        style(&def.name).cyan(),
        short_id(&def.id)
    );
    if let Some(description) = &def.description {
        println!("  {description}");
    }
    println!(
        "  Version: {}   Active: {}",
        def.version,
        if def.active { "yes" } else { "no" }
    );
    println!();

    let entry = def.first_step().map(|s| s.id.clone());
    let mut steps: Vec<_> = def.steps.iter().enumerate().collect();
    steps.sort_by_key(|(idx, s)| (s.sort_order, *idx));

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Next"),
            Cell::new("Branches (true / false)"),
        ]);

    for (_, step) in steps {
        let id_cell = if entry.as_deref() == Some(step.id.as_str()) {
            Cell::new(format!("{} (entry)", step.id)).fg(Color::Green)
        } else {
            Cell::new(&step.id)
        };
        let branches = step
            .branches
            .as_ref()
            .map(|b| {
                format!(
                    "{} / {}",
                    b.true_step_id.as_deref().unwrap_or("-"),
                    b.false_step_id.as_deref().unwrap_or("-")
                )
            })
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            id_cell,
            Cell::new(step.type_name()),
            Cell::new(step.next_step_id.as_deref().unwrap_or("-")),
            Cell::new(branches),
        ]);
    }

    println!("{table}");
    for warning in lint_definition(&def) {
        println!("  {} {}", style("!").yellow().bold(), warning);
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Activate / deactivate
// ---------------------------------------------------------------------------

async fn handle_set_active(raw_id: &str, active: bool, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(raw_id, "workflow")?;
    state.engine.set_active(&id, active).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "id": id.to_string(), "active": active })
        );
    } else {
        let verb = if active { "Activated" } else { "Deactivated" };
        println!();
        println!(
            "  {} {verb} workflow {}",
            style("*").green().bold(),
            style(short_id(&id)).cyan()
        );
        println!();
    }
    Ok(())
}
