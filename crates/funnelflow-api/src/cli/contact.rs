//! `ffw contact` subcommands: add, show, list.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Map, Value};

use funnelflow_types::contact::Contact;

use super::{format_time, parse_id, short_id};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum ContactCommand {
    /// Add a contact.
    Add {
        /// Email address (unique).
        #[arg(long)]
        email: String,

        #[arg(long)]
        first_name: Option<String>,

        #[arg(long)]
        last_name: Option<String>,

        #[arg(long)]
        company: Option<String>,

        /// Where the contact came from (e.g. "webinar").
        #[arg(long)]
        source: Option<String>,

        /// Tag to apply (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Custom field as key=value; the value is parsed as JSON when possible (repeatable).
        #[arg(long = "field")]
        fields: Vec<String>,
    },

    /// Show a contact and its recent activity.
    Show {
        /// Contact UUID or email address.
        contact: String,

        /// Number of activity entries to show.
        #[arg(long, default_value = "10")]
        activity: u32,
    },

    /// List contacts, newest first.
    #[command(alias = "ls")]
    List {
        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

pub async fn handle_contact_command(
    cmd: ContactCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        ContactCommand::Add {
            email,
            first_name,
            last_name,
            company,
            source,
            tags,
            fields,
        } => {
            let mut contact = Contact::new(email.trim());
            contact.first_name = first_name;
            contact.last_name = last_name;
            contact.company = company;
            contact.source = source;
            contact.tags = dedupe_tags(tags);
            contact.custom_fields = parse_fields(&fields)?;
            handle_add(contact, state, json).await
        }
        ContactCommand::Show { contact, activity } => {
            handle_show(&contact, activity, state, json).await
        }
        ContactCommand::List { limit } => handle_list(limit, state, json).await,
    }
}

async fn handle_add(contact: Contact, state: &AppState, json: bool) -> Result<()> {
    if !contact.email.contains('@') {
        bail!("'{}' is not an email address", contact.email);
    }
    state
        .contacts
        .create_contact(&contact)
        .await
        .with_context(|| format!("Failed to add contact {}", contact.email))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&contact)?);
    } else {
        println!();
        println!(
            "  {} Added contact {}",
            style("*").green().bold(),
            style(&contact.email).cyan()
        );
        println!("  ID: {}", contact.id);
        if !contact.tags.is_empty() {
            println!("  Tags: {}", contact.tags.join(", "));
        }
        println!();
    }
    Ok(())
}

async fn handle_show(target: &str, activity_limit: u32, state: &AppState, json: bool) -> Result<()> {
    let contact = if target.contains('@') {
        state.contacts.find_by_email(target.trim()).await?
    } else {
        let id = parse_id(target, "contact")?;
        state.contacts.find(&id).await?
    }
    .with_context(|| format!("Contact '{target}' not found"))?;

    let activity = state
        .activity
        .list_for_contact(&contact.id, activity_limit)
        .await
        .context("Failed to load contact activity")?;

    if json {
        let out = serde_json::json!({
            "contact": contact,
            "activity": activity,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let name = [contact.first_name.as_deref(), contact.last_name.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");

    println!();
    println!(
        "  {} {} {}",
        style("Contact:").bold(),
        style(&contact.email).cyan(),
        style(format!("({})", short_id(&contact.id))).dim()
    );
    if !name.is_empty() {
        println!("  Name: {name}");
    }
    if let Some(company) = &contact.company {
        println!("  Company: {company}");
    }
    println!(
        "  Tags: {}",
        if contact.tags.is_empty() {
            "-".to_string()
        } else {
            contact.tags.join(", ")
        }
    );
    for (key, value) in &contact.custom_fields {
        println!("  {key}: {value}");
    }
    println!("  Version: {}", contact.version);
    println!();

    if activity.is_empty() {
        println!("  No activity yet.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("When").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Description"),
        ]);
    for entry in &activity {
        table.add_row(vec![
            Cell::new(format_time(&entry.created_at)),
            Cell::new(entry.activity_type.as_str()),
            Cell::new(&entry.description),
        ]);
    }
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_list(limit: u32, state: &AppState, json: bool) -> Result<()> {
    let contacts = state.contacts.list(limit).await.context("Failed to list contacts")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&contacts)?);
        return Ok(());
    }
    if contacts.is_empty() {
        println!();
        println!("  No contacts.");
        println!(
            "  Add one with: {}",
            style("ffw contact add --email <address>").dim()
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
            Cell::new("Email"),
            Cell::new("Tags"),
            Cell::new("Created"),
        ]);
    for c in &contacts {
        table.add_row(vec![
            Cell::new(c.id),
            Cell::new(&c.email),
            Cell::new(c.tags.join(", ")),
            Cell::new(format_time(&c.created_at)),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn dedupe_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_string();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

fn parse_fields(raw: &[String]) -> Result<Map<String, Value>> {
    let mut fields = Map::new();
    for pair in raw {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Custom field '{pair}' must be key=value"))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("Custom field '{pair}' has an empty key");
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}
