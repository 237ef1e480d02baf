//! Step dispatcher for all workflow step types.
//!
//! `StepDispatcher` routes each step to a type-specific handler based on its
//! `StepConfig` variant. Handlers resolve merge tags from the execution
//! context, call collaborators, and return a `StepOutcome` describing where
//! the execution goes next.
//!
//! Step types: SEND_EMAIL, DELAY, ADD_TAG, REMOVE_TAG, UPDATE_CONTACT,
//! WEBHOOK, CONDITION, START_WORKFLOW, END.

use chrono::{DateTime, Utc};
use funnelflow_types::config::WebhookSettings;
use funnelflow_types::contact::{ActivityEntry, ActivityType, Contact};
use funnelflow_types::error::RepositoryError;
use funnelflow_types::workflow::{
    ConditionConfig, DataBag, DelayConfig, SendEmailConfig, StartWorkflowConfig, StepConfig,
    StepDefinition, TagConfig, UpdateContactConfig, WebhookConfig,
};
use serde_json::{Map, Value, json};

use super::collaborator::{Collaborators, EmailMessage, SpawnRequest, WebhookRequest};
use super::condition::ConditionEvaluator;
use super::context::ExecutionContext;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Attempts at a version-checked tag write before giving up.
pub const MAX_TAG_WRITE_ATTEMPTS: u32 = 5;

/// Data key holding the IDs of executions spawned by START_WORKFLOW.
pub const SPAWNED_EXECUTIONS_KEY: &str = "spawnedExecutions";

/// Data key holding a non-object webhook response body.
pub const WEBHOOK_RESPONSE_KEY: &str = "webhookResponse";

/// Data key holding per-step CONDITION results.
pub const CONDITIONS_KEY: &str = "conditions";

const ALLOWED_METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// Result of dispatching one step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepOutcome {
    pub success: bool,
    /// Where to go next; `None` completes the execution.
    pub next_step_id: Option<String>,
    /// Entries to merge into the execution's data bag.
    pub data: DataBag,
    pub error: Option<String>,
    /// True only for DELAY.
    pub should_wait: bool,
    pub wait_until: Option<DateTime<Utc>>,
    /// The contact as written by this step, when it changed.
    pub contact: Option<Contact>,
}

impl StepOutcome {
    fn advance(next_step_id: Option<String>) -> Self {
        Self {
            success: true,
            next_step_id,
            ..Default::default()
        }
    }

    fn with_data(mut self, data: DataBag) -> Self {
        self.data = data;
        self
    }

    fn with_contact(mut self, contact: Option<Contact>) -> Self {
        self.contact = contact;
        self
    }

    /// A failed outcome carrying the error string.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors that fail a step (and with it, the execution).
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The step's configuration is unusable at run time.
    #[error("validation error: {0}")]
    Validation(String),

    /// The execution lacks data the step needs (usually a contact).
    #[error("data error: {0}")]
    Data(String),

    /// Webhook non-2xx, network failure or timeout.
    #[error("external call failed: {0}")]
    ExternalCall(String),

    #[error("unknown step type: {0}")]
    UnknownStepType(String),

    /// A contact store (or spawn service) write failed.
    #[error("collaborator error: {0}")]
    Collaborator(String),
}

// ---------------------------------------------------------------------------
// StepDispatcher
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TagOp {
    Add,
    Remove,
}

/// Executes individual workflow steps by dispatching to type-specific handlers.
///
/// Holds no per-execution state; one dispatcher serves every execution.
#[derive(Debug, Clone)]
pub struct StepDispatcher {
    collaborators: Collaborators,
    webhook: WebhookSettings,
    evaluator: ConditionEvaluator,
}

impl StepDispatcher {
    pub fn new(collaborators: Collaborators, webhook: WebhookSettings) -> Self {
        Self {
            collaborators,
            webhook,
            evaluator: ConditionEvaluator::new(),
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Run a step and return its outcome. Never returns an error: failures
    /// are reported as `success = false` with the error string.
    pub async fn dispatch(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        now: DateTime<Utc>,
    ) -> StepOutcome {
        match self.run(step, ctx, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::debug!(
                    execution_id = %ctx.execution_id,
                    step_id = step.id.as_str(),
                    error = %e,
                    "step failed"
                );
                StepOutcome::failed(e.to_string())
            }
        }
    }

    async fn run(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, StepError> {
        match &step.config {
            StepConfig::SendEmail(config) => self.run_send_email(step, config, ctx).await,
            StepConfig::Delay(config) => run_delay(step, config, now),
            StepConfig::AddTag(config) => self.run_tags(step, config, ctx, TagOp::Add).await,
            StepConfig::RemoveTag(config) => {
                self.run_tags(step, config, ctx, TagOp::Remove).await
            }
            StepConfig::UpdateContact(config) => {
                self.run_update_contact(step, config, ctx).await
            }
            StepConfig::Webhook(config) => self.run_webhook(step, config, ctx).await,
            StepConfig::Condition(config) => Ok(self.run_condition(step, config, ctx)),
            StepConfig::StartWorkflow(config) => {
                self.run_start_workflow(step, config, ctx).await
            }
            StepConfig::End => Ok(StepOutcome::advance(None)),
            StepConfig::Unknown { step_type, .. } => {
                Err(StepError::UnknownStepType(step_type.clone()))
            }
        }
    }

    // -----------------------------------------------------------------------
    // SEND_EMAIL
    // -----------------------------------------------------------------------

    async fn run_send_email(
        &self,
        step: &StepDefinition,
        config: &SendEmailConfig,
        ctx: &ExecutionContext,
    ) -> Result<StepOutcome, StepError> {
        let contact = require_contact(step, ctx)?;
        let subject = ctx.resolve_template(&config.subject);
        let content = ctx.resolve_template(&config.content);

        self.record_activity(ActivityEntry::new(
            contact.id,
            ActivityType::EmailSent,
            format!("Email sent: {subject}"),
            json!({
                "workflowId": ctx.workflow_id,
                "executionId": ctx.execution_id,
                "stepId": step.id,
                "subject": subject,
            }),
        ))
        .await;

        let message = EmailMessage {
            contact_id: contact.id,
            to: contact.email.clone(),
            subject,
            content,
        };
        if let Err(e) = self.collaborators.email.send(&message).await {
            tracing::warn!(
                execution_id = %ctx.execution_id,
                step_id = step.id.as_str(),
                contact_id = %contact.id,
                error = %e,
                "email hand-off failed"
            );
        }

        Ok(StepOutcome::advance(step.next_step_id.clone()))
    }

    // -----------------------------------------------------------------------
    // ADD_TAG / REMOVE_TAG
    // -----------------------------------------------------------------------

    async fn run_tags(
        &self,
        step: &StepDefinition,
        config: &TagConfig,
        ctx: &ExecutionContext,
        op: TagOp,
    ) -> Result<StepOutcome, StepError> {
        let contact = require_contact(step, ctx)?;
        let tags = config.tag_list();
        if tags.is_empty() {
            return Ok(StepOutcome::advance(step.next_step_id.clone()));
        }

        let Some((updated, changed)) = self.write_tags(contact, &tags, op).await? else {
            return Ok(StepOutcome::advance(step.next_step_id.clone()));
        };

        let (activity_type, verb) = match op {
            TagOp::Add => (ActivityType::TagAdded, "added"),
            TagOp::Remove => (ActivityType::TagRemoved, "removed"),
        };
        self.record_activity(ActivityEntry::new(
            updated.id,
            activity_type,
            format!("Tags {verb}: {}", changed.join(", ")),
            json!({
                "workflowId": ctx.workflow_id,
                "executionId": ctx.execution_id,
                "stepId": step.id,
                "tags": changed,
            }),
        ))
        .await;

        Ok(StepOutcome::advance(step.next_step_id.clone()).with_contact(Some(updated)))
    }

    /// Compare-and-swap the tag set, re-reading on version conflicts.
    ///
    /// Returns `None` when the result equals the stored set (no write made),
    /// otherwise the written contact and the tags that actually changed.
    async fn write_tags(
        &self,
        contact: &Contact,
        tags: &[String],
        op: TagOp,
    ) -> Result<Option<(Contact, Vec<String>)>, StepError> {
        let mut current = contact.clone();

        for attempt in 1..=MAX_TAG_WRITE_ATTEMPTS {
            let (next, changed) = apply_tag_op(&current.tags, tags, op);
            if changed.is_empty() {
                return Ok(None);
            }

            match self
                .collaborators
                .contacts
                .set_tags(&current.id, &next, current.version)
                .await
            {
                Ok(updated) => return Ok(Some((updated, changed))),
                Err(RepositoryError::Conflict(_)) => {
                    tracing::debug!(
                        contact_id = %current.id,
                        attempt,
                        "tag write conflicted, re-reading contact"
                    );
                    current = self
                        .collaborators
                        .contacts
                        .get_contact(&current.id)
                        .await
                        .map_err(|e| StepError::Collaborator(e.to_string()))?
                        .ok_or_else(|| {
                            StepError::Data(format!("contact {} no longer exists", current.id))
                        })?;
                }
                Err(RepositoryError::NotFound) => {
                    return Err(StepError::Data(format!(
                        "contact {} no longer exists",
                        current.id
                    )));
                }
                Err(e) => return Err(StepError::Collaborator(e.to_string())),
            }
        }

        Err(StepError::Collaborator(format!(
            "tag update for contact {} conflicted {MAX_TAG_WRITE_ATTEMPTS} times",
            contact.id
        )))
    }

    // -----------------------------------------------------------------------
    // UPDATE_CONTACT
    // -----------------------------------------------------------------------

    async fn run_update_contact(
        &self,
        step: &StepDefinition,
        config: &UpdateContactConfig,
        ctx: &ExecutionContext,
    ) -> Result<StepOutcome, StepError> {
        let contact = require_contact(step, ctx)?;
        let fields = config.fields.map_values(|v| ctx.resolve_template(v));
        let custom_fields = config
            .custom_fields
            .as_ref()
            .filter(|m| !m.is_empty())
            .map(|m| resolve_strings(m, ctx));

        if fields.is_empty() && custom_fields.is_none() {
            return Ok(StepOutcome::advance(step.next_step_id.clone()));
        }

        let updated = self
            .collaborators
            .contacts
            .update_fields(&contact.id, &fields, custom_fields.as_ref())
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => {
                    StepError::Data(format!("contact {} no longer exists", contact.id))
                }
                other => StepError::Collaborator(other.to_string()),
            })?;

        // The store bumps the version only when a value actually changed.
        if updated.version == contact.version {
            return Ok(StepOutcome::advance(step.next_step_id.clone()).with_contact(Some(updated)));
        }

        let custom_keys: Vec<&String> = custom_fields.iter().flat_map(|m| m.keys()).collect();
        self.record_activity(ActivityEntry::new(
            contact.id,
            ActivityType::ContactUpdated,
            "Contact updated by workflow",
            json!({
                "workflowId": ctx.workflow_id,
                "executionId": ctx.execution_id,
                "stepId": step.id,
                "fields": fields.field_names(),
                "customFields": custom_keys,
            }),
        ))
        .await;

        Ok(StepOutcome::advance(step.next_step_id.clone()).with_contact(Some(updated)))
    }

    // -----------------------------------------------------------------------
    // WEBHOOK
    // -----------------------------------------------------------------------

    async fn run_webhook(
        &self,
        step: &StepDefinition,
        config: &WebhookConfig,
        ctx: &ExecutionContext,
    ) -> Result<StepOutcome, StepError> {
        let url = ctx.resolve_template(&config.url).trim().to_string();
        if url.is_empty() {
            return Err(StepError::Validation(format!(
                "webhook step '{}' resolved to an empty url",
                step.id
            )));
        }

        let method = config.method.trim().to_ascii_uppercase();
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            return Err(StepError::Validation(format!(
                "unsupported webhook method '{}'",
                config.method
            )));
        }

        let mut body = Map::new();
        body.insert("contact".to_string(), ctx.contact_json());
        body.insert("data".to_string(), Value::Object(ctx.data.clone()));
        body.insert("workflowId".to_string(), json!(ctx.workflow_id));
        body.insert("stepId".to_string(), json!(step.id));
        body.insert("executionId".to_string(), json!(ctx.execution_id));
        if let Some(payload) = &config.payload {
            body.extend(resolve_strings(payload, ctx));
        }

        let request = WebhookRequest {
            url,
            method,
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), ctx.resolve_template(v)))
                .collect(),
            body: Value::Object(body),
            timeout: self.webhook.effective_timeout(config.timeout_secs),
        };

        tracing::debug!(
            execution_id = %ctx.execution_id,
            step_id = step.id.as_str(),
            url = request.url.as_str(),
            method = request.method.as_str(),
            "calling webhook"
        );

        let response =
            match tokio::time::timeout(request.timeout, self.collaborators.webhooks.call(&request))
                .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(StepError::ExternalCall(e.to_string())),
                Err(_elapsed) => {
                    return Err(StepError::ExternalCall(format!(
                        "webhook timed out after {}s",
                        request.timeout.as_secs()
                    )));
                }
            };

        if !response.is_success() {
            return Err(StepError::ExternalCall(format!(
                "webhook returned HTTP {}",
                response.status
            )));
        }

        Ok(StepOutcome::advance(step.next_step_id.clone()).with_data(response_data(&response.body)))
    }

    // -----------------------------------------------------------------------
    // CONDITION
    // -----------------------------------------------------------------------

    fn run_condition(
        &self,
        step: &StepDefinition,
        config: &ConditionConfig,
        ctx: &ExecutionContext,
    ) -> StepOutcome {
        let result = self.evaluator.evaluate(config, &ctx.to_value());
        let branch = step.branches.as_ref().and_then(|b| {
            if result {
                b.true_step_id.clone()
            } else {
                b.false_step_id.clone()
            }
        });
        let next = branch.or_else(|| step.next_step_id.clone());

        tracing::debug!(
            execution_id = %ctx.execution_id,
            step_id = step.id.as_str(),
            result,
            next = next.as_deref().unwrap_or("<end>"),
            "condition evaluated"
        );

        let mut results = match ctx.data.get(CONDITIONS_KEY) {
            Some(Value::Object(existing)) => existing.clone(),
            _ => Map::new(),
        };
        results.insert(step.id.clone(), Value::Bool(result));
        let mut data = DataBag::new();
        data.insert(CONDITIONS_KEY.to_string(), Value::Object(results));

        StepOutcome::advance(next).with_data(data)
    }

    // -----------------------------------------------------------------------
    // START_WORKFLOW
    // -----------------------------------------------------------------------

    async fn run_start_workflow(
        &self,
        step: &StepDefinition,
        config: &StartWorkflowConfig,
        ctx: &ExecutionContext,
    ) -> Result<StepOutcome, StepError> {
        let request = SpawnRequest {
            workflow_id: config.workflow_id,
            contact_id: ctx.contact.as_ref().map(|c| c.id),
            data: ctx.data.clone(),
            parent_execution_id: ctx.execution_id,
        };

        let child_id = self
            .collaborators
            .spawner
            .spawn(request)
            .await
            .map_err(|e| {
                if e.is_invalid_target() {
                    StepError::Validation(e.to_string())
                } else {
                    StepError::Collaborator(e.to_string())
                }
            })?;

        tracing::info!(
            execution_id = %ctx.execution_id,
            child_execution_id = %child_id,
            workflow_id = %config.workflow_id,
            "spawned child execution"
        );

        let mut spawned = match ctx.data.get(SPAWNED_EXECUTIONS_KEY) {
            Some(Value::Array(existing)) => existing.clone(),
            _ => Vec::new(),
        };
        spawned.push(json!(child_id));
        let mut data = DataBag::new();
        data.insert(SPAWNED_EXECUTIONS_KEY.to_string(), Value::Array(spawned));

        Ok(StepOutcome::advance(step.next_step_id.clone()).with_data(data))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Append an activity entry; failures are logged and swallowed.
    async fn record_activity(&self, entry: ActivityEntry) {
        if let Err(e) = self.collaborators.activity.append(&entry).await {
            tracing::warn!(
                contact_id = %entry.contact_id,
                activity = entry.activity_type.as_str(),
                error = %e,
                "failed to record activity"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Pure handlers and helpers
// ---------------------------------------------------------------------------

fn run_delay(
    step: &StepDefinition,
    config: &DelayConfig,
    now: DateTime<Utc>,
) -> Result<StepOutcome, StepError> {
    let wait_until = config
        .duration()
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| {
            StepError::Validation(format!("delay step '{}' is out of range", step.id))
        })?;

    Ok(StepOutcome {
        should_wait: true,
        wait_until: Some(wait_until),
        ..StepOutcome::advance(step.next_step_id.clone())
    })
}

fn require_contact<'a>(
    step: &StepDefinition,
    ctx: &'a ExecutionContext,
) -> Result<&'a Contact, StepError> {
    ctx.contact.as_ref().ok_or_else(|| {
        StepError::Data(format!(
            "{} step '{}' requires a contact",
            step.type_name(),
            step.id
        ))
    })
}

/// Union or difference of `current` with `tags`, preserving order.
/// Returns the new set and the tags that actually changed.
fn apply_tag_op(current: &[String], tags: &[String], op: TagOp) -> (Vec<String>, Vec<String>) {
    match op {
        TagOp::Add => {
            let added: Vec<String> = tags
                .iter()
                .filter(|t| !current.contains(t))
                .cloned()
                .collect();
            let mut next = current.to_vec();
            next.extend(added.iter().cloned());
            (next, added)
        }
        TagOp::Remove => {
            let removed: Vec<String> = tags
                .iter()
                .filter(|t| current.contains(t))
                .cloned()
                .collect();
            let next = current
                .iter()
                .filter(|t| !tags.contains(t))
                .cloned()
                .collect();
            (next, removed)
        }
    }
}

/// Resolve merge tags in top-level string values.
fn resolve_strings(map: &Map<String, Value>, ctx: &ExecutionContext) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => Value::String(ctx.resolve_template(s)),
                other => other.clone(),
            };
            (k.clone(), v)
        })
        .collect()
}

/// Data produced by a 2xx webhook response body.
fn response_data(body: &str) -> DataBag {
    let mut data = DataBag::new();
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return data;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => data = map,
        Ok(other) => {
            data.insert(WEBHOOK_RESPONSE_KEY.to_string(), other);
        }
        Err(_) => {
            data.insert(
                WEBHOOK_RESPONSE_KEY.to_string(),
                Value::String(trimmed.to_string()),
            );
        }
    }
    data
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
