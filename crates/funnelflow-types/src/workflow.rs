//! Workflow domain types for Funnelflow.
//!
//! Defines the workflow definition model (a graph of typed steps linked by
//! `nextStepId` and condition branches) and the execution tracking types
//! (`WorkflowExecution`, `ExecutionStepLog`) persisted by the execution ledger.
//!
//! Step configuration arrives as a loosely typed `{type, config}` record from
//! the builder. It is converted once, at load time, into the `StepConfig` sum
//! type so the dispatcher never inspects optional fields ad hoc.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Accumulating key-value bag carried by an execution.
pub type DataBag = Map<String, Value>;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A workflow: an identity, an active flag and a graph of steps.
///
/// Treated as immutable once executions reference it; edits are expected to
/// bump `version` rather than mutate the graph in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// UUIDv7, generated when an imported file omits it.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Monotonic definition version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Inactive workflows cannot be started or spawned.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Steps forming the workflow graph.
    pub steps: Vec<StepDefinition>,
}

fn default_version() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

impl WorkflowDefinition {
    /// The entry step: lowest `sortOrder`, ties broken by declaration order.
    pub fn first_step(&self) -> Option<&StepDefinition> {
        self.steps
            .iter()
            .enumerate()
            .min_by_key(|(idx, step)| (step.sort_order, *idx))
            .map(|(_, step)| step)
    }

    /// Look up a step by its ID.
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single typed step in the workflow graph.
///
/// Serialized through [`StepRecord`], the `{id, type, config, nextStepId,
/// conditions, sortOrder}` shape the builder produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StepRecord", into = "StepRecord")]
pub struct StepDefinition {
    /// Step ID, unique within its workflow.
    pub id: String,
    /// Owning workflow, when the record carries it.
    pub workflow_id: Option<Uuid>,
    /// Position hint; the lowest value is the entry step.
    pub sort_order: i32,
    /// Type-specific configuration.
    pub config: StepConfig,
    /// Default successor.
    pub next_step_id: Option<String>,
    /// Branch targets for CONDITION steps.
    pub branches: Option<ConditionBranches>,
}

impl StepDefinition {
    /// The wire name of this step's type (e.g. `SEND_EMAIL`).
    pub fn type_name(&self) -> &str {
        self.config.type_name()
    }

    /// Every step ID this step can hand control to.
    pub fn successors(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(next) = self.next_step_id.as_deref() {
            out.push(next);
        }
        if let Some(branches) = &self.branches {
            for target in [&branches.true_step_id, &branches.false_step_id]
                .into_iter()
                .flatten()
            {
                if !out.contains(&target.as_str()) {
                    out.push(target.as_str());
                }
            }
        }
        out
    }
}

/// Raw step record as produced by the workflow builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<ConditionBranches>,
    #[serde(default)]
    pub sort_order: i32,
}

impl TryFrom<StepRecord> for StepDefinition {
    type Error = StepConfigError;

    fn try_from(record: StepRecord) -> Result<Self, Self::Error> {
        let config = StepConfig::from_parts(&record.step_type, record.config)
            .map_err(|e| e.for_step(&record.id))?;
        Ok(Self {
            id: record.id,
            workflow_id: record.workflow_id,
            sort_order: record.sort_order,
            config,
            next_step_id: record.next_step_id,
            branches: record.conditions,
        })
    }
}

impl From<StepDefinition> for StepRecord {
    fn from(step: StepDefinition) -> Self {
        let (step_type, config) = step.config.into_parts();
        Self {
            id: step.id,
            workflow_id: step.workflow_id,
            step_type,
            config,
            next_step_id: step.next_step_id,
            conditions: step.branches,
            sort_order: step.sort_order,
        }
    }
}

/// Alternative successors chosen by a CONDITION step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionBranches {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub false_step_id: Option<String>,
}

/// The kind of step in a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    SendEmail,
    Delay,
    AddTag,
    RemoveTag,
    UpdateContact,
    Webhook,
    Condition,
    StartWorkflow,
    End,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::SendEmail => "SEND_EMAIL",
            StepType::Delay => "DELAY",
            StepType::AddTag => "ADD_TAG",
            StepType::RemoveTag => "REMOVE_TAG",
            StepType::UpdateContact => "UPDATE_CONTACT",
            StepType::Webhook => "WEBHOOK",
            StepType::Condition => "CONDITION",
            StepType::StartWorkflow => "START_WORKFLOW",
            StepType::End => "END",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SEND_EMAIL" => Ok(StepType::SendEmail),
            "DELAY" => Ok(StepType::Delay),
            "ADD_TAG" => Ok(StepType::AddTag),
            "REMOVE_TAG" => Ok(StepType::RemoveTag),
            "UPDATE_CONTACT" => Ok(StepType::UpdateContact),
            "WEBHOOK" => Ok(StepType::Webhook),
            "CONDITION" => Ok(StepType::Condition),
            "START_WORKFLOW" => Ok(StepType::StartWorkflow),
            "END" => Ok(StepType::End),
            other => Err(format!("unknown step type: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Step Configuration
// ---------------------------------------------------------------------------

/// Step-specific configuration, keyed by step type.
///
/// `Unknown` preserves records whose `type` this engine does not recognize so
/// that legacy workflows still load; dispatching such a step fails the
/// execution with an "unknown step type" error.
#[derive(Debug, Clone, PartialEq)]
pub enum StepConfig {
    SendEmail(SendEmailConfig),
    Delay(DelayConfig),
    AddTag(TagConfig),
    RemoveTag(TagConfig),
    UpdateContact(UpdateContactConfig),
    Webhook(WebhookConfig),
    Condition(ConditionConfig),
    StartWorkflow(StartWorkflowConfig),
    End,
    Unknown { step_type: String, config: Value },
}

impl StepConfig {
    /// Decode a `{type, config}` pair into the typed configuration.
    pub fn from_parts(step_type: &str, config: Value) -> Result<Self, StepConfigError> {
        let config = match config {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let Ok(kind) = step_type.parse::<StepType>() else {
            return Ok(StepConfig::Unknown {
                step_type: step_type.to_string(),
                config,
            });
        };

        fn decode<T: serde::de::DeserializeOwned>(
            kind: StepType,
            config: Value,
        ) -> Result<T, StepConfigError> {
            serde_json::from_value(config).map_err(|e| StepConfigError {
                step_id: None,
                step_type: kind.as_str().to_string(),
                message: e.to_string(),
            })
        }

        Ok(match kind {
            StepType::SendEmail => StepConfig::SendEmail(decode(kind, config)?),
            StepType::Delay => StepConfig::Delay(decode(kind, config)?),
            StepType::AddTag => StepConfig::AddTag(decode(kind, config)?),
            StepType::RemoveTag => StepConfig::RemoveTag(decode(kind, config)?),
            StepType::UpdateContact => StepConfig::UpdateContact(decode(kind, config)?),
            StepType::Webhook => StepConfig::Webhook(decode(kind, config)?),
            StepType::Condition => StepConfig::Condition(decode(kind, config)?),
            StepType::StartWorkflow => StepConfig::StartWorkflow(decode(kind, config)?),
            StepType::End => StepConfig::End,
        })
    }

    /// Encode back into the `{type, config}` wire pair.
    pub fn into_parts(self) -> (String, Value) {
        fn encode<T: Serialize>(value: &T) -> Value {
            serde_json::to_value(value).unwrap_or_else(|_| Value::Object(Map::new()))
        }

        let step_type = self.type_name().to_string();
        let config = match self {
            StepConfig::SendEmail(c) => encode(&c),
            StepConfig::Delay(c) => encode(&c),
            StepConfig::AddTag(c) | StepConfig::RemoveTag(c) => encode(&c),
            StepConfig::UpdateContact(c) => encode(&c),
            StepConfig::Webhook(c) => encode(&c),
            StepConfig::Condition(c) => encode(&c),
            StepConfig::StartWorkflow(c) => encode(&c),
            StepConfig::End => Value::Object(Map::new()),
            StepConfig::Unknown { config, .. } => config,
        };
        (step_type, config)
    }

    /// The recognized step type, or `None` for `Unknown`.
    pub fn step_type(&self) -> Option<StepType> {
        Some(match self {
            StepConfig::SendEmail(_) => StepType::SendEmail,
            StepConfig::Delay(_) => StepType::Delay,
            StepConfig::AddTag(_) => StepType::AddTag,
            StepConfig::RemoveTag(_) => StepType::RemoveTag,
            StepConfig::UpdateContact(_) => StepType::UpdateContact,
            StepConfig::Webhook(_) => StepType::Webhook,
            StepConfig::Condition(_) => StepType::Condition,
            StepConfig::StartWorkflow(_) => StepType::StartWorkflow,
            StepConfig::End => StepType::End,
            StepConfig::Unknown { .. } => return None,
        })
    }

    /// Wire name of the step type, including unrecognized ones.
    pub fn type_name(&self) -> &str {
        match self {
            StepConfig::Unknown { step_type, .. } => step_type,
            other => other.step_type().map(|t| t.as_str()).unwrap_or("UNKNOWN"),
        }
    }
}

/// Error decoding a step's configuration payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {step_type} config{}: {message}", step_id.as_ref().map(|id| format!(" for step '{id}'")).unwrap_or_default())]
pub struct StepConfigError {
    pub step_id: Option<String>,
    pub step_type: String,
    pub message: String,
}

impl StepConfigError {
    fn for_step(mut self, step_id: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self
    }
}

/// SEND_EMAIL configuration. Subject and content accept merge tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailConfig {
    pub subject: String,
    #[serde(default, alias = "body")]
    pub content: String,
}

/// DELAY configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayConfig {
    pub delay_value: u64,
    #[serde(default)]
    pub delay_unit: DelayUnit,
}

impl DelayConfig {
    /// The normalized wait, or `None` if it overflows.
    pub fn duration(&self) -> Option<TimeDelta> {
        let value = i64::try_from(self.delay_value).ok()?;
        match self.delay_unit {
            DelayUnit::Minutes => TimeDelta::try_minutes(value),
            DelayUnit::Hours => TimeDelta::try_hours(value),
            DelayUnit::Days => TimeDelta::try_days(value),
        }
    }
}

/// Unit for DELAY steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayUnit {
    #[default]
    #[serde(alias = "minute")]
    Minutes,
    #[serde(alias = "hour")]
    Hours,
    #[serde(alias = "day")]
    Days,
}

/// ADD_TAG / REMOVE_TAG configuration. Accepts `tags: [..]`, `tag: ".."` or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl TagConfig {
    /// Configured tags, trimmed, without blanks or duplicates, in order.
    pub fn tag_list(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for tag in self.tags.iter().chain(self.tag.iter()) {
            let tag = tag.trim();
            if !tag.is_empty() && !out.iter().any(|t| t == tag) {
                out.push(tag.to_string());
            }
        }
        out
    }
}

/// UPDATE_CONTACT configuration.
///
/// Only the allow-listed top-level contact fields are captured; any other key
/// in the payload is ignored during decoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateContactConfig {
    #[serde(flatten)]
    pub fields: crate::contact::ContactFieldUpdate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_fields: Option<Map<String, Value>>,
}

/// WEBHOOK configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_webhook_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Extra keys merged over the standard request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    /// Per-step timeout; clamped to the engine maximum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

/// CONDITION configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionConfig {
    #[serde(default)]
    pub conditions: Vec<ConditionRule>,
    #[serde(default)]
    pub logic: ConditionLogic,
}

/// One predicate: `<field> <operator> <value>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionRule {
    /// Dot path rooted at `contact` or `data`.
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

/// Comparison operators understood by the condition evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    IsEmpty,
    IsNotEmpty,
    /// Any operator this engine does not recognize; always evaluates to false.
    #[serde(other)]
    Unsupported,
}

/// How multiple predicates combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionLogic {
    #[default]
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
}

/// START_WORKFLOW configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowConfig {
    pub workflow_id: Uuid,
}

// ---------------------------------------------------------------------------
// Execution Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow execution.
///
/// COMPLETED, FAILED and CANCELED are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Waiting,
    Completed,
    Failed,
    Canceled,
}

impl ExecutionStatus {
    /// Statuses from which an execution can still move.
    pub const ACTIVE: [ExecutionStatus; 2] = [ExecutionStatus::Running, ExecutionStatus::Waiting];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Waiting => "WAITING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Canceled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(ExecutionStatus::Running),
            "WAITING" => Ok(ExecutionStatus::Waiting),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "CANCELED" => Ok(ExecutionStatus::Canceled),
            other => Err(format!("invalid execution status: {other}")),
        }
    }
}

/// Status of an individual step dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepLogStatus {
    Running,
    Completed,
    Waiting,
    Failed,
}

impl StepLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepLogStatus::Running => "running",
            StepLogStatus::Completed => "completed",
            StepLogStatus::Waiting => "waiting",
            StepLogStatus::Failed => "failed",
        }
    }
}

impl FromStr for StepLogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(StepLogStatus::Running),
            "completed" => Ok(StepLogStatus::Completed),
            "waiting" => Ok(StepLogStatus::Waiting),
            "failed" => Ok(StepLogStatus::Failed),
            other => Err(format!("invalid step status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow Execution (ledger record)
// ---------------------------------------------------------------------------

/// One run of a workflow for (at most) one contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    /// Workflow being executed.
    pub workflow_id: Uuid,
    /// Contact the execution runs for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<Uuid>,
    pub status: ExecutionStatus,
    /// Non-null while RUNNING or WAITING. While WAITING it is the DELAY step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    /// Accumulated data bag.
    #[serde(default)]
    pub data: DataBag,
    /// Wake time; set iff status is WAITING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    /// Failure reason for FAILED executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Token of the worker currently driving this RUNNING execution.
    /// Cleared whenever the execution waits or stops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<Uuid>,
    /// When the drive lease was taken or last renewed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    /// A fresh RUNNING execution positioned at `first_step_id`.
    pub fn new(
        workflow_id: Uuid,
        contact_id: Option<Uuid>,
        first_step_id: impl Into<String>,
        data: DataBag,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            contact_id,
            status: ExecutionStatus::Running,
            current_step_id: Some(first_step_id.into()),
            data,
            resume_at: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            driver_id: None,
            claimed_at: None,
        }
    }

    /// Merge new entries into the data bag; equal keys take the newer value.
    pub fn merge_data(&mut self, entries: DataBag) {
        for (key, value) in entries {
            self.data.insert(key, value);
        }
    }
}

/// Audit record for one step dispatch within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStepLog {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub step_type: String,
    pub status: StepLogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
