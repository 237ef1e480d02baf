//! Outbound collaborator ports used by the step dispatcher.
//!
//! Each port is object-safe (boxed futures) so the dispatcher can hold them
//! as `Arc<dyn ..>` and tests can substitute in-memory fakes.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use funnelflow_types::workflow::DataBag;
use serde_json::Value;
use uuid::Uuid;

use crate::repository::activity::ActivityLog;
use crate::repository::contact::ContactStore;

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

/// A fully resolved outbound webhook request.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub timeout: Duration,
}

/// Raw response from a webhook call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid webhook request: {0}")]
    InvalidRequest(String),

    #[error("webhook transport error: {0}")]
    Transport(String),
}

/// Outbound HTTP client for WEBHOOK steps.
///
/// Implementations must honor `request.timeout`; the dispatcher also wraps
/// the call in its own timeout.
pub trait WebhookClient: Send + Sync {
    fn call<'a>(
        &'a self,
        request: &'a WebhookRequest,
    ) -> Pin<Box<dyn Future<Output = Result<WebhookResponse, WebhookError>> + Send + 'a>>;
}

// ---------------------------------------------------------------------------
// Email
// ---------------------------------------------------------------------------

/// A rendered email ready for hand-off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub contact_id: Uuid,
    pub to: String,
    pub subject: String,
    pub content: String,
}

#[derive(Debug, thiserror::Error)]
#[error("email dispatch failed: {0}")]
pub struct EmailError(pub String);

/// Email hand-off. Delivery itself is outside the engine.
pub trait EmailDispatcher: Send + Sync {
    fn send<'a>(
        &'a self,
        message: &'a EmailMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), EmailError>> + Send + 'a>>;
}

// ---------------------------------------------------------------------------
// Workflow spawn
// ---------------------------------------------------------------------------

/// Request to start an independent child execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRequest {
    pub workflow_id: Uuid,
    pub contact_id: Option<Uuid>,
    pub data: DataBag,
    pub parent_execution_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    #[error("workflow is inactive: {0}")]
    Inactive(Uuid),

    #[error("workflow has no steps: {0}")]
    Empty(Uuid),

    #[error("spawn failed: {0}")]
    Internal(String),
}

impl SpawnError {
    /// Whether the failure is the target's fault (bad configuration) rather
    /// than an infrastructure problem.
    pub fn is_invalid_target(&self) -> bool {
        matches!(
            self,
            SpawnError::NotFound(_) | SpawnError::Inactive(_) | SpawnError::Empty(_)
        )
    }
}

/// Creates child executions for START_WORKFLOW steps.
///
/// Must not drive the child inline: the returned ID refers to an execution
/// that some other worker will run.
pub trait WorkflowSpawner: Send + Sync {
    fn spawn<'a>(
        &'a self,
        request: SpawnRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Uuid, SpawnError>> + Send + 'a>>;
}

// ---------------------------------------------------------------------------
// Collaborators bundle
// ---------------------------------------------------------------------------

/// Every external dependency the dispatcher talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub contacts: Arc<dyn ContactStore>,
    pub activity: Arc<dyn ActivityLog>,
    pub webhooks: Arc<dyn WebhookClient>,
    pub email: Arc<dyn EmailDispatcher>,
    pub spawner: Arc<dyn WorkflowSpawner>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
