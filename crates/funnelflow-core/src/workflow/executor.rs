//! Workflow engine: starts, drives, resumes and cancels executions.
//!
//! The `WorkflowEngine` is stateless apart from its injected repository and
//! collaborators, so any number of callers (CLI, resume scheduler, spawn
//! worker) can share one instance concurrently.
//!
//! # Drive loop
//!
//! Driving requires the execution's lease, taken by a claim (`run_execution`,
//! `trigger`) or by the WAITING -> RUNNING resume write.
//!
//! 1. Re-read the stored execution; stop unless it is still RUNNING under our
//!    lease (this is where a concurrent cancel is observed).
//! 2. Look up the current step and record a step-log start.
//! 3. Dispatch the step and merge its data into the execution.
//! 4. Persist the transition (fail, wait, advance or complete) with a
//!    conditional write expecting RUNNING and our lease. A rejected write ends
//!    the loop.
//! 5. Finish the step log. The transition is already durable, so a failure
//!    here is logged and never causes the step to run again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use funnelflow_types::config::WebhookSettings;
use funnelflow_types::error::RepositoryError;
use funnelflow_types::workflow::{
    DataBag, ExecutionStatus, ExecutionStepLog, StepLogStatus, WorkflowDefinition,
    WorkflowExecution,
};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

use super::collaborator::Collaborators;
use super::context::ExecutionContext;
use super::definition::{WorkflowError, lint_definition, validate_definition};
use super::ledger::{ExecutionLedger, Transition};
use super::step_runner::{StepDispatcher, StepOutcome};

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors returned to engine callers. Step failures are never reported here;
/// they are recorded on the execution as FAILED.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("workflow is inactive: {0}")]
    WorkflowInactive(Uuid),

    #[error("workflow has no steps: {0}")]
    WorkflowEmpty(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("execution {id} is {status}, expected {expected}")]
    InvalidState {
        id: Uuid,
        status: ExecutionStatus,
        expected: &'static str,
    },

    #[error("execution {0} is being driven by another worker")]
    AlreadyClaimed(Uuid),

    #[error("execution {id} is not due until {resume_at}")]
    NotDue {
        id: Uuid,
        resume_at: DateTime<Utc>,
    },

    #[error("invalid workflow definition: {0}")]
    Definition(#[from] WorkflowError),

    #[error("ledger error: {0}")]
    Ledger(#[from] RepositoryError),
}

/// Build a fresh RUNNING execution for `workflow_id`, checking that the
/// definition exists, is active and has an entry step.
pub(crate) fn prepare_execution(
    workflow_id: Uuid,
    definition: Option<&WorkflowDefinition>,
    contact_id: Option<Uuid>,
    data: DataBag,
) -> Result<WorkflowExecution, EngineError> {
    let def = definition.ok_or(EngineError::WorkflowNotFound(workflow_id))?;
    if !def.active {
        return Err(EngineError::WorkflowInactive(workflow_id));
    }
    let first = def
        .first_step()
        .ok_or(EngineError::WorkflowEmpty(workflow_id))?;
    Ok(WorkflowExecution::new(
        workflow_id,
        contact_id,
        first.id.clone(),
        data,
    ))
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Per-contact workflow engine.
///
/// Generic over `R: WorkflowRepository` for storage flexibility.
pub struct WorkflowEngine<R: WorkflowRepository> {
    ledger: ExecutionLedger<R>,
    dispatcher: StepDispatcher,
}

impl<R: WorkflowRepository> WorkflowEngine<R> {
    pub fn new(repo: Arc<R>, collaborators: Collaborators, webhook: WebhookSettings) -> Self {
        Self {
            ledger: ExecutionLedger::new(repo),
            dispatcher: StepDispatcher::new(collaborators, webhook),
        }
    }

    pub fn ledger(&self) -> &ExecutionLedger<R> {
        &self.ledger
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and store a definition. Re-importing an ID replaces it.
    pub async fn import_definition(
        &self,
        mut def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, EngineError> {
        validate_definition(&def)?;
        for step in &mut def.steps {
            step.workflow_id = Some(def.id);
        }
        self.ledger.repo().save_definition(&def).await?;

        let findings = lint_definition(&def);
        tracing::info!(
            workflow_id = %def.id,
            name = def.name.as_str(),
            steps = def.steps.len(),
            warnings = findings.len(),
            "imported workflow definition"
        );
        Ok(def)
    }

    pub async fn get_definition(&self, id: &Uuid) -> Result<WorkflowDefinition, EngineError> {
        self.ledger
            .repo()
            .get_definition(id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(*id))
    }

    pub async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, EngineError> {
        Ok(self.ledger.repo().list_definitions().await?)
    }

    /// Activate or deactivate a workflow. Running executions are unaffected.
    pub async fn set_active(&self, id: &Uuid, active: bool) -> Result<(), EngineError> {
        if !self.ledger.repo().set_active(id, active).await? {
            return Err(EngineError::WorkflowNotFound(*id));
        }
        tracing::info!(workflow_id = %id, active, "workflow activation changed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Create a RUNNING execution positioned at the workflow's first step.
    /// Does not dispatch anything.
    pub async fn start_execution(
        &self,
        workflow_id: Uuid,
        contact_id: Option<Uuid>,
        data: DataBag,
    ) -> Result<WorkflowExecution, EngineError> {
        let def = self.ledger.repo().get_definition(&workflow_id).await?;
        let exec = prepare_execution(workflow_id, def.as_ref(), contact_id, data)?;
        self.ledger.create(&exec).await?;

        tracing::info!(
            execution_id = %exec.id,
            workflow_id = %workflow_id,
            contact_id = ?contact_id,
            "execution started"
        );
        Ok(exec)
    }

    /// Drive a RUNNING execution until it waits or reaches a terminal status.
    ///
    /// Fails with `AlreadyClaimed` while another caller holds a live lease.
    pub async fn run_execution(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        let exec = self.load_execution(&id).await?;
        if exec.status != ExecutionStatus::Running {
            return Err(EngineError::InvalidState {
                id,
                status: exec.status,
                expected: "RUNNING",
            });
        }
        let exec = self.claim(id).await?;
        self.drive(exec).await
    }

    /// Start an execution and drive it immediately.
    pub async fn trigger(
        &self,
        workflow_id: Uuid,
        contact_id: Option<Uuid>,
        data: DataBag,
    ) -> Result<WorkflowExecution, EngineError> {
        let exec = self.start_execution(workflow_id, contact_id, data).await?;
        let exec = self.claim(exec.id).await?;
        self.drive(exec).await
    }

    /// Claim a due WAITING execution and drive it on.
    ///
    /// The claim moves the execution off its DELAY step to the DELAY's
    /// successor (or straight to COMPLETED). Returns `Ok(None)` when another
    /// actor canceled or claimed the execution first.
    pub async fn resume_execution(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowExecution>, EngineError> {
        let mut exec = self.load_execution(&id).await?;
        if exec.status != ExecutionStatus::Waiting {
            return Err(EngineError::InvalidState {
                id,
                status: exec.status,
                expected: "WAITING",
            });
        }
        if let Some(resume_at) = exec.resume_at
            && resume_at > now
        {
            return Err(EngineError::NotDue { id, resume_at });
        }

        let def = self.ledger.repo().get_definition(&exec.workflow_id).await?;
        let delay_step = def
            .as_ref()
            .zip(exec.current_step_id.as_deref())
            .and_then(|(def, step_id)| def.step(step_id));

        let transition = match (def.as_ref(), delay_step) {
            (None, _) => Transition::Fail {
                error: format!("workflow not found: {}", exec.workflow_id),
            },
            (Some(_), None) => Transition::Fail {
                error: format!(
                    "step not found: {}",
                    exec.current_step_id.as_deref().unwrap_or("<none>")
                ),
            },
            (Some(_), Some(step)) => match &step.next_step_id {
                Some(next) => Transition::Resume {
                    next_step_id: next.clone(),
                    driver_id: Uuid::now_v7(),
                },
                None => Transition::Complete,
            },
        };
        let continues = matches!(transition, Transition::Resume { .. });

        if !self
            .ledger
            .transition(&mut exec, transition, &[ExecutionStatus::Waiting], now)
            .await?
        {
            return Ok(None);
        }

        tracing::info!(
            execution_id = %id,
            status = exec.status.as_str(),
            step_id = exec.current_step_id.as_deref().unwrap_or(""),
            "execution resumed"
        );

        if !continues {
            return Ok(Some(exec));
        }
        self.drive(exec).await.map(Some)
    }

    /// Move a RUNNING or WAITING execution to CANCELED.
    ///
    /// An in-flight step is not interrupted; the drive loop observes the
    /// cancel before its next dispatch.
    pub async fn cancel_execution(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        let exec = self.load_execution(&id).await?;
        if !self.ledger.cancel(&id, Utc::now()).await? {
            let current = self.load_execution(&id).await.unwrap_or(exec);
            return Err(EngineError::InvalidState {
                id,
                status: current.status,
                expected: "RUNNING or WAITING",
            });
        }
        self.load_execution(&id).await
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        self.load_execution(&id).await
    }

    pub async fn list_executions(
        &self,
        workflow_id: Uuid,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        Ok(self
            .ledger
            .repo()
            .list_executions(&workflow_id, limit)
            .await?)
    }

    pub async fn step_logs(&self, id: Uuid) -> Result<Vec<ExecutionStepLog>, EngineError> {
        Ok(self.ledger.step_logs(&id).await?)
    }

    // -----------------------------------------------------------------------
    // Drive loop
    // -----------------------------------------------------------------------

    async fn load_execution(&self, id: &Uuid) -> Result<WorkflowExecution, EngineError> {
        self.ledger
            .get(id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(*id))
    }

    async fn claim(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        if let Some(exec) = self.ledger.claim(&id, Utc::now()).await? {
            return Ok(exec);
        }
        let current = self.load_execution(&id).await?;
        if current.status != ExecutionStatus::Running {
            return Err(EngineError::InvalidState {
                id,
                status: current.status,
                expected: "RUNNING",
            });
        }
        Err(EngineError::AlreadyClaimed(id))
    }

    /// Step logs are an audit trail; by the time one is finished the
    /// execution has already moved on, so a failed write is only logged.
    async fn finish_step_log(
        &self,
        log_id: Uuid,
        status: StepLogStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) {
        if let Err(e) = self
            .ledger
            .record_step_finish(log_id, status, output, error)
            .await
        {
            tracing::warn!(
                log_id = %log_id,
                status = status.as_str(),
                error = %e,
                "failed to record step finish"
            );
        }
    }

    async fn drive(&self, mut exec: WorkflowExecution) -> Result<WorkflowExecution, EngineError> {
        let Some(def) = self.ledger.repo().get_definition(&exec.workflow_id).await? else {
            let error = format!("workflow not found: {}", exec.workflow_id);
            return self.fail(exec, error).await;
        };

        let contact = match exec.contact_id {
            Some(contact_id) => {
                match self
                    .dispatcher
                    .collaborators()
                    .contacts
                    .get_contact(&contact_id)
                    .await
                {
                    Ok(contact) => contact,
                    Err(e) => {
                        let error = format!("collaborator error: failed to load contact: {e}");
                        return self.fail(exec, error).await;
                    }
                }
            }
            None => None,
        };
        if exec.contact_id.is_some() && contact.is_none() {
            tracing::warn!(
                execution_id = %exec.id,
                contact_id = ?exec.contact_id,
                "contact not found, contact steps will fail"
            );
        }

        let mut ctx = ExecutionContext::new(exec.id, exec.workflow_id, contact, exec.data.clone());

        loop {
            let stored = self.load_execution(&exec.id).await?;
            if stored.status != ExecutionStatus::Running {
                tracing::info!(
                    execution_id = %exec.id,
                    status = stored.status.as_str(),
                    "execution no longer running, stopping"
                );
                return Ok(stored);
            }
            if stored.driver_id != exec.driver_id {
                tracing::warn!(
                    execution_id = %exec.id,
                    "drive lease lost to another worker, stopping"
                );
                return Ok(stored);
            }

            let Some(step_id) = exec.current_step_id.clone() else {
                return self.complete(exec).await;
            };
            let Some(step) = def.step(&step_id) else {
                return self.fail(exec, format!("step not found: {step_id}")).await;
            };

            let log_id = self.ledger.record_step_start(exec.id, step).await?;
            tracing::debug!(
                execution_id = %exec.id,
                step_id = step.id.as_str(),
                step_type = step.type_name(),
                "dispatching step"
            );

            let outcome = self.dispatcher.dispatch(step, &ctx, Utc::now()).await;

            if !outcome.success {
                let error = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "step failed".to_string());
                tracing::info!(
                    execution_id = %exec.id,
                    step_id = step.id.as_str(),
                    error = error.as_str(),
                    "step failed, failing execution"
                );
                let failed = self.fail(exec, error.clone()).await;
                self.finish_step_log(log_id, StepLogStatus::Failed, None, Some(&error))
                    .await;
                return failed;
            }

            let output = step_output(&outcome);
            ctx.merge(&outcome.data);
            exec.merge_data(outcome.data);
            if let Some(contact) = outcome.contact {
                ctx.contact = Some(contact);
            }

            let transition = if outcome.should_wait {
                match outcome.wait_until {
                    Some(resume_at) => Transition::Wait { resume_at },
                    None => {
                        let error = format!("step {} suspended without a resume time", step.id);
                        let failed = self.fail(exec, error.clone()).await;
                        self.finish_step_log(log_id, StepLogStatus::Failed, None, Some(&error))
                            .await;
                        return failed;
                    }
                }
            } else {
                match outcome.next_step_id {
                    Some(next_step_id) => Transition::Advance { next_step_id },
                    None => Transition::Complete,
                }
            };

            let log_status = match transition {
                Transition::Wait { .. } => StepLogStatus::Waiting,
                _ => StepLogStatus::Completed,
            };
            let stops = !matches!(transition, Transition::Advance { .. });
            let written = self
                .ledger
                .transition(
                    &mut exec,
                    transition,
                    &[ExecutionStatus::Running],
                    Utc::now(),
                )
                .await?;
            self.finish_step_log(log_id, log_status, Some(&output), None)
                .await;
            if !written {
                return self.load_execution(&exec.id).await;
            }
            if stops {
                tracing::info!(
                    execution_id = %exec.id,
                    status = exec.status.as_str(),
                    "execution stopped"
                );
                return Ok(exec);
            }
        }
    }

    async fn fail(
        &self,
        mut exec: WorkflowExecution,
        error: String,
    ) -> Result<WorkflowExecution, EngineError> {
        let written = self
            .ledger
            .transition(
                &mut exec,
                Transition::Fail { error },
                &ExecutionStatus::ACTIVE,
                Utc::now(),
            )
            .await?;
        if !written {
            return self.load_execution(&exec.id).await;
        }
        tracing::info!(
            execution_id = %exec.id,
            error = exec.error.as_deref().unwrap_or(""),
            "execution failed"
        );
        Ok(exec)
    }

    async fn complete(&self, mut exec: WorkflowExecution) -> Result<WorkflowExecution, EngineError> {
        let written = self
            .ledger
            .transition(
                &mut exec,
                Transition::Complete,
                &[ExecutionStatus::Running],
                Utc::now(),
            )
            .await?;
        if !written {
            return self.load_execution(&exec.id).await;
        }
        Ok(exec)
    }
}

fn step_output(outcome: &StepOutcome) -> Value {
    let mut output = json!({
        "nextStepId": outcome.next_step_id,
        "data": outcome.data,
    });
    if let Some(resume_at) = outcome.wait_until {
        output["resumeAt"] = json!(resume_at);
    }
    output
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::future::{Future, ready};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::TimeDelta;
    use funnelflow_types::contact::Contact;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::memory::{
        InMemoryActivityLog, InMemoryContactStore, InMemoryWorkflowRepository,
        RecordingEmailDispatcher,
    };
    use crate::workflow::collaborator::{
        WebhookClient, WebhookError, WebhookRequest, WebhookResponse,
    };
    use crate::workflow::definition::parse_workflow_yaml;
    use crate::workflow::spawn::QueueSpawner;

    /// Every call fails the way an unreachable host does.
    struct UnreachableWebhook;

    impl WebhookClient for UnreachableWebhook {
        fn call<'a>(
            &'a self,
            request: &'a WebhookRequest,
        ) -> Pin<Box<dyn Future<Output = Result<WebhookResponse, WebhookError>> + Send + 'a>>
        {
            Box::pin(ready(Err(WebhookError::Transport(format!(
                "error sending request for url ({}): connection refused",
                request.url
            )))))
        }
    }

    /// Answers 200 after a short pause, counting calls.
    #[derive(Default)]
    struct SlowWebhook {
        calls: AtomicUsize,
    }

    impl WebhookClient for SlowWebhook {
        fn call<'a>(
            &'a self,
            _request: &'a WebhookRequest,
        ) -> Pin<Box<dyn Future<Output = Result<WebhookResponse, WebhookError>> + Send + 'a>>
        {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(WebhookResponse {
                    status: 200,
                    body: "{}".to_string(),
                })
            })
        }
    }

    /// In-memory repository whose step-log finishes always fail.
    struct StepLogOutage(InMemoryWorkflowRepository);

    impl WorkflowRepository for StepLogOutage {
        async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
            self.0.save_definition(def).await
        }

        async fn get_definition(
            &self,
            id: &Uuid,
        ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
            self.0.get_definition(id).await
        }

        async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
            self.0.list_definitions().await
        }

        async fn set_active(&self, id: &Uuid, active: bool) -> Result<bool, RepositoryError> {
            self.0.set_active(id, active).await
        }

        async fn create_execution(&self, exec: &WorkflowExecution) -> Result<(), RepositoryError> {
            self.0.create_execution(exec).await
        }

        async fn get_execution(
            &self,
            id: &Uuid,
        ) -> Result<Option<WorkflowExecution>, RepositoryError> {
            self.0.get_execution(id).await
        }

        async fn list_executions(
            &self,
            workflow_id: &Uuid,
            limit: u32,
        ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
            self.0.list_executions(workflow_id, limit).await
        }

        async fn list_due(
            &self,
            now: DateTime<Utc>,
            limit: u32,
        ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
            self.0.list_due(now, limit).await
        }

        async fn update_execution(
            &self,
            exec: &WorkflowExecution,
            expected: &[ExecutionStatus],
            held_by: Option<&Uuid>,
        ) -> Result<bool, RepositoryError> {
            self.0.update_execution(exec, expected, held_by).await
        }

        async fn claim_execution(
            &self,
            id: &Uuid,
            driver_id: &Uuid,
            now: DateTime<Utc>,
            stale_before: DateTime<Utc>,
        ) -> Result<bool, RepositoryError> {
            self.0.claim_execution(id, driver_id, now, stale_before).await
        }

        async fn cancel_execution(
            &self,
            id: &Uuid,
            now: DateTime<Utc>,
        ) -> Result<bool, RepositoryError> {
            self.0.cancel_execution(id, now).await
        }

        async fn create_step_log(&self, log: &ExecutionStepLog) -> Result<(), RepositoryError> {
            self.0.create_step_log(log).await
        }

        async fn finish_step_log(
            &self,
            _log_id: &Uuid,
            _status: StepLogStatus,
            _output: Option<&Value>,
            _error: Option<&str>,
        ) -> Result<(), RepositoryError> {
            Err(RepositoryError::Connection)
        }

        async fn list_step_logs(
            &self,
            execution_id: &Uuid,
        ) -> Result<Vec<ExecutionStepLog>, RepositoryError> {
            self.0.list_step_logs(execution_id).await
        }
    }

    struct Harness {
        engine: Arc<WorkflowEngine<InMemoryWorkflowRepository>>,
        contacts: Arc<InMemoryContactStore>,
        email: Arc<RecordingEmailDispatcher>,
        spawned: UnboundedReceiver<Uuid>,
    }

    fn harness() -> Harness {
        harness_with(Arc::new(UnreachableWebhook))
    }

    fn harness_with(webhooks: Arc<dyn WebhookClient>) -> Harness {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let contacts = Arc::new(InMemoryContactStore::new());
        let email = Arc::new(RecordingEmailDispatcher::new());
        let (spawner, spawned) = QueueSpawner::new(Arc::clone(&repo));
        let collaborators = Collaborators {
            contacts: contacts.clone(),
            activity: Arc::new(InMemoryActivityLog::new()),
            webhooks,
            email: email.clone(),
            spawner: Arc::new(spawner),
        };
        Harness {
            engine: Arc::new(WorkflowEngine::new(
                repo,
                collaborators,
                WebhookSettings::default(),
            )),
            contacts,
            email,
            spawned,
        }
    }

    impl Harness {
        async fn import(&self, yaml: &str) -> WorkflowDefinition {
            let def = parse_workflow_yaml(yaml).expect("valid yaml");
            self.engine.import_definition(def).await.unwrap()
        }

        fn contact(&self, tags: &[&str]) -> Contact {
            let mut contact = Contact::new("grace@example.com");
            contact.first_name = Some("Grace".to_string());
            contact.tags = tags.iter().map(|t| t.to_string()).collect();
            self.contacts.insert(contact)
        }
    }

    const ONBOARDING: &str = r#"
name: onboarding
steps:
  - id: tag
    type: ADD_TAG
    config: { tag: customer }
    nextStepId: mail
  - id: mail
    type: SEND_EMAIL
    sortOrder: 1
    config: { subject: "Hi {{ contact.firstName }}", content: "Welcome aboard" }
    nextStepId: done
  - id: done
    type: END
    sortOrder: 2
"#;

    #[tokio::test]
    async fn test_non_suspending_workflow_completes() {
        let h = harness();
        let def = h.import(ONBOARDING).await;
        let contact = h.contact(&[]);

        let exec = h
            .engine
            .trigger(def.id, Some(contact.id), DataBag::new())
            .await
            .unwrap();

        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.current_step_id.is_none());
        assert!(exec.completed_at.is_some());

        let logs = h.engine.step_logs(exec.id).await.unwrap();
        let visited: Vec<&str> = logs.iter().map(|l| l.step_id.as_str()).collect();
        assert_eq!(visited, vec!["tag", "mail", "done"]);
        assert!(logs.iter().all(|l| l.status == StepLogStatus::Completed));

        let sent = h.email.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Hi Grace");
        assert_eq!(
            h.contacts.snapshot(&contact.id).unwrap().tags,
            vec!["customer"]
        );
    }

    #[tokio::test]
    async fn test_delay_suspends_with_resume_at() {
        let h = harness();
        let def = h
            .import(
                r#"
name: drip
steps:
  - id: wait
    type: DELAY
    config: { delayValue: 2, delayUnit: hours }
    nextStepId: done
  - id: done
    type: END
    sortOrder: 1
"#,
            )
            .await;

        let before = Utc::now();
        let exec = h.engine.trigger(def.id, None, DataBag::new()).await.unwrap();
        let after = Utc::now();

        assert_eq!(exec.status, ExecutionStatus::Waiting);
        assert_eq!(exec.current_step_id.as_deref(), Some("wait"));
        let resume_at = exec.resume_at.unwrap();
        assert!(resume_at >= before + TimeDelta::hours(2));
        assert!(resume_at <= after + TimeDelta::hours(2));

        let logs = h.engine.step_logs(exec.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, StepLogStatus::Waiting);
    }

    #[tokio::test]
    async fn test_resume_never_early_then_completes() {
        let h = harness();
        let def = h
            .import(
                r#"
name: drip
steps:
  - id: wait
    type: DELAY
    config: { delayValue: 10, delayUnit: minutes }
    nextStepId: bump
  - id: bump
    type: ADD_TAG
    sortOrder: 1
    config: { tag: nudged }
"#,
            )
            .await;
        let contact = h.contact(&[]);
        let exec = h
            .engine
            .trigger(def.id, Some(contact.id), DataBag::new())
            .await
            .unwrap();
        let resume_at = exec.resume_at.unwrap();

        let early = h
            .engine
            .resume_execution(exec.id, resume_at - TimeDelta::seconds(1))
            .await
            .unwrap_err();
        assert!(matches!(early, EngineError::NotDue { .. }));

        let resumed = h
            .engine
            .resume_execution(exec.id, resume_at)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Completed);
        assert!(resumed.resume_at.is_none());
        assert_eq!(
            h.contacts.snapshot(&contact.id).unwrap().tags,
            vec!["nudged"]
        );

        let again = h
            .engine
            .resume_execution(exec.id, resume_at)
            .await
            .unwrap_err();
        assert!(matches!(again, EngineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_resume_of_trailing_delay_completes_without_dispatch() {
        let h = harness();
        let def = h
            .import(
                r#"
name: cooldown
steps:
  - id: wait
    type: DELAY
    config: { delayValue: 1, delayUnit: minutes }
"#,
            )
            .await;
        let exec = h.engine.trigger(def.id, None, DataBag::new()).await.unwrap();

        let resumed = h
            .engine
            .resume_execution(exec.id, exec.resume_at.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Completed);
        assert_eq!(h.engine.step_logs(exec.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_fails_execution() {
        let h = harness();
        let def = h
            .import(
                r#"
name: notify
steps:
  - id: hook
    type: WEBHOOK
    config: { url: "http://127.0.0.1:9/unreachable" }
    nextStepId: done
  - id: done
    type: END
    sortOrder: 1
"#,
            )
            .await;

        let exec = h.engine.trigger(def.id, None, DataBag::new()).await.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.current_step_id.as_deref(), Some("hook"));
        let error = exec.error.unwrap();
        assert!(error.starts_with("external call failed"), "{error}");

        let logs = h.engine.step_logs(exec.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, StepLogStatus::Failed);
    }

    #[tokio::test]
    async fn test_tag_then_condition_takes_false_branch() {
        let h = harness();
        let def = h
            .import(
                r#"
name: qualify
steps:
  - id: lead
    type: ADD_TAG
    config: { tag: lead }
    nextStepId: vip
  - id: vip
    type: CONDITION
    sortOrder: 1
    config:
      conditions:
        - { field: contact.tags, operator: contains, value: vip }
    conditions:
      trueStepId: priority
      falseStepId: done
  - id: priority
    type: ADD_TAG
    sortOrder: 2
    config: { tag: priority }
    nextStepId: done
  - id: done
    type: END
    sortOrder: 3
"#,
            )
            .await;
        let contact = h.contact(&[]);

        let exec = h
            .engine
            .trigger(def.id, Some(contact.id), DataBag::new())
            .await
            .unwrap();

        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(h.contacts.snapshot(&contact.id).unwrap().tags, vec!["lead"]);
        assert_eq!(exec.data["conditions"]["vip"], json!(false));
    }

    #[tokio::test]
    async fn test_condition_sees_data_written_by_earlier_steps() {
        let h = harness();
        let def = h
            .import(
                r#"
name: score
steps:
  - id: check
    type: CONDITION
    config:
      conditions:
        - { field: data.score, operator: greater_than, value: 50 }
    conditions:
      trueStepId: hot
      falseStepId: done
  - id: hot
    type: ADD_TAG
    sortOrder: 1
    config: { tag: hot }
  - id: done
    type: END
    sortOrder: 2
"#,
            )
            .await;
        let contact = h.contact(&[]);
        let mut data = DataBag::new();
        data.insert("score".to_string(), json!(80));

        let exec = h
            .engine
            .trigger(def.id, Some(contact.id), data)
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(h.contacts.snapshot(&contact.id).unwrap().tags, vec!["hot"]);
    }

    #[tokio::test]
    async fn test_start_workflow_spawns_independent_child() {
        let mut h = harness();
        let child_def = h
            .import(
                r#"
name: child
steps:
  - id: mark
    type: ADD_TAG
    config: { tag: from-child }
"#,
            )
            .await;
        let parent_yaml = format!(
            r#"
name: parent
steps:
  - id: spawn
    type: START_WORKFLOW
    config: {{ workflowId: "{}" }}
    nextStepId: done
  - id: done
    type: END
    sortOrder: 1
"#,
            child_def.id
        );
        let parent_def = h.import(&parent_yaml).await;
        let contact = h.contact(&[]);

        let parent = h
            .engine
            .trigger(parent_def.id, Some(contact.id), DataBag::new())
            .await
            .unwrap();
        assert_eq!(parent.status, ExecutionStatus::Completed);

        let child_id = h.spawned.try_recv().expect("child queued");
        assert_eq!(parent.data["spawnedExecutions"], json!([child_id]));

        let queued = h.engine.get_execution(child_id).await.unwrap();
        assert_eq!(queued.workflow_id, child_def.id);
        assert_eq!(queued.contact_id, Some(contact.id));
        assert_eq!(queued.status, ExecutionStatus::Running);
        assert!(h.contacts.snapshot(&contact.id).unwrap().tags.is_empty());

        let child = h.engine.run_execution(child_id).await.unwrap();
        assert_eq!(child.status, ExecutionStatus::Completed);
        assert_eq!(
            h.contacts.snapshot(&contact.id).unwrap().tags,
            vec!["from-child"]
        );
    }

    #[tokio::test]
    async fn test_start_workflow_with_inactive_target_fails_parent() {
        let mut h = harness();
        let child_def = h
            .import("name: child\nsteps:\n  - id: done\n    type: END\n")
            .await;
        h.engine.set_active(&child_def.id, false).await.unwrap();
        let parent_def = h
            .import(&format!(
                "name: parent\nsteps:\n  - id: spawn\n    type: START_WORKFLOW\n    config: {{ workflowId: \"{}\" }}\n",
                child_def.id
            ))
            .await;

        let parent = h
            .engine
            .trigger(parent_def.id, None, DataBag::new())
            .await
            .unwrap();
        assert_eq!(parent.status, ExecutionStatus::Failed);
        assert!(parent.error.unwrap().starts_with("validation error"));
        assert!(h.spawned.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_waiting_execution_blocks_resume() {
        let h = harness();
        let def = h
            .import(
                r#"
name: drip
steps:
  - id: wait
    type: DELAY
    config: { delayValue: 1, delayUnit: days }
    nextStepId: done
  - id: done
    type: END
    sortOrder: 1
"#,
            )
            .await;
        let exec = h.engine.trigger(def.id, None, DataBag::new()).await.unwrap();

        let canceled = h.engine.cancel_execution(exec.id).await.unwrap();
        assert_eq!(canceled.status, ExecutionStatus::Canceled);
        assert!(canceled.resume_at.is_none());

        let far_future = Utc::now() + TimeDelta::days(2);
        let err = h
            .engine
            .resume_execution(exec.id, far_future)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidState {
                status: ExecutionStatus::Canceled,
                ..
            }
        ));

        let err = h.engine.cancel_execution(exec.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_canceled_before_run_dispatches_nothing() {
        let h = harness();
        let def = h.import(ONBOARDING).await;
        let contact = h.contact(&[]);
        let exec = h
            .engine
            .start_execution(def.id, Some(contact.id), DataBag::new())
            .await
            .unwrap();
        h.engine.cancel_execution(exec.id).await.unwrap();

        let err = h.engine.run_execution(exec.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
        assert!(h.engine.step_logs(exec.id).await.unwrap().is_empty());
        assert!(h.email.sent().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_missing_inactive_and_unknown_workflows() {
        let h = harness();
        let err = h
            .engine
            .start_execution(Uuid::now_v7(), None, DataBag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WorkflowNotFound(_)));

        let def = h.import(ONBOARDING).await;
        h.engine.set_active(&def.id, false).await.unwrap();
        let err = h
            .engine
            .start_execution(def.id, None, DataBag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WorkflowInactive(_)));

        let err = h.engine.set_active(&Uuid::now_v7(), true).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkflowNotFound(_)));
    }

    #[test]
    fn test_prepare_rejects_empty_workflow() {
        let def = WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "empty".to_string(),
            description: None,
            version: 1,
            active: true,
            steps: vec![],
        };
        let err = prepare_execution(def.id, Some(&def), None, DataBag::new()).unwrap_err();
        assert!(matches!(err, EngineError::WorkflowEmpty(_)));
    }

    #[tokio::test]
    async fn test_missing_contact_fails_contact_step() {
        let h = harness();
        let def = h.import(ONBOARDING).await;

        let exec = h
            .engine
            .trigger(def.id, Some(Uuid::now_v7()), DataBag::new())
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.error.unwrap().starts_with("data error"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_and_remove_serialize() {
        let h = harness();
        let add = h
            .import("name: add\nsteps:\n  - id: add\n    type: ADD_TAG\n    config: { tag: a }\n")
            .await;
        let remove = h
            .import(
                "name: remove\nsteps:\n  - id: remove\n    type: REMOVE_TAG\n    config: { tag: a }\n",
            )
            .await;

        let (add_id, remove_id) = (add.id, remove.id);

        for _ in 0..50 {
            let contact_id = h.contact(&["x"]).id;

            let adder = {
                let engine = Arc::clone(&h.engine);
                tokio::spawn(async move {
                    engine.trigger(add_id, Some(contact_id), DataBag::new()).await
                })
            };
            let remover = {
                let engine = Arc::clone(&h.engine);
                tokio::spawn(async move {
                    engine
                        .trigger(remove_id, Some(contact_id), DataBag::new())
                        .await
                })
            };

            let added = adder.await.unwrap().unwrap();
            let removed = remover.await.unwrap().unwrap();
            assert_eq!(added.status, ExecutionStatus::Completed);
            assert_eq!(removed.status, ExecutionStatus::Completed);

            let tags = h.contacts.snapshot(&contact_id).unwrap().tags;
            assert!(
                tags == vec!["x".to_string()] || tags == vec!["x".to_string(), "a".to_string()],
                "unexpected tag set {tags:?}"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_drives_dispatch_each_step_once() {
        let webhook = Arc::new(SlowWebhook::default());
        let h = harness_with(webhook.clone());
        let def = h
            .import(
                r#"
name: notify-then-mail
steps:
  - id: hook
    type: WEBHOOK
    config: { url: "https://hooks.example.com/lead" }
    nextStepId: mail
  - id: mail
    type: SEND_EMAIL
    sortOrder: 1
    config: { subject: "Thanks", content: "We got your details" }
    nextStepId: done
  - id: done
    type: END
    sortOrder: 2
"#,
            )
            .await;
        let contact = h.contact(&[]);
        let exec = h
            .engine
            .start_execution(def.id, Some(contact.id), DataBag::new())
            .await
            .unwrap();

        let drivers: Vec<_> = (0..2)
            .map(|_| {
                let engine = Arc::clone(&h.engine);
                let id = exec.id;
                tokio::spawn(async move { engine.run_execution(id).await })
            })
            .collect();

        let mut completed = 0;
        for driver in drivers {
            match driver.await.unwrap() {
                Ok(done) => {
                    assert_eq!(done.status, ExecutionStatus::Completed);
                    completed += 1;
                }
                Err(EngineError::AlreadyClaimed(_)) | Err(EngineError::InvalidState { .. }) => {}
                Err(e) => panic!("unexpected drive error: {e}"),
            }
        }

        assert_eq!(completed, 1);
        assert_eq!(webhook.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.email.sent().len(), 1);
        let logs = h.engine.step_logs(exec.id).await.unwrap();
        let visited: Vec<&str> = logs.iter().map(|l| l.step_id.as_str()).collect();
        assert_eq!(visited, vec!["hook", "mail", "done"]);

        let stored = h.engine.get_execution(exec.id).await.unwrap();
        assert!(stored.driver_id.is_none());
        assert!(stored.claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_step_log_outage_does_not_replay_steps() {
        let repo = Arc::new(StepLogOutage(InMemoryWorkflowRepository::new()));
        let contacts = Arc::new(InMemoryContactStore::new());
        let email = Arc::new(RecordingEmailDispatcher::new());
        let (spawner, _spawned) = QueueSpawner::new(Arc::clone(&repo));
        let engine = WorkflowEngine::new(
            repo,
            Collaborators {
                contacts: contacts.clone(),
                activity: Arc::new(InMemoryActivityLog::new()),
                webhooks: Arc::new(UnreachableWebhook),
                email: email.clone(),
                spawner: Arc::new(spawner),
            },
            WebhookSettings::default(),
        );
        let def = engine
            .import_definition(parse_workflow_yaml(ONBOARDING).unwrap())
            .await
            .unwrap();
        let contact = contacts.insert(Contact::new("grace@example.com"));

        let exec = engine
            .trigger(def.id, Some(contact.id), DataBag::new())
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(email.sent().len(), 1);
        assert_eq!(contacts.snapshot(&contact.id).unwrap().tags, vec!["customer"]);

        // Every step ran; the audit rows simply never got their finish.
        let logs = engine.step_logs(exec.id).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert!(logs.iter().all(|l| l.status == StepLogStatus::Running));

        let err = engine.run_execution(exec.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
        assert_eq!(email.sent().len(), 1);
    }
}
