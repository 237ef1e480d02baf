//! Execution ledger: durable execution state and step-level audit records.
//!
//! Wraps `WorkflowRepository` with a higher-level API. Every status change is
//! expressed as a [`Transition`] applied to the in-memory execution and then
//! persisted with a conditional write naming the statuses the writer expects.
//! A rejected write means another actor (a cancel, a second scheduler) got
//! there first; the caller must stop driving that execution.
//!
//! A RUNNING execution is advanced by exactly one driver at a time. The
//! driver takes a lease ([`ExecutionLedger::claim`] or a
//! [`Transition::Resume`]) and every later write additionally requires the
//! stored `driver_id` to still be its token. Advancing renews the lease;
//! waiting or stopping releases it.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use funnelflow_types::error::RepositoryError;
use funnelflow_types::workflow::{
    ExecutionStatus, ExecutionStepLog, StepDefinition, StepLogStatus, WorkflowExecution,
};
use serde_json::Value;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

/// A lease not renewed for this long is considered abandoned by its driver.
/// Each renewal happens per step, and a step is bounded by the webhook cap.
pub const DRIVE_LEASE_SECS: i64 = 300;

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// A forward move in the execution state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// RUNNING -> RUNNING at another step.
    Advance { next_step_id: String },
    /// RUNNING -> WAITING; the current step stays on the DELAY.
    Wait { resume_at: DateTime<Utc> },
    /// WAITING -> RUNNING at the DELAY's successor, leased to `driver_id`.
    Resume { next_step_id: String, driver_id: Uuid },
    /// RUNNING/WAITING -> COMPLETED.
    Complete,
    /// RUNNING/WAITING -> FAILED.
    Fail { error: String },
}

impl Transition {
    /// Apply to an in-memory execution, keeping the ledger invariants:
    /// a current step exists iff the status is non-terminal, `resume_at`
    /// is set iff the status is WAITING, and only RUNNING holds a lease.
    pub fn apply(&self, exec: &mut WorkflowExecution, now: DateTime<Utc>) {
        exec.updated_at = now;
        match self {
            Transition::Advance { next_step_id } => {
                exec.status = ExecutionStatus::Running;
                exec.current_step_id = Some(next_step_id.clone());
                exec.resume_at = None;
                exec.claimed_at = exec.driver_id.map(|_| now);
            }
            Transition::Resume {
                next_step_id,
                driver_id,
            } => {
                exec.status = ExecutionStatus::Running;
                exec.current_step_id = Some(next_step_id.clone());
                exec.resume_at = None;
                exec.driver_id = Some(*driver_id);
                exec.claimed_at = Some(now);
            }
            Transition::Wait { resume_at } => {
                exec.status = ExecutionStatus::Waiting;
                exec.resume_at = Some(*resume_at);
                exec.driver_id = None;
                exec.claimed_at = None;
            }
            Transition::Complete => {
                exec.status = ExecutionStatus::Completed;
                exec.current_step_id = None;
                exec.resume_at = None;
                exec.completed_at = Some(now);
                exec.driver_id = None;
                exec.claimed_at = None;
            }
            Transition::Fail { error } => {
                exec.status = ExecutionStatus::Failed;
                exec.resume_at = None;
                exec.error = Some(error.clone());
                exec.completed_at = Some(now);
                exec.driver_id = None;
                exec.claimed_at = None;
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Transition::Advance { .. } => "advance",
            Transition::Wait { .. } => "wait",
            Transition::Resume { .. } => "resume",
            Transition::Complete => "complete",
            Transition::Fail { .. } => "fail",
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionLedger
// ---------------------------------------------------------------------------

/// Manages durable execution state for workflow executions.
///
/// Generic over `R: WorkflowRepository` so it works with any storage backend
/// (SQLite, in-memory). Cheap to clone.
pub struct ExecutionLedger<R: WorkflowRepository> {
    repo: Arc<R>,
}

impl<R: WorkflowRepository> Clone for ExecutionLedger<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
        }
    }
}

impl<R: WorkflowRepository> ExecutionLedger<R> {
    /// Create a new ledger backed by the given repository.
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    pub async fn create(&self, exec: &WorkflowExecution) -> Result<(), RepositoryError> {
        self.repo.create_execution(exec).await?;
        tracing::debug!(
            execution_id = %exec.id,
            workflow_id = %exec.workflow_id,
            step_id = exec.current_step_id.as_deref().unwrap_or(""),
            "recorded new execution"
        );
        Ok(())
    }

    pub async fn get(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        self.repo.get_execution(id).await
    }

    /// Take the drive lease on a RUNNING execution. Returns the stored
    /// execution carrying the new lease, or `None` when the execution is not
    /// RUNNING or another driver holds a live lease.
    pub async fn claim(
        &self,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let driver_id = Uuid::now_v7();
        let stale_before = now - TimeDelta::seconds(DRIVE_LEASE_SECS);
        if !self
            .repo
            .claim_execution(id, &driver_id, now, stale_before)
            .await?
        {
            return Ok(None);
        }

        let claimed = self
            .repo
            .get_execution(id)
            .await?
            .filter(|exec| exec.driver_id == Some(driver_id));
        if claimed.is_some() {
            tracing::debug!(execution_id = %id, driver_id = %driver_id, "drive lease taken");
        }
        Ok(claimed)
    }

    /// Apply `transition` to `exec` and persist it if the stored status is in
    /// `expected` and the stored lease is the one `exec` held before the
    /// transition. On rejection `exec` is left modified in memory only and
    /// `Ok(false)` is returned.
    pub async fn transition(
        &self,
        exec: &mut WorkflowExecution,
        transition: Transition,
        expected: &[ExecutionStatus],
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let held_by = exec.driver_id;
        transition.apply(exec, now);
        let written = self
            .repo
            .update_execution(exec, expected, held_by.as_ref())
            .await?;

        if written {
            tracing::debug!(
                execution_id = %exec.id,
                transition = transition.label(),
                status = exec.status.as_str(),
                step_id = exec.current_step_id.as_deref().unwrap_or(""),
                "execution transition recorded"
            );
        } else {
            tracing::info!(
                execution_id = %exec.id,
                transition = transition.label(),
                "execution transition rejected, state changed concurrently"
            );
        }
        Ok(written)
    }

    /// RUNNING/WAITING -> CANCELED. Returns `false` if nothing was canceled.
    pub async fn cancel(&self, id: &Uuid, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let canceled = self.repo.cancel_execution(id, now).await?;
        if canceled {
            tracing::info!(execution_id = %id, "execution canceled");
        }
        Ok(canceled)
    }

    // -----------------------------------------------------------------------
    // Step logs
    // -----------------------------------------------------------------------

    /// Record a step as starting. Returns the log ID.
    pub async fn record_step_start(
        &self,
        execution_id: Uuid,
        step: &StepDefinition,
    ) -> Result<Uuid, RepositoryError> {
        let log_id = Uuid::now_v7();
        let log = ExecutionStepLog {
            id: log_id,
            execution_id,
            step_id: step.id.clone(),
            step_type: step.type_name().to_string(),
            status: StepLogStatus::Running,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.repo.create_step_log(&log).await?;

        tracing::debug!(
            execution_id = %execution_id,
            step_id = step.id.as_str(),
            log_id = %log_id,
            "recorded step start"
        );
        Ok(log_id)
    }

    /// Record a step's final status.
    pub async fn record_step_finish(
        &self,
        log_id: Uuid,
        status: StepLogStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        self.repo
            .finish_step_log(&log_id, status, output, error)
            .await?;
        tracing::debug!(log_id = %log_id, status = status.as_str(), "recorded step finish");
        Ok(())
    }

    pub async fn step_logs(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<ExecutionStepLog>, RepositoryError> {
        self.repo.list_step_logs(execution_id).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
