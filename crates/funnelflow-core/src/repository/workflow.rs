//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, executions (the
//! execution ledger) and step logs. The infrastructure layer
//! (funnelflow-infra) implements this trait with SQLite persistence; an
//! in-memory implementation lives in [`crate::memory`].

use chrono::{DateTime, Utc};
use funnelflow_types::error::RepositoryError;
use funnelflow_types::workflow::{
    ExecutionStatus, ExecutionStepLog, StepLogStatus, WorkflowDefinition, WorkflowExecution,
};
use serde_json::Value;
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Definitions:** save/get/list and the active flag.
/// - **Executions:** create, read, and *conditional* writes. Every status
///   transition names the statuses it expects to find; a write against any
///   other stored status is rejected and reported as `Ok(false)`.
/// - **Step logs:** per-dispatch audit records.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by ID).
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow definition by its UUID.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List all workflow definitions, ordered by name.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Flip the active flag. Returns `true` if the workflow exists.
    fn set_active(
        &self,
        id: &Uuid,
        active: bool,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Insert a new execution record.
    fn create_execution(
        &self,
        exec: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution by its UUID.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// List executions of a workflow, newest first.
    fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    /// WAITING executions whose `resume_at <= now`, oldest wake time first.
    fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    /// Persist the mutable fields of `exec` (status, current step, data,
    /// resume time, error, timestamps, drive lease) only if the stored status
    /// is one of `expected` and the stored `driver_id` equals `held_by`
    /// (`None` meaning no driver). Returns `false` when the precondition did
    /// not hold.
    fn update_execution(
        &self,
        exec: &WorkflowExecution,
        expected: &[ExecutionStatus],
        held_by: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Take the drive lease on a RUNNING execution for `driver_id`. Succeeds
    /// when no driver holds it or the holder's `claimed_at` is at or before
    /// `stale_before`. Returns `false` otherwise.
    fn claim_execution(
        &self,
        id: &Uuid,
        driver_id: &Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Move a RUNNING/WAITING execution to CANCELED, clearing `resume_at`
    /// and any drive lease.
    /// Returns `false` if the execution was already terminal or missing.
    fn cancel_execution(
        &self,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step logs
    // -----------------------------------------------------------------------

    /// Create a new step log entry.
    fn create_step_log(
        &self,
        log: &ExecutionStepLog,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Finish a step log with its final status and output/error.
    fn finish_step_log(
        &self,
        log_id: &Uuid,
        status: StepLogStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All step logs for an execution, in dispatch order.
    fn list_step_logs(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionStepLog>, RepositoryError>> + Send;
}
