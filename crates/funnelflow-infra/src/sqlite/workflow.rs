//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `funnelflow-core` using sqlx with split
//! read/write pools. Definitions are stored as JSON blobs with the `active`
//! flag kept in its own column. Executions carry the ledger state; every
//! status change is an `UPDATE .. WHERE status IN (..)` so competing writers
//! (a cancel, a second scheduler) are detected by `rows_affected`.

use chrono::{DateTime, Utc};
use funnelflow_core::repository::workflow::WorkflowRepository;
use funnelflow_types::error::RepositoryError;
use funnelflow_types::workflow::{
    DataBag, ExecutionStatus, ExecutionStepLog, StepLogStatus, WorkflowDefinition,
    WorkflowExecution,
};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, parse_uuid, query_error, to_json};

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowDefRow {
    active: bool,
    definition: String,
}

impl WorkflowDefRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            active: row.try_get("active")?,
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        let mut def: WorkflowDefinition = parse_json(&self.definition, "workflow definition")?;
        def.active = self.active;
        Ok(def)
    }
}

struct ExecutionRow {
    id: String,
    workflow_id: String,
    contact_id: Option<String>,
    status: String,
    current_step_id: Option<String>,
    data: String,
    resume_at: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    driver_id: Option<String>,
    claimed_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            contact_id: row.try_get("contact_id")?,
            status: row.try_get("status")?,
            current_step_id: row.try_get("current_step_id")?,
            data: row.try_get("data")?,
            resume_at: row.try_get("resume_at")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
            driver_id: row.try_get("driver_id")?,
            claimed_at: row.try_get("claimed_at")?,
        })
    }

    fn into_execution(self) -> Result<WorkflowExecution, RepositoryError> {
        let status: ExecutionStatus = self
            .status
            .parse()
            .map_err(|_| RepositoryError::Query(format!("invalid execution status: {}", self.status)))?;
        let data: DataBag = parse_json(&self.data, "execution data")?;

        Ok(WorkflowExecution {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            contact_id: self.contact_id.as_deref().map(parse_uuid).transpose()?,
            status,
            current_step_id: self.current_step_id,
            data,
            resume_at: self.resume_at.as_deref().map(parse_datetime).transpose()?,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            driver_id: self.driver_id.as_deref().map(parse_uuid).transpose()?,
            claimed_at: self.claimed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct StepLogRow {
    id: String,
    execution_id: String,
    step_id: String,
    step_type: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl StepLogRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            step_id: row.try_get("step_id")?,
            step_type: row.try_get("step_type")?,
            status: row.try_get("status")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_step_log(self) -> Result<ExecutionStepLog, RepositoryError> {
        let status: StepLogStatus = self
            .status
            .parse()
            .map_err(|_| RepositoryError::Query(format!("invalid step status: {}", self.status)))?;
        let output: Option<Value> = self
            .output
            .as_deref()
            .map(|s| parse_json(s, "step output"))
            .transpose()?;

        Ok(ExecutionStepLog {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            step_id: self.step_id,
            step_type: self.step_type,
            status,
            output,
            error: self.error,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

fn executions_from_rows(rows: &[SqliteRow]) -> Result<Vec<WorkflowExecution>, RepositoryError> {
    rows.iter()
        .map(|row| {
            ExecutionRow::from_row(row)
                .map_err(query_error)?
                .into_execution()
        })
        .collect()
}

/// `?, ?, ..` with `n` placeholders.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = to_json(def)?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflows (id, name, active, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 active = excluded.active,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(def.active)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT active, definition FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = WorkflowDefRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT active, definition FROM workflows ORDER BY name ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = WorkflowDefRow::from_row(row).map_err(query_error)?;
            defs.push(r.into_definition()?);
        }
        Ok(defs)
    }

    async fn set_active(&self, id: &Uuid, active: bool) -> Result<bool, RepositoryError> {
        let result = sqlx::query("UPDATE workflows SET active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_execution(&self, exec: &WorkflowExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_executions
               (id, workflow_id, contact_id, status, current_step_id, data,
                resume_at, error, created_at, updated_at, completed_at,
                driver_id, claimed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(exec.id.to_string())
        .bind(exec.workflow_id.to_string())
        .bind(exec.contact_id.map(|id| id.to_string()))
        .bind(exec.status.as_str())
        .bind(&exec.current_step_id)
        .bind(to_json(&exec.data)?)
        .bind(exec.resume_at.as_ref().map(format_datetime))
        .bind(&exec.error)
        .bind(format_datetime(&exec.created_at))
        .bind(format_datetime(&exec.updated_at))
        .bind(exec.completed_at.as_ref().map(format_datetime))
        .bind(exec.driver_id.map(|id| id.to_string()))
        .bind(exec.claimed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("execution {} already exists", exec.id))
            }
            other => query_error(other),
        })?;

        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_executions WHERE workflow_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(workflow_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        executions_from_rows(&rows)
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_executions
               WHERE status = 'WAITING' AND resume_at IS NOT NULL AND resume_at <= ?
               ORDER BY resume_at ASC
               LIMIT ?"#,
        )
        .bind(format_datetime(&now))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        executions_from_rows(&rows)
    }

    async fn update_execution(
        &self,
        exec: &WorkflowExecution,
        expected: &[ExecutionStatus],
        held_by: Option<&Uuid>,
    ) -> Result<bool, RepositoryError> {
        if expected.is_empty() {
            return Ok(false);
        }

        // `IS` compares NULL as a value, so `None` requires an unclaimed row.
        let sql = format!(
            r#"UPDATE workflow_executions SET
                 status = ?, current_step_id = ?, data = ?, resume_at = ?,
                 error = ?, updated_at = ?, completed_at = ?,
                 driver_id = ?, claimed_at = ?
               WHERE id = ? AND driver_id IS ? AND status IN ({})"#,
            placeholders(expected.len())
        );

        let mut query = sqlx::query(&sql)
            .bind(exec.status.as_str())
            .bind(&exec.current_step_id)
            .bind(to_json(&exec.data)?)
            .bind(exec.resume_at.as_ref().map(format_datetime))
            .bind(&exec.error)
            .bind(format_datetime(&exec.updated_at))
            .bind(exec.completed_at.as_ref().map(format_datetime))
            .bind(exec.driver_id.map(|id| id.to_string()))
            .bind(exec.claimed_at.as_ref().map(format_datetime))
            .bind(exec.id.to_string())
            .bind(held_by.map(|id| id.to_string()));
        for status in expected {
            query = query.bind(status.as_str());
        }

        let result = query
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_execution(
        &self,
        id: &Uuid,
        driver_id: &Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let now = format_datetime(&now);
        let result = sqlx::query(
            r#"UPDATE workflow_executions
               SET driver_id = ?, claimed_at = ?, updated_at = ?
               WHERE id = ? AND status = 'RUNNING'
                 AND (driver_id IS NULL OR claimed_at IS NULL OR claimed_at <= ?)"#,
        )
        .bind(driver_id.to_string())
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .bind(format_datetime(&stale_before))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel_execution(&self, id: &Uuid, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let now = format_datetime(&now);
        let result = sqlx::query(
            r#"UPDATE workflow_executions
               SET status = 'CANCELED', resume_at = NULL, driver_id = NULL, claimed_at = NULL,
                   updated_at = ?, completed_at = ?
               WHERE id = ? AND status IN ('RUNNING', 'WAITING')"#,
        )
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_step_log(&self, log: &ExecutionStepLog) -> Result<(), RepositoryError> {
        let output = log.output.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO workflow_step_logs
               (id, execution_id, step_id, step_type, status, output, error, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(log.id.to_string())
        .bind(log.execution_id.to_string())
        .bind(&log.step_id)
        .bind(&log.step_type)
        .bind(log.status.as_str())
        .bind(&output)
        .bind(&log.error)
        .bind(format_datetime(&log.started_at))
        .bind(log.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn finish_step_log(
        &self,
        log_id: &Uuid,
        status: StepLogStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let output = output.map(to_json).transpose()?;

        let result = sqlx::query(
            "UPDATE workflow_step_logs SET status = ?, output = ?, error = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(&output)
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .bind(log_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_step_logs(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<ExecutionStepLog>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_step_logs WHERE execution_id = ? ORDER BY started_at ASC, id ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut logs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepLogRow::from_row(row).map_err(query_error)?;
            logs.push(r.into_step_log()?);
        }
        Ok(logs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
