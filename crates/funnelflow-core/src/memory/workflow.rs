use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use funnelflow_types::error::RepositoryError;
use funnelflow_types::workflow::{
    ExecutionStatus, ExecutionStepLog, StepLogStatus, WorkflowDefinition, WorkflowExecution,
};
use serde_json::Value;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

/// `WorkflowRepository` held entirely in memory.
///
/// Conditional execution writes check and replace the stored row while
/// holding its `DashMap` entry, matching the
/// `UPDATE .. WHERE status IN (..) AND driver_id IS ?` semantics of the
/// SQLite ledger.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    definitions: DashMap<Uuid, WorkflowDefinition>,
    executions: DashMap<Uuid, WorkflowExecution>,
    step_logs: Mutex<Vec<ExecutionStepLog>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_logs<T>(
        &self,
        f: impl FnOnce(&mut Vec<ExecutionStepLog>) -> T,
    ) -> Result<T, RepositoryError> {
        let mut logs = self
            .step_logs
            .lock()
            .map_err(|_| RepositoryError::Query("step log store poisoned".to_string()))?;
        Ok(f(&mut logs))
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.definitions.insert(def.id, def.clone());
        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.get(id).map(|d| d.clone()))
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<WorkflowDefinition> =
            self.definitions.iter().map(|d| d.value().clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn set_active(&self, id: &Uuid, active: bool) -> Result<bool, RepositoryError> {
        match self.definitions.get_mut(id) {
            Some(mut def) => {
                def.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_execution(&self, exec: &WorkflowExecution) -> Result<(), RepositoryError> {
        if self.executions.contains_key(&exec.id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                exec.id
            )));
        }
        self.executions.insert(exec.id, exec.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.executions.get(id).map(|e| e.clone()))
    }

    async fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let mut execs: Vec<WorkflowExecution> = self
            .executions
            .iter()
            .filter(|e| e.workflow_id == *workflow_id)
            .map(|e| e.value().clone())
            .collect();
        execs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        execs.truncate(limit as usize);
        Ok(execs)
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let mut due: Vec<WorkflowExecution> = self
            .executions
            .iter()
            .filter(|e| {
                e.status == ExecutionStatus::Waiting && e.resume_at.is_some_and(|at| at <= now)
            })
            .map(|e| e.value().clone())
            .collect();
        due.sort_by_key(|e| e.resume_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn update_execution(
        &self,
        exec: &WorkflowExecution,
        expected: &[ExecutionStatus],
        held_by: Option<&Uuid>,
    ) -> Result<bool, RepositoryError> {
        let Some(mut stored) = self.executions.get_mut(&exec.id) else {
            return Ok(false);
        };
        if !expected.contains(&stored.status) || stored.driver_id.as_ref() != held_by {
            return Ok(false);
        }
        let created_at = stored.created_at;
        *stored = WorkflowExecution {
            created_at,
            ..exec.clone()
        };
        Ok(true)
    }

    async fn claim_execution(
        &self,
        id: &Uuid,
        driver_id: &Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let Some(mut stored) = self.executions.get_mut(id) else {
            return Ok(false);
        };
        if stored.status != ExecutionStatus::Running {
            return Ok(false);
        }
        let free = stored.driver_id.is_none()
            || stored.claimed_at.is_none_or(|at| at <= stale_before);
        if !free {
            return Ok(false);
        }
        stored.driver_id = Some(*driver_id);
        stored.claimed_at = Some(now);
        stored.updated_at = now;
        Ok(true)
    }

    async fn cancel_execution(&self, id: &Uuid, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let Some(mut stored) = self.executions.get_mut(id) else {
            return Ok(false);
        };
        if stored.status.is_terminal() {
            return Ok(false);
        }
        stored.status = ExecutionStatus::Canceled;
        stored.resume_at = None;
        stored.driver_id = None;
        stored.claimed_at = None;
        stored.updated_at = now;
        stored.completed_at = Some(now);
        Ok(true)
    }

    async fn create_step_log(&self, log: &ExecutionStepLog) -> Result<(), RepositoryError> {
        self.with_logs(|logs| logs.push(log.clone()))
    }

    async fn finish_step_log(
        &self,
        log_id: &Uuid,
        status: StepLogStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        self.with_logs(|logs| {
            let log = logs
                .iter_mut()
                .find(|l| l.id == *log_id)
                .ok_or(RepositoryError::NotFound)?;
            log.status = status;
            log.output = output.cloned();
            log.error = error.map(String::from);
            log.completed_at = Some(Utc::now());
            Ok(())
        })?
    }

    async fn list_step_logs(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<ExecutionStepLog>, RepositoryError> {
        self.with_logs(|logs| {
            logs.iter()
                .filter(|l| l.execution_id == *execution_id)
                .cloned()
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn waiting(resume_at: DateTime<Utc>) -> WorkflowExecution {
        let mut exec =
            WorkflowExecution::new(Uuid::now_v7(), None, "wait", serde_json::Map::new());
        exec.status = ExecutionStatus::Waiting;
        exec.resume_at = Some(resume_at);
        exec
    }

    #[tokio::test]
    async fn test_conditional_update_rejects_unexpected_status() {
        let repo = InMemoryWorkflowRepository::new();
        let exec = waiting(Utc::now());
        repo.create_execution(&exec).await.unwrap();

        assert!(repo.cancel_execution(&exec.id, Utc::now()).await.unwrap());

        let mut resumed = exec.clone();
        resumed.status = ExecutionStatus::Running;
        resumed.resume_at = None;
        assert!(
            !repo
                .update_execution(&resumed, &[ExecutionStatus::Waiting], None)
                .await
                .unwrap()
        );

        let stored = repo.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Canceled);
        assert!(!repo.cancel_execution(&exec.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_stale() {
        let repo = InMemoryWorkflowRepository::new();
        let exec =
            WorkflowExecution::new(Uuid::now_v7(), None, "first", serde_json::Map::new());
        repo.create_execution(&exec).await.unwrap();
        let now = Utc::now();
        let stale_before = now - TimeDelta::minutes(5);
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());

        assert!(repo.claim_execution(&exec.id, &a, now, stale_before).await.unwrap());
        assert!(!repo.claim_execution(&exec.id, &b, now, stale_before).await.unwrap());

        // Only the holder may write.
        assert!(
            !repo
                .update_execution(&exec, &[ExecutionStatus::Running], Some(&b))
                .await
                .unwrap()
        );
        assert!(
            !repo
                .update_execution(&exec, &[ExecutionStatus::Running], None)
                .await
                .unwrap()
        );

        // A lease older than the cutoff can be taken over.
        let later = now + TimeDelta::minutes(10);
        let cutoff = later - TimeDelta::minutes(5);
        assert!(repo.claim_execution(&exec.id, &b, later, cutoff).await.unwrap());
        let stored = repo.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(stored.driver_id, Some(b));
        assert_eq!(stored.claimed_at, Some(later));
    }

    #[tokio::test]
    async fn test_list_due_orders_and_limits() {
        let repo = InMemoryWorkflowRepository::new();
        let now = Utc::now();
        let late = waiting(now - TimeDelta::minutes(1));
        let early = waiting(now - TimeDelta::minutes(5));
        let future = waiting(now + TimeDelta::minutes(5));
        for e in [&late, &early, &future] {
            repo.create_execution(e).await.unwrap();
        }

        let due = repo.list_due(now, 10).await.unwrap();
        assert_eq!(
            due.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![early.id, late.id]
        );
        assert_eq!(repo.list_due(now, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_finish_unknown_step_log_is_not_found() {
        let repo = InMemoryWorkflowRepository::new();
        let err = repo
            .finish_step_log(&Uuid::now_v7(), StepLogStatus::Completed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }
}
