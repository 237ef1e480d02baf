//! START_WORKFLOW hand-off: the spawn queue and the worker that drains it.
//!
//! `QueueSpawner` validates the target workflow, records the child execution
//! in the ledger as RUNNING and pushes its ID onto an unbounded channel. The
//! `SpawnWorker` receives those IDs and drives each child on its own task, so
//! a parent step never recurses into the dispatcher.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

use super::collaborator::{SpawnError, SpawnRequest, WorkflowSpawner};
use super::executor::{EngineError, WorkflowEngine, prepare_execution};

// ---------------------------------------------------------------------------
// QueueSpawner
// ---------------------------------------------------------------------------

pub struct QueueSpawner<R: WorkflowRepository> {
    repo: Arc<R>,
    tx: mpsc::UnboundedSender<Uuid>,
}

impl<R: WorkflowRepository> QueueSpawner<R> {
    /// Create a spawner and the receiving end of its queue.
    pub fn new(repo: Arc<R>) -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { repo, tx }, rx)
    }

    async fn spawn_child(&self, request: SpawnRequest) -> Result<Uuid, SpawnError> {
        let def = self
            .repo
            .get_definition(&request.workflow_id)
            .await
            .map_err(|e| SpawnError::Internal(e.to_string()))?;

        let exec = prepare_execution(
            request.workflow_id,
            def.as_ref(),
            request.contact_id,
            request.data,
        )
        .map_err(|e| match e {
            EngineError::WorkflowNotFound(id) => SpawnError::NotFound(id),
            EngineError::WorkflowInactive(id) => SpawnError::Inactive(id),
            EngineError::WorkflowEmpty(id) => SpawnError::Empty(id),
            other => SpawnError::Internal(other.to_string()),
        })?;

        self.repo
            .create_execution(&exec)
            .await
            .map_err(|e| SpawnError::Internal(e.to_string()))?;

        tracing::debug!(
            execution_id = %exec.id,
            parent_execution_id = %request.parent_execution_id,
            workflow_id = %request.workflow_id,
            "queued child execution"
        );

        // The execution is already durable; a closed queue only means no
        // worker is listening in this process. It stays RUNNING for `ffw run`.
        if self.tx.send(exec.id).is_err() {
            tracing::warn!(
                execution_id = %exec.id,
                "spawn queue closed, child execution left RUNNING"
            );
        }
        Ok(exec.id)
    }
}

impl<R: WorkflowRepository> WorkflowSpawner for QueueSpawner<R> {
    fn spawn<'a>(
        &'a self,
        request: SpawnRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Uuid, SpawnError>> + Send + 'a>> {
        Box::pin(self.spawn_child(request))
    }
}

// ---------------------------------------------------------------------------
// SpawnWorker
// ---------------------------------------------------------------------------

/// Drives queued child executions until cancelled or the queue closes.
pub struct SpawnWorker<R: WorkflowRepository> {
    engine: Arc<WorkflowEngine<R>>,
    rx: mpsc::UnboundedReceiver<Uuid>,
}

impl<R: WorkflowRepository + 'static> SpawnWorker<R> {
    pub fn new(engine: Arc<WorkflowEngine<R>>, rx: mpsc::UnboundedReceiver<Uuid>) -> Self {
        Self { engine, rx }
    }

    /// Consume the queue. In-flight children are awaited before returning.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!("spawn worker started");
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.rx.recv() => {
                    let Some(execution_id) = next else { break };
                    let engine = Arc::clone(&self.engine);
                    tasks.spawn(async move { drive_child(&engine, execution_id).await });
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}
        tracing::info!("spawn worker stopped");
    }
}

async fn drive_child<R: WorkflowRepository>(engine: &WorkflowEngine<R>, execution_id: Uuid) {
    match engine.run_execution(execution_id).await {
        Ok(exec) => tracing::info!(
            execution_id = %execution_id,
            status = exec.status.as_str(),
            "child execution driven"
        ),
        Err(EngineError::InvalidState { status, .. }) => tracing::debug!(
            execution_id = %execution_id,
            status = status.as_str(),
            "child execution already picked up"
        ),
        Err(EngineError::AlreadyClaimed(_)) => tracing::debug!(
            execution_id = %execution_id,
            "child execution is being driven elsewhere"
        ),
        Err(e) => tracing::warn!(
            execution_id = %execution_id,
            error = %e,
            "failed to drive child execution"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use funnelflow_types::config::WebhookSettings;
    use funnelflow_types::contact::Contact;
    use funnelflow_types::workflow::{DataBag, ExecutionStatus};

    use super::*;
    use crate::memory::{
        InMemoryActivityLog, InMemoryContactStore, InMemoryWorkflowRepository,
        RecordingEmailDispatcher,
    };
    use crate::workflow::collaborator::{
        Collaborators, WebhookClient, WebhookError, WebhookRequest, WebhookResponse,
    };
    use crate::workflow::definition::parse_workflow_yaml;

    struct NoWebhooks;

    impl WebhookClient for NoWebhooks {
        fn call<'a>(
            &'a self,
            _request: &'a WebhookRequest,
        ) -> Pin<Box<dyn Future<Output = Result<WebhookResponse, WebhookError>> + Send + 'a>>
        {
            Box::pin(std::future::ready(Err(WebhookError::Transport(
                "disabled".to_string(),
            ))))
        }
    }

    #[tokio::test]
    async fn test_spawner_rejects_unknown_target_without_queueing() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let (spawner, mut rx) = QueueSpawner::new(repo);

        let err = spawner
            .spawn(SpawnRequest {
                workflow_id: Uuid::now_v7(),
                contact_id: None,
                data: DataBag::new(),
                parent_execution_id: Uuid::now_v7(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::NotFound(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_worker_drives_queued_children() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let contacts = Arc::new(InMemoryContactStore::new());
        let (spawner, rx) = QueueSpawner::new(Arc::clone(&repo));
        let spawner = Arc::new(spawner);
        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&repo),
            Collaborators {
                contacts: contacts.clone(),
                activity: Arc::new(InMemoryActivityLog::new()),
                webhooks: Arc::new(NoWebhooks),
                email: Arc::new(RecordingEmailDispatcher::new()),
                spawner: spawner.clone(),
            },
            WebhookSettings::default(),
        ));

        let def = parse_workflow_yaml(
            "name: child\nsteps:\n  - id: mark\n    type: ADD_TAG\n    config: { tag: spawned }\n",
        )
        .unwrap();
        let def = engine.import_definition(def).await.unwrap();
        let contact = contacts.insert(Contact::new("lin@example.com"));

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(SpawnWorker::new(Arc::clone(&engine), rx).run(cancel.clone()));

        let child_id = spawner
            .spawn(SpawnRequest {
                workflow_id: def.id,
                contact_id: Some(contact.id),
                data: DataBag::new(),
                parent_execution_id: Uuid::now_v7(),
            })
            .await
            .unwrap();

        let mut status = ExecutionStatus::Running;
        for _ in 0..100 {
            status = engine.get_execution(child_id).await.unwrap().status;
            if status != ExecutionStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, ExecutionStatus::Completed);
        assert_eq!(contacts.snapshot(&contact.id).unwrap().tags, vec!["spawned"]);

        cancel.cancel();
        worker.await.unwrap();
    }
}
