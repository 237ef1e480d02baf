//! Application state wiring the engine to its SQLite and HTTP collaborators.
//!
//! The engine is generic over its ledger repository; AppState pins it to the
//! concrete infra implementation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use funnelflow_core::workflow::collaborator::Collaborators;
use funnelflow_core::workflow::executor::WorkflowEngine;
use funnelflow_core::workflow::spawn::QueueSpawner;
use funnelflow_infra::config::{load_engine_config, resolve_data_dir};
use funnelflow_infra::sqlite::activity::SqliteActivityLog;
use funnelflow_infra::sqlite::contact::SqliteContactStore;
use funnelflow_infra::sqlite::email::SqliteEmailOutbox;
use funnelflow_infra::sqlite::pool::{DatabasePool, database_url};
use funnelflow_infra::sqlite::workflow::SqliteWorkflowRepository;
use funnelflow_infra::workflow::webhook_client::HttpWebhookClient;
use funnelflow_types::config::EngineConfig;

pub type ConcreteEngine = WorkflowEngine<SqliteWorkflowRepository>;

/// Shared state for every CLI command.
pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
    pub contacts: Arc<SqliteContactStore>,
    pub activity: Arc<SqliteActivityLog>,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
    /// Child executions queued by START_WORKFLOW steps.
    pub spawn_queue: Mutex<UnboundedReceiver<Uuid>>,
}

impl AppState {
    /// Initialize the application state: load config, open the DB, wire the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;

        let db_pool = DatabasePool::new(&database_url(&data_dir))
            .await
            .context("Failed to open the funnelflow database")?;

        let repo = Arc::new(SqliteWorkflowRepository::new(db_pool.clone()));
        let contacts = Arc::new(SqliteContactStore::new(db_pool.clone()));
        let activity = Arc::new(SqliteActivityLog::new(db_pool.clone()));
        let webhooks = HttpWebhookClient::new(&config.webhook)
            .context("Failed to build the webhook HTTP client")?;
        let (spawner, spawn_queue) = QueueSpawner::new(Arc::clone(&repo));

        let collaborators = Collaborators {
            contacts: contacts.clone(),
            activity: activity.clone(),
            webhooks: Arc::new(webhooks),
            email: Arc::new(SqliteEmailOutbox::new(db_pool)),
            spawner: Arc::new(spawner),
        };
        let engine = WorkflowEngine::new(repo, collaborators, config.webhook.clone());

        tracing::debug!(data_dir = %data_dir.display(), "application state initialized");

        Ok(Self {
            engine: Arc::new(engine),
            contacts,
            activity,
            config,
            data_dir,
            spawn_queue: Mutex::new(spawn_queue),
        })
    }
}
