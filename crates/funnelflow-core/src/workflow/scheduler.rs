//! Resume scheduler: wakes WAITING executions whose `resume_at` has passed.
//!
//! Poll-based. Each tick lists due executions (oldest first, bounded by the
//! configured batch size) and resumes them concurrently. The engine's claim
//! is a conditional WAITING -> RUNNING write, so running several schedulers
//! against one ledger is safe: each execution is driven by exactly one.
//!
//! A DELAY never resumes early; it resumes late by at most one poll interval
//! plus the time to drain earlier batches.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use funnelflow_types::config::SchedulerConfig;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::repository::workflow::WorkflowRepository;

use super::executor::{EngineError, WorkflowEngine};

/// Counts for one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Executions listed as due.
    pub due: usize,
    /// Claimed and driven by this tick.
    pub resumed: usize,
    /// Canceled, claimed elsewhere or not yet due on re-read.
    pub skipped: usize,
    /// Engine errors (ledger failures).
    pub failed: usize,
}

pub struct ResumeScheduler<R: WorkflowRepository> {
    engine: Arc<WorkflowEngine<R>>,
    config: SchedulerConfig,
}

impl<R: WorkflowRepository + 'static> ResumeScheduler<R> {
    pub fn new(engine: Arc<WorkflowEngine<R>>, config: SchedulerConfig) -> Self {
        Self { engine, config }
    }

    /// Resume every execution due at `now`, up to the batch limit.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, EngineError> {
        let due = self
            .engine
            .ledger()
            .repo()
            .list_due(now, self.config.batch_limit())
            .await?;

        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let mut tasks = JoinSet::new();
        for exec in due {
            let engine = Arc::clone(&self.engine);
            tasks.spawn(async move { (exec.id, engine.resume_execution(exec.id, now).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Some(_)))) => report.resumed += 1,
                Ok((_, Ok(None)))
                | Ok((_, Err(EngineError::InvalidState { .. })))
                | Ok((_, Err(EngineError::NotDue { .. }))) => report.skipped += 1,
                Ok((execution_id, Err(e))) => {
                    tracing::warn!(execution_id = %execution_id, error = %e, "resume failed");
                    report.failed += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "resume task panicked");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            due = report.due,
            resumed = report.resumed,
            skipped = report.skipped,
            failed = report.failed,
            "scheduler tick complete"
        );
        Ok(report)
    }

    /// Tick every poll interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let interval = self.config.poll_interval();
        tracing::info!(
            poll_interval_secs = interval.as_secs(),
            batch_size = self.config.batch_limit(),
            "resume scheduler started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        tracing::warn!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
        tracing::info!("resume scheduler stopped");
    }
}
