//! `ffw worker`: the long-running resume scheduler and spawn worker.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use console::style;
use tokio_util::sync::CancellationToken;

use funnelflow_core::workflow::scheduler::ResumeScheduler;
use funnelflow_core::workflow::spawn::SpawnWorker;

use super::run::drive_spawned;
use crate::state::AppState;

pub async fn run_worker(
    state: AppState,
    poll_interval: Option<u64>,
    once: bool,
    json: bool,
) -> Result<()> {
    let mut config = state.config.scheduler.clone();
    if let Some(secs) = poll_interval {
        config.poll_interval_secs = secs;
    }
    let scheduler = ResumeScheduler::new(Arc::clone(&state.engine), config.clone());

    if once {
        let report = scheduler.tick(Utc::now()).await?;
        let children = drive_spawned(&state).await;
        if json {
            let out = serde_json::json!({
                "due": report.due,
                "resumed": report.resumed,
                "skipped": report.skipped,
                "failed": report.failed,
                "children": children.len(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        } else {
            println!();
            println!(
                "  {} Resumed {} of {} due execution(s) ({} skipped, {} failed, {} spawned)",
                style("*").green().bold(),
                report.resumed,
                report.due,
                report.skipped,
                report.failed,
                children.len()
            );
            println!();
        }
        return Ok(());
    }

    let AppState {
        engine,
        spawn_queue,
        data_dir,
        ..
    } = state;
    let cancel = CancellationToken::new();
    let spawn_worker = SpawnWorker::new(Arc::clone(&engine), spawn_queue.into_inner());

    let scheduler_task = tokio::spawn(scheduler.run(cancel.clone()));
    let spawn_task = tokio::spawn(spawn_worker.run(cancel.clone()));

    if !json {
        println!(
            "  {} Funnelflow worker polling every {}s (data: {})",
            style("⚡").bold(),
            config.poll_interval().as_secs(),
            style(data_dir.display()).dim()
        );
        println!("  {}", style("Press Ctrl+C to stop").dim());
    }

    shutdown_signal().await;
    tracing::info!("shutdown requested, waiting for in-flight executions");
    cancel.cancel();

    let (scheduler_result, spawn_result) = tokio::join!(scheduler_task, spawn_task);
    for result in [scheduler_result, spawn_result] {
        if let Err(e) = result {
            tracing::warn!(error = %e, "worker task ended abnormally");
        }
    }

    if !json {
        println!("\n  Worker stopped.");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
