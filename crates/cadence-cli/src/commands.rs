//! Command implementations for the cadence CLI.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use cadence_api::{HttpSchedulerApi, SchedulerApi};
use cadence_core::{Engine, EngineConfig, TracingSink};
use cadence_llm::OpenAiModel;

use crate::config::Connection;

/// Build the engine from resolved connection settings plus the
/// environment-derived engine config.
pub fn build_engine(connection: &Connection) -> Result<Engine> {
    let engine_config = EngineConfig::from_env().context("invalid engine configuration")?;

    let api = Arc::new(HttpSchedulerApi::new(
        connection.api_url.clone(),
        connection.api_token.clone(),
    ));

    let mut model = OpenAiModel::new(
        connection.model_api_key.clone(),
        engine_config.ai.model.clone(),
    );
    if let Some(base_url) = &connection.model_base_url {
        model = model.with_base_url(base_url.clone());
    }

    Ok(Engine::new(
        api,
        Arc::new(model),
        engine_config,
        Arc::new(TracingSink),
    ))
}

/// `cadence start`: run continuously until interrupted.
pub async fn run_start(connection: &Connection) -> Result<()> {
    let engine = build_engine(connection)?;
    engine.start();

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    engine.stop().await;

    Ok(())
}

/// `cadence process`: run one cycle and print the aggregate. The caller
/// turns a non-zero failure count into a non-zero exit code.
pub async fn run_process(connection: &Connection) -> Result<usize> {
    let engine = build_engine(connection)?;
    let result = engine.process_cycle().await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.failed_jobs)
}

/// `cadence status`: print an engine-state snapshot.
pub async fn run_status(connection: &Connection) -> Result<()> {
    let engine = build_engine(connection)?;
    let snapshot = engine.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// `cadence metrics`: fetch and print the façade's scheduler metrics.
pub async fn run_metrics(connection: &Connection) -> Result<()> {
    let api = HttpSchedulerApi::new(connection.api_url.clone(), connection.api_token.clone());
    let metrics = api
        .scheduler_metrics()
        .await
        .context("failed to fetch scheduler metrics")?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

/// `cadence unlock-jobs`: operational lease cleanup.
pub fn run_unlock_jobs() {
    // Stale leases expire on their own after STALE_LOCK_THRESHOLD_MS; a
    // forced unlock needs a façade route that does not exist yet.
    println!("unlock-jobs: not implemented; stale leases expire automatically");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
