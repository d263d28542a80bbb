//! testfleet -- execution dispatch and result judgment for load-test worker fleets.
//!
//! A controller instance takes start/stop requests for test executions,
//! selects and shards worker nodes, pushes commands to the agents it owns,
//! relays the rest to sibling instances, and judges finished runs.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod execution;
pub mod judge;
pub mod lock;
pub mod nodes;
pub mod orchestrator;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::api::state::AppState;
use crate::config::ControllerConfig;
use crate::orchestrator::ExecutionOrchestrator;

/// Wire an orchestrator and the HTTP application for `config`.
pub fn build_app(config: ControllerConfig) -> Result<(axum::Router, Arc<ExecutionOrchestrator>)> {
    let db_path = config.storage.db_path.to_string_lossy().into_owned();
    tracing::info!(%db_path, "Initializing database");
    let pool = storage::open_pool(&db_path)?;

    let orchestrator = Arc::new(ExecutionOrchestrator::from_config(&config, pool)?);
    let state = AppState {
        orchestrator: orchestrator.clone(),
        config: Arc::new(config),
    };
    Ok((api::router(state), orchestrator))
}

/// Start the controller: API server plus the pending retry sweep.
pub async fn serve(config: ControllerConfig) -> Result<()> {
    let listen = config.network.listen_address.clone();
    let retry_interval = config.dispatch.retry_interval_secs;
    let max_attempts = config.dispatch.max_schedule_attempts;
    let instance_id = config.controller.instance_id.clone();

    let (app, orchestrator) = build_app(config)?;

    if retry_interval > 0 {
        tokio::spawn(scheduler::run_retry_loop(
            orchestrator,
            Duration::from_secs(retry_interval),
            max_attempts,
        ));
    }

    let addr: std::net::SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address: {}", listen))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, %instance_id, "testfleet controller listening");
    axum::serve(listener, app).await?;

    Ok(())
}
