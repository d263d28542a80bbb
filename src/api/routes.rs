//! API route definitions.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::envelope::ResultEnvelope;
use super::state::AppState;
use crate::execution::{Execution, ExecutionStatus, NewExecution, NodeOutcome, ThreadConfig};
use crate::judge::{TestCaseResult, TestResult};
use crate::nodes::{NodeInfo, NodeRegistration};
use crate::orchestrator::{
    CompletionReport, DeleteReport, RequestContext, SchedulingFailure, StartRequest, StopRequest,
};

type Reply<T> = (StatusCode, Json<ResultEnvelope<T>>);

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/executions", post(submit_execution))
        .route("/executions/start", post(start_execution))
        .route("/executions/stop", post(stop_execution))
        .route("/executions/delete", post(delete_executions))
        .route("/executions/{id}", get(show_execution))
        .route("/executions/{id}/threads", post(override_threads))
        .route("/executions/{id}/complete", post(complete_execution))
        .route("/executions/{id}/result", get(execution_result))
        .route("/relay/start", post(relay_start))
        .route("/relay/stop", post(relay_stop))
        .route("/nodes", get(list_nodes).post(register_node))
        .route("/nodes/{id}/heartbeat", post(node_heartbeat))
        .route("/nodes/{id}/enabled", post(set_node_enabled))
}

fn ok<T>(data: T) -> Reply<T> {
    (StatusCode::OK, Json(ResultEnvelope::ok(data)))
}

fn internal<T>(e: anyhow::Error) -> Reply<T> {
    error!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ResultEnvelope::error(e.to_string())),
    )
}

fn failure_status(failure: &SchedulingFailure) -> StatusCode {
    match failure {
        SchedulingFailure::NotFound(_) => StatusCode::NOT_FOUND,
        SchedulingFailure::Forbidden(_) => StatusCode::FORBIDDEN,
        SchedulingFailure::AlreadyRunning(_) | SchedulingFailure::InFlight(_) => StatusCode::CONFLICT,
        SchedulingFailure::MissingTargets(_) => StatusCode::BAD_REQUEST,
        SchedulingFailure::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        SchedulingFailure::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        // The request was fine; scheduling itself did not succeed.
        _ => StatusCode::OK,
    }
}

fn outcome_failure(failure: SchedulingFailure) -> Reply<Vec<NodeOutcome>> {
    let status = failure_status(&failure);
    let message = failure.to_string();
    (
        status,
        Json(ResultEnvelope::error_with(message, failure.into_outcomes())),
    )
}

fn plain_failure<T>(failure: SchedulingFailure) -> Reply<T> {
    (
        failure_status(&failure),
        Json(ResultEnvelope::error(failure.to_string())),
    )
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub version: String,
    pub instance_id: String,
    pub executions: HashMap<String, i64>,
}

async fn health(State(state): State<AppState>) -> Reply<Health> {
    match state.orchestrator.store().status_counts().await {
        Ok(executions) => ok(Health {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: state.config.controller.instance_id.clone(),
            executions,
        }),
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct Submitted {
    pub id: i64,
}

async fn submit_execution(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(new): Json<NewExecution>,
) -> Reply<Submitted> {
    if !ctx.may_operate(new.tenant_id) {
        return (
            StatusCode::FORBIDDEN,
            Json(ResultEnvelope::error(format!(
                "not permitted to submit for tenant {}",
                new.tenant_id
            ))),
        );
    }
    match state.orchestrator.store().create(new).await {
        Ok(id) => ok(Submitted { id }),
        Err(e) => internal(e),
    }
}

async fn show_execution(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i64>,
) -> Reply<Execution> {
    match state.orchestrator.store().get(id).await {
        Ok(Some(exec)) if ctx.may_operate(exec.tenant_id) => ok(exec),
        Ok(Some(_)) => plain_failure(SchedulingFailure::Forbidden(id)),
        Ok(None) => plain_failure(SchedulingFailure::NotFound(id)),
        Err(e) => internal(e),
    }
}

/// Replace the thread configuration of an execution that is not running.
async fn override_threads(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i64>,
    Json(threads): Json<ThreadConfig>,
) -> Reply<Execution> {
    let store = state.orchestrator.store();
    match store.get(id).await {
        Ok(Some(exec)) if !ctx.may_operate(exec.tenant_id) => {
            return plain_failure(SchedulingFailure::Forbidden(id))
        }
        Ok(Some(exec))
            if matches!(
                exec.status,
                ExecutionStatus::Running | ExecutionStatus::Scheduling
            ) =>
        {
            return plain_failure(SchedulingFailure::AlreadyRunning(id))
        }
        Ok(Some(_)) => {}
        Ok(None) => return plain_failure(SchedulingFailure::NotFound(id)),
        Err(e) => return internal(e),
    }

    if let Err(e) = store.update_threads(id, threads).await {
        return internal(e);
    }
    match store.get(id).await {
        Ok(Some(exec)) => ok(exec),
        Ok(None) => plain_failure(SchedulingFailure::NotFound(id)),
        Err(e) => internal(e),
    }
}

async fn start_execution(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<StartRequest>,
) -> Reply<Vec<NodeOutcome>> {
    match state.orchestrator.start(&ctx, req).await {
        Ok(outcomes) => ok(outcomes),
        Err(failure) => outcome_failure(failure),
    }
}

async fn stop_execution(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<StopRequest>,
) -> Reply<Vec<NodeOutcome>> {
    match state.orchestrator.stop(&ctx, req).await {
        Ok(outcomes) => ok(outcomes),
        Err(failure) => outcome_failure(failure),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub ids: Vec<i64>,
}

async fn delete_executions(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<DeleteRequest>,
) -> Reply<DeleteReport> {
    ok(state.orchestrator.delete(&ctx, req.ids).await)
}

async fn complete_execution(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i64>,
    Json(report): Json<CompletionReport>,
) -> Reply<TestResult> {
    match state.orchestrator.complete(&ctx, id, report).await {
        Ok(result) => ok(result),
        Err(failure) => plain_failure(failure),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultView {
    pub result: TestResult,
    pub cases: Vec<TestCaseResult>,
}

async fn execution_result(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i64>,
) -> Reply<ResultView> {
    let orch = &state.orchestrator;
    let exec = match orch.store().get(id).await {
        Ok(Some(exec)) if ctx.may_operate(exec.tenant_id) => exec,
        Ok(Some(_)) => return plain_failure(SchedulingFailure::Forbidden(id)),
        Ok(None) => return plain_failure(SchedulingFailure::NotFound(id)),
        Err(e) => return internal(e),
    };
    let result = match orch
        .results()
        .current(exec.script_type, exec.result_source_id())
        .await
    {
        Ok(Some(result)) => result,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ResultEnvelope::error(format!("execution {} has no result yet", id))),
            )
        }
        Err(e) => return internal(e),
    };
    match orch.results().case_results(result.id).await {
        Ok(cases) => ok(ResultView { result, cases }),
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// Relay (controller to controller)
// ---------------------------------------------------------------------------

fn relay_forbidden() -> Reply<Vec<NodeOutcome>> {
    (
        StatusCode::FORBIDDEN,
        Json(ResultEnvelope::error("only the system principal relays commands")),
    )
}

async fn relay_start(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(mut req): Json<StartRequest>,
) -> Reply<Vec<NodeOutcome>> {
    if !ctx.is_system() {
        return relay_forbidden();
    }
    req.broadcast = false;
    let node_ids = req.node_ids.clone();
    match state.orchestrator.start(&ctx, req).await {
        Ok(outcomes) => ok(outcomes),
        Err(failure) => ok(failure.into_node_outcomes(&node_ids)),
    }
}

async fn relay_stop(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(mut req): Json<StopRequest>,
) -> Reply<Vec<NodeOutcome>> {
    if !ctx.is_system() {
        return relay_forbidden();
    }
    req.broadcast = false;
    let node_ids = req.node_ids.clone();
    match state.orchestrator.stop(&ctx, req).await {
        Ok(outcomes) => ok(outcomes),
        Err(failure) => ok(failure.into_node_outcomes(&node_ids)),
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

async fn list_nodes(State(state): State<AppState>, _ctx: RequestContext) -> Reply<Vec<NodeInfo>> {
    match state.orchestrator.registry().list().await {
        Ok(nodes) => ok(nodes),
        Err(e) => internal(e),
    }
}

async fn register_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(reg): Json<NodeRegistration>,
) -> Reply<NodeRegistration> {
    if !ctx.is_system() {
        return (
            StatusCode::FORBIDDEN,
            Json(ResultEnvelope::error("only the system principal registers nodes")),
        );
    }
    match state.orchestrator.registry().register(reg.clone()).await {
        Ok(()) => ok(reg),
        Err(e) => internal(e),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

async fn set_node_enabled(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<i64>,
    Json(req): Json<EnabledRequest>,
) -> Reply<i64> {
    if !ctx.is_system() {
        return (
            StatusCode::FORBIDDEN,
            Json(ResultEnvelope::error("only the system principal manages nodes")),
        );
    }
    match state.orchestrator.registry().set_enabled(id, req.enabled).await {
        Ok(()) => ok(id),
        Err(e) => internal(e),
    }
}

async fn node_heartbeat(State(state): State<AppState>, Path(id): Path<i64>) -> Reply<i64> {
    match state.orchestrator.registry().heartbeat(id).await {
        Ok(true) => ok(id),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(ResultEnvelope::error(format!("node {} is not registered", id))),
        ),
        Err(e) => internal(e),
    }
}
