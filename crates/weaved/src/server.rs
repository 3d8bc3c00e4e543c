//! HTTP control plane for the daemon.
//!
//! Implements the REST surface, SSE event streams, and the WebSocket
//! subscription protocol from spec Section 6. Grounded in the teacher's
//! axum router shape (`create_router`/`AppState`/`check_auth`), generalized
//! from a single `runs` resource to executions, workflows, and federation,
//! and extended with the WebSocket half the teacher's poll-based SSE had no
//! equivalent of.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event as SseEvent, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use weave_core::{
    Config, Execution, ExecutionStatus, Id, NameSource, OnFailure, Parallelism, TrustLevel, Workflow,
    WorkflowConfig, WorkflowSource, WorkflowStatus, WorkflowStep,
};

use crate::eventbus::EventBuffer;
use crate::federation::{FederationError, FederationService};
use crate::runner::{ExecutionTask, Runner, RunnerConfig};
use crate::storage::Storage;
use crate::transport::TransportManager;
use crate::workflow::WorkflowEngine;

/// Shared state for HTTP handlers.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub runner: Arc<Runner>,
    pub workflow_engine: Arc<WorkflowEngine>,
    pub federation: Arc<FederationService>,
    pub events: Arc<EventBuffer>,
    pub transport: Arc<TransportManager>,
    pub config: Config,
    pub auth_token: Option<String>,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Executions (Section 4.4)
        .route("/executions", post(create_execution).get(list_executions))
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/cancel", post(cancel_execution))
        .route("/executions/{id}/events", get(stream_execution_events))
        // Workflows (Section 4.5)
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/steps", get(list_workflow_steps))
        .route("/workflows/{id}/pause", post(pause_workflow))
        .route("/workflows/{id}/resume", post(resume_workflow))
        .route("/workflows/{id}/cancel", post(cancel_workflow))
        .route("/workflows/{id}/events", get(stream_workflow_events))
        .route("/workflow-steps/{id}/retry", post(retry_workflow_step))
        .route("/workflow-steps/{id}/skip", post(skip_workflow_step))
        // Federation (Section 4.6 / 6.1)
        .route("/federation/info", get(federation_info))
        .route("/federation/query", post(federation_query))
        .route("/federation/mutate", post(federation_mutate))
        .route("/federation/remotes", post(register_remote).get(list_remotes))
        .route("/federation/requests", get(list_cross_repo_requests))
        .route("/federation/requests/{id}/approve", post(approve_cross_repo_request))
        .route("/federation/requests/{id}/reject", post(reject_cross_repo_request))
        .route("/federation/health", get(federation_health))
        // WebSocket subscription protocol (Section 6.1)
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Start the HTTP server. Binds to localhost only.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if let Some(expected) = &state.auth_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

        match provided {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err((StatusCode::UNAUTHORIZED, Json(ErrorResponse { error: "invalid auth token".to_string() }))),
            None => Err((StatusCode::UNAUTHORIZED, Json(ErrorResponse { error: "missing auth token".to_string() }))),
        }
    } else {
        Ok(())
    }
}

// --- Request/Response types ---

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn internal_error<E: std::fmt::Display>(context: &str, e: E) -> (StatusCode, Json<ErrorResponse>) {
    error!("{}: {}", context, e);
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error: format!("{}: {}", context, e) }))
}

fn not_found(context: &str, e: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    warn!("{}: {}", context, e);
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error: format!("{}: {}", context, e) }))
}

fn bad_request(context: &str, e: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    warn!("{}: {}", context, e);
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: format!("{}: {}", context, e) }))
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// --- Executions (Section 4.4) ---

#[derive(Debug, Deserialize)]
pub struct CreateExecutionRequest {
    pub agent_type: String,
    pub prompt: String,
    pub workspace_root: String,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub issue_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub execution: Execution,
}

#[derive(Debug, Serialize)]
pub struct ListExecutionsResponse {
    pub executions: Vec<Execution>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListExecutionsQuery {
    #[serde(default)]
    pub workspace_root: Option<String>,
}

/// POST /executions - create and launch an execution.
async fn create_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateExecutionRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;

    let work_dir = PathBuf::from(req.work_dir.unwrap_or_else(|| req.workspace_root.clone()));
    let model = req.model.unwrap_or_else(|| state.config.model.clone());
    let now = Utc::now();
    let execution = Execution {
        id: Id::new(),
        name: req.name.unwrap_or_else(|| req.agent_type.clone()),
        name_source: NameSource::SpecSlug,
        status: ExecutionStatus::Pending,
        issue_id: req.issue_id,
        workflow_id: None,
        workflow_step_id: None,
        workspace_root: req.workspace_root,
        worktree: None,
        worktree_cleanup_status: None,
        worktree_cleaned_at: None,
        base_commit: None,
        after_commit: None,
        error_message: None,
        config_json: None,
        started_at: None,
        completed_at: None,
        created_at: now,
        updated_at: now,
    };
    state
        .storage
        .insert_execution(&execution)
        .await
        .map_err(|e| internal_error("failed to create execution", e))?;

    let task = ExecutionTask {
        agent_type: req.agent_type,
        model,
        prompt: req.prompt,
        work_dir,
    };

    let runner = Arc::clone(&state.runner);
    let exec_for_task = execution.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.run(&exec_for_task, task).await {
            error!(execution_id = %exec_for_task.id, error = %e, "execution run failed");
        }
    });

    info!(execution_id = %execution.id, "created execution");
    Ok((StatusCode::CREATED, Json(ExecutionResponse { execution })))
}

/// GET /executions - list executions, optionally scoped to a workspace.
async fn list_executions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let executions = state
        .storage
        .list_executions(query.workspace_root.as_deref())
        .await
        .map_err(|e| internal_error("failed to list executions", e))?;
    Ok(Json(ListExecutionsResponse { executions }))
}

/// GET /executions/{id}.
async fn get_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let execution_id = Id::from_string(id.clone());
    let execution = state.storage.get_execution(&execution_id).await.map_err(|e| not_found("execution not found", e))?;
    Ok(Json(ExecutionResponse { execution }))
}

/// POST /executions/{id}/cancel.
async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let execution_id = Id::from_string(id.clone());
    state
        .runner
        .cancel(&execution_id)
        .await
        .map_err(|e| bad_request("failed to cancel execution", e))?;
    info!(execution_id = %id, "canceled execution");
    Ok(StatusCode::NO_CONTENT)
}

// --- Workflows (Section 4.5) ---

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub title: String,
    pub workspace_root: String,
    pub source: WorkflowSource,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub config: WorkflowConfigRequest,
}

#[derive(Debug, Deserialize, Default)]
pub struct WorkflowConfigRequest {
    #[serde(default)]
    pub on_failure: Option<OnFailure>,
    #[serde(default)]
    pub parallelism: Option<Parallelism>,
    #[serde(default)]
    pub max_concurrency: Option<u32>,
    #[serde(default)]
    pub auto_commit_after_step: Option<bool>,
    #[serde(default)]
    pub default_agent_type: Option<String>,
}

impl From<WorkflowConfigRequest> for WorkflowConfig {
    fn from(req: WorkflowConfigRequest) -> Self {
        // `WorkflowConfig` has no `Default` impl; its per-field `#[serde(default = ...)]`
        // attributes only fire on deserialization, so an empty JSON object yields the
        // same defaults `create_workflow` would apply to an omitted request body.
        let mut config: WorkflowConfig = serde_json::from_value(json!({})).expect("WorkflowConfig defaults");
        if let Some(v) = req.on_failure {
            config.on_failure = v;
        }
        if let Some(v) = req.parallelism {
            config.parallelism = v;
        }
        if let Some(v) = req.max_concurrency {
            config.max_concurrency = v;
        }
        if let Some(v) = req.auto_commit_after_step {
            config.auto_commit_after_step = v;
        }
        if let Some(v) = req.default_agent_type {
            config.default_agent_type = v;
        }
        config
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowResponse {
    pub workflow: Workflow,
}

#[derive(Debug, Serialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<Workflow>,
}

#[derive(Debug, Serialize)]
pub struct ListWorkflowStepsResponse {
    pub steps: Vec<WorkflowStep>,
}

/// POST /workflows - build the DAG, persist it, and start the scheduling loop.
async fn create_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateWorkflowRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;

    let workspace_root = PathBuf::from(&req.workspace_root);
    let base_branch = req.base_branch.unwrap_or_else(|| state.config.base_branch.clone().unwrap_or_else(|| "main".to_string()));

    let workflow = state
        .workflow_engine
        .create_workflow(&workspace_root, req.title, req.source, base_branch, req.config.into())
        .await
        .map_err(|e| bad_request("failed to create workflow", e))?;

    let engine = Arc::clone(&state.workflow_engine);
    let workflow_id = workflow.id.clone();
    let daemon_config = state.config.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.run(&workflow_id, &workspace_root, &daemon_config).await {
            error!(workflow_id = %workflow_id, error = %e, "workflow run failed");
        }
    });

    info!(workflow_id = %workflow.id, "created workflow");
    Ok((StatusCode::CREATED, Json(WorkflowResponse { workflow })))
}

async fn list_workflows(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let workflows = state.storage.list_workflows().await.map_err(|e| internal_error("failed to list workflows", e))?;
    Ok(Json(ListWorkflowsResponse { workflows }))
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let workflow_id = Id::from_string(id.clone());
    let workflow = state.storage.get_workflow(&workflow_id).await.map_err(|e| not_found("workflow not found", e))?;
    Ok(Json(WorkflowResponse { workflow }))
}

async fn list_workflow_steps(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let workflow_id = Id::from_string(id.clone());
    state.storage.get_workflow(&workflow_id).await.map_err(|e| not_found("workflow not found", e))?;
    let steps = state
        .storage
        .list_workflow_steps(&workflow_id)
        .await
        .map_err(|e| internal_error("failed to list workflow steps", e))?;
    Ok(Json(ListWorkflowStepsResponse { steps }))
}

async fn pause_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let workflow_id = Id::from_string(id.clone());
    state.workflow_engine.pause_workflow(&workflow_id).await.map_err(|e| bad_request("failed to pause workflow", e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let workflow_id = Id::from_string(id.clone());
    state.workflow_engine.resume_workflow(&workflow_id).await.map_err(|e| bad_request("failed to resume workflow", e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let workflow_id = Id::from_string(id.clone());
    state.workflow_engine.cancel_workflow(&workflow_id).await.map_err(|e| bad_request("failed to cancel workflow", e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn retry_workflow_step(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let step_id = Id::from_string(id.clone());
    state.workflow_engine.retry_step(&step_id).await.map_err(|e| bad_request("failed to retry step", e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn skip_workflow_step(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let step_id = Id::from_string(id.clone());
    state.workflow_engine.skip_step(&step_id).await.map_err(|e| bad_request("failed to skip step", e))?;
    Ok(StatusCode::NO_CONTENT)
}

// --- SSE streaming (Section 6.1) ---

/// Builds an SSE stream over a run/workflow id: an initial `connected` event
/// carrying the client id, then every buffered + live `AgUiEvent` converted
/// to an SSE frame (spec Section 6.1).
async fn sse_stream_for(state: &Arc<AppState>, run_id: Id) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    let client_id = Id::new().to_string();
    let rx = state.transport.handle_connection(client_id.clone(), Some(run_id), None).await;

    let connected = SseEvent::default().event("connected").data(json!({ "clientId": client_id }).to_string());
    let tail = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let data = serde_json::to_string(&event).unwrap_or_default();
        let frame = SseEvent::default()
            .event(event.event_type.as_str())
            .id(event.timestamp.to_string())
            .data(data);
        Some((Ok(frame), rx))
    });

    stream::once(async move { Ok(connected) }).chain(tail)
}

/// Required SSE response headers beyond axum's implicit `Sse` content type
/// (spec Section 6.1).
fn sse_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(header::HeaderName::from_static("x-accel-buffering"), HeaderValue::from_static("no"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers
}

/// GET /executions/{id}/events.
async fn stream_execution_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let execution_id = Id::from_string(id.clone());
    state.storage.get_execution(&execution_id).await.map_err(|e| not_found("execution not found", e))?;
    let stream = sse_stream_for(&state, execution_id).await;
    Ok((sse_headers(), Sse::new(stream)))
}

/// GET /workflows/{id}/events.
async fn stream_workflow_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let workflow_id = Id::from_string(id.clone());
    state.storage.get_workflow(&workflow_id).await.map_err(|e| not_found("workflow not found", e))?;
    let stream = sse_stream_for(&state, workflow_id).await;
    Ok((sse_headers(), Sse::new(stream)))
}

// --- Federation REST (Section 4.6 / 6.1) ---

#[derive(Debug, Deserialize)]
struct FederationQueryRequest {
    #[serde(default)]
    from: String,
    #[serde(default)]
    query: FederationQueryBody,
}

#[derive(Debug, Deserialize, Default)]
struct FederationQueryBody {
    #[serde(default)]
    entity: String,
    #[serde(default)]
    filters: Value,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct FederationMutateRequest {
    from: String,
    operation: String,
    #[serde(default)]
    data: Value,
}

/// GET /federation/info.
async fn federation_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.federation.info())
}

/// POST /federation/query. Answered synchronously; gated by the caller's
/// registered trust level, not the pending/approve state machine mutations
/// go through.
async fn federation_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FederationQueryRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let trust_level = resolve_trust_level(&state, &req.from).await;
    let results = state
        .federation
        .handle_incoming_query(trust_level, &req.query.entity, &req.query.filters, req.query.limit)
        .await
        .map_err(|e| internal_error("federation query failed", e))?;
    Ok(Json(json!({ "results": results })))
}

/// POST /federation/mutate.
async fn federation_mutate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FederationMutateRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let trust_level = resolve_trust_level(&state, &req.from).await;
    let reply = state
        .federation
        .handle_incoming_mutation(&req.from, trust_level, &req.operation, req.data)
        .await
        .map_err(|e| internal_error("federation mutate failed", e))?;
    Ok(Json(reply))
}

/// Look up the caller's registered trust level; unregistered peers are untrusted.
async fn resolve_trust_level(state: &Arc<AppState>, from_repo: &str) -> TrustLevel {
    match state.federation.get_remote_repo(from_repo).await {
        Ok(repo) => repo.trust_level,
        Err(_) => TrustLevel::Untrusted,
    }
}

#[derive(Debug, Deserialize)]
struct RegisterRemoteRequest {
    url: String,
    display_name: String,
    trust_level: TrustLevel,
    #[serde(default)]
    rest_endpoint: String,
    #[serde(default)]
    ws_endpoint: Option<String>,
    #[serde(default)]
    git_url: Option<String>,
    #[serde(default)]
    auto_sync: bool,
    #[serde(default = "default_sync_interval")]
    sync_interval_minutes: u32,
}

fn default_sync_interval() -> u32 {
    15
}

async fn register_remote(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterRemoteRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let now = Utc::now();
    let repo = weave_core::RemoteRepo {
        url: req.url,
        display_name: req.display_name,
        trust_level: req.trust_level,
        rest_endpoint: if req.rest_endpoint.is_empty() { None } else { Some(req.rest_endpoint) },
        ws_endpoint: req.ws_endpoint,
        git_url: req.git_url,
        auto_sync: req.auto_sync,
        sync_interval_minutes: req.sync_interval_minutes,
        sync_status: weave_core::SyncStatus::Unknown,
        last_synced_at: None,
        capabilities_json: None,
        created_at: now,
        updated_at: now,
    };
    let repo = state.federation.register_remote_repo(repo).await.map_err(|e| internal_error("failed to register remote", e))?;
    Ok((StatusCode::CREATED, Json(json!({ "remote_repo": repo }))))
}

async fn list_remotes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let remotes = state.federation.list_remote_repos().await.map_err(|e| internal_error("failed to list remotes", e))?;
    Ok(Json(json!({ "remote_repos": remotes })))
}

#[derive(Debug, Deserialize, Default)]
struct ListRequestsQuery {
    #[serde(default)]
    status: Option<weave_core::RequestStatus>,
}

async fn list_cross_repo_requests(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListRequestsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let requests = state
        .storage
        .list_cross_repo_requests(query.status)
        .await
        .map_err(|e| internal_error("failed to list cross-repo requests", e))?;
    Ok(Json(json!({ "requests": requests })))
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    approver: String,
}

async fn approve_cross_repo_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ApproveRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let request_id = Id::from_string(id.clone());
    let request = state.federation.approve(&request_id, &req.approver).await.map_err(|e| match e {
        FederationError::RequestTerminal(_) => bad_request("failed to approve request", e),
        other => internal_error("failed to approve request", other),
    })?;
    Ok(Json(json!({ "request": request })))
}

#[derive(Debug, Deserialize)]
struct RejectRequest {
    reason: String,
}

async fn reject_cross_repo_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<RejectRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    let request_id = Id::from_string(id.clone());
    let request = state.federation.reject(&request_id, &req.reason).await.map_err(|e| match e {
        FederationError::RequestTerminal(_) => bad_request("failed to reject request", e),
        other => internal_error("failed to reject request", other),
    })?;
    Ok(Json(json!({ "request": request })))
}

async fn federation_health(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let report = state.federation.health().await.map_err(|e| internal_error("failed to compute federation health", e))?;
    Ok(Json(report))
}

// --- WebSocket subscription protocol (Section 6.1) ---

async fn ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        remote_repo: String,
        entity_type: weave_core::EntityTypeFilter,
        #[serde(default)]
        entity_id: Option<String>,
        #[serde(default)]
        events: Vec<weave_core::SubscriptionEvent>,
    },
    Unsubscribe {
        subscription_id: String,
    },
}

/// Drives one WebSocket connection through the subscribe/unsubscribe
/// protocol. Client silence past `MAX_IDLE` (5 minutes) is reaped by the
/// periodic sweep the daemon runs in the background (spec Section 4.6.3).
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Id::new().to_string();
    let mut rx = state.federation.register_connection(connection_id.clone(), None).await;

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(message) = outgoing else { break };
                if socket.send(Message::Text(message.to_string().into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                match message {
                    Message::Text(text) => {
                        state.federation.ping(&connection_id).await;
                        handle_ws_text(&state, &connection_id, &text, &mut socket).await;
                    }
                    Message::Ping(_) | Message::Pong(_) => {
                        state.federation.ping(&connection_id).await;
                    }
                    Message::Close(_) => break,
                    Message::Binary(_) => {}
                }
            }
        }
    }

    let _ = state.federation.disconnect(&connection_id).await;
}

async fn handle_ws_text(state: &Arc<AppState>, connection_id: &str, text: &str, socket: &mut WebSocket) {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    match parsed {
        Ok(ClientMessage::Subscribe { remote_repo, entity_type, entity_id, events }) => {
            let sub = weave_core::Subscription {
                subscription_id: Id::new(),
                local_repo: String::new(),
                remote_repo,
                entity_type,
                entity_id,
                events,
                webhook_url: None,
                ws_connection_id: Some(connection_id.to_string()),
                active: true,
                last_event_at: None,
                created_at: Utc::now(),
            };
            match state.federation.create_subscription(sub).await {
                Ok(sub) => {
                    let _ = state.federation.bind_subscription(connection_id, &sub.subscription_id).await;
                    let ack = json!({ "type": "subscribed", "subscription_id": sub.subscription_id.to_string() });
                    let _ = socket.send(Message::Text(ack.to_string().into())).await;
                }
                Err(e) => {
                    let err = json!({ "type": "error", "error": e.to_string() });
                    let _ = socket.send(Message::Text(err.to_string().into())).await;
                }
            }
        }
        Ok(ClientMessage::Unsubscribe { subscription_id }) => {
            let id = Id::from_string(subscription_id);
            if let Err(e) = state.storage.deactivate_subscription(&id).await {
                let err = json!({ "type": "error", "error": e.to_string() });
                let _ = socket.send(Message::Text(err.to_string().into())).await;
            }
        }
        Err(e) => {
            let err = json!({ "type": "error", "error": format!("malformed message: {}", e) });
            let _ = socket.send(Message::Text(err.to_string().into())).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterRegistry;
    use crate::eventbus::{DEFAULT_MAX_EVENTS, DEFAULT_RETENTION_SEC};
    use crate::process::ProcessSupervisor;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_state(auth_token: Option<String>) -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(&dir.path().join("test.db")).await.unwrap());
        storage.migrate_embedded().await.unwrap();
        let events = Arc::new(EventBuffer::new(DEFAULT_MAX_EVENTS, DEFAULT_RETENTION_SEC));
        let transport = Arc::new(TransportManager::new(Arc::clone(&events)));
        let config = Config::default();
        let runner = Arc::new(Runner::new(
            Arc::clone(&storage),
            Arc::clone(&events),
            Arc::clone(&transport),
            Arc::new(ProcessSupervisor::new()),
            Arc::new(AdapterRegistry::default()),
            RunnerConfig::from_config(&config),
        ));
        let workflow_engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&storage),
            Arc::clone(&runner),
            Arc::clone(&events),
            Arc::clone(&transport),
        ));
        let federation = Arc::new(FederationService::new(Arc::clone(&storage), dir.path().to_path_buf(), "local-repo".to_string()));
        let state = Arc::new(AppState {
            storage,
            runner,
            workflow_engine,
            federation,
            events,
            transport,
            config,
            auth_token,
        });
        (state, dir)
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let (state, _dir) = test_state(None).await;
        let router = create_router(state);
        let response = router
            .oneshot(axum::http::Request::builder().uri("/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_execution_with_unavailable_adapter_still_returns_created() {
        let (state, _dir) = test_state(None).await;
        let router = create_router(state);
        let body = json!({
            "agent_type": "does-not-exist",
            "prompt": "hello",
            "workspace_root": "/tmp/workspace",
        });
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/executions")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: ExecutionResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.execution.status, ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn get_unknown_execution_is_not_found() {
        let (state, _dir) = test_state(None).await;
        let router = create_router(state);
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/executions/{}", Id::new()))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn federation_info_reports_capabilities() {
        let (state, _dir) = test_state(None).await;
        let router = create_router(state);
        let response = router
            .oneshot(axum::http::Request::builder().uri("/federation/info").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let info: crate::federation::InfoReply = serde_json::from_slice(&bytes).unwrap();
        assert!(info.entity_types.contains(&"issue".to_string()));
    }

    #[tokio::test]
    async fn auth_token_rejects_missing_bearer() {
        let (state, _dir) = test_state(Some("secret".to_string())).await;
        let router = create_router(state);
        let response = router
            .oneshot(axum::http::Request::builder().uri("/executions").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
