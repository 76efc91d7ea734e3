//! HTTP routes for agent management, submit-and-poll jobs and streaming.
//!
//! The router has no prefix of its own; nest it wherever it should live.

use std::{convert::Infallible, sync::Arc};

use agent_jobs_core::{ExecutionStore, TaskContext, TaskEngine};
use agent_jobs_session::{AGENT_KIND, ExecuteRequest, ExecutionOrchestrator};
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    error::ApiError,
    protocol::{
        ActiveExecutions, AgentCreated, AgentExecuteRequest, CreateAgentRequest, ExecutionStarted,
        HealthResponse, MessageResponse, TaskResult,
    },
    relay::{FrameWriter, StreamRelay},
};

/// Shared handler state.
pub struct ApiState<S, E>
where
    S: ExecutionStore + 'static,
    E: TaskEngine + 'static,
{
    pub orchestrator: Arc<ExecutionOrchestrator<S, E>>,
}

impl<S, E> ApiState<S, E>
where
    S: ExecutionStore + 'static,
    E: TaskEngine + 'static,
{
    #[must_use]
    pub const fn new(orchestrator: Arc<ExecutionOrchestrator<S, E>>) -> Self {
        Self { orchestrator }
    }

    fn store(&self) -> &Arc<S> {
        self.orchestrator.store()
    }

    fn engine(&self) -> &Arc<E> {
        self.orchestrator.engine()
    }
}

impl<S, E> Clone for ApiState<S, E>
where
    S: ExecutionStore + 'static,
    E: TaskEngine + 'static,
{
    fn clone(&self) -> Self {
        Self {
            orchestrator: Arc::clone(&self.orchestrator),
        }
    }
}

/// Build the agent API router.
pub fn build_router<S, E>(state: ApiState<S, E>) -> Router
where
    S: ExecutionStore + 'static,
    E: TaskEngine + 'static,
{
    Router::new()
        .route("/", get(list_agents::<S, E>).post(create_agent::<S, E>))
        .route("/health", get(health::<S, E>))
        .route("/active", get(active_executions::<S, E>))
        .route("/execute", post(submit_execution::<S, E>))
        .route("/status/{execution_id}", get(execution_status::<S, E>))
        .route("/results/{execution_id}", get(execution_result::<S, E>))
        .route("/{agent_id}", get(agent_state::<S, E>))
        .route("/{agent_id}/execute", post(execute_agent_task::<S, E>))
        .route("/{agent_id}/reset", post(reset_agent::<S, E>))
        .with_state(state)
}

/// `GET /health`
pub async fn health<S, E>(State(state): State<ApiState<S, E>>) -> Result<Json<HealthResponse>, ApiError>
where
    S: ExecutionStore + 'static,
    E: TaskEngine + 'static,
{
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        completed_executions: state.store().completed_count().await?,
        active_executions: state.orchestrator.in_flight(),
    }))
}

async fn list_agents<S, E>(State(state): State<ApiState<S, E>>) -> Result<Response, ApiError>
where
    S: ExecutionStore + 'static,
    E: TaskEngine + 'static,
{
    Ok(Json(state.engine().all_agent_states().await?).into_response())
}

async fn create_agent<S, E>(
    State(state): State<ApiState<S, E>>,
    payload: Result<Json<CreateAgentRequest>, JsonRejection>,
) -> Result<Json<AgentCreated>, ApiError>
where
    S: ExecutionStore + 'static,
    E: TaskEngine + 'static,
{
    let Json(request) = payload?;
    if request.config_path.trim().is_empty() {
        return Err(ApiError::BadRequest("configPath is required".to_string()));
    }
    let agent_id = state
        .engine()
        .create_agent_from_config(&request.config_path)
        .await?;
    Ok(Json(AgentCreated {
        message: "Agent created successfully".to_string(),
        agent_id,
    }))
}

async fn active_executions<S, E>(
    State(state): State<ApiState<S, E>>,
) -> Result<Json<ActiveExecutions>, ApiError>
where
    S: ExecutionStore + 'static,
    E: TaskEngine + 'static,
{
    let prefix = format!("{AGENT_KIND}_");
    let executions = state
        .store()
        .list_active_ids()
        .await?
        .into_iter()
        .filter(|id| id.starts_with(&prefix))
        .collect();
    Ok(Json(ActiveExecutions { executions }))
}

async fn submit_execution<S, E>(
    State(state): State<ApiState<S, E>>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ExecutionStarted>), ApiError>
where
    S: ExecutionStore + 'static,
    E: TaskEngine + 'static,
{
    let Json(request) = payload?;
    let execution_id = state.orchestrator.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(ExecutionStarted::new(execution_id))))
}

async fn execution_status<S, E>(
    State(state): State<ApiState<S, E>>,
    Path(execution_id): Path<String>,
) -> Result<Response, ApiError>
where
    S: ExecutionStore + 'static,
    E: TaskEngine + 'static,
{
    match state.store().get(&execution_id).await? {
        Some(record) => Ok(Json(record).into_response()),
        None => Err(ApiError::NotFound("Execution not found".to_string())),
    }
}

async fn execution_result<S, E>(
    State(state): State<ApiState<S, E>>,
    Path(execution_id): Path<String>,
) -> Result<Response, ApiError>
where
    S: ExecutionStore + 'static,
    E: TaskEngine + 'static,
{
    match state.store().get_result(&execution_id).await? {
        Some(result) => Ok(Json(result).into_response()),
        None => Err(ApiError::NotFound(
            "Result not found or execution not completed".to_string(),
        )),
    }
}

async fn agent_state<S, E>(
    State(state): State<ApiState<S, E>>,
    Path(agent_id): Path<String>,
) -> Result<Response, ApiError>
where
    S: ExecutionStore + 'static,
    E: TaskEngine + 'static,
{
    match state.engine().agent_state(&agent_id).await? {
        Some(agent) => Ok(Json(agent).into_response()),
        None => Err(ApiError::NotFound("Agent not found".to_string())),
    }
}

async fn execute_agent_task<S, E>(
    State(state): State<ApiState<S, E>>,
    Path(agent_id): Path<String>,
    payload: Result<Json<AgentExecuteRequest>, JsonRejection>,
) -> Result<Response, ApiError>
where
    S: ExecutionStore + 'static,
    E: TaskEngine + 'static,
{
    let Json(request) = payload?;
    let context = request.context.unwrap_or_default();

    if !state.engine().has_agent(&agent_id).await {
        return Err(ApiError::NotFound("Agent not found".to_string()));
    }

    if request.stream {
        return Ok(stream_agent_task(Arc::clone(state.engine()), agent_id, request.task, context));
    }

    let result = state
        .engine()
        .execute_task(&agent_id, &request.task, context)
        .await?;
    Ok(Json(TaskResult { result }).into_response())
}

/// Attach a relay, then start the task, and answer with the relay's frames.
///
/// The task runs detached from the response: a client that goes away stops
/// the relay but not the engine.
fn stream_agent_task<E>(engine: Arc<E>, agent_id: String, task: String, context: TaskContext) -> Response
where
    E: TaskEngine + 'static,
{
    let (writer, frames) = FrameWriter::channel();
    let relay = StreamRelay::attach(agent_id.clone(), &engine.events(), writer);

    let execution = tokio::spawn(async move { engine.execute_task(&agent_id, &task, context).await });

    tokio::spawn(relay.run(async move {
        match execution.await {
            Ok(outcome) => outcome.map_err(|e| e.to_string()),
            Err(e) => Err(format!("execution aborted: {e}")),
        }
    }));

    let events = UnboundedReceiverStream::new(frames).map(|frame| Ok::<_, Infallible>(frame.to_sse_event()));
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

async fn reset_agent<S, E>(
    State(state): State<ApiState<S, E>>,
    Path(agent_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError>
where
    S: ExecutionStore + 'static,
    E: TaskEngine + 'static,
{
    state.engine().reset_agent(&agent_id).await?;
    Ok(Json(MessageResponse::new("Agent reset successfully")))
}
