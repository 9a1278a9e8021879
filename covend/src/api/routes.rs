//! Request handlers - a thin shell over the state store and scheduler.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::scheduler::ApproveOutcome;

use super::error::ApiError;
use super::sse::events;
use super::AppState;

/// Build the full route table
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/state", get(full_state))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/start", post(start_task))
        .route("/tasks/{id}/kill", post(kill_agent))
        .route("/agents", get(list_agents))
        .route("/agents/{id}", get(get_agent))
        .route("/agents/{id}/output", get(agent_output))
        .route("/agents/{id}/kill", post(kill_agent))
        .route("/questions", get(list_questions))
        .route("/questions/{id}/answer", post(answer_question))
        .route("/workflows", get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/approve", post(approve_workflow))
        .route("/workflows/{id}/reject", post(reject_workflow))
        .route("/session/start", post(session_start))
        .route("/session/stop", post(session_stop))
        .route("/events", get(events))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("GIT_DESCRIBE"),
        "uptime": state.started_at.elapsed().as_secs(),
        "workspace": state.paths.workspace().display().to_string(),
    }))
}

async fn full_state(State(state): State<AppState>) -> Json<crate::state::StateSnapshot> {
    Json(state.store.snapshot())
}

async fn list_tasks(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "tasks": state.store.get_tasks() }))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let task = state
        .store
        .get_task(&id)
        .ok_or_else(|| ApiError::NotFound(format!("unknown task: {id}")))?;
    Ok(Json(json!({ "task": task })))
}

async fn start_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    state.scheduler.start_task(&id).await?;
    Ok(Json(json!({ "status": "starting", "taskId": id })))
}

async fn kill_agent(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    if !state.scheduler.kill_agent(&id).await {
        return Err(ApiError::NotFound(format!("no running agent for {id}")));
    }
    Ok(Json(json!({ "status": "killing", "taskId": id })))
}

async fn list_agents(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "agents": state.store.get_agents() }))
}

async fn get_agent(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let agent = state
        .store
        .get_agent(&id)
        .ok_or_else(|| ApiError::NotFound(format!("no agent for {id}")))?;
    Ok(Json(json!({ "agent": agent })))
}

#[derive(Debug, Deserialize)]
struct OutputParams {
    lines: Option<usize>,
}

async fn agent_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<OutputParams>,
) -> Result<Json<Value>, ApiError> {
    let log_path = state.paths.output_log(&id);
    if !log_path.exists() && state.store.get_agent(&id).is_none() {
        return Err(ApiError::NotFound(format!("no agent output for {id}")));
    }

    let content = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
    let wanted = params.lines.unwrap_or(100);
    let lines: Vec<&str> = content.lines().collect();
    let tail: Vec<String> = lines
        .iter()
        .skip(lines.len().saturating_sub(wanted))
        .map(|l| l.to_string())
        .collect();

    Ok(Json(json!({ "taskId": id, "lines": tail })))
}

async fn list_questions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "questions": state.store.get_questions() }))
}

#[derive(Debug, Deserialize)]
struct AnswerBody {
    answer: String,
}

async fn answer_question(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AnswerBody>,
) -> Result<Json<Value>, ApiError> {
    let question = state
        .store
        .answer_question(&id, &body.answer)
        .ok_or_else(|| ApiError::NotFound(format!("unknown question: {id}")))?;

    // Forward to the asking agent's stdin when it is still running
    let delivered = state.answers.deliver(&question.task_id, &question.id, &body.answer);
    Ok(Json(json!({ "question": question, "delivered": delivered })))
}

async fn list_workflows(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "workflows": state.store.get_workflows() }))
}

/// Workflows resolve by task id or by `wf-...` run id
fn resolve_workflow_task(state: &AppState, id: &str) -> Option<String> {
    if let Some(workflow) = state.store.find_workflow(id) {
        return Some(workflow.task_id);
    }
    // Fall back to disk: a freshly restarted daemon may not have the run
    // in its cache yet
    state.persister.load(id).ok().flatten().map(|s| s.task_id)
}

async fn get_workflow(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    if let Some(workflow) = state.store.find_workflow(&id) {
        return Ok(Json(json!({ "workflow": workflow })));
    }
    let workflow = state
        .persister
        .load(&id)
        .ok()
        .flatten()
        .ok_or_else(|| ApiError::NotFound(format!("unknown workflow: {id}")))?;
    Ok(Json(json!({ "workflow": workflow })))
}

#[derive(Debug, Default, Deserialize)]
struct ApproveBody {
    feedback: Option<String>,
}

/// Approve/reject bodies are optional; tolerate an empty or absent body
fn parse_body<T: Default + serde::de::DeserializeOwned>(bytes: &axum::body::Bytes) -> T {
    if bytes.is_empty() {
        return T::default();
    }
    serde_json::from_slice(bytes).unwrap_or_default()
}

async fn approve_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    bytes: axum::body::Bytes,
) -> Result<axum::response::Response, ApiError> {
    use axum::response::IntoResponse;

    let task_id = resolve_workflow_task(&state, &id).ok_or_else(|| ApiError::NotFound(format!("unknown workflow: {id}")))?;
    let feedback = parse_body::<ApproveBody>(&bytes).feedback;

    match state.scheduler.approve_merge(&task_id, feedback).await? {
        ApproveOutcome::Merged { commit } => {
            Ok(Json(json!({ "status": "merged", "commit": commit, "taskId": task_id })).into_response())
        }
        ApproveOutcome::Conflicts { files } => Ok((
            axum::http::StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "status": "conflicts",
                "hasConflicts": true,
                "conflictFiles": files,
            })),
        )
            .into_response()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RejectBody {
    reason: Option<String>,
}

async fn reject_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    bytes: axum::body::Bytes,
) -> Result<Json<Value>, ApiError> {
    let task_id = resolve_workflow_task(&state, &id).ok_or_else(|| ApiError::NotFound(format!("unknown workflow: {id}")))?;
    let reason = parse_body::<RejectBody>(&bytes).reason;
    state.scheduler.reject_merge(&task_id, reason).await?;
    Ok(Json(json!({ "status": "blocked", "taskId": task_id })))
}

async fn session_start(State(state): State<AppState>) -> Json<Value> {
    state.scheduler.start().await;
    Json(json!({ "status": "started" }))
}

async fn session_stop(State(state): State<AppState>) -> Json<Value> {
    state.scheduler.stop().await;
    Json(json!({ "status": "stopped" }))
}
