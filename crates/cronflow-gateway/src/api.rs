//! REST handlers for jobs, edges, categories, settings, history and tasks.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::info;

use cronflow_engine::{RunRequest, ScheduleInfo};
use cronflow_types::{Category, Edge, ExecutionRecord, GlobalSettings, Job, Task, TriggerKind};

use crate::GatewayState;
use crate::error::{ApiError, ApiResult};

const DEFAULT_HISTORY_LIMIT: usize = 50;

type AppState = State<Arc<GatewayState>>;

// ──────────────────── Jobs ────────────────────

pub async fn list_jobs(State(state): AppState) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(state.engine.list_jobs().await?))
}

pub async fn create_job(
    State(state): AppState,
    Json(job): Json<Job>,
) -> ApiResult<impl IntoResponse> {
    let job = state.engine.create_job(job).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn get_job(State(state): AppState, Path(id): Path<String>) -> ApiResult<Json<Job>> {
    state
        .engine
        .get_job(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Job not found: {id}")))
}

pub async fn update_job(
    State(state): AppState,
    Path(id): Path<String>,
    Json(job): Json<Job>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.engine.update_job(&id, job).await?))
}

pub async fn delete_job(State(state): AppState, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.engine.delete_job(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Body of a run or webhook request. Empty bodies mean "no overrides".
#[derive(Debug, Default, Deserialize)]
struct RunBody {
    #[serde(default)]
    options: Map<String, Value>,
}

fn parse_run_body(body: &Bytes) -> ApiResult<RunBody> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RunBody::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid run body: {e}")))
}

async fn start(
    state: &GatewayState,
    job_id: &str,
    trigger: TriggerKind,
    body: &Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let body = parse_run_body(body)?;
    let request = RunRequest::new(trigger).with_overrides(body.options);
    state.engine.start_job(job_id, request).await?;
    info!(job_id = %job_id, trigger = %trigger, "Run requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": job_id, "status": "started" })),
    ))
}

pub async fn run_job(
    State(state): AppState,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    start(&state, &id, TriggerKind::Manual, &body).await
}

/// `POST /webhook/{job_id}`.
pub async fn webhook(
    State(state): AppState,
    Path(job_id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    start(&state, &job_id, TriggerKind::Webhook, &body).await
}

#[derive(Debug, Deserialize)]
pub struct ScheduleOnceBody {
    /// RFC 3339 timestamp.
    at: String,
}

pub async fn schedule_once(
    State(state): AppState,
    Path(id): Path<String>,
    Json(body): Json<ScheduleOnceBody>,
) -> ApiResult<Json<Value>> {
    let at = state.engine.schedule_once(&id, &body.at).await?;
    Ok(Json(json!({ "job_id": id, "at": at })))
}

pub async fn running(State(state): AppState) -> Json<Value> {
    Json(json!({ "running": state.engine.running() }))
}

pub async fn schedules(State(state): AppState) -> Json<Vec<ScheduleInfo>> {
    Json(state.engine.scheduled())
}

// ──────────────────── Edges & categories ────────────────────

pub async fn list_edges(State(state): AppState) -> ApiResult<Json<Vec<Edge>>> {
    Ok(Json(state.engine.list_edges().await?))
}

pub async fn add_edge(
    State(state): AppState,
    Json(edge): Json<Edge>,
) -> ApiResult<impl IntoResponse> {
    let edge = state.engine.add_edge(edge).await?;
    Ok((StatusCode::CREATED, Json(edge)))
}

pub async fn remove_edge(
    State(state): AppState,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.remove_edge(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_categories(State(state): AppState) -> ApiResult<Json<Vec<Category>>> {
    Ok(Json(state.engine.list_categories().await?))
}

pub async fn save_category(
    State(state): AppState,
    Json(category): Json<Category>,
) -> ApiResult<Json<Category>> {
    Ok(Json(state.engine.save_category(category).await?))
}

pub async fn delete_category(
    State(state): AppState,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.engine.delete_category(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Category not found: {id}")))
    }
}

// ──────────────────── Settings & history ────────────────────

pub async fn get_settings(State(state): AppState) -> Json<GlobalSettings> {
    Json(state.engine.settings().await)
}

pub async fn update_settings(
    State(state): AppState,
    Json(settings): Json<GlobalSettings>,
) -> ApiResult<Json<GlobalSettings>> {
    Ok(Json(state.engine.update_settings(settings).await?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    job: Option<String>,
    limit: Option<usize>,
}

pub async fn list_history(
    State(state): AppState,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<ExecutionRecord>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Json(state.engine.list_executions(query.job.as_deref(), limit).await)
}

pub async fn get_history(
    State(state): AppState,
    Path(id): Path<String>,
) -> ApiResult<Json<ExecutionRecord>> {
    state
        .engine
        .get_execution(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Execution not found: {id}")))
}

// ──────────────────── Tasks ────────────────────

#[derive(Debug, Deserialize)]
pub struct SubmitTask {
    #[serde(rename = "type")]
    task_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    client_id: Option<String>,
}

pub async fn submit_task(
    State(state): AppState,
    Json(body): Json<SubmitTask>,
) -> impl IntoResponse {
    let task = state
        .tasks
        .submit(&body.task_type, body.payload, body.client_id)
        .await;
    (
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": task.id, "status": task.status })),
    )
}

pub async fn list_tasks(State(state): AppState) -> Json<Vec<Task>> {
    Json(state.tasks.list().await)
}

pub async fn get_task(State(state): AppState, Path(id): Path<String>) -> ApiResult<Json<Task>> {
    state
        .tasks
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Task not found: {id}")))
}

pub async fn cancel_task(State(state): AppState, Path(id): Path<String>) -> ApiResult<Json<Task>> {
    Ok(Json(state.tasks.cancel(&id).await?))
}
