//! cronflow-gateway: HTTP + WebSocket front of the job engine.
//!
//! Provides:
//! - REST API over jobs, edges, categories, settings, history and tasks
//! - Webhook trigger (`POST /webhook/{job_id}`)
//! - WebSocket event stream with optional client targeting
//! - Bearer token authentication
//! - HTTP health check endpoint

pub mod api;
pub mod error;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tracing::{info, warn};

use cronflow_config::CronflowConfig;
use cronflow_engine::{Engine, notifier_from_config};
use cronflow_events::EventBus;
use cronflow_storage::JobStore;
use cronflow_tasks::{CommandHandler, DailyNoteVault, TaskQueue, VaultSectionHandler};

/// Shared gateway state.
pub struct GatewayState {
    pub engine: Arc<Engine>,
    pub tasks: Arc<TaskQueue>,
    pub events: Arc<EventBus>,
    pub auth_token: Option<String>,
}

impl GatewayState {
    /// Open storage and assemble the engine and task queue from `config`.
    /// Nothing is scheduled yet.
    pub async fn from_config(config: &CronflowConfig) -> anyhow::Result<Self> {
        let db_path = config.database_path()?;
        if let Some(dir) = db_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let store = Arc::new(JobStore::open(&db_path)?);

        let events = Arc::new(EventBus::new());
        let engine = Engine::builder(Arc::clone(&store), Arc::clone(&events))
            .config(config.engine.clone())
            .notifier(notifier_from_config(&config.notifications))
            .build()
            .await?;

        let vault = DailyNoteVault::from_config(&config.vault);
        let mut tasks = TaskQueue::new(
            Arc::clone(&events),
            Duration::from_secs(config.tasks.retention_secs),
        );
        tasks.register(Arc::new(CommandHandler::new(vault.clone())));
        if let Some(vault) = vault {
            tasks.register(Arc::new(VaultSectionHandler::new(vault)));
        }

        Ok(Self {
            engine,
            tasks: Arc::new(tasks),
            events,
            auth_token: config.server.auth_token.clone(),
        })
    }
}

/// Start the gateway server and the engine's background work.
pub async fn start_gateway(config: CronflowConfig, port_override: Option<u16>) -> anyhow::Result<()> {
    let port = port_override.unwrap_or(config.server.port);
    let host = config.server.host.clone();

    let state = Arc::new(GatewayState::from_config(&config).await?);
    let scheduled = state.engine.schedule_all().await?;
    let _reaper = state
        .tasks
        .spawn_reaper(Duration::from_secs(config.tasks.reap_interval_secs));

    let app = build_router(Arc::clone(&state));
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("Gateway listening on {addr}");
    info!("  API:       http://{addr}/api");
    info!("  WebSocket: ws://{addr}/ws");
    info!("  Health:    http://{addr}/health");
    info!("  Schedules: {scheduled} armed");
    if state.auth_token.is_none() {
        warn!("No auth token configured; API is open");
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}

/// Assemble the full router.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    let protected = Router::new()
        .route("/api/jobs", get(api::list_jobs).post(api::create_job))
        .route(
            "/api/jobs/{id}",
            get(api::get_job).put(api::update_job).delete(api::delete_job),
        )
        .route("/api/jobs/{id}/run", post(api::run_job))
        .route("/api/jobs/{id}/schedule-once", post(api::schedule_once))
        .route("/api/running", get(api::running))
        .route("/api/schedules", get(api::schedules))
        .route("/api/edges", get(api::list_edges).post(api::add_edge))
        .route("/api/edges/{id}", axum::routing::delete(api::remove_edge))
        .route(
            "/api/categories",
            get(api::list_categories).post(api::save_category),
        )
        .route(
            "/api/categories/{id}",
            axum::routing::delete(api::delete_category),
        )
        .route(
            "/api/settings",
            get(api::get_settings).put(api::update_settings),
        )
        .route("/api/history", get(api::list_history))
        .route("/api/history/{id}", get(api::get_history))
        .route("/api/tasks", get(api::list_tasks).post(api::submit_task))
        .route(
            "/api/tasks/{id}",
            get(api::get_task).delete(api::cancel_task),
        )
        .route("/webhook/{job_id}", post(api::webhook))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_token,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .merge(protected)
        .with_state(state)
}

/// GET /health: liveness plus the number of running jobs.
async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "running": state.engine.running().len(),
    }))
}

/// Reject requests without the configured bearer token.
async fn require_token(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.auth_token {
        match extract_bearer_token(&headers) {
            Some(token) if token == expected => {}
            _ => {
                warn!(path = %request.uri().path(), "API authentication failed");
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
    }
    next.run(request).await
}

/// Query parameters for WebSocket connection.
#[derive(Deserialize, Default)]
struct WsQuery {
    token: Option<String>,
    client_id: Option<String>,
}

/// GET /ws: WebSocket upgrade with optional bearer token authentication.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    if let Some(expected_token) = &state.auth_token {
        let provided_token = extract_bearer_token(&headers).or(query.token.as_deref());

        match provided_token {
            Some(token) if token == expected_token => {}
            _ => {
                warn!("WebSocket authentication failed");
                return Err(StatusCode::UNAUTHORIZED);
            }
        }
    }

    let events = Arc::clone(&state.events);
    Ok(ws.on_upgrade(move |socket| ws::handle_ws_connection(socket, events, query.client_id)))
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    async fn test_state(auth_token: Option<&str>) -> Arc<GatewayState> {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let events = Arc::new(EventBus::new());
        let engine = Engine::builder(store, Arc::clone(&events))
            .build()
            .await
            .unwrap();
        let mut tasks = TaskQueue::new(Arc::clone(&events), Duration::from_secs(60));
        tasks.register(Arc::new(CommandHandler::new(None)));
        Arc::new(GatewayState {
            engine,
            tasks: Arc::new(tasks),
            events,
            auth_token: auth_token.map(String::from),
        })
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> HttpRequest<Body> {
        let builder = HttpRequest::builder().method(method).uri(uri);
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(state: &Arc<GatewayState>, req: HttpRequest<Body>) -> (StatusCode, Value) {
        let response = build_router(Arc::clone(state)).oneshot(req).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_from_config_creates_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join("nested").join("data");
        let config = CronflowConfig {
            data_dir: Some(data_dir.clone()),
            ..Default::default()
        };

        let state = GatewayState::from_config(&config).await.unwrap();
        assert!(data_dir.join("cronflow.db").exists());
        assert!(state.engine.list_jobs().await.unwrap().is_empty());
    }

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer my-secret-token".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("my-secret-token"));
    }

    #[test]
    fn test_extract_bearer_token_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic abc123".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let state = test_state(Some("secret")).await;
        let (status, body) = send(&state, request("GET", "/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_api_requires_token() {
        let state = test_state(Some("secret")).await;
        let (status, _) = send(&state, request("GET", "/api/jobs", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&state, request("POST", "/webhook/x", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let mut req = request("GET", "/api/jobs", None);
        req.headers_mut()
            .insert("authorization", "Bearer secret".parse().unwrap());
        let (status, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_job_crud() {
        let state = test_state(None).await;
        let job = json!({"name": "Daily Report", "command": "echo report", "schedule": "0 9 * * 1-5"});

        let (status, created) = send(&state, request("POST", "/api/jobs", Some(job.clone()))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["id"], "daily-report");

        let (status, _) = send(&state, request("POST", "/api/jobs", Some(job))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, fetched) = send(&state, request("GET", "/api/jobs/daily-report", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["command"], "echo report");

        let (_, schedules) = send(&state, request("GET", "/api/schedules", None)).await;
        assert_eq!(schedules[0]["job_id"], "daily-report");

        let (status, _) = send(&state, request("DELETE", "/api/jobs/daily-report", None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&state, request("GET", "/api/jobs/daily-report", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("daily-report"));
    }

    #[tokio::test]
    async fn test_invalid_cron_rejected() {
        let state = test_state(None).await;
        let job = json!({"id": "bad", "name": "Bad", "command": "true", "schedule": "61 * * * *"});
        let (status, _) = send(&state, request("POST", "/api/jobs", Some(job))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, jobs) = send(&state, request("GET", "/api/jobs", None)).await;
        assert_eq!(jobs, json!([]));
    }

    #[tokio::test]
    async fn test_run_unknown_job_is_not_found() {
        let state = test_state(None).await;
        let (status, _) = send(&state, request("POST", "/api/jobs/ghost/run", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webhook_runs_job() {
        let state = test_state(None).await;
        let job = json!({"id": "hook", "name": "Hook", "command": "echo hooked"});
        send(&state, request("POST", "/api/jobs", Some(job))).await;

        let (status, body) = send(&state, request("POST", "/webhook/hook", Some(json!({})))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "started");

        let mut records = Vec::new();
        for _ in 0..200 {
            records = state.engine.list_executions(Some("hook"), 10).await;
            let finished = records
                .first()
                .is_some_and(|r| r.status != cronflow_types::RunStatus::Running);
            if finished {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(records[0].trigger, cronflow_types::TriggerKind::Webhook);
        assert_eq!(records[0].stdout, "hooked\n");
    }

    #[tokio::test]
    async fn test_run_body_must_be_json() {
        let state = test_state(None).await;
        let job = json!({"id": "plain", "name": "Plain", "command": "true"});
        send(&state, request("POST", "/api/jobs", Some(job))).await;

        let req = HttpRequest::builder()
            .method("POST")
            .uri("/api/jobs/plain/run")
            .body(Body::from("not json"))
            .unwrap();
        let (status, _) = send(&state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_schedule_once_bad_timestamp() {
        let state = test_state(None).await;
        let job = json!({"id": "later", "name": "Later", "command": "true"});
        send(&state, request("POST", "/api/jobs", Some(job))).await;

        let (status, _) = send(
            &state,
            request("POST", "/api/jobs/later/schedule-once", Some(json!({"at": "tomorrow"}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_edge_to_missing_job() {
        let state = test_state(None).await;
        let edge = json!({"from": "a", "to": "b", "trigger": true});
        let (status, _) = send(&state, request("POST", "/api/edges", Some(edge))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_submit_unknown_task_type() {
        let state = test_state(None).await;
        let (status, body) = send(
            &state,
            request("POST", "/api/tasks", Some(json!({"type": "nope", "payload": {}}))),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "failed");

        let id = body["task_id"].as_str().unwrap();
        let (status, task) = send(&state, request("GET", &format!("/api/tasks/{id}"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["error"], "Unknown task type: nope");
    }

    #[tokio::test]
    async fn test_cancel_missing_task() {
        let state = test_state(None).await;
        let (status, _) = send(&state, request("DELETE", "/api/tasks/task-x", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
