//! REST and WebSocket endpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Request, State, ws::WebSocketUpgrade},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{QueueError, WorkflowError};
use crate::events::{EventBroadcaster, ws};
use crate::queue::{NewTask, Task, TaskQueue};
use crate::resilience::{CircuitBreakerRegistry, RateLimiter};
use crate::workflow::{Context, StepExecutionRecord, WorkflowDefinition, WorkflowEngine, WorkflowExecution};

/// Header identifying the caller for rate limiting.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<TaskQueue>,
    pub engine: Arc<WorkflowEngine>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
}

/// Build the router with every REST route and the `/ws` endpoint.
pub fn api_routes(state: AppState) -> Router {
    let submit = Router::new()
        .route("/tasks", post(submit_task))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .merge(submit)
        .route("/tasks/{id}", get(get_task))
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/start", post(start_workflow))
        .route("/executions/{id}", get(get_execution).patch(control_execution))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Error body `{"error": ...}` with a matching status code.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Conflict(m) => (StatusCode::CONFLICT, m),
            Self::Unavailable(m) => {
                error!(error = %m, "Request failed, store unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, m)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Validation(_) => Self::BadRequest(err.to_string()),
            QueueError::NotFound { .. } => Self::NotFound(err.to_string()),
            QueueError::Unavailable(_) => Self::Unavailable(err.to_string()),
        }
    }
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::DefinitionNotFound { .. } | WorkflowError::ExecutionNotFound { .. } => {
                Self::NotFound(err.to_string())
            }
            WorkflowError::InvalidDefinition(_) => Self::BadRequest(err.to_string()),
            WorkflowError::NotStartable { .. } | WorkflowError::InvalidTransition { .. } => {
                Self::Conflict(err.to_string())
            }
            WorkflowError::Database(_) => Self::Unavailable(err.to_string()),
            WorkflowError::Queue(e) => e.into(),
        }
    }
}

fn parse_id(id: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::BadRequest(format!("Invalid {what} ID")))
}

// ── Rate limiting ───────────────────────────────────────────────────────

async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let client_id = req
        .headers()
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous")
        .to_string();

    match state.rate_limiter.check(&client_id) {
        Ok(()) => next.run(req).await,
        Err(throttled) => {
            let retry_after = throttled.retry_after.as_secs().max(1);
            info!(client_id = %client_id, retry_after, "Request rate limited");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after.to_string())],
                Json(json!({ "error": "Too many requests", "retry_after": retry_after })),
            )
                .into_response()
        }
    }
}

// ── Tasks ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    #[serde(rename = "type")]
    task_type: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    priority: i64,
    max_attempts: Option<u32>,
}

async fn submit_task(
    State(state): State<AppState>,
    Json(body): Json<SubmitTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut new = NewTask::new(body.task_type, body.payload).with_priority(body.priority);
    new.max_attempts = body.max_attempts;
    let task = state.queue.enqueue(new).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": task.id, "job_id": task.id, "status": task.status })),
    ))
}

/// Public view of a task.
#[derive(Debug, Serialize)]
struct TaskView {
    task_id: Uuid,
    #[serde(rename = "type")]
    task_type: String,
    status: crate::queue::TaskStatus,
    attempt: u32,
    max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<serde_json::Value>,
    enqueued_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type,
            status: task.status,
            attempt: task.attempt,
            max_attempts: task.max_attempts,
            error: task.last_error,
            output: task.output,
            enqueued_at: task.enqueued_at,
            updated_at: task.updated_at,
        }
    }
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    let task_id = parse_id(&id, "task")?;
    let task = state
        .queue
        .get(task_id)
        .await?
        .ok_or(QueueError::NotFound { id: task_id })?;
    Ok(Json(task.into()))
}

// ── Workflows ───────────────────────────────────────────────────────────

async fn create_workflow(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> Result<impl IntoResponse, ApiError> {
    let definition = state.engine.register_definition(definition).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "workflow_id": definition.id })),
    ))
}

async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkflowDefinition>>, ApiError> {
    Ok(Json(state.engine.list_definitions().await?))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    Ok(Json(state.engine.get_definition(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    #[serde(default)]
    input: Context,
}

async fn start_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<StartRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let input = body.map(|Json(b)| b.input).unwrap_or_default();
    let execution = state.engine.start(&id, input).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "execution_id": execution.id, "status": execution.status })),
    ))
}

// ── Executions ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ExecutionView {
    #[serde(flatten)]
    execution: WorkflowExecution,
    progress: f64,
    steps: Vec<StepExecutionRecord>,
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionView>, ApiError> {
    let execution_id = parse_id(&id, "execution")?;
    let execution = state.engine.get_execution(execution_id).await?;
    let steps = state.engine.list_step_records(execution_id).await?;
    Ok(Json(ExecutionView {
        progress: execution.progress_percent(),
        execution,
        steps,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ControlAction {
    Pause,
    Resume,
    Abort,
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    action: ControlAction,
}

async fn control_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ControlRequest>,
) -> Result<Json<WorkflowExecution>, ApiError> {
    let execution_id = parse_id(&id, "execution")?;
    let execution = match body.action {
        ControlAction::Pause => state.engine.pause(execution_id).await?,
        ControlAction::Resume => state.engine.resume(execution_id).await?,
        ControlAction::Abort => state.engine.abort(execution_id).await?,
    };
    Ok(Json(execution))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Response {
    match state.queue.stats().await {
        Ok(stats) => Json(json!({
            "status": "ok",
            "service": "arq-orchestrator",
            "queue": stats,
            "breakers": state.breakers.snapshots(),
            "subscribers": state.broadcaster.subscriber_count(),
            "active_executions": state.engine.active_count(),
        }))
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(move |socket| ws::handle_socket(socket, state.broadcaster))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, QueueConfig, RateLimitConfig, RetryConfig, WorkflowConfig};
    use crate::store::{Database, LibSqlBackend};
    use crate::workflow::{SetStep, StepExecutor};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app(max_requests: u32) -> (Router, AppState) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let broadcaster = Arc::new(EventBroadcaster::new());
        let queue = TaskQueue::new(
            Arc::clone(&store),
            Arc::clone(&broadcaster),
            QueueConfig::default(),
            RetryConfig::default(),
        );
        let executor = Arc::new(StepExecutor::new(Duration::from_secs(5)));
        executor.register(Arc::new(SetStep));
        let engine = WorkflowEngine::new(
            store,
            Arc::clone(&queue),
            executor,
            Arc::clone(&broadcaster),
            WorkflowConfig::default(),
        );
        let state = AppState {
            queue,
            engine,
            broadcaster,
            breakers: Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default())),
            rate_limiter: Arc::new(RateLimiter::new(RateLimitConfig {
                max_requests,
                window: Duration::from_secs(60),
            })),
        };
        (api_routes(state.clone()), state)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(CLIENT_ID_HEADER, "tester")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn submit_then_fetch_task() {
        let (app, _) = app(10).await;
        let response = app
            .clone()
            .oneshot(json_request("POST", "/tasks", json!({"type": "noop", "payload": {"a": 1}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["task_id"], body["job_id"]);

        let id = body["task_id"].as_str().unwrap();
        let response = app.oneshot(get_request(&format!("/tasks/{id}"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let task = body_json(response).await;
        assert_eq!(task["status"], "queued");
        assert_eq!(task["attempt"], 0);
        assert_eq!(task["max_attempts"], 3);
    }

    #[tokio::test]
    async fn invalid_submissions_are_rejected() {
        let (app, _) = app(10).await;
        let response = app
            .clone()
            .oneshot(json_request("POST", "/tasks", json!({"type": "", "payload": {}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].is_string());

        let response = app.clone().oneshot(get_request("/tasks/not-a-uuid")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(get_request(&format!("/tasks/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn submissions_are_rate_limited_per_client() {
        let (app, _) = app(2).await;
        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(json_request("POST", "/tasks", json!({"type": "noop"})))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }
        let response = app
            .clone()
            .oneshot(json_request("POST", "/tasks", json!({"type": "noop"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));

        // Reads are not limited
        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn workflow_lifecycle_over_http() {
        let (app, _) = app(10).await;
        let definition = json!({
            "name": "greet",
            "steps": [
                {"id": "hello", "type": "set", "order": 1, "config": {"values": {"greeting": "hi"}}},
                {"id": "bye", "type": "set", "order": 2}
            ]
        });
        let response = app
            .clone()
            .oneshot(json_request("POST", "/workflows", definition))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let workflow_id = body_json(response).await["workflow_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .clone()
            .oneshot(get_request(&format!("/workflows/{workflow_id}")))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["name"], "greet");

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/workflows/{workflow_id}/start"),
                json!({"input": {"user": "ada"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let execution_id = body_json(response).await["execution_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .clone()
            .oneshot(get_request(&format!("/executions/{execution_id}")))
            .await
            .unwrap();
        let view = body_json(response).await;
        assert_eq!(view["status"], "running");
        assert_eq!(view["context"]["user"], "ada");
        assert_eq!(view["steps"].as_array().unwrap().len(), 2);

        let response = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                &format!("/executions/{execution_id}"),
                json!({"action": "pause"}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"], "paused");

        let response = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                &format!("/executions/{execution_id}"),
                json!({"action": "pause"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .oneshot(json_request(
                "PATCH",
                &format!("/executions/{execution_id}"),
                json!({"action": "abort"}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"], "aborted");
    }

    #[tokio::test]
    async fn invalid_workflow_is_bad_request() {
        let (app, _) = app(10).await;
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/workflows",
                json!({"name": "bad", "steps": [{"id": "a", "type": "browser"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(json_request("POST", "/workflows/missing/start", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_queue_and_breakers() {
        let (app, state) = app(10).await;
        state.breakers.get("mailer");
        state
            .queue
            .enqueue(NewTask::new("noop", json!({})))
            .await
            .unwrap();

        let response = app.oneshot(get_request("/health")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["queue"]["queued"], 1);
        assert_eq!(body["breakers"][0]["service"], "mailer");
        assert_eq!(body["breakers"][0]["state"], "closed");
    }
}
