//! Router, handlers and server lifecycle.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::{created, success};
use crate::db::Database;
use crate::error::{ApiError, ApiResult};
use crate::ports::{PortAllocator, PortRemark, PortStore};
use crate::types::{AiStatus, AiStatusUpdate, Priority, ProjectStatus, ProjectUpdate, TaskUpdate};

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    db: Arc<Database>,
    allocator: PortAllocator,
}

impl AppState {
    pub fn new(db: Arc<Database>, allocator: PortAllocator) -> Self {
        Self { db, allocator }
    }

    /// Build state with an allocator running against the same database.
    pub fn with_port_config(db: Arc<Database>, ports: crate::config::PortConfig) -> Self {
        let store: Arc<dyn PortStore> = db.clone();
        let allocator = PortAllocator::new(store, ports);
        Self::new(db, allocator)
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    let Json(body) = payload?;
    Ok(body)
}

// Health

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Response {
    success(
        HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        },
        "ok",
    )
}

async fn health_db(State(state): State<AppState>) -> Response {
    match state.db().health_check() {
        Ok(()) => success(serde_json::json!({ "database": "ok" }), "ok"),
        Err(e) => {
            error!("database health check failed: {}", e);
            let body = super::Envelope {
                code: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                msg: format!("database unavailable: {}", e),
                data: Some(serde_json::json!({ "database": "error" })),
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
    }
}

// Projects

#[derive(Debug, Deserialize)]
struct CreateProjectRequest {
    name: Option<String>,
    cursor_key: Option<String>,
    description: Option<String>,
    status: Option<ProjectStatus>,
}

async fn list_projects(State(state): State<AppState>) -> ApiResult<Response> {
    let projects = state.db().list_projects()?;
    Ok(success(projects, "ok"))
}

async fn create_project(
    State(state): State<AppState>,
    payload: Result<Json<CreateProjectRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let req = json_body(payload)?;
    let name = req.name.ok_or_else(|| ApiError::missing_field("name"))?;
    let project = state
        .db()
        .create_project(&name, req.cursor_key, req.description, req.status)?;
    info!(project_id = %project.id, "created project");
    Ok(created(project, "project created"))
}

async fn update_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ProjectUpdate>, JsonRejection>,
) -> ApiResult<Response> {
    let update = json_body(payload)?;
    let project = state
        .db()
        .update_project(&id, update)?
        .ok_or_else(|| ApiError::project_not_found(&id))?;
    Ok(success(project, "project updated"))
}

async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    if !state.db().delete_project(&id)? {
        return Err(ApiError::project_not_found(&id));
    }
    info!(project_id = %id, "deleted project");
    Ok(success(serde_json::Value::Null, "project deleted"))
}

async fn project_details(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let details = state
        .db()
        .get_project_details(&id)?
        .ok_or_else(|| ApiError::project_not_found(&id))?;
    Ok(success(details, "ok"))
}

// AI status

#[derive(Debug, Deserialize)]
struct StopAiRequest {
    status: AiStatus,
}

async fn update_ai_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<AiStatusUpdate>, JsonRejection>,
) -> ApiResult<Response> {
    let update = json_body(payload)?;
    ai_status_response(&state, &id, state.db().update_ai_status(&id, update)?)
}

async fn start_ai(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    ai_status_response(&state, &id, state.db().start_ai(&id)?)
}

async fn stop_ai(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<StopAiRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let req = json_body(payload)?;
    ai_status_response(&state, &id, state.db().stop_ai(&id, req.status)?)
}

fn ai_status_response(state: &AppState, id: &str, found: bool) -> ApiResult<Response> {
    if !found {
        return Err(ApiError::project_not_found(id));
    }
    let project = state
        .db()
        .get_project(id)?
        .ok_or_else(|| ApiError::project_not_found(id))?;
    Ok(success(project, "ai status updated"))
}

async fn running_ai(State(state): State<AppState>) -> ApiResult<Response> {
    let running = state.db().list_running_ai()?;
    Ok(success(running, "ok"))
}

// Ports

#[derive(Debug, Default, Deserialize)]
struct AllocatePortsRequest {
    count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UpdateRemarksRequest {
    ports: Vec<PortRemark>,
}

async fn get_ports(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let ports = state.allocator().get_allocated_ports(&id)?;
    Ok(success(ports, "ok"))
}

/// The body is optional; an empty body allocates the configured default.
async fn allocate_ports(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let req: AllocatePortsRequest = if body.iter().all(u8::is_ascii_whitespace) {
        AllocatePortsRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::invalid_value("count", &e.to_string()))?
    };

    let allocator = state.allocator();
    let count = req
        .count
        .unwrap_or_else(|| i64::from(allocator.config().default_count));
    let ports = allocator.allocate(&id, count).await?;
    Ok(created(ports, "ports allocated"))
}

async fn update_port_remarks(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateRemarksRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let req = json_body(payload)?;
    if req.ports.is_empty() {
        return Err(ApiError::missing_field("ports"));
    }
    let ports = state.allocator().update_remarks(&id, &req.ports)?;
    Ok(success(ports, "port remarks updated"))
}

// Tasks

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    title: Option<String>,
    project_id: Option<String>,
    priority: Option<Priority>,
}

#[derive(Debug, Deserialize)]
struct TaskOrderRequest {
    order: i64,
}

async fn list_tasks(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Response> {
    if state.db().get_project(&project_id)?.is_none() {
        return Err(ApiError::project_not_found(&project_id));
    }
    let tasks = state.db().list_tasks(&project_id)?;
    Ok(success(tasks, "ok"))
}

async fn create_task(
    State(state): State<AppState>,
    payload: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let req = json_body(payload)?;
    let project_id = req
        .project_id
        .ok_or_else(|| ApiError::missing_field("project_id"))?;
    let title = req.title.ok_or_else(|| ApiError::missing_field("title"))?;
    let task = state.db().create_task(&project_id, &title, req.priority)?;
    Ok(created(task, "task created"))
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<TaskUpdate>, JsonRejection>,
) -> ApiResult<Response> {
    let update = json_body(payload)?;
    let task = state
        .db()
        .update_task(&id, update)?
        .ok_or_else(|| ApiError::task_not_found(&id))?;
    Ok(success(task, "task updated"))
}

async fn delete_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    if !state.db().delete_task(&id)? {
        return Err(ApiError::task_not_found(&id));
    }
    Ok(success(serde_json::Value::Null, "task deleted"))
}

async fn set_task_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<TaskOrderRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let req = json_body(payload)?;
    let task = state
        .db()
        .set_task_order(&id, req.order)?
        .ok_or_else(|| ApiError::task_not_found(&id))?;
    Ok(success(task, "task updated"))
}

async fn active_tasks(State(state): State<AppState>) -> ApiResult<Response> {
    let tasks = state.db().list_active_tasks()?;
    Ok(success(tasks, "ok"))
}

/// Build the router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/health/db", get(health_db))
        // Projects
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/ai-status/running", get(running_ai))
        .route(
            "/api/projects/{id}",
            put(update_project).delete(delete_project),
        )
        .route("/api/projects/{id}/details", get(project_details))
        .route("/api/projects/{id}/ai-status", put(update_ai_status))
        .route("/api/projects/{id}/ai-status-start", post(start_ai))
        .route("/api/projects/{id}/ai-status-stop", post(stop_ai))
        .route(
            "/api/projects/{id}/ports",
            get(get_ports)
                .post(allocate_ports)
                .put(update_port_remarks),
        )
        // Tasks
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/active", get(active_tasks))
        .route("/api/tasks/project/{project_id}", get(list_tasks))
        .route("/api/tasks/{id}", put(update_task).delete(delete_task))
        .route("/api/tasks/{id}/order", put(set_task_order))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A running server.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            error!("server task failed: {}", e);
        }
    }
}

/// Bind `host:port` and serve in the background.
pub async fn start_server(state: AppState, host: &str, port: u16) -> anyhow::Result<ServerHandle> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    let addr = listener.local_addr()?;

    info!("listening on http://{}", addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                info!("server shutting down");
            })
            .await
        {
            error!("server error: {}", e);
        }
    });

    Ok(ServerHandle {
        addr,
        shutdown_tx,
        task,
    })
}
