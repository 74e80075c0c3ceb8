/**
 * DEPSYNC HTTP API - thin control plane over the coordinators
 *
 * ROLE:
 * Exposes catalog, update/install/uninstall dispatch, settings CRUD and task
 * polling. Every call is a pass-through: errors returned here are the
 * pre-dispatch ones (settings, nodes, storage); the outcome of a dispatched
 * task is read back through /tasks.
 *
 * ROUTES:
 * - /health, /system/health
 * - /{eco} (catalog or registry search), /{eco}/update|install|uninstall
 * - /settings, /settings/{id}, /settings/{id}/enable|disable
 * - /tasks, /tasks/{id}/logs, /nodes
 * - /workspaces/{reference}: manifest requirements checked against the cluster
 *
 * SECURITY:
 * - x-api-key header checked against DEPSYNC_API_KEY on every route but /health
 */

use crate::health::{HealthTracker, MasterHealth};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use depsync_core::catalog::{self, CatalogQuery, WorkspaceInspection};
use depsync_core::workspace::Workspace;
use depsync_core::{
    Coordinator, CoreError, DispatchReport, Ecosystem, InstallCommand, LogEntry, ManagerError,
    Node, NodeDirectory, RoundReport, Setting, Store, StoreError, Task, TaskTracker,
    WorkspaceError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Core(CoreError::SettingMissing(_)) | ApiError::Core(CoreError::UnknownNode(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Core(CoreError::EcosystemDisabled(_)) => StatusCode::CONFLICT,
            ApiError::Manager(_) => StatusCode::BAD_GATEWAY,
            ApiError::Workspace(WorkspaceError::InvalidReference(_)) => StatusCode::BAD_REQUEST,
            ApiError::Workspace(WorkspaceError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Workspace(
                WorkspaceError::InvalidRequirement { .. } | WorkspaceError::InvalidManifest { .. },
            ) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    pub total: usize,
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("DEPSYNC_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        warn!("DEPSYNC_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub coordinators: Arc<BTreeMap<Ecosystem, Arc<Coordinator>>>,
    pub tasks: TaskTracker,
    pub nodes: NodeDirectory,
    pub health: HealthTracker,
    pub workspace: Arc<dyn Workspace>,
}

impl AppState {
    fn coordinator(&self, eco: Ecosystem) -> Result<Arc<Coordinator>, ApiError> {
        self.coordinators.get(&eco).cloned().ok_or(ApiError::NotFound)
    }
}

pub fn build_router(app_state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/nodes", get(list_nodes))
        .route("/settings", get(list_settings).put(create_setting))
        .route(
            "/settings/{id}",
            get(get_setting).post(replace_setting).delete(delete_setting),
        )
        .route("/settings/{id}/enable", post(enable_setting))
        .route("/settings/{id}/disable", post(disable_setting))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}/logs", get(get_task_logs))
        .route("/workspaces/{reference}", get(inspect_workspace));
    for eco in Ecosystem::ALL {
        router = router.merge(ecosystem_routes(eco));
    }
    router
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

fn ecosystem_routes(eco: Ecosystem) -> Router<AppState> {
    let base = format!("/{eco}");
    Router::new()
        .route(
            &base,
            get(move |State(app): State<AppState>, Query(p): Query<DependencyParams>| {
                list_dependencies(app, eco, p)
            }),
        )
        .route(
            &format!("{base}/update"),
            post(move |State(app): State<AppState>| update(app, eco)),
        )
        .route(
            &format!("{base}/install"),
            post(move |State(app): State<AppState>, Json(cmd): Json<InstallCommand>| {
                install(app, eco, cmd)
            }),
        )
        .route(
            &format!("{base}/uninstall"),
            post(move |State(app): State<AppState>, Json(body): Json<UninstallBody>| {
                uninstall(app, eco, body)
            }),
        )
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<MasterHealth> {
    Json(app.health.get_health())
}

// GET /nodes
async fn list_nodes(State(app): State<AppState>) -> Json<Vec<Node>> {
    Json(app.nodes.all())
}

#[derive(Debug, Deserialize)]
pub struct DependencyParams {
    #[serde(default)]
    installed: bool,
    query: Option<String>,
    page: Option<usize>,
    size: Option<usize>,
}

// GET /{eco}?installed=true : cluster catalog, otherwise registry search
async fn list_dependencies(
    app: AppState,
    eco: Ecosystem,
    p: DependencyParams,
) -> Result<Response, ApiError> {
    let size = p.size.unwrap_or(10).max(1);
    if p.installed {
        let q = CatalogQuery {
            query: p.query,
            page: p.page.unwrap_or(1),
            size,
        };
        return Ok(Json(catalog::installed(&app.store, eco, &q)).into_response());
    }
    let coordinator = app.coordinator(eco)?;
    let found = coordinator
        .lookup()
        .search(p.query.as_deref().unwrap_or_default(), size)
        .await?;
    let total = found.len();
    Ok(Json(ListResponse { data: found, total }).into_response())
}

// POST /{eco}/update
async fn update(app: AppState, eco: Ecosystem) -> Result<Json<RoundReport>, ApiError> {
    let report = app.coordinator(eco)?.update().await?;
    Ok(Json(report))
}

// POST /{eco}/install
async fn install(
    app: AppState,
    eco: Ecosystem,
    cmd: InstallCommand,
) -> Result<Json<DispatchReport>, ApiError> {
    let report = app.coordinator(eco)?.install(cmd).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct UninstallBody {
    names: Vec<String>,
}

// POST /{eco}/uninstall
async fn uninstall(
    app: AppState,
    eco: Ecosystem,
    body: UninstallBody,
) -> Result<Json<DispatchReport>, ApiError> {
    let report = app.coordinator(eco)?.uninstall(&body.names).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct SettingInput {
    key: Ecosystem,
    name: Option<String>,
    description: Option<String>,
    command: Option<String>,
    proxy: Option<String>,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl SettingInput {
    fn into_setting(self, id: Uuid) -> Setting {
        Setting {
            id,
            key: self.key,
            name: self.name.unwrap_or_else(|| self.key.display_name().to_string()),
            description: self.description,
            command: self.command,
            proxy: self.proxy,
            enabled: self.enabled,
        }
    }
}

// GET /settings
async fn list_settings(State(app): State<AppState>) -> Json<ListResponse<Setting>> {
    let data = app.store.settings.all();
    let total = data.len();
    Json(ListResponse { data, total })
}

// GET /settings/{id}
async fn get_setting(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Setting>, ApiError> {
    app.store.settings.get(id).map(Json).ok_or(ApiError::NotFound)
}

// PUT /settings : create, one setting per ecosystem
async fn create_setting(
    State(app): State<AppState>,
    Json(input): Json<SettingInput>,
) -> Result<Json<Setting>, ApiError> {
    let setting = input.into_setting(Uuid::new_v4());
    app.store.settings.transaction(|all| {
        if all.iter().any(|s| s.key == setting.key) {
            return Err(ApiError::Conflict(format!("setting for {} already exists", setting.key)));
        }
        all.push(setting.clone());
        Ok(())
    })?;
    Ok(Json(setting))
}

// POST /settings/{id} : replace
async fn replace_setting(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<SettingInput>,
) -> Result<Json<Setting>, ApiError> {
    let setting = input.into_setting(id);
    app.store.settings.transaction(|all| {
        if all.iter().any(|s| s.key == setting.key && s.id != id) {
            return Err(ApiError::Conflict(format!("setting for {} already exists", setting.key)));
        }
        let slot = all.iter_mut().find(|s| s.id == id).ok_or(ApiError::NotFound)?;
        *slot = setting.clone();
        Ok(())
    })?;
    Ok(Json(setting))
}

// DELETE /settings/{id}
async fn delete_setting(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if app.store.settings.delete(id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

async fn toggle_setting(app: &AppState, id: Uuid, enabled: bool) -> Result<Json<Setting>, ApiError> {
    app.store
        .settings
        .update(id, |s| s.enabled = enabled)?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

// POST /settings/{id}/enable
async fn enable_setting(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Setting>, ApiError> {
    toggle_setting(&app, id, true).await
}

// POST /settings/{id}/disable
async fn disable_setting(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Setting>, ApiError> {
    toggle_setting(&app, id, false).await
}

#[derive(Debug, Deserialize)]
pub struct TaskParams {
    #[serde(default)]
    all: bool,
    page: Option<usize>,
    size: Option<usize>,
}

// GET /tasks (newest first)
async fn list_tasks(
    State(app): State<AppState>,
    Query(p): Query<TaskParams>,
) -> Json<ListResponse<Task>> {
    let (data, total) = app
        .tasks
        .list(p.page.unwrap_or(1), p.size.unwrap_or(10), p.all);
    Json(ListResponse { data, total })
}

// GET /tasks/{id}/logs
async fn get_task_logs(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    if app.tasks.get(id).is_none() {
        return Err(ApiError::NotFound);
    }
    Ok(Json(app.tasks.logs(id)))
}

// GET /workspaces/{reference}
async fn inspect_workspace(
    State(app): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Json<WorkspaceInspection>, ApiError> {
    let report = catalog::inspect_workspace(&app.store, app.workspace.as_ref(), &reference).await?;
    Ok(Json(report))
}
