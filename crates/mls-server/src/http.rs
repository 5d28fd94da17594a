use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use mls_agent::{AgentError, AgentLoop};
use mls_queue::{EnqueueOptions, JobKind, QueueError};
use mls_settings::SettingsError;
use mls_store::StoreError;
use mls_types::{
    AssetClass, AssetOverride, Build, BuildScope, BuildTrigger, ProgressEvent, Site, Topic,
    TopicKind,
};
use mls_workspace::{FileEdit, WorkspaceError};

use crate::AppState;

const SSE_HEARTBEAT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::NotFound { .. } => ApiError::not_found(err.to_string()),
            StoreError::Duplicate { .. } | StoreError::AlreadyInProgress { .. } => {
                ApiError::conflict(err.to_string())
            }
            _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match &err {
            QueueError::AlreadyInProgress { .. } => ApiError::conflict(err.to_string()),
            QueueError::Store(inner) => ApiError::from_store_ref(inner, err.to_string()),
        }
    }
}

impl ApiError {
    fn from_store_ref(err: &StoreError, message: String) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::not_found(message),
            StoreError::Duplicate { .. } | StoreError::AlreadyInProgress { .. } => {
                ApiError::conflict(message)
            }
            _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, message),
        }
    }
}

impl From<SettingsError> for ApiError {
    fn from(err: SettingsError) -> Self {
        match &err {
            SettingsError::Store(inner) => ApiError::from_store_ref(inner, err.to_string()),
            _ => ApiError::bad_request(err.to_string()),
        }
    }
}

impl From<WorkspaceError> for ApiError {
    fn from(err: WorkspaceError) -> Self {
        match &err {
            WorkspaceError::NotFound { .. } => ApiError::not_found(err.to_string()),
            WorkspaceError::PathEscape { .. } | WorkspaceError::UnknownPlan { .. } => {
                ApiError::bad_request(err.to_string())
            }
            WorkspaceError::Store(inner) => ApiError::from_store_ref(inner, err.to_string()),
            _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        match &err {
            AgentError::Store(inner) => ApiError::from_store_ref(inner, err.to_string()),
            AgentError::Queue(QueueError::AlreadyInProgress { .. }) => {
                ApiError::conflict(err.to_string())
            }
            AgentError::NotResumable { .. } => ApiError::conflict(err.to_string()),
            _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateSiteInput {
    name: String,
    site_url: String,
}

#[derive(Debug, Deserialize, Default)]
struct CreateBuildInput {
    scope: Option<BuildScope>,
}

#[derive(Debug, Deserialize, Default)]
struct ListBuildsQuery {
    page: Option<usize>,
    page_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OverrideInput {
    url_pattern: String,
    #[serde(default)]
    asset_class: Option<AssetClass>,
    settings: Value,
}

#[derive(Debug, Deserialize, Default)]
struct OptimizeInput {
    max_iterations: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatInput {
    #[serde(default)]
    message: String,
    mode: ChatMode,
    plan_id: Option<String>,
    #[serde(default)]
    scope: Vec<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum ChatMode {
    Plan,
    Execute,
}

#[derive(Debug, Deserialize)]
struct AuditInput {
    #[serde(rename = "type")]
    kind: AuditKind,
    #[serde(default)]
    scope: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum AuditKind {
    Speed,
    Bugs,
    Visual,
}

impl AuditKind {
    fn as_str(self) -> &'static str {
        match self {
            AuditKind::Speed => "speed",
            AuditKind::Bugs => "bugs",
            AuditKind::Visual => "visual",
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookInput {
    site_id: String,
    #[serde(default)]
    event: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildSummary {
    id: String,
    status: String,
    scope: String,
    pages_total: u64,
    pages_processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    score_before: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    score_after: Option<f64>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Build> for BuildSummary {
    fn from(build: &Build) -> Self {
        Self {
            id: build.id.clone(),
            status: build.status.as_str().to_string(),
            scope: build.scope.as_str().to_string(),
            pages_total: build.pages_total,
            pages_processed: build.pages_processed,
            score_before: build.score_before,
            score_after: build.score_after,
            created_at: build.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/sites", post(create_site).get(list_sites))
        .route("/sites/{id}", get(get_site).delete(delete_site))
        .route("/sites/{id}/status", get(site_status))
        .route("/sites/{id}/builds", post(create_build).get(list_builds))
        .route("/sites/{id}/builds/stream", get(build_stream))
        .route("/sites/{id}/builds/cancel-stale", post(cancel_stale))
        .route("/sites/{id}/builds/{build_id}", get(get_build))
        .route("/sites/{id}/builds/{build_id}/retry", post(retry_build))
        .route(
            "/sites/{id}/settings",
            get(get_settings).put(put_settings),
        )
        .route("/sites/{id}/settings/diff", get(settings_diff))
        .route("/sites/{id}/settings/reset", post(settings_reset))
        .route("/sites/{id}/settings/history", get(settings_history))
        .route(
            "/sites/{id}/settings/history/rollback/{hist_id}",
            post(settings_rollback),
        )
        .route(
            "/sites/{id}/asset-overrides",
            get(list_overrides).post(upsert_override),
        )
        .route(
            "/sites/{id}/asset-overrides/{oid}",
            get(get_override).put(update_override).delete(delete_override),
        )
        .route("/sites/{id}/ai/optimize", post(ai_optimize))
        .route("/sites/{id}/ai/status", get(ai_status))
        .route("/sites/{id}/ai/resume", post(ai_resume))
        .route("/sites/{id}/ai/stop", post(ai_stop))
        .route("/sites/{id}/ai/report", get(ai_report))
        .route("/sites/{id}/ai/stream", get(agent_stream))
        .route("/sites/{id}/live-edit/status", get(live_edit_status))
        .route(
            "/sites/{id}/live-edit/files",
            get(live_edit_files).post(live_edit_apply),
        )
        .route("/sites/{id}/live-edit/file", get(live_edit_file))
        .route("/sites/{id}/live-edit/chat", post(live_edit_chat))
        .route("/sites/{id}/live-edit/audit", post(live_edit_audit))
        .route("/sites/{id}/live-edit/deploy", post(live_edit_deploy))
        .route("/sites/{id}/live-edit/stream", get(live_edit_stream))
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/wordpress", post(wordpress_webhook))
        .merge(authed)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default();
    if !constant_time_eq(presented.as_bytes(), state.api_key.as_bytes()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing or invalid API key"})),
        )
            .into_response();
    }
    next.run(request).await
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    // Hash both sides so the comparison length never depends on the secret.
    let a = Sha256::digest(a);
    let b = Sha256::digest(b);
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ---------------------------------------------------------------------------
// Health, sites
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({"ok": true, "version": env!("CARGO_PKG_VERSION")}))
}

async fn create_site(
    State(state): State<AppState>,
    Json(input): Json<CreateSiteInput>,
) -> ApiResult<(StatusCode, Json<Site>)> {
    if input.name.trim().is_empty() || input.site_url.trim().is_empty() {
        return Err(ApiError::bad_request("name and site_url are required"));
    }
    if !input.site_url.starts_with("http://") && !input.site_url.starts_with("https://") {
        return Err(ApiError::bad_request("site_url must be an absolute URL"));
    }
    let site = Site::new(input.name.trim(), input.site_url.trim());
    state.store.insert_site(&site).await?;
    Ok((StatusCode::CREATED, Json(site)))
}

async fn list_sites(State(state): State<AppState>) -> ApiResult<Json<Vec<Site>>> {
    Ok(Json(state.store.list_sites().await?))
}

async fn get_site(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Site>> {
    Ok(Json(state.store.get_site(&site_id).await?))
}

async fn delete_site(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.delete_site(&site_id).await?;
    let dir = state.paths.site_dir(&site_id);
    let _ = tokio::fs::remove_dir_all(dir).await;
    let _ = tokio::fs::remove_dir_all(state.paths.workspace_dir(&site_id)).await;
    Ok(Json(json!({"deleted": true})))
}

async fn site_status(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let site = state.store.get_site(&site_id).await?;
    let latest = match &site.last_build_id {
        Some(build_id) => state
            .store
            .get_build(build_id)
            .await
            .ok()
            .map(|b| BuildSummary::from(&b)),
        None => None,
    };
    Ok(Json(json!({"site": site, "latestBuild": latest})))
}

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

async fn create_build(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    Json(input): Json<CreateBuildInput>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let build = enqueue_build(
        &state,
        &site_id,
        input.scope.unwrap_or(BuildScope::Full),
        BuildTrigger::User,
    )
    .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"build": build}))))
}

/// Slot first, then the build row, then the job. The worker picking the job
/// up renews the slot under the build id.
async fn enqueue_build(
    state: &AppState,
    site_id: &str,
    scope: BuildScope,
    trigger: BuildTrigger,
) -> ApiResult<Build> {
    state.store.get_site(site_id).await?;
    let build = Build::new(site_id, scope, trigger);
    state.queue.acquire_slot(site_id, &build.id).await?;
    if let Err(err) = state.store.insert_build(&build).await {
        let _ = state.queue.release_slot(site_id, &build.id).await;
        return Err(err.into());
    }
    if let Err(err) = state
        .queue
        .enqueue(
            JobKind::Build,
            site_id,
            json!({"buildId": build.id}),
            EnqueueOptions::default(),
        )
        .await
    {
        let _ = state.queue.release_slot(site_id, &build.id).await;
        return Err(err.into());
    }
    Ok(build)
}

async fn list_builds(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    Query(query): Query<ListBuildsQuery>,
) -> ApiResult<Json<Value>> {
    state.store.get_site(&site_id).await?;
    let page = query.page.unwrap_or(0);
    let page_size = query.page_size.unwrap_or(20).clamp(1, 100);
    let builds = state
        .store
        .list_builds(&site_id, page_size, page * page_size)
        .await?;
    let summaries: Vec<BuildSummary> = builds.iter().map(BuildSummary::from).collect();
    Ok(Json(json!({
        "builds": summaries,
        "page": page,
        "pageSize": page_size,
    })))
}

async fn get_build(
    State(state): State<AppState>,
    Path((site_id, build_id)): Path<(String, String)>,
) -> ApiResult<Json<Build>> {
    let build = state.store.get_build(&build_id).await?;
    if build.site_id != site_id {
        return Err(ApiError::not_found(format!("build not found: {build_id}")));
    }
    Ok(Json(build))
}

async fn cancel_stale(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.get_site(&site_id).await?;
    state.cancellations.cancel(&site_id).await;
    let summary = state.queue.cancel_stale(&site_id).await?;
    Ok(Json(json!({
        "cancelled": summary.builds,
        "agentRuns": summary.agent_runs,
        "jobs": summary.jobs,
    })))
}

async fn retry_build(
    State(state): State<AppState>,
    Path((site_id, build_id)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let build = state.store.get_build(&build_id).await?;
    if build.site_id != site_id {
        return Err(ApiError::not_found(format!("build not found: {build_id}")));
    }
    if build.status != mls_types::BuildStatus::Failed {
        return Err(ApiError::conflict("only failed builds can be retried"));
    }
    state.queue.acquire_slot(&site_id, &build_id).await?;
    if let Err(err) = state
        .queue
        .enqueue(
            JobKind::Build,
            &site_id,
            json!({"buildId": build_id}),
            EnqueueOptions::default(),
        )
        .await
    {
        let _ = state.queue.release_slot(&site_id, &build_id).await;
        return Err(err.into());
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"buildId": build_id, "resumesAt": build.checkpoint_phase})),
    ))
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

async fn get_settings(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.resolver.resolve_site_value(&site_id).await?))
}

async fn put_settings(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    Json(sparse): Json<Value>,
) -> ApiResult<Json<Value>> {
    let resolved = state
        .resolver
        .write_site_settings(&site_id, &sparse, "user")
        .await?;
    Ok(Json(resolved))
}

async fn settings_diff(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.resolver.diff_site(&site_id).await?))
}

async fn settings_reset(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.resolver.reset_site_settings(&site_id).await?))
}

async fn settings_history(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.get_site(&site_id).await?;
    let entries = state.store.list_settings_history(&site_id).await?;
    Ok(Json(json!({"history": entries})))
}

async fn settings_rollback(
    State(state): State<AppState>,
    Path((site_id, hist_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.resolver.rollback(&site_id, &hist_id).await?))
}

// ---------------------------------------------------------------------------
// Asset overrides
// ---------------------------------------------------------------------------

async fn list_overrides(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Vec<AssetOverride>>> {
    state.store.get_site(&site_id).await?;
    Ok(Json(state.store.list_asset_overrides(&site_id).await?))
}

async fn upsert_override(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    Json(input): Json<OverrideInput>,
) -> ApiResult<(StatusCode, Json<AssetOverride>)> {
    state.store.get_site(&site_id).await?;
    // Reject unparseable globs before they reach a build.
    mls_settings::compile_glob(&input.url_pattern)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let mut ovr = AssetOverride::new(&site_id, &input.url_pattern, input.settings);
    ovr.asset_class = input.asset_class;
    let stored = state.store.upsert_asset_override(&ovr).await?;
    state.resolver.invalidate(&site_id).await;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_override(
    State(state): State<AppState>,
    Path((site_id, override_id)): Path<(String, String)>,
) -> ApiResult<Json<AssetOverride>> {
    let ovr = state.store.get_asset_override(&override_id).await?;
    if ovr.site_id != site_id {
        return Err(ApiError::not_found(format!(
            "asset override not found: {override_id}"
        )));
    }
    Ok(Json(ovr))
}

async fn update_override(
    State(state): State<AppState>,
    Path((site_id, override_id)): Path<(String, String)>,
    Json(input): Json<OverrideInput>,
) -> ApiResult<Json<AssetOverride>> {
    let existing = state.store.get_asset_override(&override_id).await?;
    if existing.site_id != site_id {
        return Err(ApiError::not_found(format!(
            "asset override not found: {override_id}"
        )));
    }
    mls_settings::compile_glob(&input.url_pattern)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    // A pattern change moves the row to a new (site, pattern) key, so the
    // old row goes first.
    if existing.url_pattern != input.url_pattern {
        state.store.delete_asset_override(&override_id).await?;
    }
    let mut ovr = existing;
    ovr.url_pattern = input.url_pattern;
    ovr.asset_class = input.asset_class;
    ovr.settings = input.settings;
    let stored = state.store.upsert_asset_override(&ovr).await?;
    state.resolver.invalidate(&site_id).await;
    Ok(Json(stored))
}

async fn delete_override(
    State(state): State<AppState>,
    Path((site_id, override_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let existing = state.store.get_asset_override(&override_id).await?;
    if existing.site_id != site_id {
        return Err(ApiError::not_found(format!(
            "asset override not found: {override_id}"
        )));
    }
    state.store.delete_asset_override(&override_id).await?;
    state.resolver.invalidate(&site_id).await;
    Ok(Json(json!({"deleted": true})))
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

async fn ai_optimize(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    state.store.get_site(&site_id).await?;
    // The body is optional; an empty one means defaults.
    let input: OptimizeInput = if body.is_empty() {
        OptimizeInput::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::bad_request(format!("invalid payload: {err}")))?
    };
    let run = state
        .agent
        .create_run(&site_id, input.max_iterations)
        .await?;
    let job = match state
        .queue
        .enqueue(
            JobKind::Agent,
            &site_id,
            json!({"runId": run.id}),
            EnqueueOptions::default(),
        )
        .await
    {
        Ok(job) => job,
        Err(err) => {
            let _ = state.queue.release_slot(&site_id, &run.id).await;
            return Err(err.into());
        }
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"runId": run.id, "jobId": job.id})),
    ))
}

async fn ai_status(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.get_site(&site_id).await?;
    let run = state.store.latest_agent_run(&site_id).await?;
    let can_resume = run.as_ref().is_some_and(AgentLoop::can_resume);
    Ok(Json(json!({"run": run, "canResume": can_resume})))
}

async fn ai_resume(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let run = state
        .store
        .latest_agent_run(&site_id)
        .await?
        .ok_or_else(|| ApiError::not_found("no agent run for site"))?;
    state.queue.acquire_slot(&site_id, &run.id).await?;
    let reopened = match state.agent.prepare_resume(&run.id).await {
        Ok(run) => run,
        Err(err) => {
            let _ = state.queue.release_slot(&site_id, &run.id).await;
            return Err(err.into());
        }
    };
    let job = match state
        .queue
        .enqueue(
            JobKind::Agent,
            &site_id,
            json!({"runId": reopened.id}),
            EnqueueOptions::default(),
        )
        .await
    {
        Ok(job) => job,
        Err(err) => {
            let _ = state.queue.release_slot(&site_id, &run.id).await;
            return Err(err.into());
        }
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"runId": reopened.id, "jobId": job.id, "iteration": reopened.iteration})),
    ))
}

async fn ai_stop(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.get_site(&site_id).await?;
    let stopping = state.cancellations.cancel(&site_id).await;
    Ok(Json(json!({"stopping": stopping})))
}

async fn ai_report(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.get_site(&site_id).await?;
    let report = state.agent.report(&site_id).await?;
    report
        .map(|r| Json(json!(r)))
        .ok_or_else(|| ApiError::not_found("no agent run for site"))
}

// ---------------------------------------------------------------------------
// Live edit
// ---------------------------------------------------------------------------

async fn live_edit_status(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let site = state.store.get_site(&site_id).await?;
    Ok(Json(json!({
        "workspaceExists": state.workspace.exists(&site_id),
        "edgeUrl": site.edge_url,
        "plan": state.planner.current_plan(&site_id).await.map(|p| p.plan_id),
    })))
}

async fn live_edit_files(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.get_site(&site_id).await?;
    let files = state.workspace.list_files(&site_id).await?;
    Ok(Json(json!({"files": files})))
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    path: String,
}

async fn live_edit_file(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Json<Value>> {
    state.store.get_site(&site_id).await?;
    let content = state.workspace.read_file(&site_id, &query.path).await?;
    Ok(Json(json!({"path": query.path, "content": content})))
}

async fn live_edit_chat(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    Json(input): Json<ChatInput>,
) -> ApiResult<Json<Value>> {
    state.store.get_site(&site_id).await?;
    match input.mode {
        ChatMode::Plan => {
            if input.message.trim().is_empty() {
                return Err(ApiError::bad_request("message is required for plan mode"));
            }
            let plan = state
                .planner
                .plan(&site_id, &input.message, &input.scope)
                .await
                .map_err(ApiError::from)?;
            Ok(Json(json!({
                "planId": plan.plan_id,
                "edits": plan.edits.iter().map(|e| json!({"path": e.path})).collect::<Vec<_>>(),
                "issues": plan.issues,
                "improvements": plan.improvements,
                "rationale": plan.rationale,
            })))
        }
        ChatMode::Execute => {
            let plan_id = input
                .plan_id
                .ok_or_else(|| ApiError::bad_request("planId is required for execute mode"))?;
            let outcome = state.planner.execute(&site_id, &plan_id).await?;
            Ok(Json(json!(outcome)))
        }
    }
}

async fn live_edit_audit(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    Json(input): Json<AuditInput>,
) -> ApiResult<Json<Value>> {
    state.store.get_site(&site_id).await?;
    let result = state
        .planner
        .audit(&site_id, input.kind.as_str(), &input.scope)
        .await?;
    Ok(Json(result))
}

async fn live_edit_deploy(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.get_site(&site_id).await?;
    let url = state.workspace.deploy(&site_id).await?;
    Ok(Json(json!({"edgeUrl": url})))
}

/// Structured file-replacement edits outside the plan protocol.
async fn live_edit_apply(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    Json(edits): Json<Vec<FileEdit>>,
) -> ApiResult<Json<Value>> {
    let outcome = state.workspace.apply_edits(&site_id, &edits).await?;
    Ok(Json(json!(outcome)))
}

// ---------------------------------------------------------------------------
// SSE bridges
// ---------------------------------------------------------------------------

fn topic_sse(
    state: &AppState,
    topic: Topic,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.events.subscribe(&topic);
    let initial = tokio_stream::once(Ok(Event::default().data(
        serde_json::to_string(&json!({"type": "connected", "topic": topic.key()}))
            .unwrap_or_default(),
    )));
    let live = BroadcastStream::new(rx).filter_map(|event| match event {
        Ok(event) => Some(Ok(Event::default()
            .data(serde_json::to_string(&event).unwrap_or_default()))),
        // A lagged subscriber drops events rather than stalling publishers.
        Err(_) => Some(Ok(Event::default()
            .data(serde_json::to_string(&ProgressEvent::Heartbeat).unwrap_or_default()))),
    });
    Sse::new(initial.chain(live)).keep_alive(KeepAlive::new().interval(SSE_HEARTBEAT))
}

async fn build_stream(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    topic_sse(&state, Topic::new(TopicKind::Build, site_id))
}

async fn agent_stream(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    topic_sse(&state, Topic::new(TopicKind::Agent, site_id))
}

async fn live_edit_stream(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    topic_sse(&state, Topic::new(TopicKind::LiveEdit, site_id))
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

/// Hex SHA-256 over `secret || body`; the site's webhook secret is handed out
/// at creation time.
fn webhook_signature(secret: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

async fn wordpress_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let input: WebhookInput = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("invalid payload: {err}")))?;
    let site = state.store.get_site(&input.site_id).await?;
    let secret = site
        .webhook_secret
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("site has no webhook secret"))?;

    let presented = headers
        .get("x-mls-signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let expected = webhook_signature(secret, &body);
    if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "invalid webhook signature",
        ));
    }

    // Content changed: queue a partial rebuild. A busy site just skips.
    match enqueue_build(&state, &input.site_id, BuildScope::Partial, BuildTrigger::Webhook).await {
        Ok(build) => Ok(Json(json!({"queued": true, "buildId": build.id, "event": input.event}))),
        Err(err) if err.status == StatusCode::CONFLICT => {
            Ok(Json(json!({"queued": false, "reason": "already in progress"})))
        }
        Err(err) => Err(err),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use mls_agent::AgentConfig;
    use mls_pipeline::testing::mock_services;
    use mls_pipeline::ArtifactPaths;
    use mls_queue::{CancellationRegistry, JobQueue, QueueConfig};
    use mls_settings::SettingsResolver;
    use mls_store::Store;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tower::ServiceExt;

    const API_KEY: &str = "test-master-key";

    async fn test_state() -> (AppState, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let events = mls_events::EventBus::new();
        let resolver = SettingsResolver::new(store.clone());
        let services = mock_services(HashMap::new(), Vec::new());
        let paths = ArtifactPaths::new(tmp.path());
        let queue = JobQueue::new(store.clone(), QueueConfig::default());
        let agent = AgentLoop::new(
            store.clone(),
            queue.clone(),
            resolver.clone(),
            services.clone(),
            events.clone(),
            paths.clone(),
            AgentConfig::default(),
        );
        let state = AppState::new(
            store,
            events,
            queue,
            resolver,
            services,
            paths,
            agent,
            CancellationRegistry::new(),
            API_KEY.to_string(),
        );
        (state, tmp)
    }

    fn authed(builder: axum::http::request::Builder) -> axum::http::request::Builder {
        builder.header("authorization", format!("Bearer {API_KEY}"))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    }

    #[tokio::test]
    async fn health_is_open_but_api_requires_bearer() {
        let (state, _tmp) = test_state().await;
        let app = router(state);

        let resp = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/sites")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(
                authed(HttpRequest::builder().uri("/sites"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_site_returns_webhook_secret() {
        let (state, _tmp) = test_state().await;
        let app = router(state);

        let resp = app
            .oneshot(
                authed(HttpRequest::builder().method("POST").uri("/sites"))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"name": "Acme", "site_url": "https://acme.test"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert!(body["id"].as_str().unwrap().starts_with("site_"));
        assert!(body["webhookSecret"].as_str().unwrap().starts_with("whsec_"));
    }

    #[tokio::test]
    async fn second_concurrent_build_is_rejected_with_409() {
        let (state, _tmp) = test_state().await;
        let site = Site::new("Acme", "https://acme.test");
        state.store.insert_site(&site).await.unwrap();
        let app = router(state);

        let uri = format!("/sites/{}/builds", site.id);
        let resp = app
            .clone()
            .oneshot(
                authed(HttpRequest::builder().method("POST").uri(&uri))
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"scope": "full"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = body_json(resp).await;
        assert_eq!(body["build"]["status"], "queued");

        let resp = app
            .oneshot(
                authed(HttpRequest::builder().method("POST").uri(&uri))
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"scope": "full"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn settings_put_diff_reset_rollback_round_trip() {
        let (state, _tmp) = test_state().await;
        let site = Site::new("Acme", "https://acme.test");
        state.store.insert_site(&site).await.unwrap();
        let app = router(state);

        let put = app
            .clone()
            .oneshot(
                authed(
                    HttpRequest::builder()
                        .method("PUT")
                        .uri(format!("/sites/{}/settings", site.id)),
                )
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"css": {"purgeAggressiveness": "aggressive"}}).to_string(),
                ))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(put.status(), StatusCode::OK);
        let resolved = body_json(put).await;
        assert_eq!(resolved["css"]["purgeAggressiveness"], "aggressive");
        assert_eq!(resolved["css"]["minify"], true);

        let diff = app
            .clone()
            .oneshot(
                authed(HttpRequest::builder().uri(format!("/sites/{}/settings/diff", site.id)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let diff = body_json(diff).await;
        assert_eq!(diff, json!({"css": {"purgeAggressiveness": true}}));

        let history = app
            .clone()
            .oneshot(
                authed(HttpRequest::builder().uri(format!("/sites/{}/settings/history", site.id)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let history = body_json(history).await;
        let hist_id = history["history"][0]["id"].as_str().unwrap().to_string();

        let reset = app
            .clone()
            .oneshot(
                authed(
                    HttpRequest::builder()
                        .method("POST")
                        .uri(format!("/sites/{}/settings/reset", site.id)),
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(reset.status(), StatusCode::OK);

        let diff = app
            .clone()
            .oneshot(
                authed(HttpRequest::builder().uri(format!("/sites/{}/settings/diff", site.id)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(diff).await, json!({}));

        // Rolling back to the pre-aggressive entry restores the defaults too
        // (the first history row holds the empty pre-write value).
        let rollback = app
            .oneshot(
                authed(HttpRequest::builder().method("POST").uri(format!(
                    "/sites/{}/settings/history/rollback/{hist_id}",
                    site.id
                )))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rollback.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected_with_400() {
        let (state, _tmp) = test_state().await;
        let site = Site::new("Acme", "https://acme.test");
        state.store.insert_site(&site).await.unwrap();
        let app = router(state);

        let resp = app
            .oneshot(
                authed(
                    HttpRequest::builder()
                        .method("PUT")
                        .uri(format!("/sites/{}/settings", site.id)),
                )
                .header("content-type", "application/json")
                .body(Body::from(json!({"css": {"noSuchKnob": 1}}).to_string()))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_requires_valid_signature() {
        let (state, _tmp) = test_state().await;
        let site = Site::new("Acme", "https://acme.test");
        state.store.insert_site(&site).await.unwrap();
        let secret = site.webhook_secret.clone().unwrap();
        let app = router(state);

        let payload = json!({"site_id": site.id, "event": "content-changed"}).to_string();
        let resp = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/webhooks/wordpress")
                    .header("content-type", "application/json")
                    .header("x-mls-signature", "bogus")
                    .body(Body::from(payload.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let signature = webhook_signature(&secret, payload.as_bytes());
        let resp = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/webhooks/wordpress")
                    .header("content-type", "application/json")
                    .header("x-mls-signature", signature)
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["queued"], true);
    }

    #[tokio::test]
    async fn live_edit_execute_with_stale_plan_is_400() {
        let (state, _tmp) = test_state().await;
        let site = Site::new("Acme", "https://acme.test");
        state.store.insert_site(&site).await.unwrap();
        let app = router(state);

        let resp = app
            .oneshot(
                authed(
                    HttpRequest::builder()
                        .method("POST")
                        .uri(format!("/sites/{}/live-edit/chat", site.id)),
                )
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"mode": "execute", "planId": "p-missing"}).to_string(),
                ))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_site_is_404() {
        let (state, _tmp) = test_state().await;
        let app = router(state);
        let resp = app
            .oneshot(
                authed(HttpRequest::builder().uri("/sites/site_missing"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
