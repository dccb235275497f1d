//! HTTP control plane server.
//!
//! Thin axum handlers: each one authenticates, delegates to the owning
//! component, and maps the component's error type onto the `ErrorKind`
//! taxonomy. No business logic lives here.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use coderunner_core::types::{ErrorKind, Id, Job, JobOptions, Principal};
use coderunner_core::wire::{
    CancelJobResponse, CreateJobRequest, CreateJobResponse, DeleteJobResponse, ErrorBody,
    HealthResponse, LoginRequest, LoginResponse, LogoutResponse, RegisterRepositoryRequest,
    StartJobResponse, UnregisterResponse, UploadFileResponse, UploadImageResponse,
};

use crate::credential::{CredentialVerifier, HostPasswordDatabase};
use crate::job_store::{JobStore, JobStoreError};
use crate::persistence::Persistence;
use crate::registry::{RegistryError, RepositoryRegistry};
use crate::scheduler::{CancelOutcome, Scheduler};
use crate::staging::{self, StagingError};
use crate::token_issuer::{TokenError, TokenIssuer};
use crate::workspace::{WorkspaceError, WorkspaceManager};

pub struct AppState {
    pub credential_verifier: CredentialVerifier<HostPasswordDatabase>,
    pub token_issuer: TokenIssuer,
    pub registry: Arc<RepositoryRegistry>,
    pub job_store: Arc<JobStore>,
    pub scheduler: Arc<Scheduler>,
    pub workspace: Arc<WorkspaceManager>,
    pub persistence: Arc<Persistence>,
    pub index_binary: String,
    pub jobs_timeout_default_sec: u32,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/repositories", get(list_repositories))
        .route("/repositories/register", post(register_repository))
        .route(
            "/repositories/{name}",
            get(get_repository).delete(unregister_repository),
        )
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/{id}", get(get_job).delete(delete_job))
        .route("/jobs/{id}/files", post(upload_file).get(list_files))
        .route("/jobs/{id}/images", post(upload_image))
        .route("/jobs/{id}/start", post(start_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/files/directories", get(list_directories))
        .route("/jobs/{id}/files/content", get(read_file_content))
        .route("/jobs/{id}/files/download", get(download_file))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- error mapping ---

pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: self.message,
            error_type: self.kind.as_str().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JobStoreError> for ApiError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::NotFound(_) => ApiError::new(ErrorKind::NotFound, e.to_string()),
            JobStoreError::Forbidden(_) => ApiError::new(ErrorKind::Forbidden, e.to_string()),
            JobStoreError::NotTerminal(_) => ApiError::new(ErrorKind::Conflict, e.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadyExists(_) => ApiError::new(ErrorKind::Conflict, e.to_string()),
            RegistryError::NotFound(_) => ApiError::new(ErrorKind::NotFound, e.to_string()),
            RegistryError::Referenced(_) => ApiError::new(ErrorKind::Conflict, e.to_string()),
            RegistryError::Io(_) => ApiError::new(ErrorKind::System, e.to_string()),
        }
    }
}

fn workspace_error_kind(e: &WorkspaceError) -> ErrorKind {
    match e {
        WorkspaceError::PathSafety(_) => ErrorKind::Validation,
        WorkspaceError::CloneFailed(_) | WorkspaceError::Io(_) | WorkspaceError::CloneInProgress(_) => {
            ErrorKind::System
        }
    }
}

impl From<WorkspaceError> for ApiError {
    fn from(e: WorkspaceError) -> Self {
        ApiError::new(workspace_error_kind(&e), e.to_string())
    }
}

impl From<StagingError> for ApiError {
    fn from(e: StagingError) -> Self {
        let kind = match &e {
            StagingError::Workspace(inner) => workspace_error_kind(inner),
            StagingError::Io(_) => ErrorKind::System,
            StagingError::Mask(_) => ErrorKind::Validation,
            StagingError::NotFound(_) => ErrorKind::NotFound,
            StagingError::Ambiguous(_) => ErrorKind::Conflict,
            StagingError::TooLarge | StagingError::NotText => ErrorKind::Validation,
            StagingError::InvalidType(_) => ErrorKind::Validation,
        };
        ApiError::new(kind, e.to_string())
    }
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        ApiError::new(ErrorKind::Auth, e.to_string())
    }
}

// --- auth ---

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::new(ErrorKind::Auth, "missing Authorization header"))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::new(ErrorKind::Auth, "Authorization header must be a Bearer token"))?;
    Ok(state.token_issuer.verify(token)?)
}

// --- handlers: health ---

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// --- handlers: auth ---

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let principal = state
        .credential_verifier
        .verify(&req.username, &req.password)
        .map_err(|e| {
            warn!(username = %req.username, error = %e, "login failed");
            ApiError::new(ErrorKind::Auth, "invalid username or password")
        })?;
    let (token, expires) = state
        .token_issuer
        .issue(&principal)
        .map_err(|e| ApiError::new(ErrorKind::System, e.to_string()))?;
    Ok(Json(LoginResponse {
        token,
        username: principal.0,
        expires,
    }))
}

async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<LogoutResponse>, ApiError> {
    // Tokens are stateless HMAC bearer tokens; there is no server-side
    // session to invalidate, so logout only confirms the caller held a
    // currently-valid token.
    authenticate(&state, &headers).await?;
    Ok(Json(LogoutResponse { success: true }))
}

// --- handlers: repositories ---

async fn list_repositories(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(&state, &headers).await?;
    Ok(Json(state.registry.list().await))
}

async fn get_repository(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(&state, &headers).await?;
    Ok(Json(state.registry.metadata(&name).await?))
}

async fn register_repository(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterRepositoryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(&state, &headers).await?;
    let repo = state
        .registry
        .register(
            &req.name,
            &req.git_url,
            req.description,
            req.index_aware.unwrap_or(false),
            &state.index_binary,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(repo)))
}

async fn unregister_repository(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(&state, &headers).await?;
    // Snapshot taken just before `unregister` runs its check; the window
    // between this read and the removal is acceptable since a job cannot
    // be created against a repository that is mid-unregister (`create_job`
    // re-checks `registry.exists` on every call).
    let jobs = state.job_store.list_all().await;
    let is_referenced = |repo_name: &str| {
        jobs.iter()
            .any(|j| j.repository.eq_ignore_ascii_case(repo_name) && !j.state.is_terminal())
    };
    state.registry.unregister(&name, is_referenced).await?;
    Ok(Json(UnregisterResponse {
        success: true,
        removed: true,
        message: format!("repository '{name}' unregistered"),
    }))
}

// --- handlers: jobs ---

async fn create_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    if !state.registry.exists(&req.repository).await {
        return Err(ApiError::new(
            ErrorKind::Validation,
            format!("repository '{}' is not registered", req.repository),
        ));
    }
    let mut options = req.options;
    if options.timeout_seconds == JobOptions::default().timeout_seconds {
        options.timeout_seconds = state.jobs_timeout_default_sec;
    }
    let job = Job::new(principal, req.repository, req.prompt, options);
    let job = state.job_store.create(job).await;
    let cow_path = state.workspace.job_workspace(&job.id.0);
    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id: job.id.0,
            status: job.state.as_str().to_string(),
            cow_path: cow_path.to_string_lossy().into_owned(),
        }),
    ))
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    Ok(Json(state.job_store.list_for_principal(&principal).await))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let job_id = Id::from_string(id);
    let mut job = state.job_store.get(&job_id, &principal).await?;
    if job.queue_position.is_none() {
        job.queue_position = state.scheduler.queue_positions().await.get(&job_id.0).copied();
    }
    Ok(Json(job))
}

async fn start_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let job_id = Id::from_string(id);
    let job = state.job_store.get(&job_id, &principal).await?;
    if job.state != coderunner_core::types::JobState::Created {
        return Err(ApiError::new(
            ErrorKind::Conflict,
            "job has already been started",
        ));
    }
    state
        .job_store
        .mutate(&job_id, |j| j.state = coderunner_core::types::JobState::Queued)
        .await?;
    state.scheduler.enqueue(job_id.clone()).await;
    let queue_position = state.scheduler.queue_positions().await.get(&job_id.0).copied();
    Ok(Json(StartJobResponse {
        status: "queued".to_string(),
        queue_position,
    }))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let job_id = Id::from_string(id);
    state.job_store.get(&job_id, &principal).await?;
    let outcome = state.scheduler.cancel(&job_id).await;
    if outcome == CancelOutcome::RemovedFromQueue {
        state
            .job_store
            .mutate(&job_id, |j| j.state = coderunner_core::types::JobState::Cancelled)
            .await?;
    }
    Ok(Json(CancelJobResponse { success: true }))
}

async fn delete_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let job_id = Id::from_string(id);
    state.job_store.delete(&job_id, &principal).await?;
    state.workspace.destroy_workspace(&job_id.0)?;
    Ok(Json(DeleteJobResponse {
        success: true,
        terminated: true,
        workspace_removed: true,
    }))
}

// --- handlers: staging & artifact browser ---

#[derive(Debug, Deserialize)]
struct OverwriteQuery {
    #[serde(default)]
    overwrite: bool,
}

async fn upload_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<OverwriteQuery>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let job_id = Id::from_string(id);
    state.job_store.get(&job_id, &principal).await?;
    let (filename, bytes) = read_multipart_file(multipart).await?;
    let (stored, size, overwritten) =
        staging::upload_file(&state.workspace, &job_id.0, &filename, &bytes, query.overwrite)?;
    Ok(Json(UploadFileResponse {
        filename: stored,
        file_size: size,
        overwritten,
    }))
}

async fn upload_image(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let job_id = Id::from_string(id);
    state.job_store.get(&job_id, &principal).await?;
    let (filename, bytes) = read_multipart_file(multipart).await?;
    let (stored, path) = staging::upload_image(&state.workspace, &job_id.0, &filename, &bytes)?;
    Ok(Json(UploadImageResponse { filename: stored, path }))
}

/// Maximum upload size for either a staged file or an image ("50 MiB per file").
const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

async fn read_multipart_file(mut multipart: Multipart) -> Result<(String, Vec<u8>), ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(ErrorKind::Validation, e.to_string()))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::new(ErrorKind::Validation, e.to_string()))?;
        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err(ApiError::new(ErrorKind::Validation, "file exceeds the 50 MiB upload limit"));
        }
        return Ok((filename, bytes.to_vec()));
    }
    Err(ApiError::new(ErrorKind::Validation, "no file field present in upload"))
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    #[serde(default)]
    path: String,
    #[serde(default)]
    mask: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListFilesQuery {
    #[serde(default)]
    path: String,
    #[serde(default)]
    mask: Option<String>,
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    depth: Option<u32>,
}

async fn list_directories(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let job_id = Id::from_string(id);
    state.job_store.get(&job_id, &principal).await?;
    Ok(Json(staging::list_directories(&state.workspace, &job_id.0, &query.path)?))
}

async fn list_files(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<ListFilesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let job_id = Id::from_string(id);
    state.job_store.get(&job_id, &principal).await?;
    let entry_type = staging::EntryType::parse(query.r#type.as_deref())?;
    Ok(Json(staging::list_files(
        &state.workspace,
        &job_id.0,
        &query.path,
        query.mask.as_deref(),
        entry_type,
        query.depth.unwrap_or(0),
    )?))
}

async fn read_file_content(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let job_id = Id::from_string(id);
    state.job_store.get(&job_id, &principal).await?;
    Ok(Json(staging::read_file_content(&state.workspace, &job_id.0, &query.path)?))
}

async fn download_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let job_id = Id::from_string(id);
    state.job_store.get(&job_id, &principal).await?;
    let path = staging::download_path(&state.workspace, &job_id.0, &query.path)?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::new(ErrorKind::System, e.to_string()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let response_headers = [
        (axum::http::header::CONTENT_TYPE, content_type_for(&filename).to_string()),
        (
            axum::http::header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
    ];
    Ok((response_headers, bytes))
}

/// Content-type by extension (Section 6: "file bytes with content-type by
/// extension"). Unknown extensions fall back to the generic binary type.
fn content_type_for(filename: &str) -> &'static str {
    let ext = filename.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "txt" | "md" | "log" => "text/plain; charset=utf-8",
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" => "application/json",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gz" | "tgz" => "application/gzip",
        _ => "application/octet-stream",
    }
}
