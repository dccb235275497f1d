//! HTTP-layer integration tests for coderunnerd.
//!
//! Drives the axum router directly via `tower::ServiceExt::oneshot`, without
//! binding a real socket. `HostPasswordDatabase` reads the real host shadow
//! database, which the test environment has no privileged access to, so
//! authenticated flows mint a bearer token directly through the
//! `TokenIssuer` rather than exercising `/auth/login` end to end;
//! `/auth/login` itself is covered for its rejection path.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use coderunner_core::config::CowMethod;
use coderunner_core::types::{ErrorKind, Job, JobOptions, JobState, JobSummary, Principal};
use coderunner_core::wire::{
    CancelJobResponse, CreateJobResponse, DeleteJobResponse, ErrorBody, RepositoryView,
    StartJobResponse, UnregisterResponse, UploadFileResponse,
};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use tempfile::TempDir;
use tower::ServiceExt;

use coderunnerd::credential::{CredentialVerifier, HostPasswordDatabase};
use coderunnerd::job_store::JobStore;
use coderunnerd::persistence::Persistence;
use coderunnerd::registry::RepositoryRegistry;
use coderunnerd::scheduler::Scheduler;
use coderunnerd::server::{create_router, AppState};
use coderunnerd::token_issuer::TokenIssuer;
use coderunnerd::workspace::WorkspaceManager;

const SIGNING_KEY: &str = "test-signing-key";

async fn build_state(dir: &TempDir, max_concurrent: u32) -> Arc<AppState> {
    build_state_with_timeout(dir, max_concurrent, 600).await
}

async fn build_state_with_timeout(
    dir: &TempDir,
    max_concurrent: u32,
    jobs_timeout_default_sec: u32,
) -> Arc<AppState> {
    let workspace = Arc::new(WorkspaceManager::new(dir.path().to_path_buf(), CowMethod::Copy));
    let registry = Arc::new(RepositoryRegistry::new(Arc::clone(&workspace)));
    let job_store = Arc::new(JobStore::new());
    let scheduler = Arc::new(Scheduler::new(max_concurrent));
    let persistence = Arc::new(Persistence::open(dir.path()).await.unwrap());
    let token_issuer = TokenIssuer::new(SIGNING_KEY, 3600);
    let credential_verifier = CredentialVerifier::new(HostPasswordDatabase);

    Arc::new(AppState {
        credential_verifier,
        token_issuer,
        registry,
        job_store,
        scheduler,
        workspace,
        persistence,
        index_binary: "coderunner-index".to_string(),
        jobs_timeout_default_sec,
    })
}

async fn test_app() -> (axum::Router, Arc<AppState>, TempDir) {
    let dir = TempDir::new().unwrap();
    let state = build_state(&dir, 5).await;
    let router = create_router(Arc::clone(&state));
    (router, state, dir)
}

fn token_for(state: &AppState, username: &str) -> String {
    let (token, _expires) = state.token_issuer.issue(&Principal(username.to_string())).unwrap();
    token
}

async fn body_as<T: DeserializeOwned>(response: Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_auth(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

fn post_json_auth(uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_auth(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

fn delete_auth(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

async fn register_demo(router: &axum::Router, token: &str) {
    let req = post_json_auth(
        "/repositories/register",
        token,
        json!({"name": "demo", "gitUrl": "https://example.invalid/demo.git"}),
    );
    let response = router.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

async fn create_job(router: &axum::Router, token: &str) -> CreateJobResponse {
    let req = post_json_auth("/jobs", token, json!({"prompt": "hi", "repository": "demo"}));
    let response = router.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    body_as(response).await
}

/// Build a single-file `multipart/form-data` request body by hand (no
/// `reqwest` in this crate's dev-dependencies, so no ready-made multipart
/// builder) - enough to drive the `axum::extract::Multipart` extractor
/// under test.
fn upload_request(uri: &str, token: &str, filename: &str, bytes: &[u8]) -> Request<Body> {
    const BOUNDARY: &str = "----coderunner-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

// --- health & auth ---

#[tokio::test]
async fn health_check_requires_no_auth() {
    let (router, _state, _dir) = test_app().await;
    let response = router.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn login_with_unknown_user_returns_auth_error_not_user_existence() {
    let (router, _state, _dir) = test_app().await;
    let req = Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header("content-type", "application/json")
        .body(Body::from(json!({"username": "alice", "password": "wrong"}).to_string()))
        .unwrap();
    let response = router.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: ErrorBody = body_as(response).await;
    assert_eq!(body.error_type, ErrorKind::Auth.as_str());
}

#[tokio::test]
async fn requests_without_bearer_token_are_rejected() {
    let (router, _state, _dir) = test_app().await;
    let response = router.oneshot(get("/jobs")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn requests_with_malformed_token_are_rejected() {
    let (router, _state, _dir) = test_app().await;
    let response = router.oneshot(get_auth("/jobs", "not-a-real-token")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// --- repositories ---

#[tokio::test]
async fn list_repositories_starts_empty() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    let response = router.oneshot(get_auth("/repositories", &token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let repos: Vec<RepositoryView> = body_as(response).await;
    assert!(repos.is_empty());
}

#[tokio::test]
async fn register_repository_returns_created_with_cloning_state() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    let req = post_json_auth(
        "/repositories/register",
        &token,
        json!({"name": "demo", "gitUrl": "https://example.invalid/demo.git", "indexAware": false}),
    );
    let response = router.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let repo: RepositoryView = body_as(response).await;
    assert_eq!(repo.name, "demo");
    assert_eq!(repo.clone_state.as_str(), "cloning");
}

#[tokio::test]
async fn register_duplicate_repository_name_is_conflict() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    register_demo(&router, &token).await;

    let second = post_json_auth(
        "/repositories/register",
        &token,
        json!({"name": "demo", "gitUrl": "https://example.invalid/other.git"}),
    );
    let response = router.oneshot(second).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body: ErrorBody = body_as(response).await;
    assert_eq!(body.error_type, ErrorKind::Conflict.as_str());
}

#[tokio::test]
async fn get_unknown_repository_is_not_found() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    let response = router.oneshot(get_auth("/repositories/ghost", &token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unregister_unknown_repository_is_not_found() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    let response = router.oneshot(delete_auth("/repositories/ghost", &token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unregister_repository_succeeds_when_unreferenced() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    register_demo(&router, &token).await;

    let response = router.oneshot(delete_auth("/repositories/demo", &token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: UnregisterResponse = body_as(response).await;
    assert!(body.success);
    assert!(body.removed);
}

// --- jobs: creation, ownership, lifecycle ---

#[tokio::test]
async fn create_job_against_unregistered_repository_is_validation_error() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    let req = post_json_auth("/jobs", &token, json!({"prompt": "hi", "repository": "ghost"}));
    let response = router.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorBody = body_as(response).await;
    assert_eq!(body.error_type, ErrorKind::Validation.as_str());
}

#[tokio::test]
async fn create_job_returns_created_state_and_workspace_path() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    register_demo(&router, &token).await;

    let created = create_job(&router, &token).await;
    assert_eq!(created.status, "created");
    assert!(created.cow_path.contains(&created.job_id));
}

#[tokio::test]
async fn job_access_is_forbidden_to_other_principals() {
    let (router, state, _dir) = test_app().await;
    let alice = token_for(&state, "alice");
    let bob = token_for(&state, "bob");
    register_demo(&router, &alice).await;

    let created = create_job(&router, &alice).await;
    let job_id = created.job_id;

    let as_owner = router.clone().oneshot(get_auth(&format!("/jobs/{job_id}"), &alice)).await.unwrap();
    assert_eq!(as_owner.status(), StatusCode::OK);

    let as_other = router.oneshot(get_auth(&format!("/jobs/{job_id}"), &bob)).await.unwrap();
    assert_eq!(as_other.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn list_jobs_is_scoped_to_the_authenticated_principal() {
    let (router, state, _dir) = test_app().await;
    let alice = token_for(&state, "alice");
    let bob = token_for(&state, "bob");
    register_demo(&router, &alice).await;
    create_job(&router, &alice).await;

    let alice_jobs: Vec<JobSummary> = body_as(router.clone().oneshot(get_auth("/jobs", &alice)).await.unwrap()).await;
    assert_eq!(alice_jobs.len(), 1);

    let bob_jobs: Vec<JobSummary> = body_as(router.oneshot(get_auth("/jobs", &bob)).await.unwrap()).await;
    assert!(bob_jobs.is_empty());
}

#[tokio::test]
async fn start_job_transitions_to_queued_with_position() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    register_demo(&router, &token).await;
    let created = create_job(&router, &token).await;

    let response = router
        .oneshot(post_auth(&format!("/jobs/{}/start", created.job_id), &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: StartJobResponse = body_as(response).await;
    assert_eq!(body.status, "queued");
    assert_eq!(body.queue_position, Some(1));
}

#[tokio::test]
async fn starting_an_already_started_job_is_a_conflict() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    register_demo(&router, &token).await;
    let created = create_job(&router, &token).await;
    let start_uri = format!("/jobs/{}/start", created.job_id);

    let first = router.clone().oneshot(post_auth(&start_uri, &token)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = router.oneshot(post_auth(&start_uri, &token)).await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn cancel_while_queued_transitions_to_cancelled_without_admission() {
    // Saturate the single admission slot with one job, then cancel a second
    // job that is still waiting in the queue.
    let dir = TempDir::new().unwrap();
    let state = build_state(&dir, 1).await;
    let router = create_router(Arc::clone(&state));
    let token = token_for(&state, "alice");
    register_demo(&router, &token).await;

    let job_one = create_job(&router, &token).await;
    let job_two = create_job(&router, &token).await;

    router
        .clone()
        .oneshot(post_auth(&format!("/jobs/{}/start", job_one.job_id), &token))
        .await
        .unwrap();
    let _admission = state.scheduler.admit().await;

    let started_two: StartJobResponse = body_as(
        router
            .clone()
            .oneshot(post_auth(&format!("/jobs/{}/start", job_two.job_id), &token))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(started_two.status, "queued");

    let cancel_response = router
        .clone()
        .oneshot(post_auth(&format!("/jobs/{}/cancel", job_two.job_id), &token))
        .await
        .unwrap();
    assert_eq!(cancel_response.status(), StatusCode::OK);
    let cancelled: CancelJobResponse = body_as(cancel_response).await;
    assert!(cancelled.success);

    let fetched: Job = body_as(
        router
            .oneshot(get_auth(&format!("/jobs/{}", job_two.job_id), &token))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(fetched.state, JobState::Cancelled);
}

#[tokio::test]
async fn delete_non_terminal_job_fails_until_cancelled() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    register_demo(&router, &token).await;
    let created = create_job(&router, &token).await;
    let job_id = created.job_id;

    let first_delete = router.clone().oneshot(delete_auth(&format!("/jobs/{job_id}"), &token)).await.unwrap();
    assert_eq!(first_delete.status(), StatusCode::CONFLICT);

    router
        .clone()
        .oneshot(post_auth(&format!("/jobs/{job_id}/cancel"), &token))
        .await
        .unwrap();

    let second_delete = router.oneshot(delete_auth(&format!("/jobs/{job_id}"), &token)).await.unwrap();
    assert_eq!(second_delete.status(), StatusCode::OK);
    let body: DeleteJobResponse = body_as(second_delete).await;
    assert!(body.success);
    assert!(body.workspace_removed);
}

// --- staging & artifact browser: path safety ---

#[tokio::test]
async fn file_download_path_escape_is_rejected() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    register_demo(&router, &token).await;
    let created = create_job(&router, &token).await;

    let response = router
        .oneshot(get_auth(
            &format!("/jobs/{}/files/download?path=../../etc/passwd", created.job_id),
            &token,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorBody = body_as(response).await;
    assert_eq!(body.error_type, ErrorKind::Validation.as_str());
}

#[tokio::test]
async fn file_listing_for_unknown_job_is_not_found() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    let response = router
        .oneshot(get_auth("/jobs/00000000-0000-0000-0000-000000000000/files?path=", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn file_listing_rejects_unknown_type_filter() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    register_demo(&router, &token).await;
    let created = create_job(&router, &token).await;

    let response = router
        .oneshot(get_auth(&format!("/jobs/{}/files?type=bogus", created.job_id), &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorBody = body_as(response).await;
    assert_eq!(body.error_type, ErrorKind::Validation.as_str());
}

#[tokio::test]
async fn uploaded_file_can_be_downloaded_before_the_job_runs() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    register_demo(&router, &token).await;
    let created = create_job(&router, &token).await;

    let upload: UploadFileResponse = body_as(
        router
            .clone()
            .oneshot(upload_request(
                &format!("/jobs/{}/files", created.job_id),
                &token,
                "notes.txt",
                b"hello from staging",
            ))
            .await
            .unwrap(),
    )
    .await;
    assert!(!upload.overwritten);
    assert_eq!(upload.file_size, "hello from staging".len() as u64);

    let download = router
        .oneshot(get_auth(
            &format!("/jobs/{}/files/download?path={}", created.job_id, upload.filename),
            &token,
        ))
        .await
        .unwrap();
    assert_eq!(download.status(), StatusCode::OK);
    assert_eq!(
        download.headers().get("content-type").unwrap(),
        "text/plain; charset=utf-8",
    );
    let bytes = download.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"hello from staging");
}

#[tokio::test]
async fn reuploading_without_overwrite_leaves_the_prior_file_in_place() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    register_demo(&router, &token).await;
    let created = create_job(&router, &token).await;
    let uri = format!("/jobs/{}/files", created.job_id);

    let first: UploadFileResponse =
        body_as(router.clone().oneshot(upload_request(&uri, &token, "notes.txt", b"first")).await.unwrap())
            .await;
    assert!(!first.overwritten);
    let second: UploadFileResponse =
        body_as(router.clone().oneshot(upload_request(&uri, &token, "notes.txt", b"second")).await.unwrap())
            .await;
    assert!(!second.overwritten);
    assert_ne!(first.filename, second.filename);

    for (name, expected) in [(&first.filename, "first"), (&second.filename, "second")] {
        let download = router
            .clone()
            .oneshot(get_auth(&format!("/jobs/{}/files/download?path={name}", created.job_id), &token))
            .await
            .unwrap();
        assert_eq!(download.status(), StatusCode::OK);
        let bytes = download.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], expected.as_bytes());
    }
}

#[tokio::test]
async fn reuploading_with_overwrite_replaces_the_prior_staged_file() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    register_demo(&router, &token).await;
    let created = create_job(&router, &token).await;
    let uri = format!("/jobs/{}/files", created.job_id);

    let first: UploadFileResponse =
        body_as(router.clone().oneshot(upload_request(&uri, &token, "notes.txt", b"first")).await.unwrap())
            .await;
    assert!(!first.overwritten);

    let overwrite_uri = format!("{uri}?overwrite=true");
    let second: UploadFileResponse = body_as(
        router.clone().oneshot(upload_request(&overwrite_uri, &token, "notes.txt", b"second")).await.unwrap(),
    )
    .await;
    assert!(second.overwritten);

    let download = router
        .oneshot(get_auth(
            &format!("/jobs/{}/files/download?path={}", created.job_id, second.filename),
            &token,
        ))
        .await
        .unwrap();
    let bytes = download.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"second");
}

// --- job options round-trip through the wire layer ---

#[tokio::test]
async fn create_job_honors_custom_options() {
    let (router, state, _dir) = test_app().await;
    let token = token_for(&state, "alice");
    register_demo(&router, &token).await;

    let req = post_json_auth(
        "/jobs",
        &token,
        json!({
            "prompt": "hi",
            "repository": "demo",
            "options": {"preUpdate": false, "buildIndex": false, "timeoutSeconds": 30},
        }),
    );
    let created: CreateJobResponse = body_as(router.clone().oneshot(req).await.unwrap()).await;

    let fetched: Job =
        body_as(router.oneshot(get_auth(&format!("/jobs/{}", created.job_id), &token)).await.unwrap()).await;
    assert!(!fetched.options.pre_update);
    assert!(!fetched.options.build_index);
    assert_eq!(fetched.options.timeout_seconds, 30);
}

#[tokio::test]
async fn create_job_without_explicit_timeout_uses_configured_default() {
    let dir = TempDir::new().unwrap();
    let state = build_state_with_timeout(&dir, 5, 45).await;
    let router = create_router(Arc::clone(&state));
    let token = token_for(&state, "alice");
    register_demo(&router, &token).await;

    let req = post_json_auth("/jobs", &token, json!({"prompt": "hi", "repository": "demo"}));
    let created: CreateJobResponse = body_as(router.clone().oneshot(req).await.unwrap()).await;

    let fetched: Job =
        body_as(router.oneshot(get_auth(&format!("/jobs/{}", created.job_id), &token)).await.unwrap()).await;
    assert_eq!(fetched.options.timeout_seconds, 45);
}

#[test]
fn default_job_options_match_daemon_defaults() {
    let opts = JobOptions::default();
    assert!(opts.pre_update);
    assert!(opts.build_index);
    assert_eq!(opts.timeout_seconds, 600);
}
