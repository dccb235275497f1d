//! HTTP client for coderunnerd.
//!
//! Communicates with coderunnerd via its REST API (Section 6 of the
//! specification). A thin `reqwest` wrapper - one method per endpoint,
//! error responses mapped onto `ClientError`.

use std::path::Path;

use coderunner_core::types::{Job, JobOptions, JobSummary};
use coderunner_core::wire::{
    CancelJobResponse, CreateJobResponse, DeleteJobResponse, ErrorBody, FileContentResponse,
    HealthResponse, LoginResponse, RepositoryView, StartJobResponse, UnregisterResponse,
    UploadFileResponse, UploadImageResponse,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n → start with: coderunnerd\n → or set CODERUNNER_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("{error_type}: {message}")]
    Api { error_type: String, message: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check CODERUNNER_TOKEN env var or --token flag")]
    Unauthorized,

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n → ensure coderunnerd is running\n → check CODERUNNER_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e.url().map(ToString::to_string).unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Default total timeout for daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for coderunnerd.
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct LoginRequestBody<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RegisterRepositoryBody<'a> {
    name: &'a str,
    git_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    index_aware: Option<bool>,
}

#[derive(Debug, Serialize)]
struct CreateJobBody<'a> {
    prompt: &'a str,
    repository: &'a str,
    options: JobOptions,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Returns the daemon address (for error messages).
    pub fn addr(&self) -> &str {
        &self.base_url
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Check if the daemon is healthy by probing `/health`.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon to become ready with exponential backoff.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS).await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }
                    eprintln!(
                        "waiting for daemon at {} (retrying in {}ms)",
                        self.base_url, backoff_ms
                    );
                    let remaining = timeout_ms.saturating_sub(elapsed);
                    let sleep_ms = backoff_ms.min(remaining);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(value) = self.auth_header() {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    /// Auth header alone, for multipart requests where `headers`'s
    /// `application/json` content type would be wrong.
    fn auth_header(&self) -> Option<HeaderValue> {
        let token = self.token.as_ref()?;
        HeaderValue::from_str(&format!("Bearer {token}")).ok()
    }

    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        if status == 401 {
            return ClientError::Unauthorized;
        }
        match response.json::<ErrorBody>().await {
            Ok(body) => ClientError::Api { error_type: body.error_type, message: body.error },
            Err(_) => ClientError::HttpError { status, message: "unknown error".to_string() },
        }
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `POST /auth/login`
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ClientError> {
        let url = format!("{}/auth/login", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&LoginRequestBody { username, password })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `POST /auth/logout`
    pub async fn logout(&self) -> Result<(), ClientError> {
        let url = format!("{}/auth/logout", self.base_url);
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    /// `GET /repositories`
    pub async fn list_repositories(&self) -> Result<Vec<RepositoryView>, ClientError> {
        let url = format!("{}/repositories", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `GET /repositories/{name}`
    pub async fn get_repository(&self, name: &str) -> Result<RepositoryView, ClientError> {
        let url = format!("{}/repositories/{}", self.base_url, urlencoding::encode(name));
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `POST /repositories/register`
    pub async fn register_repository(
        &self,
        name: &str,
        git_url: &str,
        description: Option<&str>,
        index_aware: Option<bool>,
    ) -> Result<RepositoryView, ClientError> {
        let url = format!("{}/repositories/register", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&RegisterRepositoryBody { name, git_url, description, index_aware })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `DELETE /repositories/{name}`
    pub async fn unregister_repository(&self, name: &str) -> Result<UnregisterResponse, ClientError> {
        let url = format!("{}/repositories/{}", self.base_url, urlencoding::encode(name));
        let response = self.http.delete(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `POST /jobs`
    pub async fn create_job(
        &self,
        repository: &str,
        prompt: &str,
        options: JobOptions,
    ) -> Result<CreateJobResponse, ClientError> {
        let url = format!("{}/jobs", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&CreateJobBody { prompt, repository, options })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `GET /jobs`
    pub async fn list_jobs(&self) -> Result<Vec<JobSummary>, ClientError> {
        let url = format!("{}/jobs", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `GET /jobs/{id}`
    pub async fn get_job(&self, job_id: &str) -> Result<Job, ClientError> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `POST /jobs/{id}/start`
    pub async fn start_job(&self, job_id: &str) -> Result<StartJobResponse, ClientError> {
        let url = format!("{}/jobs/{}/start", self.base_url, job_id);
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `POST /jobs/{id}/cancel`
    pub async fn cancel_job(&self, job_id: &str) -> Result<CancelJobResponse, ClientError> {
        let url = format!("{}/jobs/{}/cancel", self.base_url, job_id);
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `DELETE /jobs/{id}`
    pub async fn delete_job(&self, job_id: &str) -> Result<DeleteJobResponse, ClientError> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        let response = self.http.delete(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `POST /jobs/{id}/files`
    pub async fn upload_file(
        &self,
        job_id: &str,
        path: &Path,
        overwrite: bool,
    ) -> Result<UploadFileResponse, ClientError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| ClientError::IoError(e.to_string()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ClientError::IoError("path has no file name".to_string()))?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename);
        let form = reqwest::multipart::Form::new().part("file", part);
        let url = format!(
            "{}/jobs/{}/files?overwrite={}",
            self.base_url, job_id, overwrite
        );
        let mut request = self.http.post(&url).multipart(form);
        if let Some(auth) = self.auth_header() {
            request = request.header(AUTHORIZATION, auth);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `POST /jobs/{id}/images`
    pub async fn upload_image(&self, job_id: &str, path: &Path) -> Result<UploadImageResponse, ClientError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| ClientError::IoError(e.to_string()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ClientError::IoError("path has no file name".to_string()))?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename);
        let form = reqwest::multipart::Form::new().part("file", part);
        let url = format!("{}/jobs/{}/images", self.base_url, job_id);
        let mut request = self.http.post(&url).multipart(form);
        if let Some(auth) = self.auth_header() {
            request = request.header(AUTHORIZATION, auth);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `GET /jobs/{id}/files?path=&mask=`
    pub async fn list_files(
        &self,
        job_id: &str,
        path: &str,
        mask: Option<&str>,
        entry_type: Option<&str>,
        depth: Option<u32>,
    ) -> Result<serde_json::Value, ClientError> {
        let mut url = format!(
            "{}/jobs/{}/files?path={}",
            self.base_url,
            job_id,
            urlencoding::encode(path)
        );
        if let Some(mask) = mask {
            url.push_str(&format!("&mask={}", urlencoding::encode(mask)));
        }
        if let Some(entry_type) = entry_type {
            url.push_str(&format!("&type={}", urlencoding::encode(entry_type)));
        }
        if let Some(depth) = depth {
            url.push_str(&format!("&depth={depth}"));
        }
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `GET /jobs/{id}/files/content?path=`
    pub async fn read_file_content(&self, job_id: &str, path: &str) -> Result<FileContentResponse, ClientError> {
        let url = format!(
            "{}/jobs/{}/files/content?path={}",
            self.base_url,
            job_id,
            urlencoding::encode(path)
        );
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `GET /jobs/{id}/files/download?path=`
    pub async fn download_file(&self, job_id: &str, path: &str) -> Result<Vec<u8>, ClientError> {
        let url = format!(
            "{}/jobs/{}/files/download?path={}",
            self.base_url,
            job_id,
            urlencoding::encode(path)
        );
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response.bytes().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash() {
        let client = Client::new("http://localhost:8080/", None);
        assert_eq!(client.base_url, "http://localhost:8080");
    }

    #[test]
    fn client_preserves_url_without_trailing_slash() {
        let client = Client::new("http://localhost:8080", None);
        assert_eq!(client.base_url, "http://localhost:8080");
    }

    #[test]
    fn client_stores_auth_token() {
        let client = Client::new("http://localhost:8080", Some("my-secret-token"));
        assert_eq!(client.token, Some("my-secret-token".to_string()));
    }

    #[test]
    fn client_headers_include_content_type() {
        let client = Client::new("http://localhost:8080", None);
        let headers = client.headers();
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn client_headers_include_auth_when_token_set() {
        let client = Client::new("http://localhost:8080", Some("test-token"));
        let headers = client.headers();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer test-token");
    }

    #[test]
    fn client_headers_omit_auth_when_no_token() {
        let client = Client::new("http://localhost:8080", None);
        let headers = client.headers();
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn client_addr_returns_base_url() {
        let client = Client::new("http://localhost:8080", None);
        assert_eq!(client.addr(), "http://localhost:8080");
    }

    #[tokio::test]
    async fn check_health_fails_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19999", None);
        let result = client.check_health().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19999", None);
        let result = client.wait_for_ready_with_timeout(100).await;
        match result {
            Err(ClientError::DaemonNotReady { addr, timeout_ms }) => {
                assert_eq!(addr, "http://127.0.0.1:19999");
                assert_eq!(timeout_ms, 100);
            }
            _ => panic!("expected DaemonNotReady error"),
        }
    }

    #[test]
    fn daemon_not_ready_error_message_includes_hint() {
        let err = ClientError::DaemonNotReady {
            addr: "http://127.0.0.1:8080".to_string(),
            timeout_ms: 5000,
        };
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:8080"));
        assert!(msg.contains("5000ms"));
        assert!(msg.contains("CODERUNNER_TOKEN"));
    }

    #[test]
    fn connection_failed_error_suggests_start_command() {
        let err = ClientError::ConnectionFailed { addr: "http://127.0.0.1:8080".to_string() };
        let msg = err.to_string();
        assert!(msg.contains("coderunnerd"), "should suggest starting coderunnerd");
        assert!(msg.contains("CODERUNNER_ADDR"), "should mention CODERUNNER_ADDR env var");
    }

    #[test]
    fn unauthorized_error_suggests_token_options() {
        let err = ClientError::Unauthorized;
        let msg = err.to_string();
        assert!(msg.contains("CODERUNNER_TOKEN"), "should mention CODERUNNER_TOKEN env var");
        assert!(msg.contains("--token"), "should mention --token flag");
    }
}
