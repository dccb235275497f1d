//! Core types shared between the daemon and the CLI client.
//!
//! `Repository`, `Job`, and the state machine driven by the pipeline
//! coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for jobs. Uses `UUIDv7` for time-ordered lexicographic
/// sorting, matching creation-descending listing order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The authenticated OS user on behalf of whom work is performed.
///
/// Threaded explicitly through every component call from the HTTP boundary
/// down - never read off thread-local or global state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(pub String);

impl Principal {
    pub fn username(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire-level error taxonomy. Every component boundary converts its own
/// error type into one of these kinds; only the kind and a sanitized
/// message cross the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    Validation,
    Auth,
    Forbidden,
    NotFound,
    Conflict,
    #[serde(rename = "Stage.Git")]
    StageGit,
    #[serde(rename = "Stage.Index")]
    StageIndex,
    #[serde(rename = "Stage.Exec")]
    StageExec,
    Timeout,
    Cancelled,
    System,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "Validation",
            Self::Auth => "Auth",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "NotFound",
            Self::Conflict => "Conflict",
            Self::StageGit => "Stage.Git",
            Self::StageIndex => "Stage.Index",
            Self::StageExec => "Stage.Exec",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::System => "System",
        }
    }

    /// HTTP status code this kind maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Auth => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::StageGit | Self::StageIndex | Self::StageExec | Self::Timeout | Self::Cancelled => 500,
            Self::System => 500,
        }
    }
}

// --- Repository ---

/// Clone state of a registered repository's master copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneState {
    Cloning,
    Completed,
    GitFailed,
    IndexFailed,
}

impl CloneState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloning => "cloning",
            Self::Completed => "completed",
            Self::GitFailed => "git_failed",
            Self::IndexFailed => "index_failed",
        }
    }
}

/// A registered master repository. Derived fields (branch, head, size,
/// dirty, ahead/behind) are computed at query time and are not part of the
/// persisted record - see `coderunnerd::registry::RepositoryMetadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    /// Unique name, compared case-insensitively but stored with caller casing.
    pub name: String,
    pub origin_url: String,
    pub description: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub clone_state: CloneState,
    pub index_aware: bool,
}

// --- Job ---

/// Per-job options, all supplied at creation and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobOptions {
    pub pre_update: bool,
    pub build_index: bool,
    pub timeout_seconds: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            pre_update: true,
            build_index: true,
            timeout_seconds: 600,
        }
    }
}

/// The stage at which a job's pipeline failed, distinguishing the three
/// external sub-process failure points plus crash-recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailStage {
    Git,
    Index,
    Exec,
    Recover,
}

impl FailStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Index => "index",
            Self::Exec => "exec",
            Self::Recover => "recover",
        }
    }
}

/// Job lifecycle state - a path through the pipeline DAG. Terminal variants
/// are `Completed`, `Failed`, `Timeout`, and `Cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Created,
    Queued,
    Staging,
    GitPulling,
    IndexBuilding,
    Running,
    Completed,
    Failed { stage: FailStage },
    Timeout,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Staging => "staging",
            Self::GitPulling => "git_pulling",
            Self::IndexBuilding => "index_building",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed { .. } | Self::Timeout | Self::Cancelled
        )
    }

    /// Whether this state counts against `maxConcurrent`.
    pub fn is_admitted(&self) -> bool {
        matches!(
            self,
            Self::Staging | Self::GitPulling | Self::IndexBuilding | Self::Running
        )
    }
}

/// Captured textual output, bounded with head/tail preservation on overflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
}

/// A single batch job. Mutable fields are only ever written through the job
/// store's `mutate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Id,
    pub principal: Principal,
    pub repository: String,
    pub prompt: String,
    pub options: JobOptions,
    pub created_at: DateTime<Utc>,

    #[serde(flatten)]
    pub state: JobState,
    pub queue_position: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub output: CapturedOutput,
    pub error_message: Option<String>,
    /// Secondary diagnostics appended by teardown failures that must never
    /// overwrite the primary failure kind.
    pub diagnostics: Vec<String>,
    /// Short auto-derived label; may be filled in asynchronously.
    pub title: Option<String>,
}

impl Job {
    pub fn new(
        principal: Principal,
        repository: String,
        prompt: String,
        options: JobOptions,
    ) -> Self {
        Self {
            id: Id::new(),
            principal,
            repository,
            prompt,
            options,
            created_at: Utc::now(),
            state: JobState::Created,
            queue_position: None,
            started_at: None,
            completed_at: None,
            exit_code: None,
            output: CapturedOutput::default(),
            error_message: None,
            diagnostics: Vec::new(),
            title: None,
        }
    }

    /// Workspace path: `<root>/jobs/<jobId>/`.
    pub fn workspace_dir_name(&self) -> String {
        self.id.0.clone()
    }

    /// Staging path: `<root>/staging/<jobId>/`.
    pub fn staging_dir_name(&self) -> String {
        self.id.0.clone()
    }
}

/// A lightweight projection of `Job` for list endpoints (`GET /jobs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: Id,
    pub repository: String,
    #[serde(flatten)]
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub title: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            repository: job.repository.clone(),
            state: job.state.clone(),
            created_at: job.created_at,
            title: job.title.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        assert_ne!(Id::new(), Id::new());
    }

    #[test]
    fn job_state_terminal_classification() {
        assert!(!JobState::Created.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Timeout.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(JobState::Failed { stage: FailStage::Exec }.is_terminal());
    }

    #[test]
    fn job_state_admitted_classification() {
        assert!(!JobState::Created.is_admitted());
        assert!(!JobState::Queued.is_admitted());
        assert!(JobState::Staging.is_admitted());
        assert!(JobState::GitPulling.is_admitted());
        assert!(JobState::IndexBuilding.is_admitted());
        assert!(JobState::Running.is_admitted());
        assert!(!JobState::Completed.is_admitted());
    }

    #[test]
    fn error_kind_status_codes_match_spec_table() {
        assert_eq!(ErrorKind::Validation.status_code(), 400);
        assert_eq!(ErrorKind::Auth.status_code(), 401);
        assert_eq!(ErrorKind::Forbidden.status_code(), 403);
        assert_eq!(ErrorKind::NotFound.status_code(), 404);
        assert_eq!(ErrorKind::Conflict.status_code(), 409);
    }

    #[test]
    fn error_kind_serializes_with_dotted_stage_names() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::StageGit).unwrap(),
            "\"Stage.Git\""
        );
    }

    #[test]
    fn job_options_defaults_match_spec() {
        let opts = JobOptions::default();
        assert!(opts.pre_update);
        assert!(opts.build_index);
        assert_eq!(opts.timeout_seconds, 600);
    }
}
