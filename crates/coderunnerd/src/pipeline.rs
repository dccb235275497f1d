//! Pipeline Coordinator.
//!
//! Drives a single job through its lifecycle state machine: `staging` ->
//! `git_pulling` -> `index_building` -> `running` -> one of `completed`,
//! `failed`, `timeout`; any non-terminal stage can also end in `cancelled`.
//! Teardown (stopping the index daemon) always runs regardless of outcome,
//! and a teardown failure is appended to `diagnostics` - it never overwrites
//! the job's primary failure kind (Section 4.6 ordering rule). Workspace
//! destruction is deliberately not part of teardown here: the workspace
//! stays browsable via C8 until the job itself is deleted.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use coderunner_core::types::{CapturedOutput, FailStage, Job, JobState};

use crate::index;
use crate::job_store::JobStore;
use crate::persistence::Persistence;
use crate::registry::RepositoryRegistry;
use crate::runner::{ExecutorRequest, ExecutorRunner, ExitReason};
use crate::scheduler::{Admission, Scheduler};
use crate::staging;
use crate::workspace::WorkspaceManager;

pub struct PipelineContext {
    pub job_store: Arc<JobStore>,
    pub workspace: Arc<WorkspaceManager>,
    pub registry: Arc<RepositoryRegistry>,
    pub runner: Arc<ExecutorRunner>,
    pub scheduler: Arc<Scheduler>,
    pub persistence: Arc<Persistence>,
    pub index_binary: String,
    pub executor_binary: String,
    pub executor_env_allow: Vec<String>,
}

struct StageError {
    stage: FailStage,
    message: String,
}

enum Outcome {
    Completed { exit_code: i32, output: CapturedOutput },
    Failed(StageError),
    TimedOut,
    Cancelled,
}

/// Run one job end to end once admitted past the scheduler's concurrency
/// gate (Section 4.6). Consumes the `Admission` so its permit and
/// cancellation token live exactly as long as this job does.
pub async fn run_job(ctx: Arc<PipelineContext>, admission: Admission) {
    let Admission { job_id, permit, cancel } = admission;
    let _permit = permit;

    let job = match ctx.job_store.get_any(&job_id).await {
        Ok(job) => job,
        Err(e) => {
            error!(job_id = %job_id, error = %e, "admitted job vanished from the store");
            ctx.scheduler.release(&job_id).await;
            return;
        }
    };

    let (outcome, diagnostics) = drive(&ctx, &job, cancel).await;

    let result = ctx
        .job_store
        .mutate(&job_id, |j| apply_outcome(j, outcome, diagnostics))
        .await;
    if let Err(e) = result {
        error!(job_id = %job_id, error = %e, "failed to persist final job state");
    }

    ctx.scheduler.release(&job_id).await;

    let jobs = ctx.job_store.list_all().await;
    if let Err(e) = ctx.persistence.snapshot(&jobs) {
        warn!(job_id = %job_id, error = %e, "failed to write job snapshot after completion");
    }
    ctx.persistence
        .record_event(&job_id.0, "job_finished", "")
        .await;
}

async fn drive(ctx: &PipelineContext, job: &Job, cancel: CancellationToken) -> (Outcome, Vec<String>) {
    let job_id = job.id.clone();
    let mut diagnostics = Vec::new();

    if cancel.is_cancelled() {
        return (Outcome::Cancelled, diagnostics);
    }

    // --- staging ---
    if let Err(e) = ctx.job_store.mutate(&job_id, |j| j.state = JobState::Staging).await {
        return (Outcome::Failed(StageError { stage: FailStage::Exec, message: e.to_string() }), diagnostics);
    }
    let workspace = Arc::clone(&ctx.workspace);
    let repo_name = job.repository.clone();
    let job_id_str = job_id.0.clone();
    let clone_result = tokio::task::spawn_blocking(move || workspace.clone_repo(&repo_name, &job_id_str))
        .await
        .unwrap_or_else(|e| Err(crate::workspace::WorkspaceError::Io(std::io::Error::other(e))));
    let workspace_path = match clone_result {
        Ok(path) => path,
        Err(e) => {
            return (
                Outcome::Failed(StageError { stage: FailStage::Git, message: e.to_string() }),
                diagnostics,
            );
        }
    };
    if let Err(e) = staging::materialize_into_workspace(&ctx.workspace, &job_id.0) {
        warn!(job_id = %job_id, error = %e, "failed to materialize staged uploads");
        diagnostics.push(format!("staging materialize failed: {e}"));
    }

    if cancel.is_cancelled() {
        return (Outcome::Cancelled, diagnostics);
    }

    // --- git_pulling ---
    if job.options.pre_update {
        if let Err(e) = ctx.job_store.mutate(&job_id, |j| j.state = JobState::GitPulling).await {
            return (Outcome::Failed(StageError { stage: FailStage::Exec, message: e.to_string() }), diagnostics);
        }
        let pull_path = workspace_path.clone();
        let pull_result = tokio::task::spawn_blocking(move || crate::git::pull(&pull_path))
            .await
            .unwrap_or_else(|e| Err(crate::git::GitError::CommandFailed(e.to_string())));
        if let Err(e) = pull_result {
            return (
                Outcome::Failed(StageError { stage: FailStage::Git, message: e.to_string() }),
                diagnostics,
            );
        }
    }

    if cancel.is_cancelled() {
        return (Outcome::Cancelled, diagnostics);
    }

    // --- index_building ---
    // "silently forced off if the repository was not registered
    // index-aware or if the binary is missing" (Section 3 "Options"): an
    // ineffective request never fails the job, it just skips the stage.
    let repo_index_aware = ctx
        .registry
        .get(&job.repository)
        .await
        .map(|repo| repo.index_aware)
        .unwrap_or(false);
    let build_index_effective = job.options.build_index
        && repo_index_aware
        && index::binary_available(&ctx.index_binary);

    let mut index_daemon = None;
    let mut index_healthy = false;
    if build_index_effective {
        if let Err(e) = ctx.job_store.mutate(&job_id, |j| j.state = JobState::IndexBuilding).await {
            return (Outcome::Failed(StageError { stage: FailStage::Exec, message: e.to_string() }), diagnostics);
        }
        match index::start_and_reconcile(&ctx.index_binary, &workspace_path).await {
            Ok(daemon) => {
                index_healthy = index::health_probe(&ctx.index_binary, &workspace_path).await;
                index_daemon = Some(daemon);
            }
            Err(e) => {
                return (
                    Outcome::Failed(StageError { stage: FailStage::Index, message: e.to_string() }),
                    diagnostics,
                );
            }
        }
    }

    if cancel.is_cancelled() {
        teardown(index_daemon, &mut diagnostics).await;
        return (Outcome::Cancelled, diagnostics);
    }

    // --- running ---
    if let Err(e) = ctx.job_store.mutate(&job_id, |j| j.state = JobState::Running).await {
        teardown(index_daemon, &mut diagnostics).await;
        return (Outcome::Failed(StageError { stage: FailStage::Exec, message: e.to_string() }), diagnostics);
    }

    let system_prompt_prefix = if index_healthy {
        Some(
            "A semantic index of this repository is available to accelerate search."
                .to_string(),
        )
    } else {
        None
    };

    let timeout = Duration::from_secs(u64::from(job.options.timeout_seconds));
    let image_paths = staging::image_paths(&ctx.workspace, &job_id.0);
    let request = ExecutorRequest {
        workspace: workspace_path,
        username: job.principal.username().to_string(),
        prompt: job.prompt.clone(),
        image_paths,
        system_prompt_prefix,
        executor_binary: ctx.executor_binary.clone(),
        env_allow: ctx.executor_env_allow.clone(),
        timeout,
    };

    let run_result = ctx.runner.run(&request, cancel).await;
    teardown(index_daemon, &mut diagnostics).await;

    match run_result {
        Ok(outcome) => {
            let combined = combine_output(outcome.stdout, outcome.stderr);
            match outcome.exit_reason {
                ExitReason::Exited(code) if code == 0 => {
                    (Outcome::Completed { exit_code: code, output: combined }, diagnostics)
                }
                ExitReason::Exited(code) => (
                    Outcome::Failed(StageError {
                        stage: FailStage::Exec,
                        message: format!("executor exited with status {code}"),
                    }),
                    diagnostics,
                ),
                ExitReason::Timeout => (Outcome::TimedOut, diagnostics),
                ExitReason::Killed => (Outcome::Cancelled, diagnostics),
            }
        }
        Err(e) => (
            Outcome::Failed(StageError { stage: FailStage::Exec, message: e.to_string() }),
            diagnostics,
        ),
    }
}

fn combine_output(stdout: CapturedOutput, stderr: CapturedOutput) -> CapturedOutput {
    CapturedOutput {
        text: format!("{}\n--- stderr ---\n{}", stdout.text, stderr.text),
        truncated: stdout.truncated || stderr.truncated,
    }
}

/// Always stop the index daemon, regardless of how the job ended (Section
/// 4.6 teardown rule). A stop failure is recorded as a diagnostic, never as
/// the job's primary error.
async fn teardown(index_daemon: Option<index::IndexDaemon>, diagnostics: &mut Vec<String>) {
    if let Some(daemon) = index_daemon {
        info!("tearing down index daemon for finished job");
        daemon.stop().await;
        diagnostics.push("index daemon stopped during teardown".to_string());
    }
}

fn apply_outcome(job: &mut Job, outcome: Outcome, diagnostics: Vec<String>) {
    job.completed_at = Some(chrono::Utc::now());
    job.diagnostics.extend(diagnostics);
    match outcome {
        Outcome::Completed { exit_code, output } => {
            job.state = JobState::Completed;
            job.exit_code = Some(exit_code);
            job.output = output;
        }
        Outcome::Failed(stage_error) => {
            job.state = JobState::Failed { stage: stage_error.stage };
            job.error_message = Some(stage_error.message);
        }
        Outcome::TimedOut => {
            job.state = JobState::Timeout;
        }
        Outcome::Cancelled => {
            job.state = JobState::Cancelled;
        }
    }
}
