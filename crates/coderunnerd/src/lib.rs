//! coderunnerd: the multi-tenant batch-execution daemon.
//!
//! Wires the ten components together: the daemon itself only owns startup
//! (boot reconciliation, per Section 4.10), the HTTP control plane (Section
//! 6), and the admission loop that feeds admitted jobs to the Pipeline
//! Coordinator. Everything else - credential checks, git, the job store, the
//! scheduler, the executor runner, staging, tokens, persistence - lives in
//! its own module and is constructed once here.

pub mod credential;
pub mod git;
pub mod index;
pub mod job_store;
pub mod persistence;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod staging;
pub mod token_issuer;
pub mod workspace;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use coderunner_core::types::JobState;
use coderunner_core::Config;

use crate::credential::{CredentialVerifier, HostPasswordDatabase};
use crate::job_store::JobStore;
use crate::persistence::{Persistence, PersistenceError};
use crate::pipeline::PipelineContext;
use crate::registry::RepositoryRegistry;
use crate::runner::ExecutorRunner;
use crate::scheduler::Scheduler;
use crate::server::{create_router, AppState};
use crate::token_issuer::TokenIssuer;
use crate::workspace::WorkspaceManager;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to initialize persistence: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("invalid bind address '{0}'")]
    Addr(String),
    #[error("failed to bind HTTP listener: {0}")]
    Bind(std::io::Error),
    #[error("HTTP server error: {0}")]
    Serve(std::io::Error),
    #[error("executor binary '{0}' is not installed or not executable")]
    ExecutorMissing(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Floor cadence for the periodic job-store snapshot while any job is
/// non-terminal (Section 4.10: "after every terminal transition and at
/// least every N seconds while any job is non-terminal").
const SNAPSHOT_INTERVAL_SECS: u64 = 30;

/// How often the retention reaper scans for terminal jobs past
/// `jobs_retention_hours`.
const REAP_INTERVAL_SECS: u64 = 300;

/// The running daemon: every component, plus the token that tells the HTTP
/// server and the admission loop to wind down together (graceful
/// shutdown on SIGINT/SIGTERM).
pub struct Daemon {
    config: Config,
    app_state: Arc<AppState>,
    pipeline_ctx: Arc<PipelineContext>,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
}

impl Daemon {
    pub async fn new(config: Config) -> Result<Self> {
        // The executor binary is not optional like the index binary - a
        // daemon with no way to ever run a job is a fatal startup error
        // (Section 6 "Exit codes": "missing required binaries"), while the
        // index binary's absence only disables indexing per-job.
        if !crate::index::binary_available(&config.executor_binary) {
            return Err(DaemonError::ExecutorMissing(config.executor_binary.clone()));
        }

        let workspace = Arc::new(WorkspaceManager::new(
            config.workspace_root.clone(),
            config.cow_method,
        ));
        let registry = Arc::new(RepositoryRegistry::new(Arc::clone(&workspace)));
        let job_store = Arc::new(JobStore::new());
        let scheduler = Arc::new(Scheduler::new(config.jobs_max_concurrent));
        let persistence = Arc::new(Persistence::open(&config.workspace_root).await?);
        let runner = Arc::new(ExecutorRunner::new());
        let token_issuer = TokenIssuer::new(&config.auth_signing_key, config.auth_token_ttl_sec);
        let credential_verifier = CredentialVerifier::new(HostPasswordDatabase);

        let app_state = Arc::new(AppState {
            credential_verifier,
            token_issuer,
            registry: Arc::clone(&registry),
            job_store: Arc::clone(&job_store),
            scheduler: Arc::clone(&scheduler),
            workspace: Arc::clone(&workspace),
            persistence: Arc::clone(&persistence),
            index_binary: config.index_binary.clone(),
            jobs_timeout_default_sec: config.jobs_timeout_default_sec,
        });

        let pipeline_ctx = Arc::new(PipelineContext {
            job_store,
            workspace,
            registry,
            runner,
            scheduler: Arc::clone(&scheduler),
            persistence,
            index_binary: config.index_binary.clone(),
            executor_binary: config.executor_binary.clone(),
            executor_env_allow: config.executor_env_allow.clone(),
        });

        Ok(Self {
            config,
            app_state,
            pipeline_ctx,
            scheduler,
            shutdown: CancellationToken::new(),
        })
    }

    /// Boot reconciliation (Section 4.10): load the last snapshot, mark any
    /// job caught mid-pipeline as `failed[recover]`, restore the job store,
    /// and re-enqueue whatever was still `queued`, in its original order.
    /// Must run before the HTTP server starts accepting requests.
    async fn recover(&self) -> Result<()> {
        let persisted = self.app_state.persistence.load()?;
        let job_count = persisted.len();
        let reconciled = Persistence::reconcile(persisted);
        let queued_ids = reconciled
            .iter()
            .filter(|job| job.state == JobState::Queued)
            .map(|job| job.id.clone())
            .collect::<Vec<_>>();

        self.app_state.job_store.restore(reconciled).await;
        self.scheduler.reconcile(queued_ids).await;
        info!(job_count, "boot reconciliation complete");
        Ok(())
    }

    /// Run until `shutdown` is called: the HTTP server and the admission
    /// loop race each other, and either one winding down stops the daemon.
    pub async fn run(&self) -> Result<()> {
        self.recover().await?;

        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|_| DaemonError::Addr(self.config.bind_addr.clone()))?;
        let listener = TcpListener::bind(addr).await.map_err(DaemonError::Bind)?;
        info!(%addr, "coderunnerd listening");

        let router = create_router(Arc::clone(&self.app_state));
        let shutdown_signal = self.shutdown.clone();
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            shutdown_signal.cancelled().await;
        });

        tokio::select! {
            result = server => result.map_err(DaemonError::Serve),
            () = self.admission_loop() => Ok(()),
            () = self.snapshot_loop() => Ok(()),
            () = self.reap_loop() => Ok(()),
        }
    }

    /// Pull admitted jobs off the scheduler and hand each one to its own
    /// Pipeline Coordinator task (admission is FIFO and
    /// bounded, but driving each job forward happens concurrently).
    async fn admission_loop(&self) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                admission = self.scheduler.admit() => {
                    let ctx = Arc::clone(&self.pipeline_ctx);
                    tokio::spawn(pipeline::run_job(ctx, admission));
                }
            }
        }
    }

    /// Writes a job-store snapshot on a floor cadence whenever at least one
    /// job is non-terminal, supplementing the post-terminal-transition
    /// snapshot the pipeline coordinator already writes on its own.
    async fn snapshot_loop(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(SNAPSHOT_INTERVAL_SECS));
        ticker.tick().await;
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let jobs = self.app_state.job_store.list_all().await;
                    let any_non_terminal = jobs.iter().any(|j| !j.state.is_terminal());
                    if any_non_terminal {
                        if let Err(e) = self.app_state.persistence.snapshot(&jobs) {
                            warn!(error = %e, "failed to write periodic job snapshot");
                        }
                    }
                }
            }
        }
    }

    /// Deletes terminal jobs (and their workspaces) once
    /// `jobs_retention_hours` has elapsed since completion.
    async fn reap_loop(&self) {
        let retention = chrono::Duration::hours(i64::from(self.config.jobs_retention_hours));
        let mut ticker = tokio::time::interval(Duration::from_secs(REAP_INTERVAL_SECS));
        ticker.tick().await;
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let cutoff = chrono::Utc::now() - retention;
                    let jobs = self.app_state.job_store.list_all().await;
                    for job in jobs {
                        let reapable = job.state.is_terminal()
                            && job.completed_at.is_some_and(|t| t < cutoff);
                        if !reapable {
                            continue;
                        }
                        if let Err(e) = self.app_state.job_store.remove_any(&job.id).await {
                            warn!(job_id = %job.id, error = %e, "failed to reap job from store");
                            continue;
                        }
                        if let Err(e) = self.app_state.workspace.destroy_workspace(&job.id.0) {
                            warn!(job_id = %job.id, error = %e, "failed to remove reaped job's workspace");
                        }
                        info!(job_id = %job.id, "auto-reaped terminal job past retention window");
                    }
                }
            }
        }
    }

    /// Signal the HTTP server and admission loop to stop accepting new work
    /// (Section 14: graceful shutdown). Does not wait for in-flight jobs;
    /// each Pipeline Coordinator task keeps running to completion on its own.
    pub fn shutdown(&self) {
        info!("daemon shutdown requested");
        self.shutdown.cancel();
    }
}
