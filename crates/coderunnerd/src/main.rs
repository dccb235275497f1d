//! coderunnerd - Multi-Tenant Batch-Execution Daemon
//!
//! Main entry point for the daemon binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use coderunner_core::Config;
use coderunnerd::Daemon;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

/// Command-line overrides. Precedence is CLI flags > environment > config
/// file > built-in defaults.
#[derive(Debug, Parser)]
#[command(name = "coderunnerd", about = "Multi-tenant batch-execution daemon")]
struct Args {
    /// Path to a `key=value` config file.
    #[arg(long, env = "CODERUNNER_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the HTTP control plane to.
    #[arg(long)]
    bind_addr: Option<String>,

    /// Root directory for repos, job workspaces, and snapshots.
    #[arg(long)]
    workspace_root: Option<PathBuf>,

    /// Maximum number of jobs running concurrently.
    #[arg(long)]
    jobs_max_concurrent: Option<u32>,
}

fn main() -> ExitCode {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config file {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    if let Err(e) = config.apply_env() {
        error!("invalid environment configuration: {}", e);
        return ExitCode::FAILURE;
    }

    if let Some(bind_addr) = args.bind_addr {
        config.bind_addr = bind_addr;
    }
    if let Some(workspace_root) = args.workspace_root {
        config.workspace_root = workspace_root;
    }
    if let Some(jobs_max_concurrent) = args.jobs_max_concurrent {
        config.jobs_max_concurrent = jobs_max_concurrent;
    }

    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(run(config))
}

async fn run(config: Config) -> ExitCode {
    let daemon = match Daemon::new(config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("failed to initialize daemon: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let daemon = std::sync::Arc::new(daemon);
    let run_daemon = daemon.clone();
    let mut run_handle = tokio::spawn(async move { run_daemon.run().await });

    tokio::select! {
        result = &mut run_handle => {
            match result {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(e)) => {
                    error!("daemon error: {}", e);
                    ExitCode::FAILURE
                }
                Err(e) => {
                    error!("daemon task panicked: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal, draining in-flight jobs");
            daemon.shutdown();
            match run_handle.await {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(e)) => {
                    error!("daemon error during shutdown: {}", e);
                    ExitCode::FAILURE
                }
                Err(e) => {
                    error!("daemon task panicked during shutdown: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}
