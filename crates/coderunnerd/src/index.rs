//! Semantic-index daemon integration (Glossary: "Semantic index / indexer").
//!
//! The index binary is an opaque external collaborator (Section 1 scope
//! note) invoked via documented, argv-based command lines - never shell
//! string assembly, matching `git.rs`'s sub-process style. Used by C3 (build
//! a persistent master index on `register`) and C6 (`index_building` stage:
//! start + reconcile; `running` stage: health probe; teardown: stop).

use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index binary failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute index binary: {0}")]
    Execution(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// Resolve whether `binary` can actually be launched: an absolute or
/// relative path is checked directly, a bare name is searched for on
/// `PATH`. Used to silently force `buildIndex` off when the index binary
/// was never installed (Section 3 "Options": "silently forced off ... if
/// the binary is missing") rather than failing the job.
pub fn binary_available(binary: &str) -> bool {
    if binary.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(binary).is_file();
    }
    std::env::var_os("PATH")
        .into_iter()
        .flat_map(|paths| std::env::split_paths(&paths).collect::<Vec<_>>())
        .any(|dir| dir.join(binary).is_file())
}

async fn run(binary: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(binary).args(args).output().await?;
    if !output.status.success() {
        return Err(IndexError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

/// Build a persistent index in the master workspace (C3's `register` with
/// `indexAware: true`). On failure the caller sets `index_failed` but must
/// not delete the clone.
pub async fn build_master_index(binary: &str, repo_path: &Path) -> Result<()> {
    run(binary, &["build", "--path", &repo_path.to_string_lossy()]).await
}

/// A handle to a running per-job index daemon (C6's `index_building` stage).
/// Dropped/`stop`ped at teardown regardless of pipeline outcome (Section
/// 4.6: "teardown (always): stop the index daemon if it was started").
pub struct IndexDaemon {
    child: Child,
}

/// Start the semantic-index daemon for a workspace, then issue a reconcile
/// command (Section 4.6 `index_building` stage semantics).
pub async fn start_and_reconcile(binary: &str, workspace: &Path) -> Result<IndexDaemon> {
    let child = Command::new(binary)
        .args(["serve", "--workspace", &workspace.to_string_lossy()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;
    let daemon = IndexDaemon { child };

    run(
        binary,
        &["reconcile", "--workspace", &workspace.to_string_lossy()],
    )
    .await
    .map_err(|e| {
        warn!(workspace = %workspace.display(), error = %e, "index reconcile failed");
        e
    })?;

    Ok(daemon)
}

/// Probe the index daemon's health (Section 4.6 `running` stage: "the
/// choice [of system-prompt prefix] is made from the live health probe, not
/// the option flag alone").
pub async fn health_probe(binary: &str, workspace: &Path) -> bool {
    run(binary, &["health", "--workspace", &workspace.to_string_lossy()])
        .await
        .is_ok()
}

impl IndexDaemon {
    /// Stop the daemon: polite signal first, forceful kill after a bounded
    /// grace window, matching C5's termination sequence.
    pub async fn stop(mut self) {
        if let Some(pid) = self.child.id() {
            // SAFETY: `pid` is this daemon's own tracked child pid; SIGTERM
            // is the advisory "please exit" signal used throughout C5/C6's
            // termination sequence.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        let graceful = tokio::time::timeout(std::time::Duration::from_secs(5), self.child.wait()).await;
        if graceful.is_err() {
            warn!("index daemon did not exit after SIGTERM, sending SIGKILL");
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
        info!("index daemon stopped");
    }
}
