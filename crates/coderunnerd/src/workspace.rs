//! Workspace Manager.
//!
//! Owns CoW cloning strategy resolution, per-job workspace creation and
//! destruction, and the filesystem half of path safety (`resolveInside`).
//! Strategy resolved once at startup by runtime probing, same shape as any
//! provider-selection pattern: try each candidate implementation in
//! preference order and fall back to the one that always works.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use coderunner_core::config::CowMethod;
use coderunner_core::pathsafe::{self, PathSafetyError};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("path safety violation: {0}")]
    PathSafety(#[from] PathSafetyError),
    #[error("clone operation failed: {0}")]
    CloneFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("a clone for job {0} is already in progress")]
    CloneInProgress(String),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// A single resolved CoW technique. Detected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowStrategy {
    Reflink,
    Subvolume,
    Hardlink,
    Copy,
}

impl CowStrategy {
    /// Probe in preference order: reflink, subvolume snapshot, hardlink
    /// tree, plain copy - the first that appears available wins. Plain
    /// copy always succeeds, so this never fails.
    pub fn detect(root: &Path) -> Self {
        if reflink_supported(root) {
            return Self::Reflink;
        }
        if subvolume_supported(root) {
            return Self::Subvolume;
        }
        if hardlink_supported(root) {
            return Self::Hardlink;
        }
        Self::Copy
    }

    pub fn resolve(configured: CowMethod, root: &Path) -> Self {
        match configured {
            CowMethod::Auto => Self::detect(root),
            CowMethod::Reflink => Self::Reflink,
            CowMethod::Subvolume => Self::Subvolume,
            CowMethod::Hardlink => Self::Hardlink,
            CowMethod::Copy => Self::Copy,
        }
    }

    /// Clone `src` into `dst`, which must not already exist. On any partial
    /// failure, the caller must remove the partially created `dst` before
    /// returning - handled by `WorkspaceManager::clone_repo`, not here.
    fn clone(&self, src: &Path, dst: &Path) -> Result<()> {
        match self {
            Self::Reflink => run_cp(&["--reflink=always", "-r"], src, dst),
            Self::Subvolume => run_command(
                "btrfs",
                &["subvolume", "snapshot", &src.to_string_lossy(), &dst.to_string_lossy()],
            ),
            Self::Hardlink => hardlink_tree(src, dst),
            Self::Copy => run_cp(&["-r"], src, dst),
        }
    }
}

fn run_cp(flags: &[&str], src: &Path, dst: &Path) -> Result<()> {
    let mut args: Vec<&str> = flags.to_vec();
    let src_str = src.to_string_lossy();
    let dst_str = dst.to_string_lossy();
    args.push(&src_str);
    args.push(&dst_str);
    run_command("cp", &args)
}

fn run_command(bin: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(bin).args(args).output()?;
    if !output.status.success() {
        return Err(WorkspaceError::CloneFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

fn reflink_supported(root: &Path) -> bool {
    Command::new("cp")
        .args(["--reflink=always", "--help"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
        && root.exists()
}

fn subvolume_supported(root: &Path) -> bool {
    let _ = root;
    Command::new("btrfs")
        .args(["--version"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn hardlink_supported(root: &Path) -> bool {
    // Hardlinks require same filesystem; always attemptable as a fallback
    // ahead of plain copy.
    root.exists()
}

fn hardlink_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            hardlink_tree(&entry.path(), &target)?;
        } else {
            std::fs::hard_link(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Owns the master repository pool (`<root>/repos`) and manufactures
/// per-job CoW clones under `<root>/jobs/<jobId>`.
pub struct WorkspaceManager {
    root: PathBuf,
    strategy: CowStrategy,
    /// Serializes `clone_repo` per job id: no two clones for the same job
    /// id may proceed concurrently.
    in_progress: Mutex<Vec<String>>,
}

impl WorkspaceManager {
    pub fn new(root: PathBuf, configured: CowMethod) -> Self {
        std::fs::create_dir_all(&root).ok();
        let strategy = CowStrategy::resolve(configured, &root);
        info!(strategy = ?strategy, "workspace manager resolved CoW strategy");
        Self {
            root,
            strategy,
            in_progress: Mutex::new(Vec::new()),
        }
    }

    pub fn strategy(&self) -> CowStrategy {
        self.strategy
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.root.join("repos")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn job_workspace(&self, job_id: &str) -> PathBuf {
        self.jobs_dir().join(job_id)
    }

    pub fn job_staging(&self, job_id: &str) -> PathBuf {
        self.staging_dir().join(job_id)
    }

    pub fn repo_path(&self, name: &str) -> PathBuf {
        self.repos_dir().join(name)
    }

    /// `cloneRepo(name, jobId) -> workspacePath`.
    pub fn clone_repo(&self, repo_name: &str, job_id: &str) -> Result<PathBuf> {
        {
            let mut guard = self.in_progress.lock().unwrap();
            if guard.iter().any(|id| id == job_id) {
                return Err(WorkspaceError::CloneInProgress(job_id.to_string()));
            }
            guard.push(job_id.to_string());
        }
        let result = self.clone_repo_inner(repo_name, job_id);
        self.in_progress.lock().unwrap().retain(|id| id != job_id);
        result
    }

    fn clone_repo_inner(&self, repo_name: &str, job_id: &str) -> Result<PathBuf> {
        let src = self.repo_path(repo_name);
        let dst = self.job_workspace(job_id);
        if dst.exists() {
            std::fs::remove_dir_all(&dst)?;
        }
        std::fs::create_dir_all(self.jobs_dir())?;
        match self.strategy.clone(&src, &dst) {
            Ok(()) => Ok(dst),
            Err(e) => {
                // Partial failure: remove whatever was created.
                let _ = std::fs::remove_dir_all(&dst);
                Err(e)
            }
        }
    }

    /// `destroyWorkspace(jobId)` - idempotent, swallows "not found".
    pub fn destroy_workspace(&self, job_id: &str) -> Result<()> {
        let path = self.job_workspace(job_id);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(job_id, "destroy_workspace called on already-absent workspace");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `resolveInside(workspace, userPath) -> absolutePath | ErrEscape`.
    /// Rejects `..`, absolute paths, and (after canonicalizing) any symlink
    /// that resolves outside the workspace.
    pub fn resolve_inside(&self, job_id: &str, user_path: &str) -> Result<PathBuf> {
        let workspace = self.job_workspace(job_id);
        let joined = pathsafe::resolve_inside(&workspace, user_path)?;

        // Canonicalize the deepest existing ancestor to catch symlinks that
        // would otherwise let a descendant path escape the workspace.
        let mut probe = joined.clone();
        while !probe.exists() {
            match probe.parent() {
                Some(parent) => probe = parent.to_path_buf(),
                None => break,
            }
        }
        if let Ok(canon_probe) = probe.canonicalize() {
            if let Ok(canon_root) = workspace.canonicalize() {
                pathsafe::assert_descendant(&canon_root, &canon_probe)?;
            }
        }
        Ok(joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_in(tmp: &Path) -> WorkspaceManager {
        WorkspaceManager::new(tmp.to_path_buf(), CowMethod::Copy)
    }

    #[test]
    fn clone_repo_copies_files_and_returns_workspace_path() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager_in(tmp.path());
        std::fs::create_dir_all(mgr.repo_path("demo")).unwrap();
        std::fs::write(mgr.repo_path("demo").join("file.txt"), b"hi").unwrap();

        let workspace = mgr.clone_repo("demo", "job-1").unwrap();
        assert!(workspace.join("file.txt").exists());
    }

    #[test]
    fn clone_repo_removes_partial_dir_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager_in(tmp.path());
        // Source does not exist -> cp fails.
        let result = mgr.clone_repo("missing", "job-2");
        assert!(result.is_err());
        assert!(!mgr.job_workspace("job-2").exists());
    }

    #[test]
    fn destroy_workspace_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager_in(tmp.path());
        std::fs::create_dir_all(mgr.repo_path("demo")).unwrap();
        mgr.clone_repo("demo", "job-3").unwrap();

        mgr.destroy_workspace("job-3").unwrap();
        assert!(!mgr.job_workspace("job-3").exists());
        // Second call must still succeed.
        mgr.destroy_workspace("job-3").unwrap();
    }

    #[test]
    fn resolve_inside_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager_in(tmp.path());
        std::fs::create_dir_all(mgr.repo_path("demo")).unwrap();
        mgr.clone_repo("demo", "job-4").unwrap();

        assert!(mgr.resolve_inside("job-4", "../../etc/passwd").is_err());
    }

    #[test]
    fn resolve_inside_accepts_normal_relative_path() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager_in(tmp.path());
        std::fs::create_dir_all(mgr.repo_path("demo")).unwrap();
        mgr.clone_repo("demo", "job-5").unwrap();

        let resolved = mgr.resolve_inside("job-5", "README.md").unwrap();
        assert!(resolved.starts_with(mgr.job_workspace("job-5")));
    }

    #[test]
    fn cow_strategy_resolve_honors_explicit_override() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(
            CowStrategy::resolve(CowMethod::Hardlink, tmp.path()),
            CowStrategy::Hardlink
        );
        assert_eq!(
            CowStrategy::resolve(CowMethod::Copy, tmp.path()),
            CowStrategy::Copy
        );
    }
}
