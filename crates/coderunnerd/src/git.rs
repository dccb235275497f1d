//! Git sub-process helpers backing C3 (Repository Registry) and C6's
//! `git_pulling` stage.
//!
//! Every invocation uses argv-based `Command::new("git").args([...])` -
//! never shell string concatenation (Section 9's "Process launching"
//! redesign note).

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

fn run(workspace_root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workspace_root)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(GitError::CommandFailed(stderr));
    }
    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|_| GitError::InvalidUtf8)
}

/// Clone `origin_url` into `dest` (C3's `register`). Runs in the background
/// thread pool; callers decide concurrency.
pub fn clone_repo(origin_url: &str, dest: &Path) -> Result<()> {
    let output = Command::new("git")
        .args(["clone", origin_url, &dest.to_string_lossy()])
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(GitError::CommandFailed(stderr));
    }
    Ok(())
}

/// Pull the latest changes into a workspace (C6's `git_pulling` stage).
pub fn pull(workspace_root: &Path) -> Result<()> {
    run(workspace_root, &["pull", "--ff-only"]).map(|_| ())
}

pub fn current_branch(workspace_root: &Path) -> Result<String> {
    run(workspace_root, &["rev-parse", "--abbrev-ref", "HEAD"])
}

/// `(hash, subject, author, unix-timestamp-secs)` of HEAD.
pub fn head_commit(workspace_root: &Path) -> Result<(String, String, String, i64)> {
    let format = "%H%x1f%s%x1f%an%x1f%ct";
    let raw = run(workspace_root, &["log", "-1", &format!("--format={format}")])?;
    let mut parts = raw.split('\x1f');
    let hash = parts.next().unwrap_or_default().to_string();
    let subject = parts.next().unwrap_or_default().to_string();
    let author = parts.next().unwrap_or_default().to_string();
    let ts = parts.next().unwrap_or("0").parse().unwrap_or(0);
    Ok((hash, subject, author, ts))
}

pub fn is_dirty(workspace_root: &Path) -> Result<bool> {
    let status = run(workspace_root, &["status", "--porcelain"])?;
    Ok(!status.is_empty())
}

/// `(ahead, behind)` against the tracked upstream, or `(0, 0)` if there is none.
pub fn ahead_behind(workspace_root: &Path) -> Result<(u32, u32)> {
    let raw = run(
        workspace_root,
        &["rev-list", "--left-right", "--count", "HEAD...@{u}"],
    )
    .unwrap_or_else(|_| "0\t0".to_string());
    let mut parts = raw.split_whitespace();
    let ahead = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let behind = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    Ok((ahead, behind))
}

/// Aggregate byte size of a directory tree (used for Repository metadata).
pub fn tree_size_bytes(path: &Path) -> u64 {
    fn walk(path: &Path) -> u64 {
        let mut total = 0;
        let Ok(entries) = std::fs::read_dir(path) else {
            return 0;
        };
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_dir() {
                total += walk(&entry.path());
            } else {
                total += metadata.len();
            }
        }
        total
    }
    walk(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn init_repo(dir: &Path) {
        StdCommand::new("git").args(["init", "-q"]).current_dir(dir).output().unwrap();
        StdCommand::new("git")
            .args(["config", "user.email", "test@example.com"])
            .current_dir(dir)
            .output()
            .unwrap();
        StdCommand::new("git")
            .args(["config", "user.name", "test"])
            .current_dir(dir)
            .output()
            .unwrap();
        std::fs::write(dir.join("README.md"), "hello").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(dir).output().unwrap();
        StdCommand::new("git")
            .args(["commit", "-q", "-m", "initial"])
            .current_dir(dir)
            .output()
            .unwrap();
    }

    #[test]
    fn reads_head_commit_and_dirty_state() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let (hash, subject, _author, ts) = head_commit(dir.path()).unwrap();
        assert_eq!(hash.len(), 40);
        assert_eq!(subject, "initial");
        assert!(ts > 0);
        assert!(!is_dirty(dir.path()).unwrap());

        std::fs::write(dir.path().join("README.md"), "changed").unwrap();
        assert!(is_dirty(dir.path()).unwrap());
    }

    #[test]
    fn tree_size_sums_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "12345").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "1234567890").unwrap();
        assert_eq!(tree_size_bytes(dir.path()), 15);
    }
}
