//! Repository Registry.
//!
//! Registers/unregisters named repositories, clones them into the master
//! pool under `<root>/repos/<name>`, and serves both the persisted record
//! and query-time-derived metadata (branch, head, size, dirty, ahead/behind).
//! Shaped after `workspace.rs`'s "resolve strategy once, own a directory
//! under root" pattern, generalized from CoW strategy to git state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use coderunner_core::types::{CloneState, Repository};
use coderunner_core::wire::{HeadCommit, RepositoryView};

use crate::git;
use crate::workspace::WorkspaceManager;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("repository '{0}' already exists")]
    AlreadyExists(String),
    #[error("repository '{0}' not found")]
    NotFound(String),
    #[error("repository '{0}' is referenced by a non-terminal job and cannot be unregistered")]
    Referenced(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// In-memory registry of repository records, guarded by a single `RwLock`
/// ("Registry map... guarded by their respective component
/// mutexes; all reads snapshot, all writes exclusive").
pub struct RepositoryRegistry {
    workspace: Arc<WorkspaceManager>,
    repos: RwLock<HashMap<String, Repository>>,
}

impl RepositoryRegistry {
    pub fn new(workspace: Arc<WorkspaceManager>) -> Self {
        Self {
            workspace,
            repos: RwLock::new(HashMap::new()),
        }
    }

    fn key(name: &str) -> String {
        name.to_ascii_lowercase()
    }

    /// `register(name, originUrl, description, indexAware) -> Repository`
    /// (Section 4.3). Idempotently reserves the name, then clones in the
    /// background; the directory keeps the caller's casing even though
    /// lookups are case-insensitive. Takes `Arc<Self>` because the clone
    /// runs as a detached task that must call back into `finish_clone` once
    /// `git clone` returns.
    pub async fn register(
        self: &Arc<Self>,
        name: &str,
        origin_url: &str,
        description: Option<String>,
        index_aware: bool,
        index_binary: &str,
    ) -> Result<Repository> {
        let key = Self::key(name);
        {
            let mut repos = self.repos.write().await;
            if repos.contains_key(&key) {
                return Err(RegistryError::AlreadyExists(name.to_string()));
            }
            let record = Repository {
                name: name.to_string(),
                origin_url: origin_url.to_string(),
                description,
                registered_at: Utc::now(),
                clone_state: CloneState::Cloning,
                index_aware,
            };
            repos.insert(key.clone(), record.clone());
        }

        let dest = self.workspace.repo_path(name);
        let origin_url = origin_url.to_string();
        let name_owned = name.to_string();
        let index_binary = index_binary.to_string();
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || git::clone_repo(&origin_url, &dest))
                .await
                .unwrap_or_else(|e| Err(git::GitError::CommandFailed(e.to_string())));
            registry
                .finish_clone(
                    &name_owned,
                    result.map_err(|e| e.to_string()),
                    index_aware,
                    &index_binary,
                )
                .await;
        });

        let repos = self.repos.read().await;
        Ok(repos.get(&key).cloned().expect("just inserted"))
    }

    /// Called by the background clone task once `git clone` finishes.
    /// Transitions `cloning -> completed` or `git_failed`, and if
    /// `indexAware`, attempts to build a persistent index in the master
    /// workspace, demoting to `index_failed` on error without deleting the
    /// clone.
    pub async fn finish_clone(
        &self,
        name: &str,
        clone_result: std::result::Result<(), String>,
        index_aware: bool,
        index_binary: &str,
    ) {
        let key = Self::key(name);
        let new_state = match &clone_result {
            Err(e) => {
                warn!(repository = name, error = %e, "repository clone failed");
                CloneState::GitFailed
            }
            Ok(()) => {
                info!(repository = name, "repository clone completed");
                if index_aware {
                    let repo_path = self.workspace.repo_path(name);
                    match crate::index::build_master_index(index_binary, &repo_path).await {
                        Ok(()) => CloneState::Completed,
                        Err(e) => {
                            error!(repository = name, error = %e, "master index build failed");
                            CloneState::IndexFailed
                        }
                    }
                } else {
                    CloneState::Completed
                }
            }
        };
        let mut repos = self.repos.write().await;
        if let Some(repo) = repos.get_mut(&key) {
            repo.clone_state = new_state;
        }
    }

    /// `unregister(name) -> bool`. Per I6's "reject" policy
    /// (Section 7 default recommendation), fails with `Referenced` if
    /// `is_referenced` reports any non-terminal job against this name.
    pub async fn unregister(
        &self,
        name: &str,
        is_referenced: impl FnOnce(&str) -> bool,
    ) -> Result<()> {
        let key = Self::key(name);
        let exists = self.repos.read().await.contains_key(&key);
        if !exists {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        if is_referenced(name) {
            return Err(RegistryError::Referenced(name.to_string()));
        }
        let path = self.workspace.repo_path(name);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        self.repos.write().await.remove(&key);
        Ok(())
    }

    /// `list -> [Repository]` with live-read derived metadata ("metadata is
    /// read at call time, not cached past the call").
    pub async fn list(&self) -> Vec<RepositoryView> {
        let repos: Vec<Repository> = self.repos.read().await.values().cloned().collect();
        repos.into_iter().map(|r| self.view(r)).collect()
    }

    pub async fn metadata(&self, name: &str) -> Result<RepositoryView> {
        let key = Self::key(name);
        let repo = self
            .repos
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        Ok(self.view(repo))
    }

    pub async fn get(&self, name: &str) -> Option<Repository> {
        self.repos.read().await.get(&Self::key(name)).cloned()
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.repos.read().await.contains_key(&Self::key(name))
    }

    fn view(&self, repo: Repository) -> RepositoryView {
        let path = self.workspace.repo_path(&repo.name);
        if repo.clone_state != CloneState::Completed || !path.exists() {
            return RepositoryView {
                name: repo.name,
                origin_url: repo.origin_url,
                description: repo.description,
                registered_at: repo.registered_at,
                clone_state: repo.clone_state,
                index_aware: repo.index_aware,
                branch: None,
                head: None,
                size_bytes: 0,
                dirty: false,
                ahead: 0,
                behind: 0,
            };
        }
        let branch = git::current_branch(&path).ok();
        let head = git::head_commit(&path).ok().map(|(hash, subject, author, ts)| HeadCommit {
            hash,
            subject,
            author,
            timestamp: chrono::DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now),
        });
        let dirty = git::is_dirty(&path).unwrap_or(false);
        let (ahead, behind) = git::ahead_behind(&path).unwrap_or((0, 0));
        let size_bytes = git::tree_size_bytes(&path);
        RepositoryView {
            name: repo.name,
            origin_url: repo.origin_url,
            description: repo.description,
            registered_at: repo.registered_at,
            clone_state: repo.clone_state,
            index_aware: repo.index_aware,
            branch,
            head,
            size_bytes,
            dirty,
            ahead,
            behind,
        }
    }
}
