//! Job Store.
//!
//! Holds every `Job` in memory for the lifetime of the daemon, keyed by id.
//! All mutation goes through `mutate`, which takes the single global write
//! lock so the pipeline coordinator's stage transitions are always observed
//! atomically by readers. Ownership checks (`Forbidden` vs `NotFound`)
//! happen here so every caller gets identical semantics.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use coderunner_core::types::{Id, Job, JobSummary, Principal};

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job '{0}' not found")]
    NotFound(String),
    #[error("job '{0}' is owned by a different principal")]
    Forbidden(String),
    #[error("job '{0}' must be terminal before it can be deleted")]
    NotTerminal(String),
}

pub type Result<T> = std::result::Result<T, JobStoreError>;

pub struct JobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// `create(job)`. The pipeline coordinator assigns the initial state
    /// before calling this, so the store never invents one.
    pub async fn create(&self, job: Job) -> Job {
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id.0.clone(), job.clone());
        job
    }

    /// `get(jobId, principal) -> Job | ErrNotFound | ErrForbidden` (Section
    /// 4.4, P2): a missing id is `NotFound`, but an id that exists under a
    /// different principal is `Forbidden` - the two are distinguished on
    /// the wire per Section 7's error taxonomy.
    pub async fn get(&self, job_id: &Id, principal: &Principal) -> Result<Job> {
        let jobs = self.jobs.read().await;
        let job = jobs
            .get(&job_id.0)
            .ok_or_else(|| JobStoreError::NotFound(job_id.0.clone()))?;
        if &job.principal != principal {
            return Err(JobStoreError::Forbidden(job_id.0.clone()));
        }
        Ok(job.clone())
    }

    /// Internal lookup bypassing ownership, for components that already
    /// operate with elevated internal trust (the scheduler, the pipeline
    /// coordinator, crash recovery).
    pub async fn get_any(&self, job_id: &Id) -> Result<Job> {
        let jobs = self.jobs.read().await;
        jobs.get(&job_id.0)
            .cloned()
            .ok_or_else(|| JobStoreError::NotFound(job_id.0.clone()))
    }

    /// `listForPrincipal(principal) -> [JobSummary]`, creation-descending -
    /// `Id` is UUIDv7, so sorting by id descending is equivalent to sorting
    /// by creation time descending.
    pub async fn list_for_principal(&self, principal: &Principal) -> Vec<JobSummary> {
        let jobs = self.jobs.read().await;
        let mut summaries: Vec<JobSummary> = jobs
            .values()
            .filter(|job| &job.principal == principal)
            .map(JobSummary::from)
            .collect();
        summaries.sort_by(|a, b| b.id.0.cmp(&a.id.0));
        summaries
    }

    /// Every job regardless of owner, for crash-recovery reconciliation and
    /// persistence snapshotting.
    pub async fn list_all(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// `mutate(jobId, fn)`. `f` observes and returns the updated job under
    /// the single write lock, so a stage transition can never race with
    /// another writer reading a stale state.
    pub async fn mutate<F>(&self, job_id: &Id, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id.0)
            .ok_or_else(|| JobStoreError::NotFound(job_id.0.clone()))?;
        f(job);
        Ok(job.clone())
    }

    /// `delete(jobId, principal)`. Only a job already in a terminal state
    /// may be deleted; callers that need to stop a running job must cancel
    /// it first.
    pub async fn delete(&self, job_id: &Id, principal: &Principal) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get(&job_id.0)
            .ok_or_else(|| JobStoreError::NotFound(job_id.0.clone()))?;
        if &job.principal != principal {
            return Err(JobStoreError::Forbidden(job_id.0.clone()));
        }
        if !job.state.is_terminal() {
            return Err(JobStoreError::NotTerminal(job_id.0.clone()));
        }
        Ok(jobs.remove(&job_id.0).expect("just matched"))
    }

    /// Remove a job regardless of owner, for the retention reaper, which has
    /// no `Principal` to check against and decides terminality itself before
    /// calling this. Returns the removed job so the caller can also destroy
    /// its workspace.
    pub async fn remove_any(&self, job_id: &Id) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        jobs.remove(&job_id.0)
            .ok_or_else(|| JobStoreError::NotFound(job_id.0.clone()))
    }

    /// Restore a snapshot wholesale on boot, replacing any prior in-memory
    /// state. Used once, before the HTTP server starts accepting requests.
    pub async fn restore(&self, jobs: Vec<Job>) {
        let mut map = self.jobs.write().await;
        map.clear();
        for job in jobs {
            map.insert(job.id.0.clone(), job);
        }
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedJobStore = Arc<JobStore>;
