//! Persistence Snapshotter.
//!
//! Two durability layers, reconciled against each other on boot:
//! - `snapshots/jobs.json`: the authoritative point-in-time snapshot of
//!   every job, written on every terminal transition and on a floor
//!   cadence. Restoring this is enough to rebuild every job's state after
//!   a restart.
//! - A supplemental SQLite-backed audit-event log (`audit.db`, via sqlx),
//!   kept as an append-only history of state transitions for post-hoc
//!   debugging - the daemon never reads it back to reconstruct state.

use std::path::{Path, PathBuf};

use coderunner_core::types::{FailStage, Job, JobState};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("audit database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

const AUDIT_MIGRATION: &str = include_str!("../../../migrations/0001_init.sql");

pub struct Persistence {
    snapshot_path: PathBuf,
    audit_pool: SqlitePool,
}

impl Persistence {
    pub async fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("snapshots"))?;
        let snapshot_path = root.join("snapshots/jobs.json");
        let db_path = root.join("audit.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let audit_pool = SqlitePoolOptions::new().max_connections(4).connect(&url).await?;
        let persistence = Self {
            snapshot_path,
            audit_pool,
        };
        persistence.migrate().await?;
        Ok(persistence)
    }

    /// Split-and-execute embedded migrations (no `sqlx::migrate::Migrator`
    /// needed for a single-table schema). Each statement tolerates being
    /// re-run against an already-initialized database, since there is no
    /// separate migration-version table.
    async fn migrate(&self) -> Result<()> {
        for statement in AUDIT_MIGRATION.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            if let Err(e) = sqlx::query(statement).execute(&self.audit_pool).await {
                let msg = e.to_string();
                if msg.contains("already exists") || msg.contains("duplicate column") {
                    continue;
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Append an audit record for a job state transition. Best-effort: a
    /// failure to write the audit log never fails the pipeline.
    pub async fn record_event(&self, job_id: &str, event_type: &str, detail: &str) {
        let result = sqlx::query(
            "INSERT INTO audit_events (job_id, event_type, detail, created_at) \
             VALUES (?, ?, ?, strftime('%Y-%m-%dT%H:%M:%fZ','now'))",
        )
        .bind(job_id)
        .bind(event_type)
        .bind(detail)
        .execute(&self.audit_pool)
        .await;
        if let Err(e) = result {
            warn!(job_id, error = %e, "failed to record audit event");
        }
    }

    /// Write the full job snapshot atomically: write to a temp file, then
    /// rename, so a crash mid-write never corrupts the prior snapshot.
    pub fn snapshot(&self, jobs: &[Job]) -> Result<()> {
        let json = serde_json::to_vec_pretty(jobs)?;
        let tmp_path = self.snapshot_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.snapshot_path)?;
        Ok(())
    }

    /// Load the last snapshot, or an empty list if none exists yet (first
    /// boot).
    pub fn load(&self) -> Result<Vec<Job>> {
        if !self.snapshot_path.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(&self.snapshot_path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Apply the `failed[recover]` reconciliation policy: any job that was
    /// mid-pipeline at the moment of a crash is not resumable, so it is
    /// marked failed with `FailStage::Recover`. Queued jobs are left
    /// as-is; the scheduler re-enqueues them separately. `created` jobs
    /// (never queued) are also left as-is - nothing was ever admitted for
    /// them to recover from.
    pub fn reconcile(jobs: Vec<Job>) -> Vec<Job> {
        jobs.into_iter()
            .map(|mut job| {
                if matches!(
                    job.state,
                    JobState::Staging
                        | JobState::GitPulling
                        | JobState::IndexBuilding
                        | JobState::Running
                ) {
                    warn!(
                        job_id = %job.id,
                        previous_state = job.state.as_str(),
                        "marking interrupted job as failed[recover] on boot"
                    );
                    job.state = JobState::Failed {
                        stage: FailStage::Recover,
                    };
                    job.completed_at = Some(chrono::Utc::now());
                    job.error_message =
                        Some("job was interrupted by a daemon restart".to_string());
                }
                job
            })
            .collect()
    }
}
