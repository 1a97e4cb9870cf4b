// ABOUTME: Persistence layer for jobs, runs and artifacts
// ABOUTME: Defines the JobStore interface and its SQLite implementation

pub mod jobs;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reprobox_core::{Artifact, EnvironmentInfo, Job, JobError, JobStatus, Run};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub use jobs::SqliteJobStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Illegal transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Fields supplied when a job is submitted
#[derive(Debug, Clone)]
pub struct NewJob {
    pub repo_url: String,
    pub run_command: Option<String>,
    pub paper_id: Option<String>,
}

/// Persistence interface consumed by the job coordinator.
///
/// Every status change is a conditional update on the current status, so
/// a terminal job can never be modified and two workers can never claim the
/// same pending job.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, input: NewJob) -> Result<Job>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>>;

    /// Atomically move the oldest pending job to running
    async fn claim_next_pending(&self, worker_id: &str) -> Result<Option<Job>>;

    /// Atomically move a specific pending job to running
    async fn claim_job(&self, job_id: &str, worker_id: &str) -> Result<Option<Job>>;

    /// Refresh `updated_at` on a running job
    async fn touch_job(&self, job_id: &str) -> Result<()>;

    async fn set_environment(&self, job_id: &str, env: &EnvironmentInfo) -> Result<()>;

    async fn complete_job(&self, job_id: &str) -> Result<()>;

    async fn fail_job(&self, job_id: &str, error: &JobError) -> Result<()>;

    /// Flag a non-terminal job for cancellation. Returns false when the job
    /// is already terminal.
    async fn request_cancel(&self, job_id: &str) -> Result<bool>;

    async fn is_cancel_requested(&self, job_id: &str) -> Result<bool>;

    async fn create_run(&self, run: &Run) -> Result<()>;

    async fn finish_run(&self, run: &Run) -> Result<()>;

    async fn get_run(&self, job_id: &str) -> Result<Option<Run>>;

    async fn create_artifact(&self, artifact: &Artifact) -> Result<()>;

    async fn list_artifacts(&self, job_id: &str) -> Result<Vec<Artifact>>;

    /// Running jobs that started before `started_before`
    async fn list_stuck_jobs(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>>;
}

/// Open (creating if needed) the database at `database_url` and run migrations
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    if let Some(path) = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
    {
        let path = path.split('?').next().unwrap_or(path);
        if !path.is_empty() && path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }
    }

    debug!("Connecting to database: {}", database_url);

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;

    info!("Database connection established");

    sqlx::migrate!("./migrations").run(&pool).await?;

    debug!("Database migrations completed");

    Ok(pool)
}
