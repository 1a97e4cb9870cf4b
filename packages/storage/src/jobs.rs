// ABOUTME: SQLite implementation of the JobStore interface
// ABOUTME: Conditional status updates, atomic claims and run/artifact bookkeeping

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reprobox_core::{
    generate_id, Artifact, ArtifactFormat, ArtifactKind, EnvironmentInfo, Job, JobError,
    JobStatus, Run,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::{JobStore, NewJob, Result, StorageError};

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and apply migrations
    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(crate::connect(database_url).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_job(&self, row: &SqliteRow) -> Result<Job> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<JobStatus>()
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;

        let error = row
            .try_get::<Option<String>, _>("error")?
            .map(|raw| serde_json::from_str::<JobError>(&raw))
            .transpose()?;

        let environment = row
            .try_get::<Option<String>, _>("environment")?
            .map(|raw| serde_json::from_str::<EnvironmentInfo>(&raw))
            .transpose()?;

        Ok(Job {
            id: row.try_get("id")?,
            repo_url: row.try_get("repo_url")?,
            paper_id: row.try_get("paper_id")?,
            run_command: row.try_get("run_command")?,
            status,
            error,
            environment,
            cancel_requested: row.try_get("cancel_requested")?,
            claimed_by: row.try_get("claimed_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn row_to_run(&self, row: &SqliteRow) -> Result<Run> {
        Ok(Run {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            exit_code: row.try_get("exit_code")?,
            stdout_preview: row.try_get("stdout_preview")?,
            stderr_preview: row.try_get("stderr_preview")?,
            log_path: row.try_get("log_path")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_seconds: row.try_get("duration_seconds")?,
        })
    }

    fn row_to_artifact(&self, row: &SqliteRow) -> Result<Artifact> {
        let kind: String = row.try_get("kind")?;
        let format: String = row.try_get("format")?;

        Ok(Artifact {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            kind: kind
                .parse::<ArtifactKind>()
                .map_err(|e| StorageError::InvalidData(e.to_string()))?,
            format: format
                .parse::<ArtifactFormat>()
                .map_err(|e| StorageError::InvalidData(e.to_string()))?,
            path: row.try_get("path")?,
            size_bytes: row.try_get("size_bytes")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn require_job(&self, job_id: &str) -> Result<Job> {
        self.get_job(job_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("job {}", job_id)))
    }

    /// Build the error for a conditional update that matched nothing
    async fn transition_error(&self, job_id: &str, to: JobStatus) -> StorageError {
        match self.get_job(job_id).await {
            Ok(Some(job)) => StorageError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to,
            },
            Ok(None) => StorageError::NotFound(format!("job {}", job_id)),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, input: NewJob) -> Result<Job> {
        let job_id = generate_id();
        let now = Utc::now();

        debug!("Creating job {} for {}", job_id, input.repo_url);

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, repo_url, paper_id, run_command, status,
                cancel_requested, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&job_id)
        .bind(&input.repo_url)
        .bind(&input.paper_id)
        .bind(&input.run_command)
        .bind(JobStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.require_job(&job_id).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| self.row_to_job(&r)).transpose()
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(|row| self.row_to_job(row)).collect()
    }

    async fn claim_next_pending(&self, worker_id: &str) -> Result<Option<Job>> {
        let now = Utc::now();

        // Single statement: SQLite serializes writers so only one claimant
        // can see the row still pending
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', claimed_by = ?, started_at = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending'
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let job = self.row_to_job(&row)?;
                info!("Worker {} claimed job {}", worker_id, job.id);
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn claim_job(&self, job_id: &str, worker_id: &str) -> Result<Option<Job>> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', claimed_by = ?, started_at = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("Claim of job {} by {} lost", job_id, worker_id);
            return Ok(None);
        }

        info!("Worker {} claimed job {}", worker_id, job_id);
        self.get_job(job_id).await
    }

    async fn touch_job(&self, job_id: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ? AND status = 'running'")
            .bind(Utc::now())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_environment(&self, job_id: &str, env: &EnvironmentInfo) -> Result<()> {
        let encoded = serde_json::to_string(env)?;

        let result = sqlx::query(
            "UPDATE jobs SET environment = ?, updated_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(encoded)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(job_id, JobStatus::Running).await);
        }
        Ok(())
    }

    async fn complete_job(&self, job_id: &str) -> Result<()> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', error = NULL, completed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(job_id, JobStatus::Completed).await);
        }

        info!("Job {} completed", job_id);
        Ok(())
    }

    async fn fail_job(&self, job_id: &str, error: &JobError) -> Result<()> {
        let now = Utc::now();
        let encoded = serde_json::to_string(error)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', error = ?, completed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(encoded)
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(job_id, JobStatus::Failed).await);
        }

        warn!("Job {} failed: {}", job_id, error);
        Ok(())
    }

    async fn request_cancel(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET cancel_requested = 1, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish "already terminal" from "no such job"
            self.require_job(job_id).await?;
            return Ok(false);
        }

        info!("Cancellation requested for job {}", job_id);
        Ok(true)
    }

    async fn is_cancel_requested(&self, job_id: &str) -> Result<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;

        flag.ok_or_else(|| StorageError::NotFound(format!("job {}", job_id)))
    }

    async fn create_run(&self, run: &Run) -> Result<()> {
        debug!("Creating run {} for job {}", run.id, run.job_id);

        sqlx::query(
            r#"
            INSERT INTO runs (
                id, job_id, exit_code, stdout_preview, stderr_preview,
                log_path, started_at, completed_at, duration_seconds
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.job_id)
        .bind(run.exit_code)
        .bind(&run.stdout_preview)
        .bind(&run.stderr_preview)
        .bind(&run.log_path)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.duration_seconds)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finish_run(&self, run: &Run) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET exit_code = ?, stdout_preview = ?, stderr_preview = ?,
                completed_at = ?, duration_seconds = ?
            WHERE id = ?
            "#,
        )
        .bind(run.exit_code)
        .bind(&run.stdout_preview)
        .bind(&run.stderr_preview)
        .bind(run.completed_at)
        .bind(run.duration_seconds)
        .bind(&run.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("run {}", run.id)));
        }
        Ok(())
    }

    async fn get_run(&self, job_id: &str) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| self.row_to_run(&r)).transpose()
    }

    async fn create_artifact(&self, artifact: &Artifact) -> Result<()> {
        debug!(
            "Recording {} artifact for job {} at {}",
            artifact.kind, artifact.job_id, artifact.path
        );

        sqlx::query(
            r#"
            INSERT INTO artifacts (id, job_id, kind, format, path, size_bytes, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&artifact.id)
        .bind(&artifact.job_id)
        .bind(artifact.kind.as_str())
        .bind(artifact.format.as_str())
        .bind(&artifact.path)
        .bind(artifact.size_bytes)
        .bind(artifact.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_artifacts(&self, job_id: &str) -> Result<Vec<Artifact>> {
        let rows =
            sqlx::query("SELECT * FROM artifacts WHERE job_id = ? ORDER BY created_at, rowid")
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(|row| self.row_to_artifact(row)).collect()
    }

    async fn list_stuck_jobs(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE status = 'running' ORDER BY started_at")
            .fetch_all(&self.pool)
            .await?;

        let mut stuck = Vec::new();
        for row in &rows {
            let job = self.row_to_job(row)?;
            let started = job.started_at.unwrap_or(job.updated_at);
            if started < started_before {
                stuck.push(job);
            }
        }
        Ok(stuck)
    }
}
