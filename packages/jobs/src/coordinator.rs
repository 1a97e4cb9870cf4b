// ABOUTME: Drives one claimed job through every pipeline stage to a terminal state
// ABOUTME: Maps stage failures to structured job errors and releases every resource it acquired

use crate::state::{PipelineState, StageDelta};
use crate::worker::spawn_cancel_watcher;
use crate::{CoordinatorError, Result};
use chrono::{DateTime, Utc};
use reprobox_artifacts::{ArtifactGenerator, ArtifactInput};
use reprobox_config::EngineConfig;
use reprobox_core::{
    generate_id, Artifact, ArtifactFormat, ArtifactKind, EnvironmentInfo, ErrorKind, Job,
    JobError, JobStatus, Run, Stage,
};
use reprobox_environment::EnvironmentDetector;
use reprobox_git_utils::{FetchError, FetchedRepository, RepositoryFetcher};
use reprobox_sandbox::{
    ContainerRuntime, ExecutionRequest, ImageBuilder, ImageHandle, SandboxError,
    SandboxExecutor, SandboxPolicy, ValidatedPolicy,
};
use reprobox_storage::{JobStore, NewJob, StorageError};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Build output lines quoted in a job error
const BUILD_ERROR_TAIL: usize = 20;

/// Client-facing view of a job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub error: Option<JobError>,
    pub cancel_requested: bool,
    pub exit_code: Option<i64>,
    pub log_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Client-facing pointer to one generated file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    pub format: ArtifactFormat,
    pub path: String,
    pub size_bytes: i64,
}

impl From<Artifact> for ArtifactRef {
    fn from(artifact: Artifact) -> Self {
        Self {
            kind: artifact.kind,
            format: artifact.format,
            path: artifact.path,
            size_bytes: artifact.size_bytes,
        }
    }
}

pub struct JobCoordinator {
    store: Arc<dyn JobStore>,
    config: EngineConfig,
    fetcher: RepositoryFetcher,
    detector: EnvironmentDetector,
    builder: ImageBuilder,
    executor: SandboxExecutor,
    generator: ArtifactGenerator,
    wake: Notify,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl JobCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        runtime: Arc<dyn ContainerRuntime>,
        config: EngineConfig,
    ) -> Self {
        let policy = SandboxPolicy::from_config(&config);
        Self {
            fetcher: RepositoryFetcher::new(config.fetch_timeout)
                .with_local_sources(config.allow_local_sources),
            detector: EnvironmentDetector::new(config.default_base_image.clone()),
            builder: ImageBuilder::new(runtime.clone(), config.build_timeout),
            executor: SandboxExecutor::new(runtime, policy, config.max_log_preview_bytes),
            generator: ArtifactGenerator::new(config.artifacts_root.clone()),
            store,
            config,
            wake: Notify::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Resolves when `submit` signals new work
    pub(crate) async fn work_available(&self) {
        self.wake.notified().await
    }

    /// Queue a job. Returns its id immediately.
    pub async fn submit(
        &self,
        repo_url: &str,
        run_command: Option<String>,
        paper_id: Option<String>,
    ) -> Result<String> {
        let repo_url = repo_url.trim();
        if repo_url.is_empty() {
            return Err(CoordinatorError::InvalidInput(
                "a repository URL is required".to_string(),
            ));
        }

        let job = self
            .store
            .create_job(NewJob {
                repo_url: repo_url.to_string(),
                run_command: run_command.filter(|c| !c.trim().is_empty()),
                paper_id: paper_id.filter(|p| !p.trim().is_empty()),
            })
            .await?;

        info!(job_id = %job.id, "Submitted job for {}", job.repo_url);
        self.wake.notify_one();
        Ok(job.id)
    }

    pub async fn get_status(&self, job_id: &str) -> Result<JobStatusView> {
        let job = self.require_job(job_id).await?;
        let run = self.store.get_run(job_id).await?;

        Ok(JobStatusView {
            job_id: job.id,
            status: job.status,
            error: job.error,
            cancel_requested: job.cancel_requested,
            exit_code: run.as_ref().and_then(|r| r.exit_code),
            log_path: run.map(|r| r.log_path),
            created_at: job.created_at,
            updated_at: job.updated_at,
        })
    }

    pub async fn get_artifacts(&self, job_id: &str) -> Result<Vec<ArtifactRef>> {
        self.require_job(job_id).await?;
        Ok(self
            .store
            .list_artifacts(job_id)
            .await?
            .into_iter()
            .map(ArtifactRef::from)
            .collect())
    }

    /// Request cancellation. Returns false when the job had already finished.
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        let flagged = match self.store.request_cancel(job_id).await {
            Ok(flagged) => flagged,
            Err(StorageError::NotFound(_)) => {
                return Err(CoordinatorError::NotFound(job_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        if flagged {
            // Jobs running in this process stop without waiting for the watcher
            if let Some(token) = self.active_jobs().get(job_id) {
                token.cancel();
            }
        }
        Ok(flagged)
    }

    /// Running jobs older than the grace period. Reported only; their state
    /// is left untouched.
    pub async fn stuck_jobs(&self) -> Result<Vec<Job>> {
        let grace = chrono::Duration::from_std(self.config.stuck_grace_period)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - grace;
        Ok(self.store.list_stuck_jobs(cutoff).await?)
    }

    /// Claim the oldest pending job and run it to a terminal state
    pub async fn process_next(&self, worker_id: &str) -> Result<Option<String>> {
        let Some(job) = self.store.claim_next_pending(worker_id).await? else {
            return Ok(None);
        };
        let job_id = job.id.clone();
        info!(job_id = %job_id, worker = worker_id, "Claimed job");
        self.run_claimed(job).await;
        Ok(Some(job_id))
    }

    /// Run a job this process has already claimed and persist its outcome
    pub async fn run_claimed(&self, job: Job) -> PipelineState {
        let cancel = CancellationToken::new();
        self.active_jobs().insert(job.id.clone(), cancel.clone());

        let watcher_stop = CancellationToken::new();
        let watcher = spawn_cancel_watcher(
            self.store.clone(),
            job.id.clone(),
            cancel.clone(),
            watcher_stop.clone(),
            self.config.cancel_poll_interval,
        );

        let state = if job.cancel_requested {
            PipelineState::new(&job.id).apply(StageDelta::failed(JobError::new(
                Stage::Claim,
                ErrorKind::Cancelled,
                "cancelled before the pipeline started",
            )))
        } else {
            self.run_pipeline(&job, &cancel).await
        };

        watcher_stop.cancel();
        if let Err(e) = watcher.await {
            warn!(job_id = %job.id, "Cancel watcher ended abnormally: {}", e);
        }
        self.active_jobs().remove(&job.id);

        self.finalize(&state).await;
        state
    }

    async fn finalize(&self, state: &PipelineState) {
        let result = match &state.error {
            Some(error) => {
                warn!(job_id = %state.job_id, stage = %error.stage, "Job failed: {}", error);
                self.store.fail_job(&state.job_id, error).await
            }
            None => {
                info!(job_id = %state.job_id, "Job completed");
                self.store.complete_job(&state.job_id).await
            }
        };
        if let Err(e) = result {
            error!(job_id = %state.job_id, "Failed to record terminal state: {}", e);
        }
    }

    /// Run every stage inside a scoped workspace that is removed afterwards
    async fn run_pipeline(&self, job: &Job, cancel: &CancellationToken) -> PipelineState {
        let workspace = match self.create_workspace(&job.id).await {
            Ok(dir) => dir,
            Err(e) => {
                return PipelineState::new(&job.id).apply(StageDelta::failed(JobError::new(
                    Stage::Fetch,
                    ErrorKind::Internal,
                    format!("cannot create workspace: {}", e),
                )))
            }
        };

        let state = self.run_stages(job, workspace.path(), cancel).await;

        let path = workspace.path().to_path_buf();
        if let Err(e) = workspace.close() {
            warn!(job_id = %job.id, "Failed to remove workspace {}: {}", path.display(), e);
        }
        state
    }

    async fn create_workspace(&self, job_id: &str) -> std::io::Result<tempfile::TempDir> {
        tokio::fs::create_dir_all(&self.config.workspace_root).await?;
        tempfile::Builder::new()
            .prefix(&format!("{}-", job_id))
            .tempdir_in(&self.config.workspace_root)
    }

    async fn run_stages(
        &self,
        job: &Job,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> PipelineState {
        let state = PipelineState::new(&job.id);

        let fetched = match self.fetch_stage(job, workspace, cancel).await {
            Ok(fetched) => fetched,
            Err(e) => return state.apply(StageDelta::failed(e)),
        };
        let state = state.apply(StageDelta {
            repo_root: Some(fetched.root.clone()),
            commit: fetched.commit.clone(),
            ..StageDelta::for_stage(Stage::Fetch)
        });
        self.touch(&job.id).await;

        let environment = match self.detect_stage(job, &fetched.root, cancel).await {
            Ok(env) => env,
            Err(e) => return state.apply(StageDelta::failed(e)),
        };
        let state = state.apply(StageDelta {
            environment: Some(environment.clone()),
            ..StageDelta::for_stage(Stage::Detect)
        });

        // Rejected before any image or container exists
        let policy = match self.executor.validate_policy() {
            Ok(policy) => policy,
            Err(e) => return state.apply(StageDelta::failed(sandbox_error(Stage::Execute, &e))),
        };

        let image = match self
            .build_stage(job, &fetched.root, &environment, &policy, cancel)
            .await
        {
            Ok(image) => image,
            Err(e) => return state.apply(StageDelta::failed(e)),
        };
        let state = state.apply(StageDelta {
            image_tag: Some(image.tag().to_string()),
            ..StageDelta::for_stage(Stage::Build)
        });
        self.touch(&job.id).await;

        if let Err(e) = check_cancel(cancel, Stage::Execute) {
            image.release().await;
            return state.apply(StageDelta::failed(e));
        }

        let executed = self
            .execute_stage(job, image.tag(), &fetched.root, cancel)
            .await;
        image.release().await;
        self.touch(&job.id).await;

        let state = match executed {
            Ok((run, error)) => state.apply(StageDelta {
                run: Some(run),
                error,
                ..StageDelta::for_stage(Stage::Execute)
            }),
            Err(e) => return state.apply(StageDelta::failed(e)),
        };

        let delta = self.artifacts_stage(job, &state).await;
        state.apply(delta)
    }

    async fn fetch_stage(
        &self,
        job: &Job,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<FetchedRepository, JobError> {
        check_cancel(cancel, Stage::Fetch)?;
        debug!(job_id = %job.id, stage = "fetch", "Fetching {}", job.repo_url);

        self.fetcher
            .fetch(&job.repo_url, workspace, cancel)
            .await
            .map_err(|e| match e {
                FetchError::Cancelled => {
                    JobError::new(Stage::Fetch, ErrorKind::Cancelled, "cancelled during fetch")
                }
                other => JobError::new(Stage::Fetch, ErrorKind::Fetch, other.to_string()),
            })
    }

    async fn detect_stage(
        &self,
        job: &Job,
        repo_root: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<EnvironmentInfo, JobError> {
        check_cancel(cancel, Stage::Detect)?;

        let env = self.detector.detect(repo_root).map_err(|e| {
            JobError::new(
                Stage::Detect,
                ErrorKind::NoEnvironmentDetected,
                e.to_string(),
            )
        })?;

        if let Err(e) = self.store.set_environment(&job.id, &env).await {
            warn!(job_id = %job.id, "Failed to store environment snapshot: {}", e);
        }
        Ok(env)
    }

    async fn build_stage(
        &self,
        job: &Job,
        repo_root: &Path,
        env: &EnvironmentInfo,
        policy: &ValidatedPolicy,
        cancel: &CancellationToken,
    ) -> std::result::Result<ImageHandle, JobError> {
        check_cancel(cancel, Stage::Build)?;
        self.builder
            .build(&job.id, repo_root, env, policy, cancel)
            .await
            .map_err(|e| sandbox_error(Stage::Build, &e))
    }

    /// Run the job's command. The Run row exists before the container starts
    /// and is completed with whatever output was captured, even on failure.
    async fn execute_stage(
        &self,
        job: &Job,
        image_tag: &str,
        repo_root: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<(Run, Option<JobError>), JobError> {
        let artifacts_dir = self.generator.job_dir(&job.id);
        let log_path = artifacts_dir.join("logs").join("combined.log");

        let mut run = Run {
            id: generate_id(),
            job_id: job.id.clone(),
            exit_code: None,
            stdout_preview: String::new(),
            stderr_preview: String::new(),
            log_path: log_path.to_string_lossy().into_owned(),
            started_at: Utc::now(),
            completed_at: None,
            duration_seconds: None,
        };
        self.store.create_run(&run).await.map_err(|e| {
            JobError::new(
                Stage::Execute,
                ErrorKind::Internal,
                format!("cannot record run: {}", e),
            )
        })?;

        let request = ExecutionRequest {
            job_id: job.id.clone(),
            image_tag: image_tag.to_string(),
            command: job.command_or(&self.config.default_command).to_string(),
            workspace_dir: repo_root.to_path_buf(),
            artifacts_dir,
            timeout: self.config.default_timeout,
        };

        let outcome = self.executor.execute(&request, cancel).await;
        let (result, error) = match &outcome {
            Ok(result) => (Some(result), None),
            Err(e) => (e.partial_result(), Some(sandbox_error(Stage::Execute, e))),
        };

        match result {
            Some(result) => {
                run.exit_code = result.exit_code;
                run.stdout_preview = result.stdout_preview.clone();
                run.stderr_preview = result.stderr_preview.clone();
                run.started_at = result.started_at;
                run.completed_at = Some(result.completed_at);
                run.duration_seconds = Some(result.duration.as_secs_f64());
            }
            None => {
                let now = Utc::now();
                run.completed_at = Some(now);
                run.duration_seconds =
                    Some((now - run.started_at).num_milliseconds() as f64 / 1000.0);
            }
        }

        if let Err(e) = self.store.finish_run(&run).await {
            warn!(job_id = %job.id, "Failed to record run outcome: {}", e);
        }
        Ok((run, error))
    }

    /// Generate artifacts for any job that has a Run, failed or not
    async fn artifacts_stage(&self, job: &Job, state: &PipelineState) -> StageDelta {
        let Some(run) = state.run.as_ref() else {
            return StageDelta::default();
        };

        let input = ArtifactInput {
            job,
            run,
            environment: state.environment.as_ref(),
            error: state.error.as_ref(),
            command: job.command_or(&self.config.default_command),
        };

        let generated = match self.generator.generate(input).await {
            Ok(generated) => generated,
            Err(e) if state.is_failed() => {
                warn!(job_id = %job.id, "Artifact generation failed: {}", e);
                return StageDelta::default();
            }
            Err(e) => {
                return StageDelta::failed(JobError::new(
                    Stage::Artifacts,
                    ErrorKind::ArtifactGeneration,
                    e.to_string(),
                ))
            }
        };

        for failure in &generated.failures {
            warn!(job_id = %job.id, "Optional artifact skipped: {}", failure);
        }

        let mut persisted = Vec::new();
        for artifact in generated.artifacts {
            match self.store.create_artifact(&artifact).await {
                Ok(()) => persisted.push(artifact),
                Err(e) => warn!(job_id = %job.id, "Failed to record {} artifact: {}", artifact.kind, e),
            }
        }

        let has_report = persisted
            .iter()
            .any(|a| a.kind == ArtifactKind::Report && a.size_bytes > 0);

        let mut delta = StageDelta {
            artifacts: Some(persisted),
            ..StageDelta::for_stage(Stage::Artifacts)
        };
        if !has_report && !state.is_failed() {
            delta.error = Some(JobError::new(
                Stage::Artifacts,
                ErrorKind::ArtifactGeneration,
                "no report artifact was recorded",
            ));
        }
        delta
    }

    async fn touch(&self, job_id: &str) {
        if let Err(e) = self.store.touch_job(job_id).await {
            warn!(job_id = %job_id, "Failed to refresh job liveness: {}", e);
        }
    }

    async fn require_job(&self, job_id: &str) -> Result<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(job_id.to_string()))
    }

    fn active_jobs(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn check_cancel(cancel: &CancellationToken, stage: Stage) -> std::result::Result<(), JobError> {
    if cancel.is_cancelled() {
        Err(JobError::new(
            stage,
            ErrorKind::Cancelled,
            format!("cancelled before {}", stage),
        ))
    } else {
        Ok(())
    }
}

/// Translate a sandbox failure into the job error taxonomy
fn sandbox_error(stage: Stage, error: &SandboxError) -> JobError {
    let kind = match error {
        SandboxError::SecurityConfig(_) => ErrorKind::SecurityConfig,
        SandboxError::Build { .. } | SandboxError::BuildTimeout(_) => ErrorKind::Build,
        SandboxError::Execution { .. } => ErrorKind::Execution,
        SandboxError::ExecutionTimeout { .. } => ErrorKind::ExecutionTimeout,
        SandboxError::Cancelled { .. } => ErrorKind::Cancelled,
        SandboxError::Runtime(_) | SandboxError::Io(_) if stage == Stage::Build => {
            ErrorKind::Build
        }
        SandboxError::Runtime(_) | SandboxError::Io(_) => ErrorKind::Execution,
    };

    let cause = match error {
        SandboxError::Build { message, output } if !output.is_empty() => {
            let skip = output.len().saturating_sub(BUILD_ERROR_TAIL);
            let tail: Vec<&str> = output.iter().skip(skip).map(String::as_str).collect();
            format!("{}\n{}", message, tail.join("\n"))
        }
        other => other.to_string(),
    };

    JobError::new(stage, kind, cause)
}
