// ABOUTME: Runs a job's command inside a hardened, resource-limited container
// ABOUTME: Enforces the wall-clock timeout and cancellation, captures logs and always cleans up

use crate::handles::ContainerHandle;
use crate::policy::{SandboxPolicy, ValidatedPolicy};
use crate::runtime::{ContainerRuntime, ContainerSpec, OutputStream, StreamType, VolumeMount};
use crate::{Result, SandboxError};
use chrono::{DateTime, Utc};
use reprobox_core::{PreviewBuffer, LABEL_PREFIX};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed for the log collector to flush after the container stops
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Writable scratch space inside an otherwise read-only root filesystem
const TMPFS_OPTIONS: &str = "rw,noexec,nosuid,size=256m";

const WORKSPACE_MOUNT: &str = "/workspace";
const ARTIFACTS_MOUNT: &str = "/artifacts";

/// One container run for a job
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: String,
    pub image_tag: String,
    pub command: String,
    /// Fetched repository, mounted read-only
    pub workspace_dir: PathBuf,
    /// Per-job artifact directory on the host
    pub artifacts_dir: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// None when the process never exited on its own
    pub exit_code: Option<i64>,
    pub stdout_preview: String,
    pub stderr_preview: String,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub log_path: PathBuf,
}

enum Outcome {
    Exited(i64),
    TimedOut,
    Cancelled,
    WaitFailed(String),
}

#[derive(Debug)]
struct Previews {
    stdout: PreviewBuffer,
    stderr: PreviewBuffer,
}

pub struct SandboxExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    policy: SandboxPolicy,
    max_preview_bytes: usize,
}

impl SandboxExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        policy: SandboxPolicy,
        max_preview_bytes: usize,
    ) -> Self {
        Self {
            runtime,
            policy,
            max_preview_bytes,
        }
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// Validate the policy without touching the runtime
    pub fn validate_policy(&self) -> Result<ValidatedPolicy> {
        self.policy.validate()
    }

    /// Run the job's command to completion, timeout or cancellation.
    ///
    /// A non-zero exit is a successful execution. The container is removed
    /// on every path once it has been created.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let policy = self.policy.validate()?;

        let outputs_dir = request.artifacts_dir.join("outputs");
        let logs_dir = request.artifacts_dir.join("logs");
        tokio::fs::create_dir_all(&outputs_dir).await?;
        tokio::fs::create_dir_all(&logs_dir).await?;
        make_world_writable(&outputs_dir).await?;
        let log_path = logs_dir.join("combined.log");

        let spec = self.container_spec(request, &policy, &outputs_dir);

        let container_id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| SandboxError::Execution {
                message: format!("failed to create container: {}", e),
                result: None,
            })?;
        let container = ContainerHandle::new(self.runtime.clone(), container_id.clone());

        let started_at = Utc::now();
        let clock = Instant::now();

        if let Err(e) = self.runtime.start_container(&container_id).await {
            container.release().await;
            return Err(SandboxError::Execution {
                message: format!("failed to start container: {}", e),
                result: None,
            });
        }
        info!(
            "Job {} running in container {} (timeout {}s)",
            request.job_id,
            container_id,
            request.timeout.as_secs()
        );

        let per_stream = (self.max_preview_bytes / 2).max(1);
        let previews = Arc::new(Mutex::new(Previews {
            stdout: PreviewBuffer::new(per_stream),
            stderr: PreviewBuffer::new(per_stream),
        }));

        let mut collector = match self.runtime.stream_output(&container_id).await {
            Ok(stream) => Some(tokio::spawn(collect_output(
                stream,
                log_path.clone(),
                previews.clone(),
            ))),
            Err(e) => {
                warn!("No output stream for container {}: {}", container_id, e);
                None
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            waited = tokio::time::timeout(request.timeout, self.runtime.wait_container(&container_id)) => {
                match waited {
                    Ok(Ok(code)) => Outcome::Exited(code),
                    Ok(Err(e)) => Outcome::WaitFailed(e.to_string()),
                    Err(_) => Outcome::TimedOut,
                }
            }
        };
        let duration = clock.elapsed();
        let completed_at = Utc::now();

        if !matches!(outcome, Outcome::Exited(_)) {
            if let Err(e) = self.runtime.kill_container(&container_id).await {
                warn!("Failed to kill container {}: {}", container_id, e);
            }
        }

        if let Some(task) = collector.as_mut() {
            if tokio::time::timeout(DRAIN_GRACE, &mut *task).await.is_err() {
                warn!("Log collector for {} did not finish; aborting", container_id);
                task.abort();
            }
        }

        container.release().await;

        let (stdout_preview, stderr_preview) = match previews.lock() {
            Ok(p) => (p.stdout.render(), p.stderr.render()),
            Err(poisoned) => {
                let p = poisoned.into_inner();
                (p.stdout.render(), p.stderr.render())
            }
        };

        let mut result = ExecutionResult {
            exit_code: None,
            stdout_preview,
            stderr_preview,
            duration,
            started_at,
            completed_at,
            log_path,
        };

        match outcome {
            Outcome::Exited(code) => {
                info!(
                    "Job {} exited with code {} after {:.1}s",
                    request.job_id,
                    code,
                    result.duration.as_secs_f64()
                );
                result.exit_code = Some(code);
                Ok(result)
            }
            Outcome::TimedOut => {
                warn!(
                    "Job {} exceeded its {}s timeout",
                    request.job_id,
                    request.timeout.as_secs()
                );
                Err(SandboxError::ExecutionTimeout {
                    seconds: request.timeout.as_secs(),
                    result: Box::new(result),
                })
            }
            Outcome::Cancelled => {
                info!("Job {} cancelled during execution", request.job_id);
                Err(SandboxError::Cancelled {
                    result: Some(Box::new(result)),
                })
            }
            Outcome::WaitFailed(message) => Err(SandboxError::Execution {
                message,
                result: Some(Box::new(result)),
            }),
        }
    }

    fn container_spec(
        &self,
        request: &ExecutionRequest,
        policy: &ValidatedPolicy,
        outputs_dir: &Path,
    ) -> ContainerSpec {
        let mut env_vars = HashMap::from([
            ("HOME".to_string(), "/tmp".to_string()),
            ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ("MPLCONFIGDIR".to_string(), "/tmp/matplotlib".to_string()),
            ("REPROBOX_JOB_ID".to_string(), request.job_id.clone()),
            (
                "REPROBOX_ARTIFACTS_DIR".to_string(),
                ARTIFACTS_MOUNT.to_string(),
            ),
        ]);
        let mut labels = HashMap::from([(
            format!("{}.job_id", LABEL_PREFIX),
            request.job_id.clone(),
        )]);
        if policy.network_mode == "bridge" {
            let allowed = policy.allowed_domains.join(",");
            env_vars.insert("REPROBOX_ALLOWED_DOMAINS".to_string(), allowed.clone());
            labels.insert(format!("{}.allowed_domains", LABEL_PREFIX), allowed);
        }

        ContainerSpec {
            image: request.image_tag.clone(),
            name: format!("{}-run-{}", LABEL_PREFIX, request.job_id.to_lowercase()),
            command: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                request.command.clone(),
            ],
            user: policy.user.clone(),
            working_dir: WORKSPACE_MOUNT.to_string(),
            env_vars,
            volumes: vec![
                VolumeMount {
                    host_path: request.workspace_dir.to_string_lossy().into_owned(),
                    container_path: WORKSPACE_MOUNT.to_string(),
                    readonly: true,
                },
                VolumeMount {
                    host_path: outputs_dir.to_string_lossy().into_owned(),
                    container_path: ARTIFACTS_MOUNT.to_string(),
                    readonly: false,
                },
            ],
            tmpfs: HashMap::from([("/tmp".to_string(), TMPFS_OPTIONS.to_string())]),
            labels,
            nano_cpus: policy.nano_cpus,
            memory_bytes: policy.memory_bytes,
            pids_limit: policy.pids_limit,
            network_mode: policy.network_mode.clone(),
            readonly_rootfs: true,
        }
    }
}

/// Write every chunk to the combined log in arrival order and feed the previews
async fn collect_output(
    mut stream: OutputStream,
    log_path: PathBuf,
    previews: Arc<Mutex<Previews>>,
) {
    let mut log = match tokio::fs::File::create(&log_path).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!("Cannot create log file {}: {}", log_path.display(), e);
            None
        }
    };

    while let Some(chunk) = stream.receiver.recv().await {
        if let Some(file) = log.as_mut() {
            if let Err(e) = file.write_all(&chunk.data).await {
                warn!("Failed writing {}: {}", log_path.display(), e);
                log = None;
            }
        }
        if let Ok(mut p) = previews.lock() {
            match chunk.stream {
                StreamType::Stdout => p.stdout.push(&chunk.data),
                StreamType::Stderr => p.stderr.push(&chunk.data),
            }
        }
    }

    if let Some(mut file) = log {
        if let Err(e) = file.flush().await {
            warn!("Failed flushing {}: {}", log_path.display(), e);
        }
    }
    debug!("Log collector for {} finished", log_path.display());
}

#[cfg(unix)]
async fn make_world_writable(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    // The container user's uid differs from ours
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777)).await
}

#[cfg(not(unix))]
async fn make_world_writable(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
