// ABOUTME: Artifact generation for jobs whose execution has finished
// ABOUTME: Writes a Markdown report, a reproduction notebook and a status badge per job

pub mod badge;
pub mod notebook;
pub mod report;

use reprobox_core::{generate_id, Artifact, ArtifactKind, EnvironmentInfo, Job, JobError, Run};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub use badge::{render_badge, BadgeStatus};
pub use notebook::render_notebook;
pub use report::render_report;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to render {kind}: {reason}")]
    Render { kind: ArtifactKind, reason: String },
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

/// Everything known about a job once its run has ended
#[derive(Debug, Clone, Copy)]
pub struct ArtifactInput<'a> {
    pub job: &'a Job,
    pub run: &'a Run,
    pub environment: Option<&'a EnvironmentInfo>,
    /// Set when the pipeline failed (timeout, cancellation, start failure)
    pub error: Option<&'a JobError>,
    pub command: &'a str,
}

impl ArtifactInput<'_> {
    pub fn badge_status(&self) -> BadgeStatus {
        match (self.error, self.run.exit_code) {
            (Some(_), _) | (None, None) => BadgeStatus::Failure,
            (None, Some(0)) => BadgeStatus::Success,
            (None, Some(_)) => BadgeStatus::Partial,
        }
    }
}

/// Files written for one job. The report is always present; notebook and
/// badge failures are collected instead of aborting.
#[derive(Debug)]
pub struct GeneratedArtifacts {
    pub artifacts: Vec<Artifact>,
    pub failures: Vec<ArtifactError>,
}

impl GeneratedArtifacts {
    pub fn report(&self) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::Report)
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactGenerator {
    root: PathBuf,
}

impl ArtifactGenerator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding every file for `job_id`
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    pub async fn generate(&self, input: ArtifactInput<'_>) -> Result<GeneratedArtifacts> {
        let dir = self.job_dir(&input.job.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ArtifactError::Write {
                path: dir.clone(),
                source,
            })?;

        let mut artifacts = Vec::new();
        let mut failures = Vec::new();

        let report = render_report(&input);
        artifacts.push(write_artifact(&dir, &input.job.id, ArtifactKind::Report, &report).await?);

        let optional = [
            (ArtifactKind::Notebook, render_notebook(&input)),
            (ArtifactKind::Badge, Ok(render_badge(input.badge_status()))),
        ];
        for (kind, rendered) in optional {
            let written = match rendered {
                Ok(contents) => write_artifact(&dir, &input.job.id, kind, &contents).await,
                Err(e) => Err(e),
            };
            match written {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => {
                    warn!(job_id = %input.job.id, "Skipping {} artifact: {}", kind, e);
                    failures.push(e);
                }
            }
        }

        info!(
            job_id = %input.job.id,
            "Generated {} artifacts in {}",
            artifacts.len(),
            dir.display()
        );

        Ok(GeneratedArtifacts {
            artifacts,
            failures,
        })
    }
}

async fn write_artifact(
    dir: &Path,
    job_id: &str,
    kind: ArtifactKind,
    contents: &str,
) -> Result<Artifact> {
    let path = dir.join(kind.file_name());
    tokio::fs::write(&path, contents)
        .await
        .map_err(|source| ArtifactError::Write {
            path: path.clone(),
            source,
        })?;

    Ok(Artifact {
        id: generate_id(),
        job_id: job_id.to_string(),
        kind,
        format: kind.format(),
        path: path.to_string_lossy().into_owned(),
        size_bytes: contents.len() as i64,
        created_at: chrono::Utc::now(),
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{TimeZone, Utc};
    use reprobox_core::{Dependency, EnvKind, EnvironmentInfo, Job, JobStatus, Run};

    pub fn job() -> Job {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        Job {
            id: "0b7e4c1e-5f3a-4c55-9a0e-1f2d3c4b5a69".into(),
            repo_url: "https://github.com/example/paper-code".into(),
            paper_id: Some("2403.01234".into()),
            run_command: Some("python train.py --epochs 1".into()),
            status: JobStatus::Running,
            error: None,
            environment: None,
            cancel_requested: false,
            claimed_by: Some("worker-0".into()),
            created_at: at,
            updated_at: at,
            started_at: Some(at),
            completed_at: None,
        }
    }

    pub fn run(exit_code: Option<i64>) -> Run {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 1, 0).unwrap();
        Run {
            id: "run-1".into(),
            job_id: job().id,
            exit_code,
            stdout_preview: "epoch 1 loss=0.42\n".into(),
            stderr_preview: String::new(),
            log_path: "/var/reprobox/artifacts/job/logs/combined.log".into(),
            started_at: at,
            completed_at: Some(at + chrono::Duration::seconds(75)),
            duration_seconds: Some(75.0),
        }
    }

    pub fn environment() -> EnvironmentInfo {
        EnvironmentInfo {
            kind: EnvKind::Pip,
            dependencies: vec![
                Dependency::new("numpy", Some("==1.26.0".into())),
                Dependency::new("torch", None),
            ],
            detected_files: vec!["requirements.txt".into(), "pyproject.toml".into()],
            base_image: "python:3.11-slim".into(),
            python_version: None,
        }
    }
}
