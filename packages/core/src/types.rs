// ABOUTME: Job, Run, Artifact and EnvironmentInfo type definitions
// ABOUTME: Status lifecycle rules and the structured job error shared by all stages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Lifecycle state of a job: pending -> running -> {completed | failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(ParseEnumError::new("job status", s)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Claim,
    Fetch,
    Detect,
    Build,
    Execute,
    Artifacts,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Claim => "claim",
            Stage::Fetch => "fetch",
            Stage::Detect => "detect",
            Stage::Build => "build",
            Stage::Execute => "execute",
            Stage::Artifacts => "artifacts",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "FetchError")]
    Fetch,
    #[serde(rename = "NoEnvironmentDetectedError")]
    NoEnvironmentDetected,
    #[serde(rename = "BuildError")]
    Build,
    #[serde(rename = "ExecutionError")]
    Execution,
    #[serde(rename = "ExecutionTimeoutError")]
    ExecutionTimeout,
    #[serde(rename = "SecurityConfigError")]
    SecurityConfig,
    #[serde(rename = "ArtifactGenerationError")]
    ArtifactGeneration,
    #[serde(rename = "Cancelled")]
    Cancelled,
    #[serde(rename = "InternalError")]
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Fetch => "FetchError",
            ErrorKind::NoEnvironmentDetected => "NoEnvironmentDetectedError",
            ErrorKind::Build => "BuildError",
            ErrorKind::Execution => "ExecutionError",
            ErrorKind::ExecutionTimeout => "ExecutionTimeoutError",
            ErrorKind::SecurityConfig => "SecurityConfigError",
            ErrorKind::ArtifactGeneration => "ArtifactGenerationError",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure recorded on a job: which stage, what kind, why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub cause: String,
}

impl JobError {
    pub fn new(stage: Stage, kind: ErrorKind, cause: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            cause: cause.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.kind, self.cause)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub repo_url: String,
    pub paper_id: Option<String>,
    pub run_command: Option<String>,
    pub status: JobStatus,
    pub error: Option<JobError>,
    pub environment: Option<EnvironmentInfo>,
    pub cancel_requested: bool,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Command to run, falling back to `default` when none was submitted
    pub fn command_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.run_command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(default)
    }
}

/// Outcome of the single sandboxed execution belonging to a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub job_id: String,
    /// Absent on timeout, cancellation or start failure
    pub exit_code: Option<i64>,
    pub stdout_preview: String,
    pub stderr_preview: String,
    pub log_path: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Report,
    Notebook,
    Badge,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Report => "report",
            ArtifactKind::Notebook => "notebook",
            ArtifactKind::Badge => "badge",
        }
    }

    pub fn format(&self) -> ArtifactFormat {
        match self {
            ArtifactKind::Report => ArtifactFormat::Markdown,
            ArtifactKind::Notebook => ArtifactFormat::Ipynb,
            ArtifactKind::Badge => ArtifactFormat::Svg,
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactKind::Report => "report.md",
            ArtifactKind::Notebook => "notebook.ipynb",
            ArtifactKind::Badge => "badge.svg",
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "report" => Ok(ArtifactKind::Report),
            "notebook" => Ok(ArtifactKind::Notebook),
            "badge" => Ok(ArtifactKind::Badge),
            _ => Err(ParseEnumError::new("artifact kind", s)),
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Markdown,
    Ipynb,
    Svg,
}

impl ArtifactFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactFormat::Markdown => "markdown",
            ArtifactFormat::Ipynb => "ipynb",
            ArtifactFormat::Svg => "svg",
        }
    }
}

impl FromStr for ArtifactFormat {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "markdown" => Ok(ArtifactFormat::Markdown),
            "ipynb" => Ok(ArtifactFormat::Ipynb),
            "svg" => Ok(ArtifactFormat::Svg),
            _ => Err(ParseEnumError::new("artifact format", s)),
        }
    }
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub job_id: String,
    pub kind: ArtifactKind,
    pub format: ArtifactFormat,
    pub path: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

/// Package manager family inferred from the repository's manifests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvKind {
    Pip,
    Conda,
    Poetry,
    Pipenv,
}

impl EnvKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKind::Pip => "pip",
            EnvKind::Conda => "conda",
            EnvKind::Poetry => "poetry",
            EnvKind::Pipenv => "pipenv",
        }
    }
}

impl fmt::Display for EnvKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    /// Version or range exactly as declared (e.g. `==1.2.0`, `>=2,<3`, `^1.4`)
    pub version: Option<String>,
}

impl Dependency {
    pub fn new(name: impl Into<String>, version: Option<String>) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Render as a pip requirement specifier
    pub fn to_requirement(&self) -> String {
        match self.version.as_deref() {
            None | Some("") | Some("*") => self.name.clone(),
            Some(v) if v.starts_with(['=', '<', '>', '!', '~', '@', ';', ',', ' ']) => {
                format!("{}{}", self.name, v)
            }
            Some(v) => format!("{}=={}", self.name, v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub kind: EnvKind,
    pub dependencies: Vec<Dependency>,
    /// Every manifest present in the repository, selecting manifest first
    pub detected_files: Vec<String>,
    pub base_image: String,
    pub python_version: Option<String>,
}
