// ABOUTME: Versioned pipeline state threaded through the job stages
// ABOUTME: Each stage returns a delta that is merged field by field, last writer wins

use reprobox_core::{Artifact, EnvironmentInfo, JobError, Run, Stage};
use std::path::PathBuf;

/// Everything the pipeline has learned about one job so far.
///
/// Owned by the coordinator and passed by value; stages never mutate it
/// directly, they return a [`StageDelta`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineState {
    pub version: u64,
    pub job_id: String,
    /// Last stage that reported
    pub stage: Option<Stage>,
    pub repo_root: Option<PathBuf>,
    pub commit: Option<String>,
    pub environment: Option<EnvironmentInfo>,
    pub image_tag: Option<String>,
    pub run: Option<Run>,
    pub error: Option<JobError>,
    pub artifacts: Vec<Artifact>,
}

/// Fields a stage wants to set. `None` leaves the current value alone.
#[derive(Debug, Clone, Default)]
pub struct StageDelta {
    pub stage: Option<Stage>,
    pub repo_root: Option<PathBuf>,
    pub commit: Option<String>,
    pub environment: Option<EnvironmentInfo>,
    pub image_tag: Option<String>,
    pub run: Option<Run>,
    pub error: Option<JobError>,
    pub artifacts: Option<Vec<Artifact>>,
}

impl StageDelta {
    pub fn for_stage(stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            ..Default::default()
        }
    }

    pub fn failed(error: JobError) -> Self {
        Self {
            stage: Some(error.stage),
            error: Some(error),
            ..Default::default()
        }
    }
}

impl PipelineState {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Default::default()
        }
    }

    /// Merge `delta` into a new state with the version bumped
    pub fn apply(self, delta: StageDelta) -> Self {
        Self {
            version: self.version + 1,
            job_id: self.job_id,
            stage: delta.stage.or(self.stage),
            repo_root: delta.repo_root.or(self.repo_root),
            commit: delta.commit.or(self.commit),
            environment: delta.environment.or(self.environment),
            image_tag: delta.image_tag.or(self.image_tag),
            run: delta.run.or(self.run),
            error: delta.error.or(self.error),
            artifacts: delta.artifacts.unwrap_or(self.artifacts),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}
