// ABOUTME: Core domain types and utilities for Reprobox
// ABOUTME: Foundational package shared by every stage of the job pipeline

pub mod constants;
pub mod types;
pub mod utils;

// Re-export main types
pub use types::{
    Artifact, ArtifactFormat, ArtifactKind, Dependency, EnvKind, EnvironmentInfo, ErrorKind,
    Job, JobError, JobStatus, ParseEnumError, Run, Stage,
};

// Re-export constants
pub use constants::{
    image_tag_for_job, reprobox_dir, DEFAULT_COMMAND, LABEL_PREFIX, TRUNCATION_MARKER,
};

// Re-export utilities
pub use utils::{generate_id, truncate_at_char_boundary, PreviewBuffer};
