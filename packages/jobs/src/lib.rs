// ABOUTME: Job coordinator for the fetch, detect, build, execute and report pipeline
// ABOUTME: Owns the job state machine, the worker pool, cancellation and stuck-job reporting

pub mod coordinator;
pub mod state;
pub mod worker;

pub use coordinator::{ArtifactRef, JobCoordinator, JobStatusView};
pub use state::{PipelineState, StageDelta};
pub use worker::run_workers;

use reprobox_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
