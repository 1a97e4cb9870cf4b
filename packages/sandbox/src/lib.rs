// ABOUTME: Image building and sandboxed execution of job code
// ABOUTME: Wraps a container runtime with security policy, timeouts and guaranteed cleanup

pub mod builder;
pub mod executor;
pub mod handles;
pub mod policy;
pub mod runtime;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use builder::{render_dockerfile, ImageBuilder, DOCKERFILE_NAME};
pub use executor::{ExecutionRequest, ExecutionResult, SandboxExecutor};
pub use handles::{ContainerHandle, ImageHandle};
pub use policy::{parse_memory_limit, SandboxPolicy, ValidatedPolicy};
pub use runtime::{ContainerRuntime, DockerRuntime, RuntimeError};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Security configuration rejected: {0}")]
    SecurityConfig(String),

    #[error("Image build failed: {message}")]
    Build { message: String, output: Vec<String> },

    #[error("Image build timed out after {0}s")]
    BuildTimeout(u64),

    #[error("Execution failed: {message}")]
    Execution {
        message: String,
        result: Option<Box<ExecutionResult>>,
    },

    #[error("Execution timed out after {seconds}s")]
    ExecutionTimeout {
        seconds: u64,
        result: Box<ExecutionResult>,
    },

    #[error("Cancelled")]
    Cancelled { result: Option<Box<ExecutionResult>> },

    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Output captured before the failure, if the container got that far
    pub fn partial_result(&self) -> Option<&ExecutionResult> {
        match self {
            SandboxError::Execution { result, .. } | SandboxError::Cancelled { result } => {
                result.as_deref()
            }
            SandboxError::ExecutionTimeout { result, .. } => Some(result),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
