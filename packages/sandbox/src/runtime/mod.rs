// ABOUTME: Container runtime trait used by the image builder and executor
// ABOUTME: Defines the container/image lifecycle surface and its value types

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod docker;

pub use docker::DockerRuntime;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Build failed: {message}")]
    BuildFailed { message: String, output: Vec<String> },

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Everything needed to create one hardened container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub command: Vec<String>,
    pub user: String,
    pub working_dir: String,
    pub env_vars: HashMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub tmpfs: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub nano_cpus: i64,
    pub memory_bytes: i64,
    pub pids_limit: i64,
    pub network_mode: String,
    pub readonly_rootfs: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

/// A build request: tar context plus the Dockerfile name inside it
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub tag: String,
    pub dockerfile: String,
    pub context: Vec<u8>,
    pub labels: HashMap<String, String>,
}

/// Lines the builder printed for a successful build
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub lines: Vec<String>,
}

/// Containers carrying the engine's managed label
#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub state: String,
    pub labels: HashMap<String, String>,
}

/// Stream output from container logs
pub struct OutputStream {
    pub receiver: tokio::sync::mpsc::UnboundedReceiver<OutputChunk>,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stream: StreamType,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

/// Container engine backend
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check if the runtime daemon is reachable
    async fn is_available(&self) -> bool;

    /// Build and tag an image from a tar context
    async fn build_image(&self, spec: BuildSpec) -> Result<BuildOutput>;

    /// Remove an image by tag. Removing a missing image succeeds.
    async fn remove_image(&self, tag: &str) -> Result<()>;

    /// Create (but do not start) a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Follow combined stdout/stderr until the container stops
    async fn stream_output(&self, container_id: &str) -> Result<OutputStream>;

    /// Wait for the container to stop and return its exit code
    async fn wait_container(&self, container_id: &str) -> Result<i64>;

    /// SIGKILL the container. Killing a stopped container succeeds.
    async fn kill_container(&self, container_id: &str) -> Result<()>;

    /// Force-remove the container and its anonymous volumes. Removing a
    /// missing container succeeds.
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    /// Containers (running or not) carrying `label=value`
    async fn list_containers(&self, label: &str, value: &str) -> Result<Vec<ManagedContainer>>;
}
