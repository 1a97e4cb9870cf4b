// ABOUTME: Subcommand handlers for the reprobox binary
// ABOUTME: Shared setup loads configuration and wires the store and runtime into a coordinator

pub mod jobs;
pub mod worker;

use anyhow::{Context, Result};
use reprobox_config::EngineConfig;
use reprobox_jobs::JobCoordinator;
use reprobox_sandbox::DockerRuntime;
use reprobox_storage::SqliteJobStore;
use std::sync::Arc;

pub async fn open_coordinator(config: EngineConfig) -> Result<Arc<JobCoordinator>> {
    let store = SqliteJobStore::connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open job database {}", config.database_url))?;
    let runtime = DockerRuntime::new().context("failed to set up the Docker client")?;

    Ok(Arc::new(JobCoordinator::new(
        Arc::new(store),
        Arc::new(runtime),
        config,
    )))
}

pub fn load_config() -> Result<EngineConfig> {
    EngineConfig::from_env().context("invalid configuration")
}
