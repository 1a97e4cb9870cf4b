// ABOUTME: `reprobox worker` runs the worker pool in the foreground
// ABOUTME: Ctrl-C stops claiming new jobs and waits for in-flight jobs to finish

use super::{load_config, open_coordinator};
use anyhow::{bail, Result};
use colored::*;
use reprobox_core::LABEL_PREFIX;
use reprobox_jobs::run_workers;
use reprobox_sandbox::{ContainerRuntime, DockerRuntime};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run(workers: Option<usize>) -> Result<()> {
    let mut config = load_config()?;
    if let Some(workers) = workers {
        config.worker_count = workers.max(1);
    }

    let runtime = DockerRuntime::new()?;
    if !runtime.is_available().await {
        bail!("Docker daemon is not reachable; start Docker or set DOCKER_HOST");
    }
    report_leftover_containers(&runtime).await;

    println!(
        "{} {} workers, artifacts in {}",
        "Starting".green().bold(),
        config.worker_count,
        config.artifacts_root.display()
    );

    let coordinator = open_coordinator(config).await?;
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; finishing in-flight jobs");
            signal.cancel();
        }
    });

    run_workers(coordinator, shutdown).await;
    println!("{}", "Workers stopped".dimmed());
    Ok(())
}

/// Containers from a previous crash are reported, not removed
async fn report_leftover_containers(runtime: &DockerRuntime) {
    let label = format!("{}.managed", LABEL_PREFIX);
    match runtime.list_containers(&label, "true").await {
        Ok(containers) => {
            for container in containers {
                warn!(
                    container = %container.name,
                    state = %container.state,
                    "Found a managed container from an earlier run"
                );
            }
        }
        Err(e) => warn!("Failed to list managed containers: {}", e),
    }
}
