// ABOUTME: Bounded worker pool and background watchers for the job coordinator
// ABOUTME: Workers claim and run jobs one at a time; watchers relay cancellation and report stuck jobs

use crate::coordinator::JobCoordinator;
use reprobox_storage::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often running jobs are checked against the stuck grace period
const STUCK_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Run `worker_count` workers until `shutdown` is cancelled.
///
/// Shutdown stops workers from claiming new jobs; a job already claimed
/// runs to its terminal state first.
pub async fn run_workers(coordinator: Arc<JobCoordinator>, shutdown: CancellationToken) {
    let worker_count = coordinator.config().worker_count.max(1);
    let instance = std::process::id();
    info!("Starting {} workers", worker_count);

    report_stuck_jobs(&coordinator).await;

    let mut set = JoinSet::new();
    for index in 0..worker_count {
        let coordinator = coordinator.clone();
        let shutdown = shutdown.clone();
        let worker_id = format!("worker-{}-{}", instance, index);
        set.spawn(async move { worker_loop(coordinator, worker_id, shutdown).await });
    }

    {
        let coordinator = coordinator.clone();
        let shutdown = shutdown.clone();
        set.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = time::sleep(STUCK_CHECK_INTERVAL) => report_stuck_jobs(&coordinator).await,
                }
            }
        });
    }

    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            error!("Worker task ended abnormally: {}", e);
        }
    }
    info!("All workers stopped");
}

async fn worker_loop(coordinator: Arc<JobCoordinator>, worker_id: String, shutdown: CancellationToken) {
    info!(worker = %worker_id, "Worker started");
    let poll_interval = coordinator.config().poll_interval;

    while !shutdown.is_cancelled() {
        match coordinator.process_next(&worker_id).await {
            Ok(Some(job_id)) => {
                debug!(worker = %worker_id, job_id = %job_id, "Worker finished job");
                continue;
            }
            Ok(None) => {}
            Err(e) => error!(worker = %worker_id, "Failed to claim a job: {}", e),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = coordinator.work_available() => {}
            _ = time::sleep(poll_interval) => {}
        }
    }

    info!(worker = %worker_id, "Worker stopped");
}

async fn report_stuck_jobs(coordinator: &JobCoordinator) {
    match coordinator.stuck_jobs().await {
        Ok(stuck) => {
            for job in stuck {
                warn!(
                    job_id = %job.id,
                    claimed_by = job.claimed_by.as_deref().unwrap_or("unknown"),
                    "Job has been running since {} and may be stuck",
                    job.started_at.unwrap_or(job.updated_at)
                );
            }
        }
        Err(e) => error!("Failed to check for stuck jobs: {}", e),
    }
}

/// Poll the persisted cancel flag so a cancel from another process reaches
/// this job. Stops when `stop` fires or after relaying one cancellation.
pub(crate) fn spawn_cancel_watcher(
    store: Arc<dyn JobStore>,
    job_id: String,
    cancel: CancellationToken,
    stop: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = cancel.cancelled() => break,
                _ = time::sleep(interval) => {}
            }

            match store.is_cancel_requested(&job_id).await {
                Ok(true) => {
                    info!(job_id = %job_id, "Cancellation requested; stopping job");
                    cancel.cancel();
                    break;
                }
                Ok(false) => {}
                Err(e) => warn!(job_id = %job_id, "Failed to read cancel flag: {}", e),
            }
        }
    })
}
