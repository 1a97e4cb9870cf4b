// ABOUTME: Client subcommands: submit, status, artifacts, cancel, list and stuck
// ABOUTME: Human-readable tables by default, JSON with --json for scripting

use super::{load_config, open_coordinator};
use anyhow::{anyhow, Result};
use clap::Args;
use colored::*;
use reprobox_cli::render;
use reprobox_core::JobStatus;
use reprobox_storage::JobStore;
use std::time::Duration;

/// Interval between status checks for `submit --wait`
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Args)]
pub struct JobArgs {
    /// Job ID
    pub job_id: String,
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub async fn submit(
    repo_url: &str,
    command: Option<String>,
    paper_id: Option<String>,
    wait: bool,
) -> Result<()> {
    let coordinator = open_coordinator(load_config()?).await?;
    let job_id = coordinator.submit(repo_url, command, paper_id).await?;

    println!("{} {}", "Submitted job".green().bold(), job_id.cyan());
    if !wait {
        println!(
            "{}",
            format!("Check progress with 'reprobox status {}'", job_id).dimmed()
        );
        return Ok(());
    }

    let mut last = None;
    let view = loop {
        let view = coordinator.get_status(&job_id).await?;
        if last != Some(view.status) {
            println!("  {}", render::status_label(view.status));
            last = Some(view.status);
        }
        if view.status.is_terminal() {
            break view;
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    };

    println!("{}", render::status_table(&view));
    if view.status == JobStatus::Failed {
        return Err(anyhow!("job {} failed", job_id));
    }
    Ok(())
}

pub async fn status(args: &JobArgs) -> Result<()> {
    let coordinator = open_coordinator(load_config()?).await?;
    let view = coordinator.get_status(&args.job_id).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        println!(
            "{} {}",
            format!("Job {}", view.job_id).blue().bold(),
            render::status_label(view.status)
        );
        println!("{}", render::status_table(&view));
    }
    Ok(())
}

pub async fn artifacts(args: &JobArgs) -> Result<()> {
    let coordinator = open_coordinator(load_config()?).await?;
    let artifacts = coordinator.get_artifacts(&args.job_id).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&artifacts)?);
        return Ok(());
    }

    if artifacts.is_empty() {
        println!("{}", "No artifacts recorded for this job yet".yellow());
        return Ok(());
    }
    println!("{}", render::artifacts_table(&artifacts));
    Ok(())
}

pub async fn cancel(job_id: &str) -> Result<()> {
    let coordinator = open_coordinator(load_config()?).await?;
    if coordinator.cancel(job_id).await? {
        println!("{} {}", "Cancellation requested for".yellow(), job_id.cyan());
    } else {
        println!("{}", "Job has already finished; nothing to cancel".dimmed());
    }
    Ok(())
}

pub async fn list(status: Option<&str>, limit: i64) -> Result<()> {
    let status = status
        .map(|s| s.parse::<JobStatus>())
        .transpose()
        .map_err(|e| anyhow!("{}", e))?;

    let coordinator = open_coordinator(load_config()?).await?;
    let jobs = coordinator.store().list_jobs(status, limit).await?;

    if jobs.is_empty() {
        println!("{}", "No jobs found".yellow());
        println!("{}", "Use 'reprobox submit <repo-url>' to queue one".dimmed());
        return Ok(());
    }

    println!("{}", render::jobs_table(&jobs));
    println!("Total: {} jobs", jobs.len().to_string().cyan());
    Ok(())
}

pub async fn stuck() -> Result<()> {
    let coordinator = open_coordinator(load_config()?).await?;
    let jobs = coordinator.stuck_jobs().await?;

    if jobs.is_empty() {
        println!("{}", "No stuck jobs".green());
        return Ok(());
    }

    println!(
        "{}",
        format!("{} job(s) running past the grace period", jobs.len())
            .yellow()
            .bold()
    );
    println!("{}", render::jobs_table(&jobs));
    println!(
        "{}",
        "These jobs are left as they are; cancel them or inspect their workers".dimmed()
    );
    Ok(())
}
