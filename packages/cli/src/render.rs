// ABOUTME: Terminal tables and labels for job status, artifacts and job listings
// ABOUTME: Built on comfy-table with colored status labels

use chrono::{DateTime, Local, Utc};
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use reprobox_core::{Job, JobStatus};
use reprobox_jobs::{ArtifactRef, JobStatusView};

const MISSING: &str = "-";

pub fn status_label(status: JobStatus) -> ColoredString {
    match status {
        JobStatus::Pending => status.as_str().yellow(),
        JobStatus::Running => status.as_str().cyan(),
        JobStatus::Completed => status.as_str().green(),
        JobStatus::Failed => status.as_str().red(),
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Two-column field/value table for one job
pub fn status_table(view: &JobStatusView) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Field", "Value"]);

    table.add_row(vec!["Job".to_string(), view.job_id.clone()]);
    table.add_row(vec!["Status".to_string(), view.status.as_str().to_string()]);
    table.add_row(vec![
        "Exit code".to_string(),
        view.exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| MISSING.to_string()),
    ]);
    if let Some(error) = &view.error {
        table.add_row(vec!["Failed stage".to_string(), error.stage.to_string()]);
        table.add_row(vec!["Error".to_string(), error.kind.to_string()]);
        table.add_row(vec!["Cause".to_string(), error.cause.clone()]);
    }
    if view.cancel_requested {
        table.add_row(vec!["Cancel requested".to_string(), "yes".to_string()]);
    }
    table.add_row(vec![
        "Log".to_string(),
        view.log_path.clone().unwrap_or_else(|| MISSING.to_string()),
    ]);
    table.add_row(vec!["Created".to_string(), format_timestamp(&view.created_at)]);
    table.add_row(vec!["Updated".to_string(), format_timestamp(&view.updated_at)]);
    table
}

pub fn artifacts_table(artifacts: &[ArtifactRef]) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Kind", "Format", "Size", "Path"]);
    for artifact in artifacts {
        table.add_row(vec![
            artifact.kind.to_string(),
            artifact.format.to_string(),
            format_size(artifact.size_bytes),
            artifact.path.clone(),
        ]);
    }
    table
}

pub fn jobs_table(jobs: &[Job]) -> Table {
    let mut table = new_table();
    table.set_header(vec!["ID", "Status", "Repository", "Paper", "Worker", "Created"]);
    for job in jobs {
        table.add_row(vec![
            job.id.clone(),
            job.status.as_str().to_string(),
            job.repo_url.clone(),
            job.paper_id.clone().unwrap_or_else(|| MISSING.to_string()),
            job.claimed_by.clone().unwrap_or_else(|| MISSING.to_string()),
            format_timestamp(&job.created_at),
        ]);
    }
    table
}

pub fn format_size(bytes: i64) -> String {
    const KIB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KIB {
        format!("{} B", bytes)
    } else if b < KIB * KIB {
        format!("{:.1} KiB", b / KIB)
    } else {
        format!("{:.1} MiB", b / (KIB * KIB))
    }
}
