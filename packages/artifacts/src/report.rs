// ABOUTME: Markdown reproduction report
// ABOUTME: Job metadata, environment summary, outcome and bounded log excerpts

use crate::ArtifactInput;
use reprobox_core::{truncate_at_char_boundary, TRUNCATION_MARKER};
use std::fmt::Write;

/// Longest log excerpt embedded in the report, per stream
const EXCERPT_BYTES: usize = 16 * 1024;

pub fn render_report(input: &ArtifactInput<'_>) -> String {
    let job = input.job;
    let run = input.run;
    let mut out = String::new();

    let _ = writeln!(out, "# Reproduction Report\n");
    let _ = writeln!(out, "| Field | Value |");
    let _ = writeln!(out, "|-------|-------|");
    let _ = writeln!(out, "| Job ID | `{}` |", job.id);
    let _ = writeln!(out, "| Repository | {} |", job.repo_url);
    if let Some(paper) = &job.paper_id {
        let _ = writeln!(out, "| Paper | {} |", paper);
    }
    let _ = writeln!(out, "| Command | `{}` |", input.command);
    let _ = writeln!(out, "| Submitted | {} |", job.created_at.to_rfc3339());
    let _ = writeln!(out, "| Started | {} |", run.started_at.to_rfc3339());
    if let Some(done) = run.completed_at {
        let _ = writeln!(out, "| Finished | {} |", done.to_rfc3339());
    }
    if let Some(seconds) = run.duration_seconds {
        let _ = writeln!(out, "| Duration | {:.2}s |", seconds);
    }

    let _ = writeln!(out, "\n## Environment\n");
    match input.environment {
        Some(env) => {
            let _ = writeln!(out, "- Manager: {}", env.kind);
            let _ = writeln!(out, "- Base image: `{}`", env.base_image);
            let _ = writeln!(out, "- Detected files: {}", env.detected_files.join(", "));
            if env.dependencies.is_empty() {
                let _ = writeln!(out, "- Dependencies: none declared");
            } else {
                let _ = writeln!(out, "- Dependencies ({}):", env.dependencies.len());
                for dep in &env.dependencies {
                    let _ = writeln!(out, "  - `{}`", dep.to_requirement());
                }
            }
        }
        None => {
            let _ = writeln!(out, "No environment was recorded.");
        }
    }

    let _ = writeln!(out, "\n## Outcome\n");
    let _ = writeln!(out, "- Result: **{}**", input.badge_status().label());
    match run.exit_code {
        Some(code) => {
            let _ = writeln!(out, "- Exit code: {}", code);
        }
        None => {
            let _ = writeln!(out, "- Exit code: none (the process did not exit on its own)");
        }
    }
    if let Some(error) = input.error {
        let _ = writeln!(out, "- Error: {}", error);
    }

    write_excerpt(&mut out, "Standard output", &run.stdout_preview);
    write_excerpt(&mut out, "Standard error", &run.stderr_preview);

    let _ = writeln!(out, "\n## Full log\n");
    let _ = writeln!(out, "The complete combined log is at `{}`.", run.log_path);

    out
}

fn write_excerpt(out: &mut String, title: &str, text: &str) {
    let _ = writeln!(out, "\n## {}\n", title);
    if text.is_empty() {
        let _ = writeln!(out, "_(empty)_");
        return;
    }
    let mut excerpt = truncate_at_char_boundary(text, EXCERPT_BYTES).to_string();
    if excerpt.len() < text.len() {
        excerpt.push_str(TRUNCATION_MARKER);
    }
    // A fence longer than any backtick run inside the log
    let longest = longest_backtick_run(&excerpt);
    let fence = "`".repeat(longest.max(2) + 1);
    let _ = writeln!(out, "{}text\n{}\n{}", fence, excerpt.trim_end_matches('\n'), fence);
}

fn longest_backtick_run(text: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for c in text.chars() {
        if c == '`' {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}
