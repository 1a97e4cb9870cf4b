// ABOUTME: Shared constants for job naming, labelling and previews
// ABOUTME: Anything two crates must agree on lives here

use std::env;
use std::path::PathBuf;

/// Command executed when a job does not supply one
pub const DEFAULT_COMMAND: &str = "python main.py";

/// Appended to a log preview that was cut short
pub const TRUNCATION_MARKER: &str = "\n... [truncated]";

/// Prefix for every Docker label the engine attaches
pub const LABEL_PREFIX: &str = "reprobox";

/// Prefix of per-job image repositories
pub const IMAGE_PREFIX: &str = "reprobox-job";

/// Build the image tag for a job. The tag embeds the job id so concurrent
/// builds never collide.
pub fn image_tag_for_job(job_id: &str) -> String {
    format!("{}-{}:latest", IMAGE_PREFIX, job_id.to_lowercase())
}

/// Get the path to the Reprobox state directory (~/.reprobox)
pub fn reprobox_dir() -> PathBuf {
    // HOME first so tests can redirect it
    if let Ok(home) = env::var("HOME") {
        PathBuf::from(home).join(".reprobox")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".reprobox")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_tag_embeds_job_id() {
        let tag = image_tag_for_job("3F2A-b1");
        assert_eq!(tag, "reprobox-job-3f2a-b1:latest");
    }
}
