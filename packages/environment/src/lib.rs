// ABOUTME: Environment detection for cloned repositories
// ABOUTME: Picks the first dependency manifest by fixed priority and derives a base image

pub mod manifests;
pub mod requirements;

use reprobox_core::{truncate_at_char_boundary, EnvironmentInfo};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use manifests::ParsedManifest;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error(
        "No environment files detected. Supported: requirements.txt, environment.yml, pyproject.toml, Pipfile"
    )]
    NoManifest,

    #[error("Failed to parse {file}: {reason}")]
    MalformedManifest { file: String, reason: String },

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, DetectError>;

/// Manifests larger than this are not dependency lists
const MAX_MANIFEST_BYTES: u64 = 1024 * 1024;

/// Parse failures quote manifest text; keep job errors short
const MAX_REASON_CHARS: usize = 160;

type Parser = fn(&str) -> std::result::Result<ParsedManifest, String>;

/// Manifests in priority order. The first one present decides everything.
pub const MANIFESTS: &[(&str, Parser)] = &[
    ("requirements.txt", manifests::parse_requirements_txt),
    ("environment.yml", manifests::parse_environment_yml),
    ("environment.yaml", manifests::parse_environment_yml),
    ("pyproject.toml", manifests::parse_pyproject_toml),
    ("Pipfile", manifests::parse_pipfile),
];

#[derive(Debug, Clone)]
pub struct EnvironmentDetector {
    default_base_image: String,
}

impl EnvironmentDetector {
    pub fn new(default_base_image: impl Into<String>) -> Self {
        Self {
            default_base_image: default_base_image.into(),
        }
    }

    /// Inspect `repo_root` and describe the environment it needs
    pub fn detect(&self, repo_root: &Path) -> Result<EnvironmentInfo> {
        let detected_files: Vec<&str> = MANIFESTS
            .iter()
            .map(|(name, _)| *name)
            .filter(|name| is_regular_file(&repo_root.join(name)))
            .collect();

        let Some((file, parser)) = MANIFESTS
            .iter()
            .find(|(name, _)| detected_files.contains(name))
        else {
            warn!("No dependency manifest found in {}", repo_root.display());
            return Err(DetectError::NoManifest);
        };

        let path = repo_root.join(file);
        let size = std::fs::symlink_metadata(&path)
            .map_err(|source| DetectError::Io {
                path: path.clone(),
                source,
            })?
            .len();
        if size > MAX_MANIFEST_BYTES {
            return Err(DetectError::MalformedManifest {
                file: file.to_string(),
                reason: format!(
                    "file is {} bytes, larger than the {} byte limit",
                    size, MAX_MANIFEST_BYTES
                ),
            });
        }

        let text = std::fs::read_to_string(&path).map_err(|source| DetectError::Io {
            path: path.clone(),
            source,
        })?;

        let parsed = parser(&text).map_err(|reason| {
            warn!("Malformed manifest {}: {}", file, reason);
            DetectError::MalformedManifest {
                file: file.to_string(),
                reason: cap_reason(reason),
            }
        })?;

        let base_image = match parsed.python_version.as_deref() {
            Some(version) => format!("python:{}-slim", version),
            None => self.default_base_image.clone(),
        };

        info!(
            "Detected {} environment from {}: {} dependencies, base image {}",
            parsed.kind,
            file,
            parsed.dependencies.len(),
            base_image
        );
        debug!("Manifests present: {:?}", detected_files);

        Ok(EnvironmentInfo {
            kind: parsed.kind,
            dependencies: parsed.dependencies,
            detected_files: detected_files.iter().map(|s| s.to_string()).collect(),
            base_image,
            python_version: parsed.python_version,
        })
    }
}

/// Symlinks are never followed: a checked-out link could point at any host file
fn is_regular_file(path: &Path) -> bool {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => meta.file_type().is_file(),
        Err(_) => false,
    }
}

fn cap_reason(reason: String) -> String {
    if reason.len() <= MAX_REASON_CHARS {
        return reason;
    }
    format!("{}...", truncate_at_char_boundary(&reason, MAX_REASON_CHARS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_reason() {
        assert_eq!(cap_reason("short".to_string()), "short");
        let long = "x".repeat(500);
        let capped = cap_reason(long);
        assert_eq!(capped.len(), MAX_REASON_CHARS + 3);
        assert!(capped.ends_with("..."));
    }
}
