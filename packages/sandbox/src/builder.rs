// ABOUTME: Builds a per-job image from a detected environment
// ABOUTME: Renders a Dockerfile, packs the repository as build context and runs the build

use crate::handles::ImageHandle;
use crate::policy::ValidatedPolicy;
use crate::runtime::{BuildSpec, ContainerRuntime, RuntimeError};
use crate::{Result, SandboxError};
use reprobox_core::{image_tag_for_job, EnvKind, EnvironmentInfo, LABEL_PREFIX};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the generated Dockerfile inside the build context
pub const DOCKERFILE_NAME: &str = "Dockerfile.reprobox";

/// Requirements rendered from a non-pip manifest
const GENERATED_REQUIREMENTS: &str = ".reprobox-requirements.txt";

/// Build output lines kept on failure
const BUILD_OUTPUT_TAIL: usize = 50;

/// Render the Dockerfile for `env`. Dependencies install as root, then the
/// image drops to the unprivileged `user`.
pub fn render_dockerfile(env: &EnvironmentInfo, user: &str, uid: u32) -> String {
    let account = user.split(':').next().unwrap_or(user);
    let mut lines = vec![
        format!("FROM {}", env.base_image),
        "ENV PYTHONUNBUFFERED=1 PIP_NO_CACHE_DIR=1 PIP_DISABLE_PIP_VERSION_CHECK=1".to_string(),
        format!(
            "RUN useradd --create-home --shell /bin/sh --uid {} {}",
            uid, account
        ),
        "WORKDIR /workspace".to_string(),
        "COPY --chown=root:root . /workspace".to_string(),
    ];

    if let Some(install) = install_command(env) {
        lines.push(format!("RUN {}", install));
    }

    lines.push("RUN chmod -R a+rX,go-w /workspace".to_string());
    lines.push(format!("USER {}", user));
    lines.join("\n") + "\n"
}

fn install_command(env: &EnvironmentInfo) -> Option<String> {
    let source = env.detected_files.first().map(String::as_str);
    match env.kind {
        EnvKind::Pip if source == Some("requirements.txt") => {
            Some("pip install -r requirements.txt".to_string())
        }
        EnvKind::Pip | EnvKind::Conda => {
            if env.dependencies.is_empty() {
                None
            } else {
                Some(format!("pip install -r {}", GENERATED_REQUIREMENTS))
            }
        }
        EnvKind::Poetry => Some(
            "pip install poetry && poetry config virtualenvs.create false \
             && poetry install --no-root --only main --no-interaction"
                .to_string(),
        ),
        EnvKind::Pipenv => Some(
            "pip install pipenv && if [ -f Pipfile.lock ]; \
             then pipenv install --system --deploy; \
             else pipenv install --system --skip-lock; fi"
                .to_string(),
        ),
    }
}

/// Requirements file contents for environments pip cannot read directly
fn generated_requirements(env: &EnvironmentInfo) -> Option<String> {
    let from_requirements = env.detected_files.first().map(String::as_str) == Some("requirements.txt");
    match env.kind {
        EnvKind::Pip | EnvKind::Conda if !from_requirements && !env.dependencies.is_empty() => {
            let mut text = env
                .dependencies
                .iter()
                .map(|d| d.to_requirement())
                .collect::<Vec<_>>()
                .join("\n");
            text.push('\n');
            Some(text)
        }
        _ => None,
    }
}

/// Pack `repo_root` plus generated files into a tar build context.
/// `.git` is left out and symlinks are not followed.
pub fn build_context(repo_root: &Path, extra: &[(&str, &str)]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let walker = walkdir::WalkDir::new(repo_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git");

    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = match entry.path().strip_prefix(repo_root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => continue,
        };
        if relative == Path::new(".dockerignore") {
            continue;
        }
        let file_type = entry.file_type();
        if file_type.is_dir() {
            builder.append_dir(&relative, entry.path())?;
        } else if file_type.is_file() {
            builder.append_path_with_name(entry.path(), &relative)?;
        }
    }

    for (name, contents) in extra {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, contents.as_bytes())?;
    }

    builder.into_inner()
}

pub struct ImageBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    timeout: Duration,
}

impl ImageBuilder {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, timeout: Duration) -> Self {
        Self { runtime, timeout }
    }

    /// Build the image for `job_id`. On any failure the tag is removed
    /// before returning.
    pub async fn build(
        &self,
        job_id: &str,
        repo_root: &Path,
        env: &EnvironmentInfo,
        policy: &ValidatedPolicy,
        cancel: &CancellationToken,
    ) -> Result<ImageHandle> {
        let tag = image_tag_for_job(job_id);
        let dockerfile = render_dockerfile(env, &policy.user, policy.uid);
        debug!("Dockerfile for job {}:\n{}", job_id, dockerfile);

        let requirements = generated_requirements(env);
        let root: PathBuf = repo_root.to_path_buf();
        let context = tokio::task::spawn_blocking(move || {
            let mut extra = vec![(DOCKERFILE_NAME, dockerfile.as_str())];
            if let Some(text) = requirements.as_deref() {
                extra.push((GENERATED_REQUIREMENTS, text));
            }
            build_context(&root, &extra)
        })
        .await
        .map_err(|e| RuntimeError::InternalError(format!("context task failed: {}", e)))??;

        let spec = BuildSpec {
            tag: tag.clone(),
            dockerfile: DOCKERFILE_NAME.to_string(),
            context,
            labels: HashMap::from([
                (format!("{}.managed", LABEL_PREFIX), "true".to_string()),
                (format!("{}.job_id", LABEL_PREFIX), job_id.to_string()),
            ]),
        };

        info!("Building image {} for job {}", tag, job_id);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SandboxError::Cancelled { result: None }),
            result = tokio::time::timeout(self.timeout, self.runtime.build_image(spec)) => {
                match result {
                    Ok(Ok(output)) => {
                        debug!("Build for {} produced {} lines", tag, output.lines.len());
                        Ok(())
                    }
                    Ok(Err(RuntimeError::BuildFailed { message, output })) => {
                        let skip = output.len().saturating_sub(BUILD_OUTPUT_TAIL);
                        Err(SandboxError::Build {
                            message,
                            output: output.into_iter().skip(skip).collect(),
                        })
                    }
                    Ok(Err(e)) => Err(SandboxError::Build {
                        message: e.to_string(),
                        output: Vec::new(),
                    }),
                    Err(_) => Err(SandboxError::BuildTimeout(self.timeout.as_secs())),
                }
            }
        };

        match outcome {
            Ok(()) => Ok(ImageHandle::new(self.runtime.clone(), tag)),
            Err(e) => {
                warn!("Image build for job {} failed: {}", job_id, e);
                if let Err(remove_err) = self.runtime.remove_image(&tag).await {
                    warn!("Failed to remove partial image {}: {}", tag, remove_err);
                }
                Err(e)
            }
        }
    }
}
