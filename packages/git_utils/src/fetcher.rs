// ABOUTME: Repository fetcher that materializes a job's source tree on disk
// ABOUTME: Shallow git clones via libgit2 and recursive copies for local directories

use git2::build::RepoBuilder;
use git2::{FetchOptions, RemoteCallbacks, Repository};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::url::{parse_repo_url, repository_name, RepoSource};
use crate::FetchError;

type Result<T> = std::result::Result<T, FetchError>;

/// How long to wait for an aborted clone thread to notice and stop
const ABORT_GRACE: Duration = Duration::from_secs(5);

/// A repository checked out under the caller's workspace directory
#[derive(Debug, Clone)]
pub struct FetchedRepository {
    pub root: PathBuf,
    /// HEAD commit when the source was a git repository
    pub commit: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RepositoryFetcher {
    timeout: Duration,
    allow_local_sources: bool,
}

impl RepositoryFetcher {
    /// Fetcher for remote repositories only. `file://` URLs are refused
    /// until enabled with [`RepositoryFetcher::with_local_sources`].
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            allow_local_sources: false,
        }
    }

    pub fn with_local_sources(mut self, allow: bool) -> Self {
        self.allow_local_sources = allow;
        self
    }

    /// Fetch `url` into a fresh directory inside `workspace`.
    ///
    /// `workspace` is owned by the caller, who removes it on every path.
    /// A partially written checkout is removed here before an error returns.
    pub async fn fetch(
        &self,
        url: &str,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedRepository> {
        let source = parse_repo_url(url)?;
        if matches!(source, RepoSource::Local(_)) && !self.allow_local_sources {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
                reason: "local file:// sources are disabled".to_string(),
            });
        }
        let dest = workspace.join(repository_name(url));

        if dest.exists() {
            return Err(FetchError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("checkout directory already exists: {}", dest.display()),
            )));
        }

        info!("Fetching repository {} into {}", url, dest.display());

        // Child token lets a timeout abort the blocking clone without
        // cancelling the whole job
        let abort = cancel.child_token();
        let task = {
            let abort = abort.clone();
            let dest = dest.clone();
            let url = url.to_string();
            tokio::task::spawn_blocking(move || fetch_blocking(&url, source, &dest, &abort))
        };
        tokio::pin!(task);

        let result = tokio::select! {
            joined = &mut task => joined.map_err(|e| FetchError::Internal(e.to_string()))?,
            _ = tokio::time::sleep(self.timeout) => {
                abort.cancel();
                // Let the clone thread stop before the directory is removed
                let _ = tokio::time::timeout(ABORT_GRACE, &mut task).await;
                Err(FetchError::Timeout(self.timeout.as_secs()))
            }
        };

        match result {
            Ok(commit) => {
                debug!("Fetched {} (commit: {:?})", url, commit);
                Ok(FetchedRepository { root: dest, commit })
            }
            Err(e) => {
                let e = if cancel.is_cancelled() {
                    FetchError::Cancelled
                } else {
                    e
                };
                if dest.exists() {
                    if let Err(rm) = fs::remove_dir_all(&dest) {
                        warn!("Failed to remove partial checkout {}: {}", dest.display(), rm);
                    }
                }
                Err(e)
            }
        }
    }
}

fn fetch_blocking(
    url: &str,
    source: RepoSource,
    dest: &Path,
    abort: &CancellationToken,
) -> Result<Option<String>> {
    match source {
        RepoSource::Remote(remote) => clone_repository(&remote, dest, true, abort).map(Some),
        RepoSource::Local(path) => {
            if !path.is_dir() {
                return Err(FetchError::MissingPath(path));
            }
            if path.join(".git").exists() {
                // The local transport does not support shallow clones
                let local_url = format!("file://{}", path.display());
                clone_repository(&local_url, dest, false, abort).map(Some)
            } else {
                debug!("{} is not a git repository, copying", url);
                copy_tree(&path, dest, abort)?;
                Ok(None)
            }
        }
    }
}

fn clone_repository(
    url: &str,
    dest: &Path,
    shallow: bool,
    abort: &CancellationToken,
) -> Result<String> {
    let mut callbacks = RemoteCallbacks::new();
    let token = abort.clone();
    // Returning false aborts the transfer
    callbacks.transfer_progress(move |_progress| !token.is_cancelled());

    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(callbacks);
    if shallow {
        fetch_options.depth(1);
    }

    let repo = RepoBuilder::new()
        .fetch_options(fetch_options)
        .clone(url, dest)
        .map_err(|source| {
            if abort.is_cancelled() {
                FetchError::Cancelled
            } else {
                FetchError::Clone {
                    url: url.to_string(),
                    source,
                }
            }
        })?;

    head_commit(&repo).ok_or_else(|| FetchError::Clone {
        url: url.to_string(),
        source: git2::Error::from_str("cloned repository has no HEAD commit"),
    })
}

fn head_commit(repo: &Repository) -> Option<String> {
    repo.head()
        .ok()
        .and_then(|head| head.peel_to_commit().ok())
        .map(|commit| commit.id().to_string())
}

/// Copy a plain directory tree. Symlinks are skipped so a repository cannot
/// pull in files from outside its own tree.
fn copy_tree(src: &Path, dest: &Path, abort: &CancellationToken) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        if abort.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let entry = entry.map_err(|e| {
            FetchError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            )
        })?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            debug!("Skipping non-regular file {}", entry.path().display());
        }
    }
    Ok(())
}
