// ABOUTME: Repository fetching for Reprobox jobs
// ABOUTME: Clones remote git URLs or copies file:// sources into a caller-owned workspace

pub mod fetcher;
pub mod url;

use std::path::PathBuf;
use thiserror::Error;

pub use fetcher::{FetchedRepository, RepositoryFetcher};
pub use url::{parse_github_url, parse_repo_url, repository_name, RepoSource};

/// Every way a fetch can fail collapses into this one error
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Invalid repository URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Repository path does not exist: {}", .0.display())]
    MissingPath(PathBuf),

    #[error("Clone of {url} failed: {source}")]
    Clone { url: String, source: git2::Error },

    #[error("IO error while fetching repository: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fetch timed out after {0}s")]
    Timeout(u64),

    #[error("Fetch cancelled")]
    Cancelled,

    #[error("Fetch task failed: {0}")]
    Internal(String),
}
