// ABOUTME: Repository URL classification and naming
// ABOUTME: Distinguishes remote git URLs from local file:// sources and parses GitHub owner/repo

use std::path::PathBuf;

use crate::FetchError;

/// Where a repository comes from
#[derive(Debug, Clone, PartialEq)]
pub enum RepoSource {
    /// Anything libgit2 can clone over the network
    Remote(String),
    /// A `file://` location on this machine
    Local(PathBuf),
}

const REMOTE_SCHEMES: &[&str] = &["https://", "http://", "git://", "ssh://"];

/// Classify a submitted repository URL
pub fn parse_repo_url(url: &str) -> Result<RepoSource, FetchError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(invalid(url, "empty URL"));
    }

    if let Some(path) = url.strip_prefix("file://") {
        if path.is_empty() || !path.starts_with('/') {
            return Err(invalid(url, "file URLs must carry an absolute path"));
        }
        return Ok(RepoSource::Local(PathBuf::from(path)));
    }

    if let Some(scheme) = REMOTE_SCHEMES.iter().find(|s| url.starts_with(**s)) {
        let rest = &url[scheme.len()..];
        let host = rest.split('/').next().unwrap_or_default();
        if host.is_empty() || rest.len() <= host.len() + 1 {
            return Err(invalid(url, "missing host or repository path"));
        }
        return Ok(RepoSource::Remote(url.to_string()));
    }

    // scp-like syntax: git@github.com:owner/repo.git
    if let Some((user_host, path)) = url.split_once(':') {
        if user_host.contains('@') && !user_host.contains('/') && !path.is_empty() {
            return Ok(RepoSource::Remote(url.to_string()));
        }
    }

    Err(invalid(url, "unsupported scheme"))
}

fn invalid(url: &str, reason: &str) -> FetchError {
    FetchError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

/// Directory name a repository is cloned into
pub fn repository_name(url: &str) -> String {
    if let Some((_, repo)) = parse_github_url(url) {
        return sanitize(&repo);
    }

    let trimmed = url.trim().trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default();
    let last = last.strip_suffix(".git").unwrap_or(last);
    let name = sanitize(last);
    if name.is_empty() {
        "repo".to_string()
    } else {
        name
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

/// Extract `(owner, repo)` from a GitHub URL.
///
/// Handles https://github.com/owner/repo(.git), credentials in the
/// authority and git@github.com:owner/repo.git.
pub fn parse_github_url(url: &str) -> Option<(String, String)> {
    let path = if let Some(path) = url.strip_prefix("git@github.com:") {
        path
    } else {
        let pos = url.find("github.com/")? + "github.com/".len();
        &url[pos..]
    };

    let path = path.trim_end_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    let mut parts = path.split('/');
    match (parts.next(), parts.next()) {
        (Some(owner), Some(repo)) if !owner.is_empty() && !repo.is_empty() => {
            Some((owner.to_string(), repo.to_string()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_github_url() {
        assert_eq!(
            parse_github_url("https://github.com/openai/gym.git"),
            Some(("openai".to_string(), "gym".to_string()))
        );
        assert_eq!(
            parse_github_url("https://github.com/openai/gym/"),
            Some(("openai".to_string(), "gym".to_string()))
        );
        assert_eq!(
            parse_github_url("https://someone@github.com/openai/gym.git"),
            Some(("openai".to_string(), "gym".to_string()))
        );
        assert_eq!(
            parse_github_url("git@github.com:openai/gym.git"),
            Some(("openai".to_string(), "gym".to_string()))
        );
        assert_eq!(parse_github_url("not-a-valid-url"), None);
        assert_eq!(parse_github_url("https://github.com/onlyowner"), None);
    }

    #[test]
    fn test_classifies_sources() {
        assert_eq!(
            parse_repo_url("https://github.com/a/b").unwrap(),
            RepoSource::Remote("https://github.com/a/b".to_string())
        );
        assert_eq!(
            parse_repo_url("git@gitlab.com:a/b.git").unwrap(),
            RepoSource::Remote("git@gitlab.com:a/b.git".to_string())
        );
        assert_eq!(
            parse_repo_url("file:///srv/repos/demo").unwrap(),
            RepoSource::Local(PathBuf::from("/srv/repos/demo"))
        );
    }

    #[test]
    fn test_rejects_unsupported_urls() {
        for url in [
            "",
            "ftp://example.com/repo",
            "file://relative/path",
            "https://",
            "https://github.com",
            "/just/a/path",
            "C:\\repo",
        ] {
            assert!(
                matches!(parse_repo_url(url), Err(FetchError::InvalidUrl { .. })),
                "expected {:?} to be rejected",
                url
            );
        }
    }

    #[test]
    fn test_repository_name() {
        assert_eq!(repository_name("https://github.com/openai/gym.git"), "gym");
        assert_eq!(repository_name("https://gitlab.com/group/sub/proj.git"), "proj");
        assert_eq!(repository_name("file:///tmp/fixtures/demo-repo/"), "demo-repo");
        assert_eq!(repository_name("git@host.org:team/My Repo.git"), "My_Repo");
        assert_eq!(repository_name("file:///"), "repo");
    }
}
