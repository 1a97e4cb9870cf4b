// ABOUTME: Integration tests for manifest detection on real directory trees
// ABOUTME: Priority order, no merging, base image selection and failure cases

use pretty_assertions::assert_eq;
use reprobox_core::{Dependency, EnvKind};
use reprobox_environment::{DetectError, EnvironmentDetector};
use std::fs;
use tempfile::TempDir;

fn repo_with(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, contents) in files {
        fs::write(dir.path().join(name), contents).unwrap();
    }
    dir
}

fn detector() -> EnvironmentDetector {
    EnvironmentDetector::new("python:3.11-slim")
}

#[test]
fn test_requirements_wins_and_nothing_is_merged() {
    let repo = repo_with(&[
        ("requirements.txt", "numpy==1.26.0\n"),
        ("Pipfile", "[packages]\nflask = \"*\"\n"),
        ("pyproject.toml", "[tool.poetry.dependencies]\ntorch = \"^2\"\n"),
    ]);

    let env = detector().detect(repo.path()).unwrap();
    assert_eq!(env.kind, EnvKind::Pip);
    assert_eq!(
        env.dependencies,
        vec![Dependency::new("numpy", Some("==1.26.0".into()))]
    );
    assert_eq!(
        env.detected_files,
        vec!["requirements.txt", "pyproject.toml", "Pipfile"]
    );
    assert_eq!(env.base_image, "python:3.11-slim");
}

#[test]
fn test_conda_pins_base_image() {
    let repo = repo_with(&[(
        "environment.yml",
        "dependencies:\n  - python=3.9\n  - numpy\n",
    )]);

    let env = detector().detect(repo.path()).unwrap();
    assert_eq!(env.kind, EnvKind::Conda);
    assert_eq!(env.base_image, "python:3.9-slim");
    assert_eq!(env.python_version.as_deref(), Some("3.9"));
    assert_eq!(env.dependencies, vec![Dependency::new("numpy", None)]);
}

#[test]
fn test_pipfile_only() {
    let repo = repo_with(&[("Pipfile", "[packages]\nrequests = \"*\"\n")]);
    let env = detector().detect(repo.path()).unwrap();
    assert_eq!(env.kind, EnvKind::Pipenv);
    assert_eq!(env.detected_files, vec!["Pipfile"]);
}

#[test]
fn test_empty_repository_has_no_environment() {
    let repo = repo_with(&[("main.py", "print('hi')\n")]);
    let err = detector().detect(repo.path()).unwrap_err();
    assert!(matches!(err, DetectError::NoManifest));
}

#[test]
fn test_malformed_manifest_fails_detection() {
    let repo = repo_with(&[
        ("environment.yml", "dependencies: [unterminated\n"),
        ("Pipfile", "[packages]\nrequests = \"*\"\n"),
    ]);

    // The higher priority manifest is broken; no fallback to Pipfile
    match detector().detect(repo.path()).unwrap_err() {
        DetectError::MalformedManifest { file, .. } => assert_eq!(file, "environment.yml"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_manifest_directory_is_ignored() {
    let repo = repo_with(&[("Pipfile", "[packages]\n")]);
    fs::create_dir(repo.path().join("requirements.txt")).unwrap();

    let env = detector().detect(repo.path()).unwrap();
    assert_eq!(env.kind, EnvKind::Pipenv);
    assert!(env.dependencies.is_empty());
}

#[cfg(unix)]
#[test]
fn test_symlinked_manifest_is_never_read() {
    let outside = tempfile::tempdir().unwrap();
    let secret = outside.path().join("passwd");
    fs::write(&secret, "root:x:0:0:SECRET_TOKEN_abc123:/root:/bin/bash\n").unwrap();

    let repo = repo_with(&[("main.py", "print('hi')\n")]);
    std::os::unix::fs::symlink(&secret, repo.path().join("requirements.txt")).unwrap();

    let err = detector().detect(repo.path()).unwrap_err();
    assert!(matches!(err, DetectError::NoManifest));
    assert!(!err.to_string().contains("SECRET_TOKEN"));
}

#[cfg(unix)]
#[test]
fn test_symlinked_manifest_falls_through_to_regular_one() {
    let outside = tempfile::tempdir().unwrap();
    let secret = outside.path().join("requirements.txt");
    fs::write(&secret, "secret-package==1.0\n").unwrap();

    let repo = repo_with(&[("Pipfile", "[packages]\nflask = \"*\"\n")]);
    std::os::unix::fs::symlink(&secret, repo.path().join("requirements.txt")).unwrap();

    let env = detector().detect(repo.path()).unwrap();
    assert_eq!(env.kind, EnvKind::Pipenv);
    assert_eq!(env.detected_files, vec!["Pipfile"]);
}

#[test]
fn test_malformed_manifest_reason_is_capped() {
    let long_line = format!("numpy {}\n", "^".repeat(2000));
    let repo = repo_with(&[("requirements.txt", long_line.as_str())]);

    match detector().detect(repo.path()).unwrap_err() {
        DetectError::MalformedManifest { file, reason } => {
            assert_eq!(file, "requirements.txt");
            assert!(reason.len() < 200, "reason was {} bytes", reason.len());
        }
        other => panic!("expected a malformed manifest, got {:?}", other),
    }
}
