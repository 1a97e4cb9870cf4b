// ABOUTME: End-to-end sandbox tests against a real Docker daemon
// ABOUTME: Builds a tiny image, runs it under the default policy and checks cleanup

use reprobox_core::{EnvKind, EnvironmentInfo};
use reprobox_sandbox::{
    ContainerRuntime, DockerRuntime, ExecutionRequest, ImageBuilder, SandboxError,
    SandboxExecutor, SandboxPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// DockerRuntime::new() only configures a client, so it must not panic
/// when no daemon is listening.
#[tokio::test]
async fn test_docker_runtime_unavailable_is_not_fatal() {
    match DockerRuntime::new() {
        Ok(runtime) => {
            // Either answer is fine; the call itself must not hang or panic
            let _ = runtime.is_available().await;
        }
        Err(e) => {
            let message = e.to_string();
            assert!(
                message.contains("Connection") || message.contains("socket"),
                "Error should mention the connection: {}",
                message
            );
        }
    }
}

fn policy() -> SandboxPolicy {
    SandboxPolicy {
        user: Some("reprobox".into()),
        uid: Some(1000),
        cpu_limit: 1.0,
        memory_limit: Some("256m".into()),
        pids_limit: 64,
        network_mode: "none".into(),
        allowed_domains: vec![],
        readonly_rootfs: true,
    }
}

fn environment() -> EnvironmentInfo {
    EnvironmentInfo {
        kind: EnvKind::Pip,
        dependencies: vec![],
        detected_files: vec!["requirements.txt".into()],
        base_image: "python:3.11-slim".into(),
        python_version: None,
    }
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_build_and_run_exit_code() {
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new().unwrap());
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir(&repo).unwrap();
    std::fs::write(repo.join("requirements.txt"), "").unwrap();
    std::fs::write(
        repo.join("main.py"),
        "import sys\nprint('ran')\nsys.exit(1)\n",
    )
    .unwrap();

    let validated = policy().validate().unwrap();
    let image = ImageBuilder::new(runtime.clone(), Duration::from_secs(600))
        .build("it-exit", &repo, &environment(), &validated, &CancellationToken::new())
        .await
        .unwrap();

    let executor = SandboxExecutor::new(runtime.clone(), policy(), 64 * 1024);
    let request = ExecutionRequest {
        job_id: "it-exit".into(),
        image_tag: image.tag().to_string(),
        command: "python main.py".into(),
        workspace_dir: repo.clone(),
        artifacts_dir: dir.path().join("artifacts"),
        timeout: Duration::from_secs(120),
    };
    let result = executor
        .execute(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.exit_code, Some(1));
    assert!(result.stdout_preview.contains("ran"));

    let leftover = runtime
        .list_containers("reprobox.job_id", "it-exit")
        .await
        .unwrap();
    assert!(leftover.is_empty());
    image.release().await;
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_timeout_removes_container() {
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new().unwrap());
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir(&repo).unwrap();
    std::fs::write(repo.join("requirements.txt"), "").unwrap();

    let validated = policy().validate().unwrap();
    let image = ImageBuilder::new(runtime.clone(), Duration::from_secs(600))
        .build("it-timeout", &repo, &environment(), &validated, &CancellationToken::new())
        .await
        .unwrap();

    let executor = SandboxExecutor::new(runtime.clone(), policy(), 64 * 1024);
    let request = ExecutionRequest {
        job_id: "it-timeout".into(),
        image_tag: image.tag().to_string(),
        command: "sleep 60".into(),
        workspace_dir: repo.clone(),
        artifacts_dir: dir.path().join("artifacts"),
        timeout: Duration::from_secs(2),
    };
    let err = executor
        .execute(&request, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::ExecutionTimeout { .. }));

    let leftover = runtime
        .list_containers("reprobox.job_id", "it-timeout")
        .await
        .unwrap();
    assert!(leftover.is_empty());
    image.release().await;
}
