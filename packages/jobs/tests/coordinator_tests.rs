// ABOUTME: End-to-end coordinator tests on SQLite with an in-memory container runtime
// ABOUTME: Exercises terminal states, cleanup, cancellation, claims and the worker pool

use pretty_assertions::assert_eq;
use reprobox_config::EngineConfig;
use reprobox_core::{ArtifactKind, ErrorKind, JobStatus, Stage};
use reprobox_jobs::{run_workers, CoordinatorError, JobCoordinator};
use reprobox_sandbox::testing::{FakeBehavior, FakeRuntime};
use reprobox_storage::{JobStore, NewJob, SqliteJobStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    coordinator: Arc<JobCoordinator>,
    runtime: Arc<FakeRuntime>,
    store: Arc<SqliteJobStore>,
    dir: TempDir,
}

impl Harness {
    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn workspace_entries(&self) -> usize {
        match std::fs::read_dir(self.root().join("workspaces")) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    /// Write a repository fixture and return its file:// URL
    fn repo(&self, name: &str, files: &[(&str, &str)]) -> String {
        let path: PathBuf = self.root().join("fixtures").join(name);
        std::fs::create_dir_all(&path).unwrap();
        for (file, contents) in files {
            std::fs::write(path.join(file), contents).unwrap();
        }
        format!("file://{}", path.display())
    }

    fn paper_repo(&self) -> String {
        self.repo(
            "paper",
            &[
                ("requirements.txt", "numpy==1.26.0\n"),
                ("main.py", "print('reproduced')\n"),
            ],
        )
    }
}

async fn harness(behavior: FakeBehavior, tweak: impl FnOnce(&mut EngineConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let database_url = format!("sqlite://{}", dir.path().join("reprobox.db").display());
    let store = Arc::new(SqliteJobStore::connect(&database_url).await.unwrap());

    let mut config = EngineConfig {
        database_url,
        workspace_root: dir.path().join("workspaces"),
        artifacts_root: dir.path().join("artifacts"),
        allow_local_sources: true,
        default_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(50),
        cancel_poll_interval: Duration::from_millis(20),
        ..EngineConfig::default()
    };
    tweak(&mut config);

    let runtime = Arc::new(FakeRuntime::with_behavior(behavior));
    let coordinator = Arc::new(JobCoordinator::new(store.clone(), runtime.clone(), config));

    Harness {
        coordinator,
        runtime,
        store,
        dir,
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_nonzero_exit_completes_with_exit_code() {
    let h = harness(
        FakeBehavior {
            exit_code: 1,
            ..Default::default()
        },
        |_| {},
    )
    .await;
    let url = h.paper_repo();

    let job_id = h
        .coordinator
        .submit(&url, None, Some("2403.01234".into()))
        .await
        .unwrap();
    let processed = h.coordinator.process_next("worker-test").await.unwrap();
    assert_eq!(processed.as_deref(), Some(job_id.as_str()));

    let status = h.coordinator.get_status(&job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Completed);
    assert_eq!(status.error, None);
    assert_eq!(status.exit_code, Some(1));

    let artifacts = h.coordinator.get_artifacts(&job_id).await.unwrap();
    let report = artifacts
        .iter()
        .find(|a| a.kind == ArtifactKind::Report)
        .unwrap();
    assert!(report.size_bytes > 0);
    assert!(Path::new(&report.path).exists());
    assert_eq!(artifacts.len(), 3);

    // Container, image and workspace are all gone
    assert!(h.runtime.live_containers().is_empty());
    assert!(h.runtime.images().is_empty());
    assert_eq!(h.workspace_entries(), 0);

    let job = h.store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(
        job.environment.map(|e| e.detected_files),
        Some(vec!["requirements.txt".to_string()])
    );
}

#[tokio::test]
async fn test_status_and_artifact_queries_are_idempotent() {
    let h = harness(FakeBehavior::default(), |_| {}).await;
    let url = h.paper_repo();
    let job_id = h.coordinator.submit(&url, None, None).await.unwrap();
    h.coordinator.process_next("worker-test").await.unwrap();

    let first = h.coordinator.get_status(&job_id).await.unwrap();
    let second = h.coordinator.get_status(&job_id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.status, JobStatus::Completed);

    let first = h.coordinator.get_artifacts(&job_id).await.unwrap();
    let second = h.coordinator.get_artifacts(&job_id).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_root_user_fails_before_any_container_or_image() {
    let h = harness(FakeBehavior::default(), |config| {
        config.container_user = Some("root".into());
    })
    .await;
    let url = h.paper_repo();
    let job_id = h.coordinator.submit(&url, None, None).await.unwrap();
    h.coordinator.process_next("worker-test").await.unwrap();

    let status = h.coordinator.get_status(&job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    let error = status.error.unwrap();
    assert_eq!(error.kind, ErrorKind::SecurityConfig);

    assert_eq!(h.runtime.created_count(), 0);
    assert!(h.runtime.images().is_empty());
    assert!(h.runtime.removed_images().is_empty());
    assert!(h.coordinator.get_artifacts(&job_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_timeout_fails_and_removes_container() {
    let h = harness(
        FakeBehavior {
            run_for: Duration::from_secs(60),
            ..Default::default()
        },
        |config| config.default_timeout = Duration::from_millis(300),
    )
    .await;
    let url = h.paper_repo();
    let job_id = h.coordinator.submit(&url, None, None).await.unwrap();
    h.coordinator.process_next("worker-test").await.unwrap();

    let status = h.coordinator.get_status(&job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    let error = status.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ExecutionTimeout);
    assert_eq!(error.stage, Stage::Execute);
    assert_eq!(status.exit_code, None);

    assert!(h.runtime.live_containers().is_empty());
    assert_eq!(h.runtime.killed_containers().len(), 1);
    assert!(h.runtime.images().is_empty());

    let run = h.store.get_run(&job_id).await.unwrap().unwrap();
    let duration = run.duration_seconds.unwrap();
    assert!((0.25..5.0).contains(&duration), "duration {}", duration);

    // Diagnostics are still produced for a failed run
    let artifacts = h.coordinator.get_artifacts(&job_id).await.unwrap();
    assert!(artifacts.iter().any(|a| a.kind == ArtifactKind::Report));
}

#[tokio::test]
async fn test_missing_manifest_fails_without_build() {
    let h = harness(FakeBehavior::default(), |_| {}).await;
    let url = h.repo("bare", &[("main.py", "print('hi')\n")]);
    let job_id = h.coordinator.submit(&url, None, None).await.unwrap();
    h.coordinator.process_next("worker-test").await.unwrap();

    let status = h.coordinator.get_status(&job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    let error = status.error.unwrap();
    assert_eq!(error.kind, ErrorKind::NoEnvironmentDetected);
    assert_eq!(error.stage, Stage::Detect);

    assert!(h.runtime.removed_images().is_empty());
    assert_eq!(h.runtime.created_count(), 0);
    assert_eq!(h.workspace_entries(), 0);
}

#[tokio::test]
async fn test_unreachable_repository_fails_fetch_and_cleans_workspace() {
    let h = harness(FakeBehavior::default(), |_| {}).await;
    let missing = h.root().join("does-not-exist");
    let url = format!("file://{}", missing.display());
    let job_id = h.coordinator.submit(&url, None, None).await.unwrap();
    h.coordinator.process_next("worker-test").await.unwrap();

    let status = h.coordinator.get_status(&job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    let error = status.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Fetch);
    assert_eq!(error.stage, Stage::Fetch);
    assert_eq!(h.workspace_entries(), 0);
}

#[tokio::test]
async fn test_local_source_rejected_when_disabled() {
    let h = harness(FakeBehavior::default(), |config| {
        config.allow_local_sources = false;
    })
    .await;
    let url = h.paper_repo();
    let job_id = h.coordinator.submit(&url, None, None).await.unwrap();
    h.coordinator.process_next("worker-test").await.unwrap();

    let status = h.coordinator.get_status(&job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    let error = status.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Fetch);
    assert_eq!(error.stage, Stage::Fetch);
    assert!(error.cause.contains("disabled"));
    assert_eq!(h.runtime.created_count(), 0);
    assert_eq!(h.workspace_entries(), 0);
}

#[tokio::test]
async fn test_cancel_pending_job() {
    let h = harness(FakeBehavior::default(), |_| {}).await;
    let url = h.paper_repo();
    let job_id = h.coordinator.submit(&url, None, None).await.unwrap();

    assert!(h.coordinator.cancel(&job_id).await.unwrap());
    h.coordinator.process_next("worker-test").await.unwrap();

    let status = h.coordinator.get_status(&job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    let error = status.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Cancelled);
    assert_eq!(error.stage, Stage::Claim);
    assert_eq!(h.runtime.created_count(), 0);

    // Already terminal
    assert!(!h.coordinator.cancel(&job_id).await.unwrap());
}

#[tokio::test]
async fn test_cancel_running_job_stops_container() {
    let h = harness(
        FakeBehavior {
            run_for: Duration::from_secs(60),
            ..Default::default()
        },
        |config| config.default_timeout = Duration::from_secs(30),
    )
    .await;
    let url = h.paper_repo();
    let job_id = h.coordinator.submit(&url, None, None).await.unwrap();

    let coordinator = h.coordinator.clone();
    let task = tokio::spawn(async move { coordinator.process_next("worker-test").await });

    let runtime = h.runtime.clone();
    wait_until(|| !runtime.live_containers().is_empty()).await;
    assert!(h.coordinator.cancel(&job_id).await.unwrap());
    task.await.unwrap().unwrap();

    let status = h.coordinator.get_status(&job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(status.error.unwrap().kind, ErrorKind::Cancelled);
    assert!(h.runtime.live_containers().is_empty());
    assert!(h.runtime.images().is_empty());
}

#[tokio::test]
async fn test_cancel_flag_from_another_process_is_observed() {
    let h = harness(
        FakeBehavior {
            run_for: Duration::from_secs(60),
            ..Default::default()
        },
        |config| config.default_timeout = Duration::from_secs(30),
    )
    .await;
    let url = h.paper_repo();
    let job_id = h.coordinator.submit(&url, None, None).await.unwrap();

    let coordinator = h.coordinator.clone();
    let task = tokio::spawn(async move { coordinator.process_next("worker-test").await });

    let runtime = h.runtime.clone();
    wait_until(|| !runtime.live_containers().is_empty()).await;
    // Only the persisted flag; the in-process token is left alone
    assert!(h.store.request_cancel(&job_id).await.unwrap());
    task.await.unwrap().unwrap();

    let status = h.coordinator.get_status(&job_id).await.unwrap();
    assert_eq!(status.error.unwrap().kind, ErrorKind::Cancelled);
    assert!(h.runtime.live_containers().is_empty());
}

#[tokio::test]
async fn test_concurrent_workers_claim_a_job_once() {
    let h = harness(FakeBehavior::default(), |_| {}).await;
    let url = h.paper_repo();
    h.coordinator.submit(&url, None, None).await.unwrap();

    let (a, b) = tokio::join!(
        h.coordinator.process_next("worker-a"),
        h.coordinator.process_next("worker-b"),
    );
    let winners = [a.unwrap(), b.unwrap()]
        .into_iter()
        .filter(Option::is_some)
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_empty_queue() {
    let h = harness(FakeBehavior::default(), |_| {}).await;
    assert_eq!(h.coordinator.process_next("worker-test").await.unwrap(), None);
}

#[tokio::test]
async fn test_unknown_job() {
    let h = harness(FakeBehavior::default(), |_| {}).await;
    let err = h.coordinator.get_status("nope").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NotFound(_)));
    let err = h.coordinator.cancel("nope").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NotFound(_)));
}

#[tokio::test]
async fn test_blank_repository_url_rejected() {
    let h = harness(FakeBehavior::default(), |_| {}).await;
    let err = h.coordinator.submit("  ", None, None).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidInput(_)));
}

#[tokio::test]
async fn test_stuck_jobs_are_reported_not_resolved() {
    let h = harness(FakeBehavior::default(), |config| {
        config.stuck_grace_period = Duration::ZERO;
    })
    .await;

    let job = h
        .store
        .create_job(NewJob {
            repo_url: "https://example.com/a/b.git".into(),
            run_command: None,
            paper_id: None,
        })
        .await
        .unwrap();
    // A worker that crashed after claiming
    h.store.claim_job(&job.id, "dead-worker").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stuck = h.coordinator.stuck_jobs().await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].id, job.id);

    let status = h.coordinator.get_status(&job.id).await.unwrap();
    assert_eq!(status.status, JobStatus::Running);
}

#[tokio::test]
async fn test_worker_pool_drains_queue() {
    let h = harness(FakeBehavior::default(), |config| config.worker_count = 2).await;
    let url = h.paper_repo();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(h.coordinator.submit(&url, None, None).await.unwrap());
    }

    let shutdown = CancellationToken::new();
    let pool = tokio::spawn(run_workers(h.coordinator.clone(), shutdown.clone()));

    for _ in 0..250 {
        let mut done = 0;
        for id in &ids {
            let status = h.coordinator.get_status(id).await.unwrap();
            if status.status.is_terminal() {
                done += 1;
            }
        }
        if done == ids.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.cancel();
    pool.await.unwrap();

    for id in &ids {
        let status = h.coordinator.get_status(id).await.unwrap();
        assert_eq!(status.status, JobStatus::Completed, "job {}", id);
    }
    assert!(h.runtime.live_containers().is_empty());
}
