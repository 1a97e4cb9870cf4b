// ABOUTME: In-memory container runtime for tests that cannot reach a Docker daemon
// ABOUTME: Scripted exit codes, run times and output, with a record of every lifecycle call

use crate::runtime::{
    BuildOutput, BuildSpec, ContainerRuntime, ContainerSpec, ManagedContainer, OutputChunk,
    OutputStream, Result, RuntimeError, StreamType,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How every container started by a [`FakeRuntime`] behaves
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    pub build_error: Option<String>,
    pub create_error: Option<String>,
    pub start_error: Option<String>,
    pub exit_code: i64,
    pub run_for: Duration,
    /// How long the output stream stays open after the process ends
    pub output_linger: Duration,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            build_error: None,
            create_error: None,
            start_error: None,
            exit_code: 0,
            run_for: Duration::from_millis(10),
            output_linger: Duration::ZERO,
            stdout: b"hello from the job\n".to_vec(),
            stderr: Vec::new(),
        }
    }
}

#[derive(Default)]
struct FakeState {
    images: Vec<String>,
    live: HashMap<String, (ContainerSpec, CancellationToken)>,
    specs: Vec<ContainerSpec>,
    killed: Vec<String>,
    removed_containers: Vec<String>,
    removed_images: Vec<String>,
}

#[derive(Default)]
pub struct FakeRuntime {
    behavior: FakeBehavior,
    state: Mutex<FakeState>,
    next_id: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            ..Default::default()
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn token(&self, container_id: &str) -> Option<CancellationToken> {
        self.state()
            .live
            .get(container_id)
            .map(|(_, token)| token.clone())
    }

    /// Image tags currently present
    pub fn images(&self) -> Vec<String> {
        self.state().images.clone()
    }

    /// Containers created and not yet removed
    pub fn live_containers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().live.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every container spec ever passed to `create_container`
    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.state().specs.clone()
    }

    pub fn created_count(&self) -> usize {
        self.state().specs.len()
    }

    pub fn killed_containers(&self) -> Vec<String> {
        self.state().killed.clone()
    }

    pub fn removed_containers(&self) -> Vec<String> {
        self.state().removed_containers.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state().removed_images.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn is_available(&self) -> bool {
        true
    }

    async fn build_image(&self, spec: BuildSpec) -> Result<BuildOutput> {
        let lines = vec![
            format!("Step 1/6 : FROM {}", spec.tag),
            format!("Successfully tagged {}", spec.tag),
        ];
        if let Some(message) = &self.behavior.build_error {
            return Err(RuntimeError::BuildFailed {
                message: message.clone(),
                output: lines,
            });
        }
        let mut state = self.state();
        if !state.images.contains(&spec.tag) {
            state.images.push(spec.tag);
        }
        Ok(BuildOutput { lines })
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        let mut state = self.state();
        state.images.retain(|t| t != tag);
        state.removed_images.push(tag.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        if let Some(message) = &self.behavior.create_error {
            return Err(RuntimeError::ContainerError(message.clone()));
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state();
        state.specs.push(spec.clone());
        state
            .live
            .insert(id.clone(), (spec.clone(), CancellationToken::new()));
        Ok(id)
    }

    async fn start_container(&self, _container_id: &str) -> Result<()> {
        match &self.behavior.start_error {
            Some(message) => Err(RuntimeError::ContainerError(message.clone())),
            None => Ok(()),
        }
    }

    async fn stream_output(&self, container_id: &str) -> Result<OutputStream> {
        let token = self
            .token(container_id)
            .ok_or_else(|| RuntimeError::ContainerError(format!("no such container {}", container_id)))?;
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        for (stream, data) in [
            (StreamType::Stdout, &self.behavior.stdout),
            (StreamType::Stderr, &self.behavior.stderr),
        ] {
            if !data.is_empty() {
                let _ = tx.send(OutputChunk {
                    timestamp: chrono::Utc::now(),
                    stream,
                    data: data.clone(),
                });
            }
        }

        // The stream stays open while the process "runs"
        let run_for = self.behavior.run_for;
        let linger = self.behavior.output_linger;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(run_for) => {}
            }
            tokio::time::sleep(linger).await;
            drop(tx);
        });

        Ok(OutputStream { receiver: rx })
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64> {
        let token = self
            .token(container_id)
            .ok_or_else(|| RuntimeError::ContainerError(format!("no such container {}", container_id)))?;
        tokio::select! {
            _ = token.cancelled() => Ok(137),
            _ = tokio::time::sleep(self.behavior.run_for) => Ok(self.behavior.exit_code),
        }
    }

    async fn kill_container(&self, container_id: &str) -> Result<()> {
        if let Some(token) = self.token(container_id) {
            token.cancel();
        }
        self.state().killed.push(container_id.to_string());
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state();
        if let Some((_, token)) = state.live.remove(container_id) {
            token.cancel();
        }
        state.removed_containers.push(container_id.to_string());
        Ok(())
    }

    async fn list_containers(&self, label: &str, value: &str) -> Result<Vec<ManagedContainer>> {
        let state = self.state();
        Ok(state
            .live
            .iter()
            .filter(|(_, (spec, _))| spec.labels.get(label).map(String::as_str) == Some(value))
            .map(|(id, (spec, _))| ManagedContainer {
                id: id.clone(),
                name: spec.name.clone(),
                state: "running".to_string(),
                labels: spec.labels.clone(),
            })
            .collect())
    }
}
