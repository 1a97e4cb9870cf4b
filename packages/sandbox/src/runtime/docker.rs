// ABOUTME: Docker runtime implementation backed by the bollard client
// ABOUTME: Builds job images and runs hardened, labelled, resource-limited containers

use super::{
    BuildOutput, BuildSpec, ContainerRuntime, ContainerSpec, ManagedContainer, OutputChunk,
    OutputStream, Result, RuntimeError, StreamType,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
        LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
    },
    errors::Error as BollardError,
    image::{BuildImageOptions, RemoveImageOptions},
    models::{HostConfig, RestartPolicy, RestartPolicyNameEnum},
    Docker,
};
use futures::StreamExt;
use reprobox_core::LABEL_PREFIX;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

pub struct DockerRuntime {
    client: Docker,
    label_prefix: String,
}

impl DockerRuntime {
    /// Connect using DOCKER_HOST or the platform default socket
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::ConnectionError(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            label_prefix: LABEL_PREFIX.to_string(),
        }
    }

    /// Convert our spec to bollard config
    fn to_bollard_config(&self, spec: &ContainerSpec) -> Config<String> {
        let mut labels = spec.labels.clone();
        labels.insert(format!("{}.managed", self.label_prefix), "true".to_string());
        labels.insert(format!("{}.name", self.label_prefix), spec.name.clone());

        let binds: Vec<String> = spec
            .volumes
            .iter()
            .map(|v| {
                format!(
                    "{}:{}:{}",
                    v.host_path,
                    v.container_path,
                    if v.readonly { "ro" } else { "rw" }
                )
            })
            .collect();

        let mut env: Vec<String> = spec
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();

        let host_config = HostConfig {
            binds: Some(binds),
            tmpfs: if spec.tmpfs.is_empty() {
                None
            } else {
                Some(spec.tmpfs.clone())
            },
            nano_cpus: Some(spec.nano_cpus),
            memory: Some(spec.memory_bytes),
            // Equal to memory: no swap on top of the ceiling
            memory_swap: Some(spec.memory_bytes),
            pids_limit: Some(spec.pids_limit),
            network_mode: Some(spec.network_mode.clone()),
            readonly_rootfs: Some(spec.readonly_rootfs),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            privileged: Some(false),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            user: Some(spec.user.clone()),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(labels),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(spec.network_mode == "none"),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

fn is_status(err: &BollardError, codes: &[u16]) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError { status_code, .. } if codes.contains(status_code)
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn is_available(&self) -> bool {
        match self.client.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Docker not available: {}", e);
                false
            }
        }
    }

    async fn build_image(&self, spec: BuildSpec) -> Result<BuildOutput> {
        info!(
            "Building image {} ({} byte context)",
            spec.tag,
            spec.context.len()
        );

        let options = BuildImageOptions {
            dockerfile: spec.dockerfile.clone(),
            t: spec.tag.clone(),
            rm: true,
            forcerm: true,
            labels: spec.labels.clone(),
            ..Default::default()
        };

        let mut stream = self
            .client
            .build_image(options, None, Some(spec.context.into()));
        let mut lines = Vec::new();

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(text) = info.stream {
                        for line in text.lines().filter(|l| !l.trim().is_empty()) {
                            debug!("[build {}] {}", spec.tag, line);
                            lines.push(line.to_string());
                        }
                    }
                    if let Some(message) = info.error {
                        return Err(RuntimeError::BuildFailed {
                            message,
                            output: lines,
                        });
                    }
                }
                Err(e) => {
                    return Err(RuntimeError::BuildFailed {
                        message: e.to_string(),
                        output: lines,
                    });
                }
            }
        }

        info!("Built image {}", spec.tag);
        Ok(BuildOutput { lines })
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        info!("Removing image: {}", tag);

        let options = RemoveImageOptions {
            force: true,
            noprune: false,
        };

        match self.client.remove_image(tag, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, &[404]) => {
                debug!("Image {} already removed", tag);
                Ok(())
            }
            Err(e) => Err(RuntimeError::ImageError(e.to_string())),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        info!("Creating container: {}", spec.name);

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), self.to_bollard_config(spec))
            .await
            .map_err(|e| RuntimeError::ContainerError(e.to_string()))?;

        for warning in &container.warnings {
            warn!("Container {} warning: {}", container.id, warning);
        }
        debug!("Created container: {}", container.id);

        Ok(container.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        info!("Starting container: {}", container_id);

        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::ContainerError(e.to_string()))?;

        Ok(())
    }

    async fn stream_output(&self, container_id: &str) -> Result<OutputStream> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        };

        let logs = self.client.logs(container_id, Some(options));

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut stream = Box::pin(logs);
            while let Some(result) = stream.next().await {
                match result {
                    Ok(log) => {
                        let (stream_type, data) = match log {
                            LogOutput::StdOut { message } => (StreamType::Stdout, message.to_vec()),
                            LogOutput::StdErr { message } => (StreamType::Stderr, message.to_vec()),
                            LogOutput::Console { message } => {
                                (StreamType::Stdout, message.to_vec())
                            }
                            _ => continue,
                        };

                        let chunk = OutputChunk {
                            timestamp: chrono::Utc::now(),
                            stream: stream_type,
                            data,
                        };

                        if tx.send(chunk).is_err() {
                            break; // Receiver dropped
                        }
                    }
                    Err(e) => {
                        error!("Error streaming logs: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(OutputStream { receiver: rx })
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.client.wait_container(container_id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(RuntimeError::ContainerError(e.to_string())),
            None => Err(RuntimeError::ContainerError(format!(
                "wait stream for {} ended without a status",
                container_id
            ))),
        }
    }

    async fn kill_container(&self, container_id: &str) -> Result<()> {
        info!("Killing container: {}", container_id);

        let options = KillContainerOptions { signal: "SIGKILL" };

        match self.client.kill_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // 404: gone, 409: not running
            Err(e) if is_status(&e, &[404, 409]) => Ok(()),
            Err(e) => Err(RuntimeError::ContainerError(e.to_string())),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        info!("Removing container: {}", container_id);

        let options = RemoveContainerOptions {
            force: true,
            v: true, // Remove volumes
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, &[404]) => {
                debug!("Container {} already removed", container_id);
                Ok(())
            }
            Err(e) => Err(RuntimeError::ContainerError(e.to_string())),
        }
    }

    async fn list_containers(&self, label: &str, value: &str) -> Result<Vec<ManagedContainer>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}={}", label, value)]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::ContainerError(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                Some(ManagedContainer {
                    name: c
                        .names
                        .and_then(|names| names.into_iter().next())
                        .unwrap_or_else(|| id.clone())
                        .trim_start_matches('/')
                        .to_string(),
                    id,
                    state: c.state.unwrap_or_default(),
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::VolumeMount;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            image: "reprobox-job-abc:latest".to_string(),
            name: "reprobox-run-abc".to_string(),
            command: vec!["/bin/sh".into(), "-c".into(), "python main.py".into()],
            user: "reprobox".to_string(),
            working_dir: "/workspace".to_string(),
            env_vars: HashMap::from([("REPROBOX_JOB_ID".to_string(), "abc".to_string())]),
            volumes: vec![
                VolumeMount {
                    host_path: "/tmp/repo".to_string(),
                    container_path: "/workspace".to_string(),
                    readonly: true,
                },
                VolumeMount {
                    host_path: "/tmp/out".to_string(),
                    container_path: "/artifacts".to_string(),
                    readonly: false,
                },
            ],
            tmpfs: HashMap::new(),
            labels: HashMap::new(),
            nano_cpus: 2_000_000_000,
            memory_bytes: 4 * 1024 * 1024 * 1024,
            pids_limit: 256,
            network_mode: "none".to_string(),
            readonly_rootfs: true,
        }
    }

    #[test]
    fn test_container_config_is_hardened() {
        // connect_with_defaults only builds a client; no daemon round trip
        let Ok(client) = Docker::connect_with_defaults() else {
            return;
        };
        let runtime = DockerRuntime::with_client(client);
        let config = runtime.to_bollard_config(&spec());

        let host = config.host_config.unwrap();
        assert_eq!(
            host.binds.unwrap(),
            vec!["/tmp/repo:/workspace:ro", "/tmp/out:/artifacts:rw"]
        );
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.privileged, Some(false));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.memory, host.memory_swap);
        assert_eq!(config.user.as_deref(), Some("reprobox"));
        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(
            config.labels.unwrap().get("reprobox.managed").map(String::as_str),
            Some("true")
        );
    }

    #[tokio::test]
    #[ignore] // Requires Docker daemon
    async fn test_docker_runtime_round_trip() {
        let runtime = DockerRuntime::new().unwrap();
        assert!(runtime.is_available().await);
        let containers = runtime
            .list_containers("reprobox.managed", "true")
            .await
            .unwrap();
        for c in containers {
            assert!(c.labels.contains_key("reprobox.managed"));
        }
    }
}
