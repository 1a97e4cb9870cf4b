// ABOUTME: Owned handles for per-job images and containers
// ABOUTME: Explicit async release, with a best-effort removal on drop as a backstop

use crate::runtime::ContainerRuntime;
use std::sync::Arc;
use tracing::{debug, warn};

/// A container created for one job. Dropping an unreleased handle schedules
/// a forced removal on the current runtime.
pub struct ContainerHandle {
    runtime: Arc<dyn ContainerRuntime>,
    id: Option<String>,
}

impl ContainerHandle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, id: String) -> Self {
        Self {
            runtime,
            id: Some(id),
        }
    }

    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    /// Force-remove the container. Errors are logged, never returned.
    pub async fn release(mut self) {
        if let Some(id) = self.id.take() {
            if let Err(e) = self.runtime.remove_container(&id).await {
                warn!("Failed to remove container {}: {}", id, e);
            }
        }
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Removing container {} from drop", id);
                handle.spawn(async move {
                    if let Err(e) = runtime.remove_container(&id).await {
                        warn!("Failed to remove container {}: {}", id, e);
                    }
                });
            }
            Err(_) => warn!("Container {} leaked: no runtime to remove it", id),
        }
    }
}

/// A per-job image tag
pub struct ImageHandle {
    runtime: Arc<dyn ContainerRuntime>,
    tag: Option<String>,
}

impl ImageHandle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, tag: String) -> Self {
        Self {
            runtime,
            tag: Some(tag),
        }
    }

    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or_default()
    }

    pub async fn release(mut self) {
        if let Some(tag) = self.tag.take() {
            if let Err(e) = self.runtime.remove_image(&tag).await {
                warn!("Failed to remove image {}: {}", tag, e);
            }
        }
    }
}

impl Drop for ImageHandle {
    fn drop(&mut self) {
        let Some(tag) = self.tag.take() else {
            return;
        };
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Removing image {} from drop", tag);
                handle.spawn(async move {
                    if let Err(e) = runtime.remove_image(&tag).await {
                        warn!("Failed to remove image {}: {}", tag, e);
                    }
                });
            }
            Err(_) => warn!("Image {} leaked: no runtime to remove it", tag),
        }
    }
}
