// ABOUTME: Security policy for job containers and its validation
// ABOUTME: A policy must validate before any image or container is created

use crate::{Result, SandboxError};
use reprobox_config::EngineConfig;
use tracing::warn;

/// Smallest memory ceiling Docker accepts for a container
const MIN_MEMORY_BYTES: i64 = 6 * 1024 * 1024;

/// Security and resource settings requested for job containers
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxPolicy {
    pub user: Option<String>,
    pub uid: Option<u32>,
    pub cpu_limit: f64,
    pub memory_limit: Option<String>,
    pub pids_limit: i64,
    pub network_mode: String,
    pub allowed_domains: Vec<String>,
    pub readonly_rootfs: bool,
}

/// A policy that passed validation, with limits in runtime units
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPolicy {
    pub user: String,
    pub uid: u32,
    pub nano_cpus: i64,
    pub memory_bytes: i64,
    pub pids_limit: i64,
    pub network_mode: String,
    pub allowed_domains: Vec<String>,
}

impl SandboxPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            user: config.container_user.clone(),
            uid: config.container_uid,
            cpu_limit: config.cpu_limit,
            memory_limit: config.memory_limit.clone(),
            pids_limit: config.pids_limit,
            network_mode: config.network_mode.clone(),
            allowed_domains: config.allowed_domains.clone(),
            readonly_rootfs: true,
        }
    }

    /// Check every setting. Nothing here touches the container runtime.
    pub fn validate(&self) -> Result<ValidatedPolicy> {
        let user = self
            .user
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| reject("a non-root container user is required"))?;

        let (name, group) = match user.split_once(':') {
            Some((name, group)) => (name, Some(group)),
            None => (user, None),
        };
        if is_root_identity(name) {
            return Err(reject("containers must not run as root"));
        }
        if group.is_some_and(is_root_identity) {
            return Err(reject("containers must not run in the root group"));
        }

        let uid = self
            .uid
            .ok_or_else(|| reject("a container uid is required"))?;
        if uid == 0 {
            return Err(reject("container uid 0 is root"));
        }

        if !self.cpu_limit.is_finite() || self.cpu_limit <= 0.0 {
            return Err(reject(format!(
                "cpu limit must be a positive number, got {}",
                self.cpu_limit
            )));
        }

        let raw_memory = self
            .memory_limit
            .as_deref()
            .ok_or_else(|| reject("a memory limit is required"))?;
        let memory_bytes = parse_memory_limit(raw_memory)
            .ok_or_else(|| reject(format!("unparsable memory limit {:?}", raw_memory)))?;
        if memory_bytes < MIN_MEMORY_BYTES {
            return Err(reject(format!(
                "memory limit {} is below the 6m minimum",
                raw_memory
            )));
        }

        if self.pids_limit <= 0 {
            return Err(reject(format!(
                "pids limit must be positive, got {}",
                self.pids_limit
            )));
        }

        match self.network_mode.as_str() {
            "none" => {}
            "bridge" if !self.allowed_domains.is_empty() => {}
            "bridge" => {
                return Err(reject(
                    "bridge networking requires a non-empty domain allowlist",
                ))
            }
            other => {
                return Err(reject(format!("unsupported network mode {:?}", other)));
            }
        }

        if !self.readonly_rootfs {
            return Err(reject("the container root filesystem must be read-only"));
        }

        Ok(ValidatedPolicy {
            user: user.to_string(),
            uid,
            nano_cpus: (self.cpu_limit * 1_000_000_000.0).round() as i64,
            memory_bytes,
            pids_limit: self.pids_limit,
            network_mode: self.network_mode.clone(),
            allowed_domains: self.allowed_domains.clone(),
        })
    }
}

/// Docker reads an all-digit name as a numeric id, so `00` is uid 0
fn is_root_identity(part: &str) -> bool {
    let part = part.trim();
    if part == "root" {
        return true;
    }
    if !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) {
        return part.parse::<u32>().map_or(true, |id| id == 0);
    }
    false
}

fn reject(reason: impl Into<String>) -> SandboxError {
    let reason = reason.into();
    warn!("Rejected sandbox policy: {}", reason);
    SandboxError::SecurityConfig(reason)
}

/// Parse `512m`, `4g`, `4GB`, `1048576` and friends into bytes
pub fn parse_memory_limit(raw: &str) -> Option<i64> {
    let lower = raw.trim().to_ascii_lowercase();
    let trimmed = lower.strip_suffix('b').unwrap_or(&lower);

    let (digits, multiplier) = match trimmed.chars().last()? {
        'k' => (&trimmed[..trimmed.len() - 1], 1024_i64),
        'm' => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        'g' => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        't' => (&trimmed[..trimmed.len() - 1], 1024_i64.pow(4)),
        _ => (trimmed, 1),
    };

    let value: i64 = digits.trim().parse().ok()?;
    if value <= 0 {
        return None;
    }
    value.checked_mul(multiplier)
}
