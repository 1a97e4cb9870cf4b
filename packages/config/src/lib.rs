// ABOUTME: Engine configuration loaded once at process start
// ABOUTME: Typed settings for storage paths, timeouts, sandbox limits and the worker pool

pub mod constants;

use constants::*;
use reprobox_core::{reprobox_dir, DEFAULT_COMMAND};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{var} must be at least {min}, got {value}")]
    BelowMinimum {
        var: &'static str,
        min: u64,
        value: u64,
    },
}

type Result<T> = std::result::Result<T, ConfigError>;

pub const DEFAULT_BASE_IMAGE: &str = "python:3.11-slim";
pub const DEFAULT_MEMORY_LIMIT: &str = "4g";
pub const DEFAULT_NETWORK_MODE: &str = "none";
pub const DEFAULT_CONTAINER_USER: &str = "reprobox";
pub const DEFAULT_CONTAINER_UID: u32 = 1000;
pub const DEFAULT_MAX_LOG_PREVIEW_BYTES: usize = 1_000_000;
const MIN_LOG_PREVIEW_BYTES: u64 = 1024;

/// All tunables of the engine. Built once and shared by reference.
///
/// Sandbox identity and resource values are loaded as-is. They are
/// validated by the executor right before a container is created so a bad
/// value fails the job with a security error instead of refusing to boot.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub workspace_root: PathBuf,
    pub artifacts_root: PathBuf,
    /// Accept `file://` repository URLs. Off by default.
    pub allow_local_sources: bool,

    pub default_timeout: Duration,
    pub fetch_timeout: Duration,
    pub build_timeout: Duration,

    pub cpu_limit: f64,
    pub memory_limit: Option<String>,
    pub pids_limit: i64,
    pub network_mode: String,
    pub allowed_domains: Vec<String>,
    pub container_user: Option<String>,
    pub container_uid: Option<u32>,

    pub max_log_preview_bytes: usize,

    pub worker_count: usize,
    pub poll_interval: Duration,
    pub cancel_poll_interval: Duration,
    pub stuck_grace_period: Duration,

    pub default_base_image: String,
    pub default_command: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let default_timeout = Duration::from_secs(1800);
        let fetch_timeout = Duration::from_secs(300);
        let build_timeout = Duration::from_secs(1800);

        Self {
            database_url: format!(
                "sqlite://{}",
                reprobox_dir().join("reprobox.db").display()
            ),
            workspace_root: env::temp_dir().join("reprobox").join("repos"),
            artifacts_root: reprobox_dir().join("artifacts"),
            allow_local_sources: false,
            default_timeout,
            fetch_timeout,
            build_timeout,
            cpu_limit: 2.0,
            memory_limit: Some(DEFAULT_MEMORY_LIMIT.to_string()),
            pids_limit: 512,
            network_mode: DEFAULT_NETWORK_MODE.to_string(),
            allowed_domains: Vec::new(),
            container_user: Some(DEFAULT_CONTAINER_USER.to_string()),
            container_uid: Some(DEFAULT_CONTAINER_UID),
            max_log_preview_bytes: DEFAULT_MAX_LOG_PREVIEW_BYTES,
            worker_count: 2,
            poll_interval: Duration::from_secs(2),
            cancel_poll_interval: Duration::from_secs(1),
            stuck_grace_period: default_grace(default_timeout, fetch_timeout, build_timeout),
            default_base_image: DEFAULT_BASE_IMAGE.to_string(),
            default_command: DEFAULT_COMMAND.to_string(),
        }
    }
}

/// A job running longer than every stage deadline combined plus slack is
/// considered stuck.
fn default_grace(execution: Duration, fetch: Duration, build: Duration) -> Duration {
    execution + fetch + build + Duration::from_secs(300)
}

impl EngineConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup. Unset variables keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());

        let default_timeout = get_secs(&get, REPROBOX_EXECUTION_TIMEOUT_SECS)?
            .unwrap_or(defaults.default_timeout);
        let fetch_timeout =
            get_secs(&get, REPROBOX_FETCH_TIMEOUT_SECS)?.unwrap_or(defaults.fetch_timeout);
        let build_timeout =
            get_secs(&get, REPROBOX_BUILD_TIMEOUT_SECS)?.unwrap_or(defaults.build_timeout);

        let cpu_limit = match get(REPROBOX_CPU_LIMIT) {
            Some(raw) => raw.parse::<f64>().map_err(|e| ConfigError::InvalidValue {
                var: REPROBOX_CPU_LIMIT,
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => defaults.cpu_limit,
        };

        // Explicitly empty means "no ceiling", which the executor refuses
        let memory_limit = match get(REPROBOX_MEMORY_LIMIT) {
            Some(raw) if raw.is_empty() => None,
            Some(raw) => Some(raw),
            None => defaults.memory_limit,
        };

        let container_user = match get(REPROBOX_CONTAINER_USER) {
            Some(raw) if raw.is_empty() => None,
            Some(raw) => Some(raw),
            None => defaults.container_user,
        };

        let container_uid = match get(REPROBOX_CONTAINER_UID) {
            Some(raw) if raw.is_empty() => None,
            Some(raw) => Some(raw.parse::<u32>().map_err(|e| ConfigError::InvalidValue {
                var: REPROBOX_CONTAINER_UID,
                value: raw.clone(),
                reason: e.to_string(),
            })?),
            None => defaults.container_uid,
        };

        let allowed_domains = get(REPROBOX_ALLOWED_DOMAINS)
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.allowed_domains);

        let allow_local_sources =
            get_bool(&get, REPROBOX_ALLOW_LOCAL_SOURCES)?.unwrap_or(defaults.allow_local_sources);

        let max_log_preview_bytes = get_u64(&get, REPROBOX_MAX_LOG_PREVIEW_BYTES)?
            .map(|v| v as usize)
            .unwrap_or(defaults.max_log_preview_bytes);
        if (max_log_preview_bytes as u64) < MIN_LOG_PREVIEW_BYTES {
            return Err(ConfigError::BelowMinimum {
                var: REPROBOX_MAX_LOG_PREVIEW_BYTES,
                min: MIN_LOG_PREVIEW_BYTES,
                value: max_log_preview_bytes as u64,
            });
        }

        let worker_count = get_u64(&get, REPROBOX_WORKER_COUNT)?
            .map(|v| v as usize)
            .unwrap_or(defaults.worker_count);
        if worker_count == 0 {
            return Err(ConfigError::BelowMinimum {
                var: REPROBOX_WORKER_COUNT,
                min: 1,
                value: 0,
            });
        }

        let pids_limit = get_u64(&get, REPROBOX_PIDS_LIMIT)?
            .map(|v| v as i64)
            .unwrap_or(defaults.pids_limit);

        let poll_interval =
            get_millis(&get, REPROBOX_POLL_INTERVAL_MS)?.unwrap_or(defaults.poll_interval);
        let cancel_poll_interval = get_millis(&get, REPROBOX_CANCEL_POLL_INTERVAL_MS)?
            .unwrap_or(defaults.cancel_poll_interval);
        let stuck_grace_period = get_secs(&get, REPROBOX_STUCK_GRACE_SECS)?
            .unwrap_or_else(|| default_grace(default_timeout, fetch_timeout, build_timeout));

        let config = Self {
            database_url: get(REPROBOX_DATABASE_URL)
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.database_url),
            workspace_root: get(REPROBOX_WORKSPACE_ROOT)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            artifacts_root: get(REPROBOX_ARTIFACTS_ROOT)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_root),
            allow_local_sources,
            default_timeout,
            fetch_timeout,
            build_timeout,
            cpu_limit,
            memory_limit,
            pids_limit,
            network_mode: get(REPROBOX_NETWORK_MODE)
                .map(|v| v.to_lowercase())
                .unwrap_or(defaults.network_mode),
            allowed_domains,
            container_user,
            container_uid,
            max_log_preview_bytes,
            worker_count,
            poll_interval,
            cancel_poll_interval,
            stuck_grace_period,
            default_base_image: get(REPROBOX_DEFAULT_BASE_IMAGE)
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.default_base_image),
            default_command: get(REPROBOX_DEFAULT_COMMAND)
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.default_command),
        };

        debug!(
            "Loaded engine config: workers={}, timeout={:?}, network={}",
            config.worker_count, config.default_timeout, config.network_mode
        );

        Ok(config)
    }
}

fn get_u64<G>(get: &G, var: &'static str) -> Result<Option<u64>>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) if !raw.is_empty() => {
            raw.parse::<u64>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    var,
                    value: raw.clone(),
                    reason: e.to_string(),
                })
        }
        _ => Ok(None),
    }
}

fn get_bool<G>(get: &G, var: &'static str) -> Result<Option<bool>>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "" | "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                var,
                value: raw,
                reason: "expected true or false".to_string(),
            }),
        },
        None => Ok(None),
    }
}

fn get_secs<G>(get: &G, var: &'static str) -> Result<Option<Duration>>
where
    G: Fn(&str) -> Option<String>,
{
    match get_u64(get, var)? {
        Some(0) => Err(ConfigError::BelowMinimum {
            var,
            min: 1,
            value: 0,
        }),
        other => Ok(other.map(Duration::from_secs)),
    }
}

fn get_millis<G>(get: &G, var: &'static str) -> Result<Option<Duration>>
where
    G: Fn(&str) -> Option<String>,
{
    match get_u64(get, var)? {
        Some(0) => Err(ConfigError::BelowMinimum {
            var,
            min: 1,
            value: 0,
        }),
        other => Ok(other.map(Duration::from_millis)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.default_timeout, Duration::from_secs(1800));
        assert_eq!(config.cpu_limit, 2.0);
        assert_eq!(config.memory_limit.as_deref(), Some("4g"));
        assert_eq!(config.network_mode, "none");
        assert!(config.allowed_domains.is_empty());
        assert_eq!(config.container_user.as_deref(), Some("reprobox"));
        assert_eq!(config.container_uid, Some(1000));
        assert_eq!(config.max_log_preview_bytes, 1_000_000);
        assert_eq!(config.default_command, "python main.py");
        assert_eq!(config.default_base_image, "python:3.11-slim");
        assert!(config.stuck_grace_period > config.default_timeout);
        assert!(!config.allow_local_sources);
    }

    #[test]
    fn test_local_sources_flag() {
        let config =
            EngineConfig::from_lookup(lookup(&[(REPROBOX_ALLOW_LOCAL_SOURCES, "TRUE")])).unwrap();
        assert!(config.allow_local_sources);

        let config =
            EngineConfig::from_lookup(lookup(&[(REPROBOX_ALLOW_LOCAL_SOURCES, "0")])).unwrap();
        assert!(!config.allow_local_sources);

        let err = EngineConfig::from_lookup(lookup(&[(REPROBOX_ALLOW_LOCAL_SOURCES, "maybe")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: REPROBOX_ALLOW_LOCAL_SOURCES,
                ..
            }
        ));
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = EngineConfig::from_lookup(lookup(&[
            (REPROBOX_EXECUTION_TIMEOUT_SECS, "60"),
            (REPROBOX_CPU_LIMIT, "0.5"),
            (REPROBOX_MEMORY_LIMIT, "512m"),
            (REPROBOX_NETWORK_MODE, "Bridge"),
            (REPROBOX_ALLOWED_DOMAINS, "PyPI.org, files.pythonhosted.org,,"),
            (REPROBOX_WORKER_COUNT, "4"),
            (REPROBOX_POLL_INTERVAL_MS, "250"),
            (REPROBOX_STUCK_GRACE_SECS, "90"),
        ]))
        .unwrap();

        assert_eq!(config.default_timeout, Duration::from_secs(60));
        assert_eq!(config.cpu_limit, 0.5);
        assert_eq!(config.memory_limit.as_deref(), Some("512m"));
        assert_eq!(config.network_mode, "bridge");
        assert_eq!(
            config.allowed_domains,
            vec!["pypi.org".to_string(), "files.pythonhosted.org".to_string()]
        );
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.stuck_grace_period, Duration::from_secs(90));
    }

    #[test]
    fn test_empty_memory_and_user_mean_unset() {
        let config = EngineConfig::from_lookup(lookup(&[
            (REPROBOX_MEMORY_LIMIT, ""),
            (REPROBOX_CONTAINER_USER, " "),
        ]))
        .unwrap();
        assert_eq!(config.memory_limit, None);
        assert_eq!(config.container_user, None);
    }

    #[test]
    fn test_rejects_garbage_numbers() {
        let err = EngineConfig::from_lookup(lookup(&[(REPROBOX_CPU_LIMIT, "lots")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: REPROBOX_CPU_LIMIT,
                ..
            }
        ));

        let err = EngineConfig::from_lookup(lookup(&[(REPROBOX_WORKER_COUNT, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { .. }));

        let err = EngineConfig::from_lookup(lookup(&[(REPROBOX_EXECUTION_TIMEOUT_SECS, "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { .. }));

        let err = EngineConfig::from_lookup(lookup(&[(REPROBOX_MAX_LOG_PREVIEW_BYTES, "10")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { min: 1024, .. }));
    }
}
