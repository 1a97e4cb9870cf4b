// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Reprobox

// Persistence
pub const REPROBOX_DATABASE_URL: &str = "REPROBOX_DATABASE_URL";

// Filesystem Layout
pub const REPROBOX_WORKSPACE_ROOT: &str = "REPROBOX_WORKSPACE_ROOT";
pub const REPROBOX_ARTIFACTS_ROOT: &str = "REPROBOX_ARTIFACTS_ROOT";

// Repository Sources
pub const REPROBOX_ALLOW_LOCAL_SOURCES: &str = "REPROBOX_ALLOW_LOCAL_SOURCES";

// Stage Timeouts
pub const REPROBOX_EXECUTION_TIMEOUT_SECS: &str = "REPROBOX_EXECUTION_TIMEOUT_SECS";
pub const REPROBOX_FETCH_TIMEOUT_SECS: &str = "REPROBOX_FETCH_TIMEOUT_SECS";
pub const REPROBOX_BUILD_TIMEOUT_SECS: &str = "REPROBOX_BUILD_TIMEOUT_SECS";

// Sandbox Resource Limits
pub const REPROBOX_CPU_LIMIT: &str = "REPROBOX_CPU_LIMIT";
pub const REPROBOX_MEMORY_LIMIT: &str = "REPROBOX_MEMORY_LIMIT";
pub const REPROBOX_PIDS_LIMIT: &str = "REPROBOX_PIDS_LIMIT";

// Sandbox Network Policy
pub const REPROBOX_NETWORK_MODE: &str = "REPROBOX_NETWORK_MODE";
pub const REPROBOX_ALLOWED_DOMAINS: &str = "REPROBOX_ALLOWED_DOMAINS";

// Sandbox Identity
pub const REPROBOX_CONTAINER_USER: &str = "REPROBOX_CONTAINER_USER";
pub const REPROBOX_CONTAINER_UID: &str = "REPROBOX_CONTAINER_UID";

// Log Previews
pub const REPROBOX_MAX_LOG_PREVIEW_BYTES: &str = "REPROBOX_MAX_LOG_PREVIEW_BYTES";

// Worker Pool
pub const REPROBOX_WORKER_COUNT: &str = "REPROBOX_WORKER_COUNT";
pub const REPROBOX_POLL_INTERVAL_MS: &str = "REPROBOX_POLL_INTERVAL_MS";
pub const REPROBOX_CANCEL_POLL_INTERVAL_MS: &str = "REPROBOX_CANCEL_POLL_INTERVAL_MS";
pub const REPROBOX_STUCK_GRACE_SECS: &str = "REPROBOX_STUCK_GRACE_SECS";

// Image Defaults
pub const REPROBOX_DEFAULT_BASE_IMAGE: &str = "REPROBOX_DEFAULT_BASE_IMAGE";
pub const REPROBOX_DEFAULT_COMMAND: &str = "REPROBOX_DEFAULT_COMMAND";

// Logging
pub const REPROBOX_LOG_FORMAT: &str = "REPROBOX_LOG_FORMAT";
pub const RUST_LOG: &str = "RUST_LOG";
