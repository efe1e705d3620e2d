//! Daemon and per-workspace queue configuration.
//!
//! The queue configuration is the only scheduler state that survives a
//! restart. It lives at `.steward/queue.toml` under each workspace root and
//! is parsed strictly: unknown fields are rejected rather than ignored, so a
//! typo'd limit never silently falls back to a default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const STEWARD_DIR: &str = ".steward";
const QUEUE_FILE: &str = "queue.toml";

const DEFAULT_READY_LIMIT: usize = 3;
const DEFAULT_EXECUTING_LIMIT: usize = 1;
const DEFAULT_LEASE_TTL_MS: i64 = 45_000;
const DEFAULT_FAST_FAIL_GRACE_MS: i64 = 120_000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: i64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid queue config: {field} {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

// ─── QueueConfig ─────────────────────────────────────────────────────────────

/// Per-workspace scheduler configuration (`.steward/queue.toml`).
///
/// WIP limits bound how many tasks may sit in `ready` and how many live
/// executions may run at once; the automation toggles gate the two promotion
/// steps independently; the timing knobs are deliberately short relative to
/// legitimate execution durations.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Whether the scheduler runs at all. Persisted by `start()`/`stop()`.
    pub enabled: bool,
    /// Maximum tasks in the `ready` column (bounds backlog promotion).
    pub ready_limit: usize,
    /// Maximum concurrent live executions.
    pub executing_limit: usize,
    /// Automatically promote planned backlog tasks into `ready`.
    pub backlog_to_ready: bool,
    /// Automatically hand ready tasks to the agent.
    pub ready_to_executing: bool,
    /// Lease freshness window (milliseconds).
    pub lease_ttl_ms: i64,
    /// Orphans younger than this are fast failures, returned to `ready`
    /// instead of resumed.
    pub fast_fail_grace_ms: i64,
    /// Lease renewal period for live sessions (milliseconds).
    pub heartbeat_interval_ms: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ready_limit: DEFAULT_READY_LIMIT,
            executing_limit: DEFAULT_EXECUTING_LIMIT,
            backlog_to_ready: false,
            ready_to_executing: true,
            lease_ttl_ms: DEFAULT_LEASE_TTL_MS,
            fast_fail_grace_ms: DEFAULT_FAST_FAIL_GRACE_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }
}

impl QueueConfig {
    pub fn path_for(workspace_root: &Path) -> PathBuf {
        workspace_root.join(STEWARD_DIR).join(QUEUE_FILE)
    }

    /// Load the workspace's queue config, falling back to defaults when the
    /// file does not exist. Parse and validation errors are real errors —
    /// a malformed config must be fixed, not papered over.
    pub fn load(workspace_root: &Path) -> Result<Self, ConfigError> {
        let path = Self::path_for(workspace_root);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: QueueConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, workspace_root: &Path) -> Result<(), ConfigError> {
        let path = Self::path_for(workspace_root);
        let dir = path.parent().expect("queue config has a parent directory");
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })?;
        let content = toml::to_string_pretty(self).expect("queue config serializes");
        std::fs::write(&path, content).map_err(|source| ConfigError::Write { path, source })?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ready_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "ready_limit",
                reason: "must be at least 1",
            });
        }
        if self.executing_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "executing_limit",
                reason: "must be at least 1",
            });
        }
        if self.lease_ttl_ms <= 0 {
            return Err(ConfigError::Invalid {
                field: "lease_ttl_ms",
                reason: "must be positive",
            });
        }
        if self.fast_fail_grace_ms < 0 {
            return Err(ConfigError::Invalid {
                field: "fast_fail_grace_ms",
                reason: "must not be negative",
            });
        }
        if self.heartbeat_interval_ms <= 0 {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval_ms",
                reason: "must be positive",
            });
        }
        Ok(())
    }
}

// ─── Daemon settings ─────────────────────────────────────────────────────────

/// Process-level settings assembled from CLI flags and environment in main.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Where the daemon keeps its own files (logs). Defaults to
    /// `~/.steward`.
    pub data_dir: PathBuf,
    /// Workspace roots to schedule.
    pub workspaces: Vec<PathBuf>,
    /// Env-filter log directive, e.g. `"info"` or `"info,steward=debug"`.
    pub log: String,
}

impl DaemonConfig {
    pub fn new(data_dir: Option<PathBuf>, workspaces: Vec<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(|| {
            dirs_home()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".steward")
        });
        Self {
            data_dir,
            workspaces,
            log: log.unwrap_or_else(|| "info".to_string()),
        }
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
