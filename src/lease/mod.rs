//! Execution lease store.
//!
//! A lease is the heartbeat record proving that a task's execution is
//! actively owned by a live process. It is the sole signal distinguishing
//! "a live owner exists elsewhere" from "the owning process died": a task in
//! `executing` with no live in-process session and no fresh lease is an
//! orphan and gets recovered.
//!
//! Leases for one workspace live in a single `.steward/leases.json` map,
//! rewritten whole on each mutation. Renewal happens only from the process
//! currently executing the task (the session heartbeat); the queue manager's
//! orphan check and the startup recovery sweep only read.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

use crate::tasks::now_ms;

const STEWARD_DIR: &str = ".steward";
const LEASES_FILE: &str = "leases.json";

// ─── Lease record ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    #[default]
    Active,
    /// An explicit stop was requested; the lease is about to be cleared.
    Stopping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLease {
    pub task_id: String,
    /// Identity of the owning process (stable for one daemon run).
    pub owner_id: String,
    /// Epoch milliseconds of the first renewal.
    pub started_at: i64,
    /// Epoch milliseconds of the latest heartbeat.
    pub last_heartbeat_at: i64,
    #[serde(default)]
    pub status: LeaseStatus,
}

/// A lease is fresh iff it exists, carries a plausible heartbeat timestamp,
/// and that heartbeat is younger than the TTL. A missing lease is never
/// fresh.
pub fn is_fresh(lease: Option<&ExecutionLease>, now_ms: i64, ttl_ms: i64) -> bool {
    match lease {
        None => false,
        Some(l) if l.last_heartbeat_at <= 0 => false,
        Some(l) => now_ms - l.last_heartbeat_at < ttl_ms,
    }
}

// ─── Stale classification ────────────────────────────────────────────────────

/// Why a lease failed the freshness check. Rendered into audit reasons and
/// recovery notifications, so the wording stays machine-stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StaleReason {
    /// No lease record exists for the task at all.
    NoLease,
    /// A record exists but its heartbeat timestamp is unusable.
    InvalidHeartbeat { owner_id: String },
    /// The heartbeat is older than the TTL.
    HeartbeatExpired { owner_id: String, age_ms: i64 },
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleReason::NoLease => write!(f, "no lease metadata"),
            StaleReason::InvalidHeartbeat { owner_id } => {
                write!(f, "invalid heartbeat timestamp (owner {owner_id})")
            }
            StaleReason::HeartbeatExpired { owner_id, age_ms } => {
                write!(f, "lease heartbeat expired (owner {owner_id}, age {age_ms}ms)")
            }
        }
    }
}

/// Classify a lease against the freshness guard. `None` means the lease is
/// fresh and the execution must be left alone.
pub fn stale_reason(
    lease: Option<&ExecutionLease>,
    now_ms: i64,
    ttl_ms: i64,
) -> Option<StaleReason> {
    match lease {
        None => Some(StaleReason::NoLease),
        Some(l) if l.last_heartbeat_at <= 0 => Some(StaleReason::InvalidHeartbeat {
            owner_id: l.owner_id.clone(),
        }),
        Some(l) => {
            let age = now_ms - l.last_heartbeat_at;
            if age < ttl_ms {
                None
            } else {
                Some(StaleReason::HeartbeatExpired {
                    owner_id: l.owner_id.clone(),
                    age_ms: age,
                })
            }
        }
    }
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// File-backed lease map for one workspace.
pub struct LeaseStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process. Cross-process
    /// writers are excluded by the ownership rule, not by locking.
    write_lock: Mutex<()>,
}

impl LeaseStore {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            path: workspace_root.as_ref().join(STEWARD_DIR).join(LEASES_FILE),
            write_lock: Mutex::new(()),
        }
    }

    /// Bulk-read the lease map. A missing or corrupt file loads as empty —
    /// an unreadable lease is indistinguishable from a dead owner, and the
    /// recovery guard treats both the same way.
    pub fn load(&self) -> HashMap<String, ExecutionLease> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %self.path.display(), err = %e, "corrupt lease file — treating as empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        }
    }

    pub fn get(&self, task_id: &str) -> Option<ExecutionLease> {
        self.load().get(task_id).cloned()
    }

    /// Create the lease on first call (recording `started_at`), otherwise
    /// bump `last_heartbeat_at` to now.
    pub async fn renew(&self, task_id: &str, owner_id: &str) -> Result<ExecutionLease> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.load();
        let now = now_ms();
        let lease = map
            .entry(task_id.to_string())
            .and_modify(|l| l.last_heartbeat_at = now)
            .or_insert_with(|| ExecutionLease {
                task_id: task_id.to_string(),
                owner_id: owner_id.to_string(),
                started_at: now,
                last_heartbeat_at: now,
                status: LeaseStatus::Active,
            })
            .clone();
        self.write(&map)?;
        Ok(lease)
    }

    /// Flag an explicit stop before the session is torn down.
    pub async fn mark_stopping(&self, task_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.load();
        if let Some(l) = map.get_mut(task_id) {
            l.status = LeaseStatus::Stopping;
            self.write(&map)?;
        }
        Ok(())
    }

    /// Remove the lease on terminal completion or explicit stop.
    pub async fn clear(&self, task_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.load();
        if map.remove(task_id).is_some() {
            self.write(&map)?;
        }
        Ok(())
    }

    fn write(&self, map: &HashMap<String, ExecutionLease>) -> Result<()> {
        let dir = self.path.parent().expect("lease file has a parent directory");
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let json = serde_json::to_string_pretty(map).context("failed to serialize leases")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}
