//! Agent session boundary.
//!
//! The scheduler does not know how to talk to a model; it hands a task to an
//! [`AgentSessionDriver`] and awaits the outcome. Everything a session needs
//! travels in a [`SessionContext`] constructed at hand-off time and dropped
//! at completion — there is no process-wide callback registry to collide in.
//!
//! The [`SessionRegistry`] is the in-memory map of live executions; its
//! entries are what "a live session exists" means everywhere in the
//! scheduler. A lease on disk plus an entry here are two independent proofs
//! of ownership; the registry is authoritative within this process, the
//! lease across processes.

pub mod command;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::lease::LeaseStore;
use crate::tasks::{now_ms, Task};

// ─── Hand-off types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkspaceContext {
    pub root: PathBuf,
    pub name: String,
}

impl WorkspaceContext {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());
        Self { root, name }
    }
}

/// Everything one session invocation needs, scoped to that invocation.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Unique per hand-off; completion bookkeeping is keyed on it so a
    /// replaced or stopped session can never report for its successor.
    pub session_id: String,
    pub task: Task,
    pub workspace: WorkspaceContext,
    /// The capability directive injected into every agent turn.
    pub directive: String,
}

/// The consumed collaborator: runs one agent session for one task.
///
/// The returned future must resolve exactly once, with `Ok(success)` when the
/// session ran and reported an outcome, or `Err` when it could not run. A
/// future that never resolves stalls the task for this process lifetime —
/// that is an operational concern, deliberately not auto-recovered here.
#[async_trait]
pub trait AgentSessionDriver: Send + Sync {
    async fn execute(&self, ctx: SessionContext) -> anyhow::Result<bool>;
}

// ─── Live-session registry ───────────────────────────────────────────────────

pub struct SessionHandle {
    pub session_id: String,
    pub owner_id: String,
    pub started_at_ms: i64,
    join: Option<JoinHandle<()>>,
}

/// In-memory map of task id → live session handle for one workspace.
#[derive(Default)]
pub struct SessionRegistry {
    handles: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a session before its worker task is spawned, so a completion
    /// racing the spawn can never observe a missing entry. Registering over
    /// an existing entry for the same task replaces it (single-owner,
    /// explicit replace policy).
    pub async fn begin(&self, task_id: &str, session_id: &str, owner_id: &str) {
        let mut handles = self.handles.write().await;
        if let Some(old) = handles.insert(
            task_id.to_string(),
            SessionHandle {
                session_id: session_id.to_string(),
                owner_id: owner_id.to_string(),
                started_at_ms: now_ms(),
                join: None,
            },
        ) {
            if let Some(join) = old.join {
                warn!(task_id, old_session = %old.session_id, "replacing live session registration");
                join.abort();
            }
        }
    }

    /// Attach the spawned worker's join handle. A no-op if the session
    /// already finished (or was replaced) between spawn and attach.
    pub async fn attach(&self, task_id: &str, session_id: &str, join: JoinHandle<()>) {
        let mut handles = self.handles.write().await;
        match handles.get_mut(task_id) {
            Some(h) if h.session_id == session_id => h.join = Some(join),
            _ => join.abort(),
        }
    }

    /// Deregister on completion. Returns `false` when the entry was already
    /// gone or belongs to a different session — the caller's completion is
    /// then a late callback and must not mutate queue state.
    pub async fn finish(&self, task_id: &str, session_id: &str) -> bool {
        let mut handles = self.handles.write().await;
        match handles.get(task_id) {
            Some(h) if h.session_id == session_id => {
                handles.remove(task_id);
                true
            }
            _ => false,
        }
    }

    /// Forcibly stop a live session. Returns `true` when something was
    /// aborted. After `stop`, the aborted worker can never run its
    /// completion path.
    pub async fn stop(&self, task_id: &str) -> bool {
        let mut handles = self.handles.write().await;
        match handles.remove(task_id) {
            Some(handle) => {
                if let Some(join) = handle.join {
                    join.abort();
                }
                true
            }
            None => false,
        }
    }

    pub async fn is_live(&self, task_id: &str) -> bool {
        self.handles.read().await.contains_key(task_id)
    }

    pub async fn live_count(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn live_task_ids(&self) -> HashSet<String> {
        self.handles.read().await.keys().cloned().collect()
    }
}

// ─── Lease heartbeat ─────────────────────────────────────────────────────────

/// Renews a task's lease on a fixed interval while the owning session runs.
/// Dropping the guard stops the heartbeat; the lease itself is cleared by
/// the queue manager's completion/stop paths, not here.
pub struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl HeartbeatGuard {
    pub fn spawn(
        leases: Arc<LeaseStore>,
        task_id: String,
        owner_id: String,
        interval_ms: i64,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let period = std::time::Duration::from_millis(interval_ms.max(1) as u64);
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately, creating the lease and
            // stamping its started_at.
            loop {
                interval.tick().await;
                if let Err(e) = leases.renew(&task_id, &owner_id).await {
                    warn!(task_id = %task_id, err = %e, "lease heartbeat failed");
                }
            }
        });
        Self { handle }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
