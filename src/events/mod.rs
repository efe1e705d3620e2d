//! Workspace-scoped notification boundary.
//!
//! Every phase change, queue-status change, and recovery event is emitted as
//! a typed, idempotent snapshot. Consumers must tolerate at-least-once and
//! reordered delivery; the payloads carry full state, not deltas.

use serde_json::{json, Value};
use std::path::Path;
use tokio::sync::broadcast;

use crate::lease::StaleReason;
use crate::queue::QueueStatus;
use crate::tasks::{Task, TaskPhase};

/// Broadcasts JSON-RPC notification strings to all subscribed consumers.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Send a JSON-RPC notification to all subscribers.
    fn broadcast(&self, method: &str, params: Value) {
        let notification = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        // Ignore errors — no subscribers is fine.
        let _ = self
            .tx
            .send(serde_json::to_string(&notification).unwrap_or_default());
    }

    // ─── Typed events ────────────────────────────────────────────────────────

    pub fn task_phase_changed(
        &self,
        workspace: &Path,
        task: &Task,
        from: TaskPhase,
        reason: &str,
    ) {
        self.broadcast(
            "task.phaseChanged",
            json!({
                "workspace": workspace.display().to_string(),
                "taskId": task.id,
                "from": from,
                "to": task.phase,
                "reason": reason,
                "updatedAt": task.updated_at,
            }),
        );
    }

    pub fn queue_status_changed(&self, workspace: &Path, status: &QueueStatus) {
        self.broadcast(
            "queue.statusChanged",
            json!({
                "workspace": workspace.display().to_string(),
                "status": status,
            }),
        );
    }

    pub fn execution_recovered(&self, workspace: &Path, task_id: &str, reason: &StaleReason) {
        self.broadcast(
            "queue.executionRecovered",
            json!({
                "workspace": workspace.display().to_string(),
                "taskId": task_id,
                "staleReason": reason,
                "detail": reason.to_string(),
            }),
        );
    }

    pub fn task_removed(&self, workspace: &Path, task_id: &str) {
        self.broadcast(
            "task.removed",
            json!({
                "workspace": workspace.display().to_string(),
                "taskId": task_id,
            }),
        );
    }
}
