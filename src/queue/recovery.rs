//! Startup recovery sweep.
//!
//! Runs once per process start, before normal scheduling. Any task recorded
//! as `executing` with no live session and no fresh lease was abandoned by a
//! dead process: return it to `ready` with a structured stale reason, tell
//! the world, and drop the lease.
//!
//! This sweep and the queue manager's steady-state orphan detection are two
//! independent layers converging on the same guard (live session or fresh
//! lease), so running the sweep twice is a no-op.

use anyhow::Result;
use tracing::{info, warn};

use crate::events::EventBroadcaster;
use crate::lease::{stale_reason, LeaseStore};
use crate::session::SessionRegistry;
use crate::tasks::{now_ms, TaskPhase, TaskStore};

/// Reconcile one workspace. Returns how many tasks were recovered.
pub async fn sweep_workspace(
    store: &TaskStore,
    leases: &LeaseStore,
    registry: &SessionRegistry,
    broadcaster: &EventBroadcaster,
    ttl_ms: i64,
) -> Result<usize> {
    let tasks = store.discover()?;
    let lease_map = leases.load();
    let now = now_ms();
    let mut recovered = 0usize;

    for task in tasks.iter().filter(|t| t.phase == TaskPhase::Executing) {
        if registry.is_live(&task.id).await {
            continue;
        }
        let Some(reason) = stale_reason(lease_map.get(&task.id), now, ttl_ms) else {
            // Fresh lease: a live owner exists elsewhere. Hands off.
            continue;
        };

        info!(
            workspace = %store.workspace_root().display(),
            task_id = %task.id,
            reason = %reason,
            "recovering stale execution"
        );
        match store.transition(
            &task.id,
            TaskPhase::Ready,
            "recovery",
            &format!("stale execution recovered: {reason}"),
        ) {
            Ok(updated) => {
                broadcaster.execution_recovered(store.workspace_root(), &task.id, &reason);
                broadcaster.task_phase_changed(
                    store.workspace_root(),
                    &updated,
                    TaskPhase::Executing,
                    "stale execution recovered",
                );
                if let Err(e) = leases.clear(&task.id).await {
                    warn!(task_id = %task.id, err = %e, "failed to clear stale lease");
                }
                recovered += 1;
            }
            Err(e) => {
                warn!(task_id = %task.id, err = %e, "stale execution recovery failed");
            }
        }
    }

    if recovered > 0 {
        info!(
            workspace = %store.workspace_root().display(),
            recovered,
            "startup recovery sweep complete"
        );
    }
    Ok(recovered)
}
