//! Per-workspace queue manager.
//!
//! One instance per workspace. Each scheduling pass reads the tasks and
//! leases, reconciles orphaned executions, enforces WIP limits, picks the
//! next ready task FIFO, and hands it to the agent-session driver. A
//! re-entrancy guard keeps passes single-threaded-cooperative per workspace;
//! different workspaces schedule fully independently.

pub mod recovery;

use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::contract;
use crate::events::EventBroadcaster;
use crate::lease::LeaseStore;
use crate::session::{
    AgentSessionDriver, HeartbeatGuard, SessionContext, SessionRegistry, WorkspaceContext,
};
use crate::tasks::{new_id, now_ms, Task, TaskPhase, TaskStore};

/// Safety net: re-evaluate the queue even when no event kicks it.
const SAFETY_INTERVAL_SECS: u64 = 30;
/// Pause between a completion and the follow-up pass, letting the store and
/// notifications settle.
const SETTLE_DELAY_MS: u64 = 500;
/// Delay before retrying after a failed hand-off.
const HANDOFF_RETRY_DELAY_MS: u64 = 3_000;

/// Read-only queue snapshot, also the `queue.statusChanged` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub enabled: bool,
    pub current_task_id: Option<String>,
    pub ready_count: usize,
    pub executing_count: usize,
}

pub struct QueueManager {
    workspace: WorkspaceContext,
    store: TaskStore,
    leases: Arc<LeaseStore>,
    registry: Arc<SessionRegistry>,
    driver: Arc<dyn AgentSessionDriver>,
    broadcaster: Arc<EventBroadcaster>,
    /// Stable identity for this daemon run; stamped into every lease this
    /// manager's sessions renew.
    owner_id: String,
    config: RwLock<QueueConfig>,
    /// Most recently handed-off task.
    current_task_id: RwLock<Option<String>>,
    /// Executions that reported failure and were left in `executing` for
    /// manual triage. Never auto-retried within this process lifetime.
    parked: RwLock<HashSet<String>>,
    /// Re-entrancy guard: at most one scheduling pass at a time.
    pass_guard: Mutex<()>,
    safety_timer_started: AtomicBool,
    /// Back-reference for the background tasks this manager spawns; they
    /// hold weak handles so a dropped manager winds down its timers.
    weak_self: Weak<QueueManager>,
}

impl QueueManager {
    pub fn new(
        workspace_root: impl AsRef<Path>,
        driver: Arc<dyn AgentSessionDriver>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Result<Arc<Self>> {
        let root = workspace_root.as_ref();
        let config = QueueConfig::load(root)?;
        Ok(Arc::new_cyclic(|weak| Self {
            workspace: WorkspaceContext::new(root),
            store: TaskStore::new(root),
            leases: Arc::new(LeaseStore::new(root)),
            registry: SessionRegistry::new(),
            driver,
            broadcaster,
            owner_id: format!("steward-{}", uuid::Uuid::new_v4()),
            config: RwLock::new(config),
            current_task_id: RwLock::new(None),
            parked: RwLock::new(HashSet::new()),
            pass_guard: Mutex::new(()),
            safety_timer_started: AtomicBool::new(false),
            weak_self: weak.clone(),
        }))
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace.root
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn leases(&self) -> &Arc<LeaseStore> {
        &self.leases
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn config(&self) -> QueueConfig {
        self.config.read().await.clone()
    }

    pub async fn enabled(&self) -> bool {
        self.config.read().await.enabled
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Enable the scheduler, persist the flag, and attempt one pass.
    /// Idempotent.
    pub async fn start(&self) {
        {
            let mut config = self.config.write().await;
            if !config.enabled {
                config.enabled = true;
                if let Err(e) = config.save(&self.workspace.root) {
                    warn!(err = %e, "failed to persist queue enabled flag");
                }
            }
        }
        self.spawn_safety_timer();
        info!(workspace = %self.workspace.name, "queue manager started");
        self.run_pass().await;
    }

    /// Disable the scheduler and persist the flag. Does not interrupt an
    /// in-flight session — stopping execution is a separate, explicit
    /// operation. Idempotent.
    pub async fn stop(&self) {
        let mut config = self.config.write().await;
        if config.enabled {
            config.enabled = false;
            if let Err(e) = config.save(&self.workspace.root) {
                warn!(err = %e, "failed to persist queue enabled flag");
            }
        }
        info!(workspace = %self.workspace.name, "queue manager stopped");
    }

    /// Request a scheduling pass. No-op while disabled; bursts of kicks
    /// during an active pass coalesce into that one pass.
    pub fn kick(&self) {
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            manager.run_pass().await;
        });
    }

    fn schedule_kick(&self, delay_ms: u64) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            if let Some(manager) = weak.upgrade() {
                manager.run_pass().await;
            }
        });
    }

    fn spawn_safety_timer(&self) {
        if self.safety_timer_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(SAFETY_INTERVAL_SECS));
            interval.tick().await; // the immediate first tick
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(manager) => manager.run_pass().await,
                    None => break,
                }
            }
        });
    }

    /// Read-only snapshot of the queue.
    pub async fn status(&self) -> QueueStatus {
        let tasks = self.store.discover().unwrap_or_default();
        QueueStatus {
            enabled: self.config.read().await.enabled,
            current_task_id: self.current_task_id.read().await.clone(),
            ready_count: tasks.iter().filter(|t| t.phase == TaskPhase::Ready).count(),
            executing_count: tasks
                .iter()
                .filter(|t| t.phase == TaskPhase::Executing)
                .count(),
        }
    }

    // ─── Scheduling pass ─────────────────────────────────────────────────────

    /// Run one scheduling pass. Returns immediately when another pass is
    /// already running (kick coalescing) or the queue is disabled.
    pub async fn run_pass(&self) {
        let Ok(_guard) = self.pass_guard.try_lock() else {
            debug!(workspace = %self.workspace.name, "pass already running — kick coalesced");
            return;
        };
        if !self.config.read().await.enabled {
            return;
        }
        let config = self.config.read().await.clone();

        let tasks = match self.store.discover() {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(workspace = %self.workspace.name, err = %e, "task discovery failed — skipping pass");
                return;
            }
        };

        self.prune_parked(&tasks).await;

        if config.backlog_to_ready {
            self.promote_backlog(&tasks, &config).await;
        }

        // Partition `executing` into live sessions and orphans. Parked
        // failures are neither: they wait for a human.
        let live_ids = self.registry.live_task_ids().await;
        let parked = self.parked.read().await.clone();
        let mut live_count = tasks
            .iter()
            .filter(|t| t.phase == TaskPhase::Executing && live_ids.contains(&t.id))
            .count();

        // A task fast-failed in this pass must not be re-picked in the same
        // pass.
        let mut skip_this_pass: Option<String> = None;

        let orphan = tasks.iter().find(|t| {
            t.phase == TaskPhase::Executing
                && !live_ids.contains(&t.id)
                && !parked.contains(&t.id)
        });
        if let Some(orphan) = orphan {
            let age_ms = orphan
                .started_at
                .map(|started| now_ms() - started)
                .unwrap_or(i64::MAX);
            if age_ms < config.fast_fail_grace_ms {
                // Died right after starting: a fast failure. Return it to
                // ready instead of resuming, so an instantly-crashing task
                // cannot spin in an unbroken retry loop.
                info!(
                    task_id = %orphan.id,
                    age_ms,
                    "orphaned execution inside fast-fail grace window — returning to ready"
                );
                match self.store.transition(
                    &orphan.id,
                    TaskPhase::Ready,
                    "queue",
                    "execution orphaned shortly after start (fast failure)",
                ) {
                    Ok(updated) => {
                        let _ = self.leases.clear(&orphan.id).await;
                        self.broadcaster.task_phase_changed(
                            &self.workspace.root,
                            &updated,
                            TaskPhase::Executing,
                            "execution orphaned shortly after start (fast failure)",
                        );
                        skip_this_pass = Some(orphan.id.clone());
                    }
                    Err(e) => warn!(task_id = %orphan.id, err = %e, "fast-fail recovery failed"),
                }
            } else if live_count < config.executing_limit {
                info!(task_id = %orphan.id, age_ms, "resuming orphaned execution");
                self.hand_off(orphan.clone(), true).await;
                live_count += 1;
            } else {
                debug!(task_id = %orphan.id, "orphan found but executing limit reached");
            }
        }

        if live_count >= config.executing_limit {
            debug!(workspace = %self.workspace.name, live_count, "no executing capacity");
            return;
        }
        if !config.ready_to_executing {
            return;
        }

        // FIFO pick: discovery already orders by (order, created_at). Skip
        // tasks whose planning session is still running with no saved plan.
        let tasks = match self.store.discover() {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(err = %e, "task re-discovery failed — skipping pick");
                return;
            }
        };
        let next = tasks.iter().find(|t| {
            t.phase == TaskPhase::Ready
                && !t.planning_in_flight()
                && skip_this_pass.as_deref() != Some(t.id.as_str())
        });
        let Some(next) = next else {
            return;
        };

        match self
            .store
            .transition(&next.id, TaskPhase::Executing, "queue", "picked by scheduler")
        {
            Ok(task) => {
                self.broadcaster.task_phase_changed(
                    &self.workspace.root,
                    &task,
                    TaskPhase::Ready,
                    "picked by scheduler",
                );
                *self.current_task_id.write().await = Some(task.id.clone());
                self.hand_off(task, false).await;
                self.broadcaster
                    .queue_status_changed(&self.workspace.root, &self.status().await);
            }
            Err(e) => {
                warn!(task_id = %next.id, err = %e, "could not move picked task to executing");
            }
        }
    }

    /// Promote planned backlog tasks into ready, oldest first, while the
    /// ready column has room.
    async fn promote_backlog(&self, tasks: &[Task], config: &QueueConfig) {
        let ready_count = tasks.iter().filter(|t| t.phase == TaskPhase::Ready).count();
        let mut slots = config.ready_limit.saturating_sub(ready_count);
        for task in tasks
            .iter()
            .filter(|t| t.phase == TaskPhase::Backlog && t.planning_satisfied())
        {
            if slots == 0 {
                break;
            }
            match self.store.transition(
                &task.id,
                TaskPhase::Ready,
                "queue",
                "planning complete — promoted to ready",
            ) {
                Ok(updated) => {
                    self.broadcaster.task_phase_changed(
                        &self.workspace.root,
                        &updated,
                        TaskPhase::Backlog,
                        "planning complete — promoted to ready",
                    );
                    slots -= 1;
                }
                Err(e) => {
                    debug!(task_id = %task.id, err = %e, "backlog promotion rejected");
                }
            }
        }
    }

    /// Drop parked markers for tasks that left `executing` (or were
    /// removed), and surface the ones still waiting on a human.
    async fn prune_parked(&self, tasks: &[Task]) {
        let mut parked = self.parked.write().await;
        parked.retain(|id| {
            tasks
                .iter()
                .any(|t| t.id == *id && t.phase == TaskPhase::Executing)
        });
        for id in parked.iter() {
            if let Some(task) = tasks.iter().find(|t| t.id == *id) {
                let dwell_ms = task.started_at.map(|s| now_ms() - s).unwrap_or(0);
                warn!(
                    task_id = %id,
                    dwell_ms,
                    "task parked in executing after a reported failure — needs manual intervention"
                );
            }
        }
    }

    // ─── Hand-off & completion ───────────────────────────────────────────────

    /// Hand a task to the agent-session driver. All failures are contained
    /// here: a broken hand-off resets bookkeeping and schedules a delayed
    /// retry instead of propagating — one task must never stop the
    /// workspace's scheduling loop.
    async fn hand_off(&self, task: Task, resumed: bool) {
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        let config = self.config.read().await.clone();
        let session_id = new_id();
        let task_id = task.id.clone();

        self.registry
            .begin(&task_id, &session_id, &self.owner_id)
            .await;
        // Write the lease before the session spawns so ownership evidence
        // exists even if we crash immediately after.
        if let Err(e) = self.leases.renew(&task_id, &self.owner_id).await {
            warn!(task_id = %task_id, err = %e, "failed to write initial lease");
        }

        let mode = contract::resolve_task_mode(task.phase, task.planning_status, task.plan.is_some());
        let ctx = SessionContext {
            session_id: session_id.clone(),
            task,
            workspace: self.workspace.clone(),
            directive: contract::directive(mode),
        };

        let driver = Arc::clone(&self.driver);
        let leases = Arc::clone(&self.leases);
        let owner_id = self.owner_id.clone();
        let heartbeat_ms = config.heartbeat_interval_ms;
        let (tid, sid) = (task_id.clone(), session_id.clone());

        let join = tokio::spawn(async move {
            let heartbeat =
                HeartbeatGuard::spawn(leases, tid.clone(), owner_id, heartbeat_ms);
            let result = driver.execute(ctx).await;
            // Stop renewing before completion clears the lease, then
            // deregister; a stale session (replaced or stopped) loses the
            // race here and its completion becomes a no-op.
            drop(heartbeat);
            let current = manager.registry.finish(&tid, &sid).await;
            match result {
                Ok(success) => manager.on_execution_complete(&tid, success, current).await,
                Err(e) => {
                    warn!(task_id = %tid, err = %e, "agent session hand-off failed");
                    manager.clear_current(&tid).await;
                    let _ = manager.leases.clear(&tid).await;
                    manager.schedule_kick(HANDOFF_RETRY_DELAY_MS);
                }
            }
        });
        self.registry.attach(&task_id, &session_id, join).await;
        info!(
            task_id = %task_id,
            session_id = %session_id,
            resumed,
            "task handed to agent session"
        );
    }

    /// Runs exactly once per session that ran to an outcome.
    async fn on_execution_complete(&self, task_id: &str, success: bool, current: bool) {
        if !current {
            info!(task_id, "completion from a superseded session ignored");
            let _ = self.leases.clear(task_id).await;
            return;
        }

        // Re-read fresh: the record may have changed (or vanished) while the
        // session ran.
        match self.store.get(task_id) {
            Ok(None) => {
                info!(task_id, "completion for a removed task — nothing to update");
            }
            Ok(Some(task)) if task.phase == TaskPhase::Executing => {
                if success {
                    match self.store.transition(
                        task_id,
                        TaskPhase::Complete,
                        "queue",
                        "execution reported success",
                    ) {
                        Ok(updated) => {
                            info!(task_id, "task complete");
                            self.broadcaster.task_phase_changed(
                                &self.workspace.root,
                                &updated,
                                TaskPhase::Executing,
                                "execution reported success",
                            );
                        }
                        Err(e) => warn!(task_id, err = %e, "completion transition failed"),
                    }
                } else {
                    // Deliberately not auto-retried: an agent-reported
                    // failure usually means a systematic problem a retry
                    // would only mask.
                    warn!(
                        task_id,
                        "execution reported failure — task left in executing for manual triage"
                    );
                    self.parked.write().await.insert(task_id.to_string());
                }
            }
            Ok(Some(task)) => {
                info!(
                    task_id,
                    phase = %task.phase,
                    "task changed phase during execution — completion left it untouched"
                );
            }
            Err(e) => warn!(task_id, err = %e, "failed to re-read task on completion"),
        }

        let _ = self.leases.clear(task_id).await;
        self.clear_current(task_id).await;
        self.broadcaster
            .queue_status_changed(&self.workspace.root, &self.status().await);
        self.schedule_kick(SETTLE_DELAY_MS);
    }

    async fn clear_current(&self, task_id: &str) {
        let mut current = self.current_task_id.write().await;
        if current.as_deref() == Some(task_id) {
            *current = None;
        }
    }

    // ─── Explicit stop / delete ──────────────────────────────────────────────

    /// Stop a task's in-flight session and return the task to `ready`.
    /// Distinct from disabling the queue: this interrupts, `stop()` only
    /// prevents future picks.
    pub async fn stop_execution(&self, task_id: &str) -> Result<bool> {
        let stopped = self.registry.stop(task_id).await;
        let _ = self.leases.mark_stopping(task_id).await;
        let _ = self.leases.clear(task_id).await;
        self.parked.write().await.remove(task_id);
        self.clear_current(task_id).await;

        if let Some(task) = self.store.get(task_id)? {
            if task.phase == TaskPhase::Executing {
                let updated = self.store.transition(
                    task_id,
                    TaskPhase::Ready,
                    "user",
                    "execution stopped by request",
                )?;
                self.broadcaster.task_phase_changed(
                    &self.workspace.root,
                    &updated,
                    TaskPhase::Executing,
                    "execution stopped by request",
                );
            }
        }
        if stopped {
            info!(task_id, "live session stopped");
        }
        Ok(stopped)
    }

    /// Delete a task. Any live session is stopped first, so a late
    /// completion callback cannot resurrect the removed record.
    pub async fn remove_task(&self, task_id: &str) -> Result<()> {
        if self.registry.stop(task_id).await {
            info!(task_id, "stopped live session before removal");
        }
        let _ = self.leases.mark_stopping(task_id).await;
        let _ = self.leases.clear(task_id).await;
        self.parked.write().await.remove(task_id);
        self.clear_current(task_id).await;
        self.store.remove(task_id)?;
        self.broadcaster.task_removed(&self.workspace.root, task_id);
        self.broadcaster
            .queue_status_changed(&self.workspace.root, &self.status().await);
        Ok(())
    }

    /// Boot-time reconciliation for this workspace; see
    /// [`recovery::sweep_workspace`].
    pub async fn sweep(&self) -> Result<usize> {
        let ttl_ms = self.config.read().await.lease_ttl_ms;
        recovery::sweep_workspace(
            &self.store,
            &self.leases,
            &self.registry,
            &self.broadcaster,
            ttl_ms,
        )
        .await
    }
}
