//! Integration tests for the startup recovery sweep.
//! A task left `executing` with no live session and no fresh lease must be
//! returned to `ready` by exactly one sweep; everything else is untouched.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use steward::events::EventBroadcaster;
use steward::lease::{ExecutionLease, LeaseStore};
use steward::queue::recovery::sweep_workspace;
use steward::session::SessionRegistry;
use steward::tasks::{now_ms, TaskDraft, TaskPhase, TaskStore};

const TTL_MS: i64 = 45_000;

fn executing_task(store: &TaskStore, title: &str) -> String {
    let task = store
        .create(TaskDraft {
            title: title.into(),
            acceptance_criteria: vec!["done".into()],
            ..Default::default()
        })
        .unwrap();
    store
        .transition(&task.id, TaskPhase::Executing, "queue", "test setup")
        .unwrap();
    task.id
}

/// Rewrite a lease's heartbeat to `age_ms` in the past (0 = an invalid
/// heartbeat timestamp), simulating a dead owner.
fn write_lease(ws: &Path, task_id: &str, heartbeat_at: i64) {
    let path = ws.join(".steward").join("leases.json");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut map: HashMap<String, ExecutionLease> = std::fs::read_to_string(&path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    map.insert(
        task_id.to_string(),
        ExecutionLease {
            task_id: task_id.to_string(),
            owner_id: "dead-owner".to_string(),
            started_at: heartbeat_at,
            last_heartbeat_at: heartbeat_at,
            status: Default::default(),
        },
    );
    std::fs::write(&path, serde_json::to_string(&map).unwrap()).unwrap();
}

struct Fixture {
    store: TaskStore,
    leases: LeaseStore,
    registry: Arc<SessionRegistry>,
    broadcaster: EventBroadcaster,
}

impl Fixture {
    fn new(ws: &TempDir) -> Self {
        Self {
            store: TaskStore::new(ws.path()),
            leases: LeaseStore::new(ws.path()),
            registry: SessionRegistry::new(),
            broadcaster: EventBroadcaster::new(),
        }
    }

    async fn sweep(&self) -> usize {
        sweep_workspace(
            &self.store,
            &self.leases,
            &self.registry,
            &self.broadcaster,
            TTL_MS,
        )
        .await
        .unwrap()
    }

    fn phase_of(&self, id: &str) -> TaskPhase {
        self.store.get(id).unwrap().unwrap().phase
    }
}

#[tokio::test]
async fn fresh_lease_is_left_alone_expired_lease_is_recovered() {
    let ws = TempDir::new().unwrap();
    let fx = Fixture::new(&ws);
    let id = executing_task(&fx.store, "crashed elsewhere");

    // Heartbeat 40s old, TTL 45s: still fresh — the sweep must not touch it.
    write_lease(ws.path(), &id, now_ms() - 40_000);
    assert_eq!(fx.sweep().await, 0);
    assert_eq!(fx.phase_of(&id), TaskPhase::Executing);

    // Heartbeat 46s old: stale — recovered with the expiry reason.
    write_lease(ws.path(), &id, now_ms() - 46_000);
    assert_eq!(fx.sweep().await, 1);
    assert_eq!(fx.phase_of(&id), TaskPhase::Ready);

    let task = fx.store.get(&id).unwrap().unwrap();
    let last = task.transitions.last().unwrap();
    assert_eq!(last.actor, "recovery");
    assert!(
        last.reason.contains("lease heartbeat expired"),
        "reason: {}",
        last.reason
    );
    assert!(last.reason.contains("dead-owner"));

    // The stale lease is gone.
    assert!(fx.leases.load().is_empty());
}

#[tokio::test]
async fn second_sweep_is_a_no_op() {
    let ws = TempDir::new().unwrap();
    let fx = Fixture::new(&ws);
    let id = executing_task(&fx.store, "orphan");

    assert_eq!(fx.sweep().await, 1);
    assert_eq!(fx.phase_of(&id), TaskPhase::Ready);

    assert_eq!(fx.sweep().await, 0, "repeated sweeps must converge");
    assert_eq!(fx.phase_of(&id), TaskPhase::Ready);
    // Exactly one recovery transition in the audit trail.
    let task = fx.store.get(&id).unwrap().unwrap();
    let recoveries = task
        .transitions
        .iter()
        .filter(|t| t.actor == "recovery")
        .count();
    assert_eq!(recoveries, 1);
}

#[tokio::test]
async fn missing_lease_recovers_with_no_lease_reason() {
    let ws = TempDir::new().unwrap();
    let fx = Fixture::new(&ws);
    let id = executing_task(&fx.store, "no lease at all");

    assert_eq!(fx.sweep().await, 1);
    let task = fx.store.get(&id).unwrap().unwrap();
    assert!(task
        .transitions
        .last()
        .unwrap()
        .reason
        .contains("no lease metadata"));
}

#[tokio::test]
async fn invalid_heartbeat_recovers_with_its_own_reason() {
    let ws = TempDir::new().unwrap();
    let fx = Fixture::new(&ws);
    let id = executing_task(&fx.store, "zeroed heartbeat");
    write_lease(ws.path(), &id, 0);

    assert_eq!(fx.sweep().await, 1);
    let task = fx.store.get(&id).unwrap().unwrap();
    assert!(task
        .transitions
        .last()
        .unwrap()
        .reason
        .contains("invalid heartbeat timestamp"));
}

#[tokio::test]
async fn live_session_is_never_swept() {
    let ws = TempDir::new().unwrap();
    let fx = Fixture::new(&ws);
    let id = executing_task(&fx.store, "alive in this process");

    // No lease, but a live in-process session: hands off.
    fx.registry.begin(&id, "s1", "owner").await;
    assert_eq!(fx.sweep().await, 0);
    assert_eq!(fx.phase_of(&id), TaskPhase::Executing);
}

#[tokio::test]
async fn sweep_only_touches_executing_tasks() {
    let ws = TempDir::new().unwrap();
    let fx = Fixture::new(&ws);

    let backlog = fx
        .store
        .create(TaskDraft {
            title: "backlog".into(),
            acceptance_criteria: vec!["x".into()],
            ..Default::default()
        })
        .unwrap();
    let ready = executing_task(&fx.store, "to ready");
    fx.store
        .transition(&ready, TaskPhase::Complete, "queue", "finished")
        .unwrap();

    assert_eq!(fx.sweep().await, 0);
    assert_eq!(fx.phase_of(&backlog.id), TaskPhase::Backlog);
    assert_eq!(fx.phase_of(&ready), TaskPhase::Complete);
}

#[tokio::test]
async fn recovery_emits_a_typed_notification() {
    let ws = TempDir::new().unwrap();
    let fx = Fixture::new(&ws);
    let id = executing_task(&fx.store, "announced");
    let mut rx = fx.broadcaster.subscribe();

    assert_eq!(fx.sweep().await, 1);

    let raw = rx.recv().await.unwrap();
    let msg: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(msg["method"], "queue.executionRecovered");
    assert_eq!(msg["params"]["taskId"], id);
    assert_eq!(msg["params"]["staleReason"]["kind"], "no_lease");
}

#[tokio::test]
async fn manager_sweep_uses_the_workspace_config_ttl() {
    use async_trait::async_trait;
    use steward::queue::QueueManager;
    use steward::session::{AgentSessionDriver, SessionContext};

    struct NoopDriver;
    #[async_trait]
    impl AgentSessionDriver for NoopDriver {
        async fn execute(&self, _ctx: SessionContext) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    let ws = TempDir::new().unwrap();
    let mut config = steward::config::QueueConfig::default();
    config.lease_ttl_ms = 1_000; // tight TTL for the test
    config.save(ws.path()).unwrap();

    let store = TaskStore::new(ws.path());
    let id = executing_task(&store, "short ttl");
    write_lease(ws.path(), &id, now_ms() - 2_000);

    let manager = QueueManager::new(
        ws.path(),
        Arc::new(NoopDriver),
        Arc::new(EventBroadcaster::new()),
    )
    .unwrap();

    assert_eq!(manager.sweep().await.unwrap(), 1);
    assert_eq!(
        store.get(&id).unwrap().unwrap().phase,
        TaskPhase::Ready
    );
}
