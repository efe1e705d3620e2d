//! File-backed task store.
//!
//! One directory per task under `.steward/tasks/<id>/`, with the record
//! itself in `task.yaml`. The store is deliberately non-transactional: each
//! mutation is a load-mutate-persist of a single small file, and every
//! consumer (scheduler passes, the recovery sweep) re-derives truth from the
//! current records rather than from any log.

use anyhow::{Context, Result};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::model::{PlanningStatus, Task, TaskDraft, TaskPhase};
use super::transition::apply_transition;

const STEWARD_DIR: &str = ".steward";
const TASKS_DIR: &str = "tasks";
const TASK_FILE: &str = "task.yaml";

/// Task store bound to a single workspace root.
#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            root: workspace_root.into(),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.root
    }

    /// `.steward/tasks` under the workspace root.
    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join(STEWARD_DIR).join(TASKS_DIR)
    }

    fn task_file(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(task_id).join(TASK_FILE)
    }

    // ─── Discovery ───────────────────────────────────────────────────────────

    /// Read every task record under the workspace, ordered by (`order`,
    /// `created_at`, `id`) — the scheduler's FIFO order.
    ///
    /// Unreadable individual records are skipped with a warning rather than
    /// failing the whole discovery; a single corrupt file must not stop the
    /// workspace's scheduling loop.
    pub fn discover(&self) -> Result<Vec<Task>> {
        let dir = self.tasks_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut tasks = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("failed to list task directory {}", dir.display()))?
        {
            let entry = entry?;
            let file = entry.path().join(TASK_FILE);
            if !file.is_file() {
                continue;
            }
            match read_task_file(&file) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!(path = %file.display(), err = %e, "skipping unreadable task record");
                }
            }
        }

        tasks.sort_by(fifo_order);
        Ok(tasks)
    }

    /// Load a single task, `None` if it does not exist.
    pub fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let file = self.task_file(task_id);
        if !file.is_file() {
            return Ok(None);
        }
        read_task_file(&file).map(Some)
    }

    // ─── Mutation ────────────────────────────────────────────────────────────

    /// Promote a staged draft into a backlog task at the end of the column.
    pub fn create(&self, draft: TaskDraft) -> Result<Task> {
        let next_order = self
            .discover()?
            .iter()
            .map(|t| t.order)
            .fold(0.0_f64, f64::max)
            + 1.0;
        let task = draft.promote(next_order);
        self.persist(&task)?;
        Ok(task)
    }

    /// The single phase-change funnel: load fresh, validate + apply the
    /// transition (audit entry included), persist.
    ///
    /// Guard failures reject the transition with nothing applied.
    pub fn transition(
        &self,
        task_id: &str,
        to: TaskPhase,
        actor: &str,
        reason: &str,
    ) -> Result<Task> {
        let mut task = self
            .get(task_id)?
            .with_context(|| format!("task {task_id} not found"))?;
        apply_transition(&mut task, to, actor, reason)?;
        self.persist(&task)?;
        Ok(task)
    }

    /// Save the plan produced by a planning session and mark planning done.
    pub fn save_plan(&self, task_id: &str, plan: &str) -> Result<Task> {
        self.update(task_id, |task| {
            task.plan = Some(plan.to_string());
            task.planning_status = PlanningStatus::Completed;
        })
    }

    pub fn set_planning_status(&self, task_id: &str, status: PlanningStatus) -> Result<Task> {
        self.update(task_id, |task| task.planning_status = status)
    }

    /// Completion callbacks report a run summary.
    pub fn set_summary(&self, task_id: &str, summary: &str) -> Result<Task> {
        self.update(task_id, |task| task.summary = Some(summary.to_string()))
    }

    /// Flip one acceptance criterion's done flag.
    pub fn set_criterion_done(&self, task_id: &str, criterion_id: &str, done: bool) -> Result<Task> {
        self.update(task_id, |task| {
            if let Some(c) = task
                .acceptance_criteria
                .iter_mut()
                .find(|c| c.id == criterion_id)
            {
                c.done = done;
            }
        })
    }

    /// Move a task to a new position within its column.
    pub fn set_order(&self, task_id: &str, order: f64) -> Result<Task> {
        self.update(task_id, |task| task.order = order)
    }

    /// Delete a task record. Callers must stop any live execution first (the
    /// queue manager's `remove_task` does) so a late completion callback
    /// cannot resurrect the record.
    pub fn remove(&self, task_id: &str) -> Result<()> {
        let dir = self.tasks_dir().join(task_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove task {task_id}"))?;
        }
        Ok(())
    }

    /// Write a task record to disk, creating its directory as needed.
    pub fn persist(&self, task: &Task) -> Result<()> {
        let file = self.task_file(&task.id);
        let dir = file.parent().expect("task file has a parent directory");
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let yaml = serde_yaml::to_string(task).context("failed to serialize task")?;
        std::fs::write(&file, yaml)
            .with_context(|| format!("failed to write {}", file.display()))?;
        Ok(())
    }

    fn update(&self, task_id: &str, mutate: impl FnOnce(&mut Task)) -> Result<Task> {
        let mut task = self
            .get(task_id)?
            .with_context(|| format!("task {task_id} not found"))?;
        mutate(&mut task);
        task.updated_at = super::model::now_ms();
        self.persist(&task)?;
        Ok(task)
    }
}

/// FIFO comparator: `order` ascending, then `created_at`, then id.
fn fifo_order(a: &Task, b: &Task) -> Ordering {
    a.order
        .partial_cmp(&b.order)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

fn read_task_file(path: &Path) -> Result<Task> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse task record {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::TaskDraft;
    use tempfile::TempDir;

    fn draft(title: &str) -> TaskDraft {
        TaskDraft {
            title: title.into(),
            acceptance_criteria: vec!["done".into()],
            ..Default::default()
        }
    }

    #[test]
    fn create_then_discover_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());

        let created = store.create(draft("first")).unwrap();
        let found = store.discover().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, created.id);
        assert_eq!(found[0].title, "first");
        assert_eq!(found[0].phase, TaskPhase::Backlog);
    }

    #[test]
    fn discover_orders_by_order_then_created() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());

        let a = store.create(draft("a")).unwrap(); // order 1.0
        let b = store.create(draft("b")).unwrap(); // order 2.0
        let c = store.create(draft("c")).unwrap(); // order 3.0

        // Move c between a and b.
        store.set_order(&c.id, 1.5).unwrap();

        let ids: Vec<String> = store.discover().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a.id.clone(), c.id.clone(), b.id.clone()]);

        // Equal order falls back to creation time: make c clearly younger.
        store.set_order(&c.id, 1.0).unwrap();
        let mut younger = store.get(&c.id).unwrap().unwrap();
        younger.created_at = a.created_at + 5_000;
        store.persist(&younger).unwrap();

        let ids: Vec<String> = store.discover().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids[0], a.id);
        assert_eq!(ids[1], c.id);
    }

    #[test]
    fn transition_persists_phase_and_audit() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let task = store.create(draft("t")).unwrap();

        store
            .transition(&task.id, TaskPhase::Ready, "user", "planned")
            .unwrap();

        let fresh = store.get(&task.id).unwrap().unwrap();
        assert_eq!(fresh.phase, TaskPhase::Ready);
        assert_eq!(fresh.transitions.len(), 1);
        assert_eq!(fresh.transitions[0].reason, "planned");
    }

    #[test]
    fn rejected_transition_leaves_record_untouched() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let bare = store
            .create(TaskDraft {
                title: "no criteria".into(),
                ..Default::default()
            })
            .unwrap();

        let err = store.transition(&bare.id, TaskPhase::Ready, "user", "go");
        assert!(err.is_err());

        let fresh = store.get(&bare.id).unwrap().unwrap();
        assert_eq!(fresh.phase, TaskPhase::Backlog);
        assert!(fresh.transitions.is_empty());
    }

    #[test]
    fn save_plan_completes_planning() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let task = store.create(draft("t")).unwrap();

        store
            .set_planning_status(&task.id, PlanningStatus::Running)
            .unwrap();
        assert!(store.get(&task.id).unwrap().unwrap().planning_in_flight());

        store.save_plan(&task.id, "1. fix it\n2. test it").unwrap();
        let fresh = store.get(&task.id).unwrap().unwrap();
        assert_eq!(fresh.planning_status, PlanningStatus::Completed);
        assert!(!fresh.planning_in_flight());
    }

    #[test]
    fn remove_deletes_the_record() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let task = store.create(draft("gone")).unwrap();

        store.remove(&task.id).unwrap();
        assert!(store.get(&task.id).unwrap().is_none());
        assert!(store.discover().unwrap().is_empty());
    }

    #[test]
    fn corrupt_record_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        store.create(draft("good")).unwrap();

        let bad_dir = store.tasks_dir().join("bogus");
        std::fs::create_dir_all(&bad_dir).unwrap();
        std::fs::write(bad_dir.join(TASK_FILE), ": not yaml {{{").unwrap();

        let found = store.discover().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title, "good");
    }
}
