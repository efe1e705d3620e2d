//! Task pipeline data model.
//!
//! A `Task` moves through a fixed phase pipeline (backlog → ready → executing
//! → complete → archived). Every phase change goes through
//! [`super::transition::apply_transition`], which validates the edge, enforces
//! phase guards, and appends a `TransitionRecord` to the task's audit trail.

use serde::{Deserialize, Serialize};

/// Generate a new ULID string (sortable, collision-free ids for tasks,
/// sessions, and audit entries).
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─── Phases ──────────────────────────────────────────────────────────────────

/// Pipeline phases a task can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Backlog,
    Ready,
    Executing,
    Complete,
    Archived,
}

impl TaskPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::Backlog => "backlog",
            TaskPhase::Ready => "ready",
            TaskPhase::Executing => "executing",
            TaskPhase::Complete => "complete",
            TaskPhase::Archived => "archived",
        }
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Planning lifecycle for a task still in the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanningStatus {
    #[default]
    Unset,
    Running,
    Completed,
    Error,
}

impl PlanningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanningStatus::Unset => "unset",
            PlanningStatus::Running => "running",
            PlanningStatus::Completed => "completed",
            PlanningStatus::Error => "error",
        }
    }
}

// ─── Records ─────────────────────────────────────────────────────────────────

/// One acceptance criterion. Agents flip `done` via the completion callback;
/// the scheduler only cares whether the list is non-empty when a task leaves
/// the backlog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub done: bool,
}

impl AcceptanceCriterion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            text: text.into(),
            done: false,
        }
    }
}

/// Audit entry appended on every successful phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TaskPhase,
    pub to: TaskPhase,
    /// Epoch milliseconds.
    pub at: i64,
    /// Who requested the transition (`"queue"`, `"recovery"`, `"user"`, ...).
    pub actor: String,
    pub reason: String,
}

/// A unit of work moving through the pipeline.
///
/// Persisted as `.steward/tasks/<id>/task.yaml` under the workspace root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub phase: TaskPhase,
    /// Numeric position within the phase column. Fractional values allow
    /// insert-between without renumbering; ties break on `created_at`.
    pub order: f64,
    #[serde(default)]
    pub planning_status: PlanningStatus,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    /// When set, the task may leave the backlog with an empty criteria list.
    #[serde(default)]
    pub skip_planning: bool,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    /// How many times an execution of this task was recovered (crashed or
    /// stalled and returned to ready).
    #[serde(default)]
    pub blocked_count: u32,
    /// Cumulative milliseconds spent wedged in `executing` before recovery.
    #[serde(default)]
    pub blocked_ms: i64,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
}

impl Task {
    /// True when the planning session is still running and has not saved a
    /// plan yet — such tasks are skipped by the scheduler's ready pick.
    pub fn planning_in_flight(&self) -> bool {
        self.planning_status == PlanningStatus::Running && self.plan.is_none()
    }

    /// True when planning has produced what the pipeline needs to leave the
    /// backlog: a saved plan, or an explicit skip.
    pub fn planning_satisfied(&self) -> bool {
        self.skip_planning || self.plan.is_some()
    }
}

/// A staged draft, promoted into a backlog task by the store. The only way
/// records enter the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub skip_planning: bool,
}

impl TaskDraft {
    pub fn promote(self, order: f64) -> Task {
        let now = now_ms();
        Task {
            id: new_id(),
            title: self.title,
            description: self.description,
            phase: TaskPhase::Backlog,
            order,
            planning_status: PlanningStatus::Unset,
            plan: None,
            summary: None,
            acceptance_criteria: self
                .acceptance_criteria
                .into_iter()
                .map(AcceptanceCriterion::new)
                .collect(),
            skip_planning: self.skip_planning,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            blocked_count: 0,
            blocked_ms: 0,
            transitions: Vec::new(),
        }
    }
}
