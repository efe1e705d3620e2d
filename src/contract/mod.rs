//! Session mode and capability contract.
//!
//! Every agent turn runs under exactly one mode, derived on demand from the
//! owning task's phase and planning snapshot — never stored. Each mode owns a
//! fixed, non-overlapping allowed/forbidden capability table. The table is
//! consulted twice: once to render the directive injected into every agent
//! turn, and once defensively to reject a disallowed action if the agent
//! attempts it anyway.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tasks::{PlanningStatus, Task, TaskPhase};

// ─── Modes ───────────────────────────────────────────────────────────────────

/// The agent's capability profile for one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Workspace-level assistant with no specific task in context.
    Foreman,
    /// A backlog task's planning session is running and no plan is saved yet.
    TaskPlanning,
    /// The task is executing.
    TaskExecution,
    /// The task reached a terminal or post-pipeline state.
    TaskComplete,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Foreman => "foreman",
            SessionMode::TaskPlanning => "task_planning",
            SessionMode::TaskExecution => "task_execution",
            SessionMode::TaskComplete => "task_complete",
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named actions an agent may or may not invoke under a given mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ReadFiles,
    RunShell,
    FetchUrl,
    SearchWeb,
    EditFiles,
    WriteFiles,
    SavePlan,
    MarkComplete,
    StopExecution,
}

impl Capability {
    pub const ALL: &'static [Capability] = &[
        Capability::ReadFiles,
        Capability::RunShell,
        Capability::FetchUrl,
        Capability::SearchWeb,
        Capability::EditFiles,
        Capability::WriteFiles,
        Capability::SavePlan,
        Capability::MarkComplete,
        Capability::StopExecution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ReadFiles => "read_files",
            Capability::RunShell => "run_shell",
            Capability::FetchUrl => "fetch_url",
            Capability::SearchWeb => "search_web",
            Capability::EditFiles => "edit_files",
            Capability::WriteFiles => "write_files",
            Capability::SavePlan => "save_plan",
            Capability::MarkComplete => "mark_complete",
            Capability::StopExecution => "stop_execution",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Mode → capability tables ────────────────────────────────────────────────

/// Static table mapping each mode to its (allowed, forbidden) capability
/// sets. The two sets partition `Capability::ALL` for every mode.
const MODE_CAPABILITIES: &[(SessionMode, &[Capability], &[Capability])] = &[
    (
        SessionMode::Foreman,
        &[
            Capability::ReadFiles,
            Capability::RunShell,
            Capability::FetchUrl,
            Capability::SearchWeb,
            Capability::StopExecution,
        ],
        &[
            Capability::EditFiles,
            Capability::WriteFiles,
            Capability::SavePlan,
            Capability::MarkComplete,
        ],
    ),
    (
        SessionMode::TaskPlanning,
        &[
            Capability::ReadFiles,
            Capability::RunShell,
            Capability::FetchUrl,
            Capability::SavePlan,
        ],
        &[
            Capability::SearchWeb,
            Capability::EditFiles,
            Capability::WriteFiles,
            Capability::MarkComplete,
            Capability::StopExecution,
        ],
    ),
    (
        SessionMode::TaskExecution,
        &[
            Capability::ReadFiles,
            Capability::RunShell,
            Capability::FetchUrl,
            Capability::EditFiles,
            Capability::WriteFiles,
            Capability::MarkComplete,
        ],
        &[
            Capability::SearchWeb,
            Capability::SavePlan,
            Capability::StopExecution,
        ],
    ),
    (
        SessionMode::TaskComplete,
        &[
            Capability::ReadFiles,
            Capability::RunShell,
            Capability::FetchUrl,
            Capability::EditFiles,
            Capability::WriteFiles,
        ],
        &[
            Capability::SearchWeb,
            Capability::SavePlan,
            Capability::MarkComplete,
            Capability::StopExecution,
        ],
    ),
];

/// The derived contract for one mode. Never stored — recomputed on demand
/// from the task's live snapshot.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModeContract {
    pub mode: SessionMode,
    pub allowed: &'static [Capability],
    pub forbidden: &'static [Capability],
}

pub fn contract_for(mode: SessionMode) -> ModeContract {
    let (m, allowed, forbidden) = MODE_CAPABILITIES
        .iter()
        .find(|(m, _, _)| *m == mode)
        .expect("every mode has a table entry");
    ModeContract {
        mode: *m,
        allowed,
        forbidden,
    }
}

// ─── Resolution ──────────────────────────────────────────────────────────────

/// Map a task's phase/planning snapshot to its mode.
///
/// Total over all inputs. Evaluation order matters: terminal and explicit
/// states are checked before in-progress ones.
pub fn resolve_task_mode(
    phase: TaskPhase,
    planning_status: PlanningStatus,
    plan_present: bool,
) -> SessionMode {
    if phase == TaskPhase::Archived
        || planning_status == PlanningStatus::Error
        || (phase != TaskPhase::Backlog && phase != TaskPhase::Executing)
    {
        return SessionMode::TaskComplete;
    }
    if phase == TaskPhase::Executing {
        return SessionMode::TaskExecution;
    }
    if phase == TaskPhase::Backlog
        && planning_status == PlanningStatus::Running
        && !plan_present
    {
        return SessionMode::TaskPlanning;
    }
    SessionMode::Foreman
}

/// Resolve the mode for an optional task context; no task means the
/// workspace-level foreman.
pub fn resolve_mode(task: Option<&Task>) -> SessionMode {
    match task {
        None => SessionMode::Foreman,
        Some(t) => resolve_task_mode(t.phase, t.planning_status, t.plan.is_some()),
    }
}

// ─── Enforcement ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ContractViolation {
    #[error("capability '{capability}' is forbidden in {mode} mode")]
    Forbidden {
        capability: Capability,
        mode: SessionMode,
    },
}

pub fn is_forbidden(mode: SessionMode, capability: Capability) -> bool {
    contract_for(mode).forbidden.contains(&capability)
}

/// Defensive check applied when the agent actually attempts an action; the
/// directive below is the cooperative half of the same table.
pub fn check_capability(mode: SessionMode, capability: Capability) -> Result<(), ContractViolation> {
    if is_forbidden(mode, capability) {
        Err(ContractViolation::Forbidden { capability, mode })
    } else {
        Ok(())
    }
}

/// Render the per-turn directive for a mode.
pub fn directive(mode: SessionMode) -> String {
    let contract = contract_for(mode);
    let list = |caps: &[Capability]| {
        caps.iter()
            .map(Capability::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    };
    let headline = match mode {
        SessionMode::Foreman => {
            "You are the workspace foreman: assist with questions and inspection, \
             but do not modify the workspace."
        }
        SessionMode::TaskPlanning => {
            "You are planning this task: produce and save a plan; do not start \
             implementing it."
        }
        SessionMode::TaskExecution => {
            "You are executing this task: implement it and mark it complete when \
             the acceptance criteria hold."
        }
        SessionMode::TaskComplete => {
            "This task already finished: you may make follow-up edits, but you \
             cannot re-plan it or complete it again."
        }
    };
    format!(
        "{headline}\nAllowed actions: {}.\nForbidden actions: {}.",
        list(contract.allowed),
        list(contract.forbidden)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn archived_resolves_complete_before_anything_else() {
        // Even with planning running, archived wins.
        assert_eq!(
            resolve_task_mode(TaskPhase::Archived, PlanningStatus::Running, false),
            SessionMode::TaskComplete
        );
    }

    #[test]
    fn planning_error_resolves_complete() {
        assert_eq!(
            resolve_task_mode(TaskPhase::Backlog, PlanningStatus::Error, false),
            SessionMode::TaskComplete
        );
    }

    #[test]
    fn ready_and_complete_phases_resolve_complete() {
        assert_eq!(
            resolve_task_mode(TaskPhase::Ready, PlanningStatus::Unset, true),
            SessionMode::TaskComplete
        );
        assert_eq!(
            resolve_task_mode(TaskPhase::Complete, PlanningStatus::Completed, true),
            SessionMode::TaskComplete
        );
    }

    #[test]
    fn executing_resolves_execution() {
        assert_eq!(
            resolve_task_mode(TaskPhase::Executing, PlanningStatus::Completed, true),
            SessionMode::TaskExecution
        );
        // In-progress check order: executing wins over planning-running.
        assert_eq!(
            resolve_task_mode(TaskPhase::Executing, PlanningStatus::Running, false),
            SessionMode::TaskExecution
        );
    }

    #[test]
    fn backlog_planning_without_plan_resolves_planning() {
        assert_eq!(
            resolve_task_mode(TaskPhase::Backlog, PlanningStatus::Running, false),
            SessionMode::TaskPlanning
        );
        // Once a plan is present, planning mode no longer applies.
        assert_eq!(
            resolve_task_mode(TaskPhase::Backlog, PlanningStatus::Running, true),
            SessionMode::Foreman
        );
    }

    #[test]
    fn idle_backlog_resolves_foreman() {
        assert_eq!(
            resolve_task_mode(TaskPhase::Backlog, PlanningStatus::Unset, false),
            SessionMode::Foreman
        );
        assert_eq!(resolve_mode(None), SessionMode::Foreman);
    }

    #[test]
    fn tables_partition_the_capability_set() {
        for (mode, allowed, forbidden) in MODE_CAPABILITIES {
            for cap in Capability::ALL {
                let in_allowed = allowed.contains(cap);
                let in_forbidden = forbidden.contains(cap);
                assert!(
                    in_allowed ^ in_forbidden,
                    "{mode:?}/{cap:?} must be in exactly one of allowed/forbidden"
                );
            }
        }
    }

    #[test]
    fn foreman_cannot_write_but_can_search() {
        assert!(check_capability(SessionMode::Foreman, Capability::SearchWeb).is_ok());
        assert!(check_capability(SessionMode::Foreman, Capability::WriteFiles).is_err());
        assert!(check_capability(SessionMode::Foreman, Capability::MarkComplete).is_err());
    }

    #[test]
    fn planning_saves_plans_and_nothing_else_mutates() {
        assert!(check_capability(SessionMode::TaskPlanning, Capability::SavePlan).is_ok());
        assert!(check_capability(SessionMode::TaskPlanning, Capability::EditFiles).is_err());
        assert!(check_capability(SessionMode::TaskPlanning, Capability::SearchWeb).is_err());
    }

    #[test]
    fn execution_edits_and_completes_but_never_plans() {
        assert!(check_capability(SessionMode::TaskExecution, Capability::EditFiles).is_ok());
        assert!(check_capability(SessionMode::TaskExecution, Capability::MarkComplete).is_ok());
        assert!(check_capability(SessionMode::TaskExecution, Capability::SavePlan).is_err());
        assert!(check_capability(SessionMode::TaskExecution, Capability::SearchWeb).is_err());
    }

    #[test]
    fn complete_mode_edits_but_cannot_complete_again() {
        assert!(check_capability(SessionMode::TaskComplete, Capability::EditFiles).is_ok());
        assert!(check_capability(SessionMode::TaskComplete, Capability::MarkComplete).is_err());
        assert!(check_capability(SessionMode::TaskComplete, Capability::SavePlan).is_err());
    }

    #[test]
    fn directive_names_the_forbidden_actions() {
        let text = directive(SessionMode::TaskExecution);
        assert!(text.contains("edit_files"));
        assert!(text.contains("Forbidden actions"));
        assert!(text.contains("save_plan"));
    }

    fn any_phase() -> impl Strategy<Value = TaskPhase> {
        prop_oneof![
            Just(TaskPhase::Backlog),
            Just(TaskPhase::Ready),
            Just(TaskPhase::Executing),
            Just(TaskPhase::Complete),
            Just(TaskPhase::Archived),
        ]
    }

    fn any_planning() -> impl Strategy<Value = PlanningStatus> {
        prop_oneof![
            Just(PlanningStatus::Unset),
            Just(PlanningStatus::Running),
            Just(PlanningStatus::Completed),
            Just(PlanningStatus::Error),
        ]
    }

    proptest! {
        // Totality + determinism: every input triple maps to exactly one
        // mode, stable across calls, and the forbidden check never varies.
        #[test]
        fn resolve_is_total_and_deterministic(
            phase in any_phase(),
            planning in any_planning(),
            plan_present in any::<bool>(),
        ) {
            let first = resolve_task_mode(phase, planning, plan_present);
            let second = resolve_task_mode(phase, planning, plan_present);
            prop_assert_eq!(first, second);

            for cap in Capability::ALL {
                prop_assert_eq!(is_forbidden(first, *cap), is_forbidden(second, *cap));
            }
        }
    }
}
