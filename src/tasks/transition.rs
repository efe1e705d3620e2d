//! Phase transition state machine.
//!
//! The allowed edge set and the phase guards live here; the store funnels
//! every phase change through [`apply_transition`] so a task's phase can never
//! move without the matching audit entry.

use thiserror::Error;

use super::model::{now_ms, Task, TaskPhase, TransitionRecord};

/// A rejected transition. Nothing is applied on rejection.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("transition {from} → {to} is not an allowed edge")]
    EdgeNotAllowed { from: TaskPhase, to: TaskPhase },

    #[error(
        "task {task_id} cannot leave the backlog with no acceptance criteria \
         (set skip_planning to override)"
    )]
    EmptyAcceptanceCriteria { task_id: String },
}

/// The fixed edge set of the pipeline.
pub fn edge_allowed(from: TaskPhase, to: TaskPhase) -> bool {
    use TaskPhase::*;
    matches!(
        (from, to),
        (Backlog, Ready)
            | (Backlog, Executing)
            | (Ready, Executing)
            | (Executing, Complete)
            | (Executing, Ready) // failure / crash return
            | (Complete, Archived)
            | (Archived, Complete) // manual restore
    )
}

/// Validate and apply a phase transition in place.
///
/// On success the task's phase changes, lifecycle timestamps are stamped, and
/// a [`TransitionRecord`] is appended. On failure the task is untouched.
///
/// An `executing → ready` edge is by definition a crash/stall return, so it
/// also bumps the blocked counters with the time spent in `executing`.
pub fn apply_transition(
    task: &mut Task,
    to: TaskPhase,
    actor: &str,
    reason: &str,
) -> Result<(), TransitionError> {
    let from = task.phase;

    if !edge_allowed(from, to) {
        return Err(TransitionError::EdgeNotAllowed { from, to });
    }

    // Guard: leaving the backlog requires acceptance criteria unless the task
    // explicitly skips planning.
    if from == TaskPhase::Backlog
        && task.acceptance_criteria.is_empty()
        && !task.skip_planning
    {
        return Err(TransitionError::EmptyAcceptanceCriteria {
            task_id: task.id.clone(),
        });
    }

    let now = now_ms();

    if to == TaskPhase::Executing && task.started_at.is_none() {
        task.started_at = Some(now);
    }
    if from == TaskPhase::Executing && to == TaskPhase::Complete {
        task.completed_at = Some(now);
    }
    if from == TaskPhase::Executing && to == TaskPhase::Ready {
        task.blocked_count += 1;
        if let Some(started) = task.started_at {
            task.blocked_ms += (now - started).max(0);
        }
        // The next execution gets a fresh start timestamp.
        task.started_at = None;
    }

    task.phase = to;
    task.updated_at = now;
    task.transitions.push(TransitionRecord {
        from,
        to,
        at: now,
        actor: actor.to_string(),
        reason: reason.to_string(),
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::TaskDraft;

    fn task_with_criteria() -> Task {
        TaskDraft {
            title: "t".into(),
            description: String::new(),
            acceptance_criteria: vec!["it works".into()],
            skip_planning: false,
        }
        .promote(1.0)
    }

    #[test]
    fn full_happy_path() {
        let mut task = task_with_criteria();
        apply_transition(&mut task, TaskPhase::Ready, "user", "planned").unwrap();
        apply_transition(&mut task, TaskPhase::Executing, "queue", "picked").unwrap();
        assert!(task.started_at.is_some());
        apply_transition(&mut task, TaskPhase::Complete, "queue", "done").unwrap();
        assert!(task.completed_at.is_some());
        apply_transition(&mut task, TaskPhase::Archived, "user", "archived").unwrap();
        assert_eq!(task.transitions.len(), 4);
        assert_eq!(task.transitions[1].actor, "queue");
    }

    #[test]
    fn direct_backlog_to_executing_is_allowed() {
        let mut task = task_with_criteria();
        apply_transition(&mut task, TaskPhase::Executing, "queue", "direct").unwrap();
        assert_eq!(task.phase, TaskPhase::Executing);
    }

    #[test]
    fn archived_restores_to_complete() {
        let mut task = task_with_criteria();
        task.phase = TaskPhase::Archived;
        apply_transition(&mut task, TaskPhase::Complete, "user", "restore").unwrap();
        assert_eq!(task.phase, TaskPhase::Complete);
    }

    #[test]
    fn disallowed_edge_is_rejected_without_side_effects() {
        let mut task = task_with_criteria();
        task.phase = TaskPhase::Complete;
        let err = apply_transition(&mut task, TaskPhase::Executing, "user", "nope")
            .unwrap_err();
        assert!(matches!(err, TransitionError::EdgeNotAllowed { .. }));
        assert_eq!(task.phase, TaskPhase::Complete);
        assert!(task.transitions.is_empty());
    }

    #[test]
    fn empty_criteria_blocks_backlog_exit() {
        let mut task = TaskDraft {
            title: "bare".into(),
            ..Default::default()
        }
        .promote(1.0);
        let err = apply_transition(&mut task, TaskPhase::Ready, "user", "go").unwrap_err();
        assert!(matches!(err, TransitionError::EmptyAcceptanceCriteria { .. }));
        assert_eq!(task.phase, TaskPhase::Backlog);
    }

    #[test]
    fn skip_planning_overrides_criteria_guard() {
        let mut task = TaskDraft {
            title: "quick fix".into(),
            skip_planning: true,
            ..Default::default()
        }
        .promote(1.0);
        apply_transition(&mut task, TaskPhase::Ready, "user", "go").unwrap();
        assert_eq!(task.phase, TaskPhase::Ready);
    }

    #[test]
    fn crash_return_bumps_blocked_counters_and_resets_start() {
        let mut task = task_with_criteria();
        apply_transition(&mut task, TaskPhase::Executing, "queue", "picked").unwrap();
        // Pretend the execution started a while ago.
        task.started_at = Some(now_ms() - 5_000);
        apply_transition(&mut task, TaskPhase::Ready, "recovery", "stale").unwrap();
        assert_eq!(task.blocked_count, 1);
        assert!(task.blocked_ms >= 5_000);
        assert!(task.started_at.is_none());
    }

    #[test]
    fn every_recorded_transition_is_an_allowed_edge() {
        // Walk a task around the full graph and re-check its audit trail.
        let mut task = task_with_criteria();
        for (to, actor) in [
            (TaskPhase::Ready, "user"),
            (TaskPhase::Executing, "queue"),
            (TaskPhase::Ready, "recovery"),
            (TaskPhase::Executing, "queue"),
            (TaskPhase::Complete, "queue"),
            (TaskPhase::Archived, "user"),
            (TaskPhase::Complete, "user"),
        ] {
            apply_transition(&mut task, to, actor, "step").unwrap();
        }
        for record in &task.transitions {
            assert!(edge_allowed(record.from, record.to));
        }
    }
}
