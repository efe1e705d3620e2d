//! Task records, the phase state machine, and the file-backed store.

pub mod model;
pub mod store;
pub mod transition;

pub use model::{
    new_id, now_ms, AcceptanceCriterion, PlanningStatus, Task, TaskDraft, TaskPhase,
    TransitionRecord,
};
pub use store::TaskStore;
pub use transition::{apply_transition, edge_allowed, TransitionError};
