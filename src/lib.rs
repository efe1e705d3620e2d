//! steward — workspace task pipeline daemon.
//!
//! Moves tasks through a fixed phase pipeline (backlog → ready → executing →
//! complete → archived), hands ready tasks to an autonomous agent session
//! under WIP limits, and recovers crashed executions via file-backed
//! heartbeat leases.

pub mod config;
pub mod contract;
pub mod events;
pub mod lease;
pub mod queue;
pub mod session;
pub mod tasks;
pub mod workspace;

use std::sync::Arc;

use config::DaemonConfig;
use events::EventBroadcaster;
use workspace::WorkspaceRegistry;

/// Shared application state passed to the daemon's background tasks.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub workspaces: Arc<WorkspaceRegistry>,
    pub started_at: std::time::Instant,
}
