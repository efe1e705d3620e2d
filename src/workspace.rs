//! Workspace registry: one queue manager per workspace root.
//!
//! Workspaces schedule fully independently — there is no cross-workspace
//! lock, and a stalled pass in one workspace never delays another.

use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::events::EventBroadcaster;
use crate::queue::QueueManager;
use crate::session::AgentSessionDriver;

pub struct WorkspaceRegistry {
    driver: Arc<dyn AgentSessionDriver>,
    broadcaster: Arc<EventBroadcaster>,
    managers: RwLock<HashMap<PathBuf, Arc<QueueManager>>>,
}

impl WorkspaceRegistry {
    pub fn new(driver: Arc<dyn AgentSessionDriver>, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            driver,
            broadcaster,
            managers: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the workspace's queue manager, creating it on first use.
    pub async fn get_or_create(&self, root: &Path) -> Result<Arc<QueueManager>> {
        if let Some(manager) = self.managers.read().await.get(root) {
            return Ok(Arc::clone(manager));
        }
        let mut managers = self.managers.write().await;
        // Double-checked: another caller may have created it meanwhile.
        if let Some(manager) = managers.get(root) {
            return Ok(Arc::clone(manager));
        }
        let manager = QueueManager::new(
            root,
            Arc::clone(&self.driver),
            Arc::clone(&self.broadcaster),
        )?;
        managers.insert(root.to_path_buf(), Arc::clone(&manager));
        Ok(manager)
    }

    pub async fn get(&self, root: &Path) -> Option<Arc<QueueManager>> {
        self.managers.read().await.get(root).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<QueueManager>> {
        self.managers.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionContext;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NoopDriver;

    #[async_trait]
    impl AgentSessionDriver for NoopDriver {
        async fn execute(&self, _ctx: SessionContext) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn get_or_create_returns_the_same_manager() {
        let registry = WorkspaceRegistry::new(
            Arc::new(NoopDriver),
            Arc::new(EventBroadcaster::new()),
        );
        let ws = TempDir::new().unwrap();

        let a = registry.get_or_create(ws.path()).await.unwrap();
        let b = registry.get_or_create(ws.path()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.all().await.len(), 1);
    }

    #[tokio::test]
    async fn different_roots_get_independent_managers() {
        let registry = WorkspaceRegistry::new(
            Arc::new(NoopDriver),
            Arc::new(EventBroadcaster::new()),
        );
        let ws1 = TempDir::new().unwrap();
        let ws2 = TempDir::new().unwrap();

        let a = registry.get_or_create(ws1.path()).await.unwrap();
        let b = registry.get_or_create(ws2.path()).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
