//! In-memory task store for tests and offline development.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::{Bead, BeadStatus};

use super::{TaskStore, TaskStoreError};

/// A task store living entirely in memory.
///
/// Ready ordering follows priority then id, matching what the real store
/// promises. `fail_updates` simulates an unreachable store for error-path
/// tests.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<HashMap<String, Bead>>,
    fail_updates: Mutex<bool>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bead: Bead) {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(bead.id.clone(), bead);
    }

    /// Make subsequent `update_status` calls fail
    pub fn set_fail_updates(&self, fail: bool) {
        *self.fail_updates.lock().unwrap_or_else(|p| p.into_inner()) = fail;
    }

    /// Peek a bead's current status
    pub fn status_of(&self, id: &str) -> Option<BeadStatus> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .map(|b| b.status)
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn list_ready(&self) -> Result<Vec<Bead>, TaskStoreError> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let closed: Vec<String> = inner
            .values()
            .filter(|b| b.status == BeadStatus::Closed)
            .map(|b| b.id.clone())
            .collect();

        let mut ready: Vec<Bead> = inner
            .values()
            .filter(|b| b.status == BeadStatus::Open)
            .filter(|b| b.dependencies.iter().all(|d| closed.contains(d)))
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(ready)
    }

    async fn get(&self, id: &str) -> Result<Option<Bead>, TaskStoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned())
    }

    async fn update_status(&self, id: &str, status: BeadStatus) -> Result<(), TaskStoreError> {
        if *self.fail_updates.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(TaskStoreError::Unavailable("simulated outage".to_string()));
        }
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let bead = inner.get_mut(id).ok_or_else(|| TaskStoreError::NotFound(id.to_string()))?;
        bead.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bead(id: &str, priority: u8, deps: &[&str]) -> Bead {
        Bead {
            id: id.to_string(),
            title: id.to_string(),
            body: String::new(),
            bead_type: "feature".to_string(),
            priority,
            labels: vec![],
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            status: BeadStatus::Open,
        }
    }

    #[tokio::test]
    async fn test_ready_respects_dependencies_and_priority() {
        let store = MemoryTaskStore::new();
        store.insert(bead("bd-1", 2, &[]));
        store.insert(bead("bd-2", 1, &[]));
        store.insert(bead("bd-3", 0, &["bd-1"]));

        let ready: Vec<_> = store.list_ready().await.unwrap().into_iter().map(|b| b.id).collect();
        // bd-3 is blocked on bd-1; lower priority number first
        assert_eq!(ready, vec!["bd-2", "bd-1"]);

        store.update_status("bd-1", BeadStatus::Closed).await.unwrap();
        let ready: Vec<_> = store.list_ready().await.unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(ready, vec!["bd-3", "bd-2"]);
    }

    #[tokio::test]
    async fn test_simulated_outage() {
        let store = MemoryTaskStore::new();
        store.insert(bead("bd-1", 1, &[]));
        store.set_fail_updates(true);
        assert!(store.update_status("bd-1", BeadStatus::Closed).await.is_err());
    }
}
