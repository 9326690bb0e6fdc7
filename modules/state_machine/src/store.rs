use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use flowkit::JsonMap;

use crate::instance::{InstanceSnapshot, TransitionRecord};

/// Persistence adapter for workflow instances. Attached stores get a
/// write-through on every successful transition; persistence is advisory —
/// the in-memory instance is authoritative.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn save(&self, instance: &InstanceSnapshot) -> anyhow::Result<()>;

    async fn load(&self, id: &str) -> anyhow::Result<Option<InstanceSnapshot>>;

    /// Instance ids, optionally filtered by definition name.
    async fn list(&self, definition: Option<&str>) -> anyhow::Result<Vec<String>>;

    /// Optional transition log write; default is a no-op.
    async fn record_transition(
        &self,
        _instance_id: &str,
        _record: &TransitionRecord,
        _payload: &JsonMap,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory store, useful for tests and single-run deployments.
#[derive(Default)]
pub struct MemoryInstanceStore {
    instances: RwLock<HashMap<String, InstanceSnapshot>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn save(&self, instance: &InstanceSnapshot) -> anyhow::Result<()> {
        self.instances
            .write()
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> anyhow::Result<Option<InstanceSnapshot>> {
        Ok(self.instances.read().get(id).cloned())
    }

    async fn list(&self, definition: Option<&str>) -> anyhow::Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .instances
            .read()
            .values()
            .filter(|i| definition.is_none_or(|d| i.definition == d))
            .map(|i| i.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_load_list_round_trip() {
        let store = MemoryInstanceStore::new();
        let inst = InstanceSnapshot::new("i-1", "order", "new", JsonMap::new());
        store.save(&inst).await.unwrap();

        let loaded = store.load("i-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, "new");

        assert_eq!(store.list(None).await.unwrap(), vec!["i-1"]);
        assert_eq!(store.list(Some("order")).await.unwrap(), vec!["i-1"]);
        assert!(store.list(Some("other")).await.unwrap().is_empty());
    }
}
