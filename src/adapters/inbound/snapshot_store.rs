use crate::common::{Snapshot, SnapshotStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// In-memory snapshot store for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, BTreeMap<u64, Snapshot>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: Snapshot) -> Result<(), String> {
        self.snapshots
            .write()
            .await
            .entry(snapshot.aggregate_id.clone())
            .or_default()
            .insert(snapshot.aggregate_version, snapshot);
        Ok(())
    }

    async fn load_latest(&self, aggregate_id: &str, at_most: Option<u64>) -> Result<Option<Snapshot>, String> {
        let snapshots = self.snapshots.read().await;
        let Some(versions) = snapshots.get(aggregate_id) else {
            return Ok(None);
        };
        let newest = match at_most {
            Some(max) => versions.range(..=max).next_back(),
            None => versions.iter().next_back(),
        };
        Ok(newest.map(|(_, s)| s.clone()))
    }

    async fn prune_before(&self, aggregate_id: &str, version: u64) -> Result<(), String> {
        if let Some(versions) = self.snapshots.write().await.get_mut(aggregate_id) {
            versions.retain(|v, _| *v >= version);
        }
        Ok(())
    }
}
