use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Serialized state of one aggregate at `aggregate_version`. Checkpoints and
/// the result buffer reuse this shape, with their own version counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_id: String,
    pub kind: String,
    pub aggregate_version: u64,
    pub state: serde_json::Value,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new<T: Serialize>(
        aggregate_id: &str,
        kind: &str,
        aggregate_version: u64,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            aggregate_id: aggregate_id.to_string(),
            kind: kind.to_string(),
            aggregate_version,
            state: serde_json::to_value(state)?,
            taken_at: Utc::now(),
        })
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state.clone())
    }
}

#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replaces any snapshot stored under the same id and version.
    async fn save(&self, snapshot: Snapshot) -> Result<(), String>;

    /// Newest snapshot, optionally no newer than `at_most`.
    async fn load_latest(&self, aggregate_id: &str, at_most: Option<u64>) -> Result<Option<Snapshot>, String>;

    /// Drops every snapshot older than `version`. `u64::MAX` clears the id.
    async fn prune_before(&self, aggregate_id: &str, version: u64) -> Result<(), String>;
}
