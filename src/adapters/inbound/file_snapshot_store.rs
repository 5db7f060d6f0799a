use crate::common::{Snapshot, SnapshotStore};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Snapshots as JSON files: `<base>/<aggregate id>/<version>.json`.
///
/// Each file is written to a temporary name, synced, then renamed into place,
/// so a crash leaves either the old snapshot or the new one.
pub struct FileSnapshotStore {
    base_path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn aggregate_dir(&self, aggregate_id: &str) -> PathBuf {
        self.base_path.join(aggregate_id)
    }

    async fn versions(dir: &Path) -> Result<Vec<u64>, String> {
        if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| format!("Failed to read snapshot directory {}: {}", dir.display(), e))?;
        let mut versions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| format!("Failed to read snapshot entry: {}", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Some(version) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: Snapshot) -> Result<(), String> {
        let dir = self.aggregate_dir(&snapshot.aggregate_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("Failed to create snapshot directory {}: {}", dir.display(), e))?;

        let body = serde_json::to_vec_pretty(&snapshot).map_err(|e| format!("Failed to serialize snapshot: {}", e))?;
        let target = dir.join(format!("{}.json", snapshot.aggregate_version));
        let staging = dir.join(format!(".{}.json.tmp", snapshot.aggregate_version));

        let mut file = tokio::fs::File::create(&staging)
            .await
            .map_err(|e| format!("Failed to create {}: {}", staging.display(), e))?;
        file.write_all(&body)
            .await
            .map_err(|e| format!("Failed to write snapshot: {}", e))?;
        file.sync_all()
            .await
            .map_err(|e| format!("Failed to sync snapshot: {}", e))?;
        drop(file);

        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|e| format!("Failed to move snapshot into place: {}", e))
    }

    async fn load_latest(&self, aggregate_id: &str, at_most: Option<u64>) -> Result<Option<Snapshot>, String> {
        let dir = self.aggregate_dir(aggregate_id);
        let newest = Self::versions(&dir)
            .await?
            .into_iter()
            .filter(|v| at_most.map_or(true, |max| *v <= max))
            .last();
        let Some(version) = newest else {
            return Ok(None);
        };
        let path = dir.join(format!("{}.json", version));
        let body = tokio::fs::read(&path)
            .await
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))
    }

    async fn prune_before(&self, aggregate_id: &str, version: u64) -> Result<(), String> {
        let dir = self.aggregate_dir(aggregate_id);
        for old in Self::versions(&dir).await?.into_iter().filter(|v| *v < version) {
            let path = dir.join(format!("{}.json", old));
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| format!("Failed to remove {}: {}", path.display(), e))?;
        }
        Ok(())
    }
}
