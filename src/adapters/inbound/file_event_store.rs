use crate::common::{EventEnvelope, EventStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// JSON Lines event log, one file per aggregate.
///
/// The line number of an event is its version. Appends are serialized and
/// checked against the expected version, then synced to disk before returning.
pub struct FileEventStore {
    base_path: PathBuf,
    append_lock: Mutex<()>,
}

impl FileEventStore {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Self {
        Self {
            base_path: base_path.into(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn stream_path(&self, stream: &str) -> PathBuf {
        self.base_path.join(format!("{}.jsonl", stream))
    }

    async fn ensure_base_dir(&self) -> Result<(), String> {
        tokio::fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| format!("Failed to create event store directory: {}", e))
    }

    async fn read_stream(path: &Path) -> Result<Vec<EventEnvelope>, String> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let file = File::open(path)
            .await
            .map_err(|e| format!("Failed to open event file {}: {}", path.display(), e))?;
        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();
        let mut line_number = 0u64;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| format!("Failed to read line: {}", e))?
        {
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            let event: EventEnvelope = serde_json::from_str(&line).map_err(|e| {
                format!("Failed to deserialize event at {}:{}: {}", path.display(), line_number, e)
            })?;
            events.push(event);
        }
        Ok(events)
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn append(&self, stream: &str, expected_version: u64, events: Vec<EventEnvelope>) -> Result<(), String> {
        if events.is_empty() {
            return Ok(());
        }
        let _guard = self.append_lock.lock().await;
        self.ensure_base_dir().await?;
        let path = self.stream_path(stream);

        let current = Self::read_stream(&path).await?.len() as u64;
        if current != expected_version {
            return Err(format!(
                "Version mismatch for {}: expected {}, stream has {}",
                stream, expected_version, current
            ));
        }

        let mut buf = Vec::new();
        for event in &events {
            let line = serde_json::to_string(event).map_err(|e| format!("Failed to serialize event: {}", e))?;
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| format!("Failed to open event file {}: {}", path.display(), e))?;
        file.write_all(&buf)
            .await
            .map_err(|e| format!("Failed to write events: {}", e))?;
        file.sync_data()
            .await
            .map_err(|e| format!("Failed to sync event file: {}", e))?;
        Ok(())
    }

    async fn load_stream(&self, stream: &str, from_version: u64) -> Result<Vec<EventEnvelope>, String> {
        let events = Self::read_stream(&self.stream_path(stream)).await?;
        Ok(events.into_iter().skip(from_version as usize).collect())
    }

    async fn load_by_type(&self, event_type: &str, since: Option<DateTime<Utc>>) -> Result<Vec<EventEnvelope>, String> {
        self.ensure_base_dir().await?;
        let mut matching = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.base_path)
            .await
            .map_err(|e| format!("Failed to read directory: {}", e))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| format!("Failed to read directory entry: {}", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                continue;
            }
            matching.extend(
                Self::read_stream(&path)
                    .await?
                    .into_iter()
                    .filter(|e| e.matches(event_type, since)),
            );
        }
        matching.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at));
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Recorder;
    use crate::domains::work_queue::{Assignment, WorkKind, WorkQueueEvent};
    use tempfile::TempDir;

    fn enqueued(seq: u64) -> EventEnvelope {
        let event = WorkQueueEvent::Enqueued {
            queue_id: "queue".to_string(),
            assignment: Assignment::manual(WorkKind::LucasLehmer { exponent: 127 }),
            seq,
            timestamp: Utc::now(),
        };
        EventEnvelope::new(&event, "WorkQueue", &Recorder::new("test")).unwrap()
    }

    #[tokio::test]
    async fn appends_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("events");
        let store = FileEventStore::new(&path);
        store.append("queue", 0, vec![enqueued(0), enqueued(1)]).await.unwrap();
        store.append("queue", 2, vec![enqueued(2)]).await.unwrap();

        let reopened = FileEventStore::new(&path);
        let all = reopened.load_stream("queue", 0).await.unwrap();
        assert_eq!(all.len(), 3);
        let tail = reopened.load_stream("queue", 2).await.unwrap();
        let decoded: WorkQueueEvent = tail[0].decode().unwrap();
        assert!(matches!(decoded, WorkQueueEvent::Enqueued { seq: 2, .. }));

        let by_type = reopened.load_by_type("Enqueued", None).await.unwrap();
        assert_eq!(by_type.len(), 3);
    }

    #[tokio::test]
    async fn stale_expected_version_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileEventStore::new(temp_dir.path());
        store.append("queue", 0, vec![enqueued(0)]).await.unwrap();
        let err = store.append("queue", 0, vec![enqueued(1)]).await.unwrap_err();
        assert!(err.contains("Version mismatch"));
        assert_eq!(store.load_stream("queue", 0).await.unwrap().len(), 1);
    }
}
