use crate::common::{EventEnvelope, EventStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory event log for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<String, Vec<EventEnvelope>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stream_len(&self, stream: &str) -> usize {
        self.streams.read().await.get(stream).map_or(0, Vec::len)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, stream: &str, expected_version: u64, events: Vec<EventEnvelope>) -> Result<(), String> {
        let mut streams = self.streams.write().await;
        let log = streams.entry(stream.to_string()).or_default();
        let current = log.len() as u64;
        if current != expected_version {
            return Err(format!(
                "Version mismatch for {}: expected {}, stream has {}",
                stream, expected_version, current
            ));
        }
        log.extend(events);
        Ok(())
    }

    async fn load_stream(&self, stream: &str, from_version: u64) -> Result<Vec<EventEnvelope>, String> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(stream)
            .map(|events| events.iter().skip(from_version as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn load_by_type(&self, event_type: &str, since: Option<DateTime<Utc>>) -> Result<Vec<EventEnvelope>, String> {
        let streams = self.streams.read().await;
        let mut matching: Vec<EventEnvelope> = streams
            .values()
            .flatten()
            .filter(|e| e.matches(event_type, since))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at));
        Ok(matching)
    }
}
