use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub trait DomainEvent: Send + Sync + Clone {
    fn event_type(&self) -> &'static str;
    fn aggregate_id(&self) -> &str;
    /// Payload layout version, bumped when a variant's fields change.
    fn schema_version(&self) -> u32;
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Identifies the client process that wrote an event. A fresh `run_id` is
/// drawn on every start, so replayed streams show which run did what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recorder {
    pub client: String,
    pub run_id: Uuid,
}

impl Recorder {
    pub fn new(client: &str) -> Self {
        Self {
            client: client.to_string(),
            run_id: Uuid::new_v4(),
        }
    }
}

/// One stored event. Its position in the stream is its version, so the
/// envelope does not carry one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub stream: String,
    pub stream_kind: String,
    pub event_type: String,
    pub schema_version: u32,
    pub payload: serde_json::Value,
    pub recorded_by: Recorder,
    pub occurred_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new<E: DomainEvent + Serialize>(
        event: &E,
        stream_kind: &str,
        recorder: &Recorder,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            stream: event.aggregate_id().to_string(),
            stream_kind: stream_kind.to_string(),
            event_type: event.event_type().to_string(),
            schema_version: event.schema_version(),
            payload: serde_json::to_value(event)?,
            recorded_by: recorder.clone(),
            occurred_at: event.occurred_at(),
        })
    }

    pub fn decode<E: for<'de> Deserialize<'de>>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn matches(&self, event_type: &str, since: Option<DateTime<Utc>>) -> bool {
        self.event_type == event_type && since.map_or(true, |ts| self.occurred_at >= ts)
    }
}

/// Append-only event log keyed by stream. Versions are zero-based positions.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Fails without writing anything when the stream length differs from
    /// `expected_version`.
    async fn append(&self, stream: &str, expected_version: u64, events: Vec<EventEnvelope>) -> Result<(), String>;

    async fn load_stream(&self, stream: &str, from_version: u64) -> Result<Vec<EventEnvelope>, String>;

    /// Events of one type across every stream, oldest first.
    async fn load_by_type(&self, event_type: &str, since: Option<DateTime<Utc>>) -> Result<Vec<EventEnvelope>, String>;
}
