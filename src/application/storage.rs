use crate::common::{
    AggregateRoot, ApplicationError, ApplicationResult, DomainError, EventEnvelope,
    EventStore, Recorder, Snapshot, SnapshotStore,
};
use crate::domains::primenet::{ResultBuffer, SharedResultBuffer};
use crate::domains::supervisor::CheckpointRecord;
use crate::domains::work_queue::{AssignmentId, SharedWorkQueue, WorkQueue, WorkQueueEvent};
use std::sync::Arc;
use tracing::{debug, info};

pub const QUEUE_AGGREGATE_TYPE: &str = "WorkQueue";
pub const CHECKPOINT_AGGREGATE_TYPE: &str = "Checkpoint";
pub const RESULT_BUFFER_TYPE: &str = "ResultBuffer";
pub const RESULT_BUFFER_ID: &str = "result-buffer";
const CLIENT_NAME: &str = "primenet-client";

pub fn checkpoint_key(id: &AssignmentId) -> String {
    format!("checkpoint-{id}")
}

/// Durable state of the engine: the queue's event stream and snapshots,
/// per-assignment checkpoints and the outstanding result buffer.
///
/// Queue events that fail to append stay in a backlog and go out with the
/// next batch, so the stream never skips a version.
pub struct EngineStorage {
    events: Arc<dyn EventStore>,
    snapshots: Arc<dyn SnapshotStore>,
    snapshot_frequency: u64,
    recorder: Recorder,
    queue_id: String,
    committed_version: u64,
    backlog: Vec<EventEnvelope>,
    result_buffer_version: u64,
}

impl EngineStorage {
    pub fn new(events: Arc<dyn EventStore>, snapshots: Arc<dyn SnapshotStore>, snapshot_frequency: u64) -> Self {
        Self {
            events,
            snapshots,
            snapshot_frequency,
            recorder: Recorder::new(CLIENT_NAME),
            queue_id: String::new(),
            committed_version: 0,
            backlog: Vec::new(),
            result_buffer_version: 0,
        }
    }

    pub fn committed_version(&self) -> u64 {
        self.committed_version
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Newest snapshot plus every event recorded after it.
    pub async fn load_queue(&mut self, queue_id: &str, max_retries: u32) -> ApplicationResult<WorkQueue> {
        let snapshot = self
            .snapshots
            .load_latest(queue_id, None)
            .await
            .map_err(ApplicationError::SnapshotStore)?;
        let mut base = match snapshot {
            Some(s) => s.decode::<WorkQueue>().map_err(DomainError::from)?,
            None => WorkQueue::new(queue_id, max_retries),
        };
        base.max_retries = max_retries;

        let envelopes = self
            .events
            .load_stream(queue_id, base.version)
            .await
            .map_err(ApplicationError::EventStore)?;
        let replayed = envelopes.len();
        let events = envelopes
            .iter()
            .map(|e| e.decode::<WorkQueueEvent>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(DomainError::from)?;
        let queue = WorkQueue::replay(base, events)?;

        info!(
            queue = queue_id,
            version = queue.version,
            replayed,
            run = %self.recorder.run_id,
            entries = queue.entries.len(),
            "work queue loaded"
        );
        self.queue_id = queue_id.to_string();
        self.committed_version = queue.version;
        self.backlog.clear();
        Ok(queue)
    }

    /// Append the queue's uncommitted events, snapshotting every
    /// `snapshot_frequency` events. Returns how many events were written.
    pub async fn persist_queue(&mut self, queue: &SharedWorkQueue) -> ApplicationResult<usize> {
        let frequency = self.snapshot_frequency;
        let (events, snapshot) = queue.with(|q| {
            let events = q.take_uncommitted();
            let before = q.version - events.len() as u64;
            let crosses = frequency > 0 && !events.is_empty() && q.version / frequency > before / frequency;
            let snapshot = if crosses {
                Some(Snapshot::new(&q.id, QUEUE_AGGREGATE_TYPE, q.version, &*q))
            } else {
                None
            };
            (events, snapshot)
        });

        for event in &events {
            let envelope = EventEnvelope::new(event, QUEUE_AGGREGATE_TYPE, &self.recorder)
                .map_err(DomainError::from)?;
            self.backlog.push(envelope);
        }
        if self.backlog.is_empty() {
            return Ok(0);
        }

        let written = self.backlog.len();
        self.events
            .append(&self.queue_id, self.committed_version, self.backlog.clone())
            .await
            .map_err(ApplicationError::EventStore)?;
        self.committed_version += written as u64;
        self.backlog.clear();

        if let Some(snapshot) = snapshot {
            let snapshot = snapshot.map_err(DomainError::from)?;
            let version = snapshot.aggregate_version;
            self.snapshots
                .save(snapshot)
                .await
                .map_err(ApplicationError::SnapshotStore)?;
            self.snapshots
                .prune_before(&self.queue_id, version)
                .await
                .map_err(ApplicationError::SnapshotStore)?;
            debug!(version, "work queue snapshot written");
        }
        Ok(written)
    }

    pub async fn save_checkpoint(&self, record: &CheckpointRecord) -> ApplicationResult<()> {
        let key = checkpoint_key(&record.assignment_id);
        let snapshot =
            Snapshot::new(&key, CHECKPOINT_AGGREGATE_TYPE, record.iteration, record).map_err(DomainError::from)?;
        self.snapshots
            .save(snapshot)
            .await
            .map_err(ApplicationError::SnapshotStore)?;
        self.snapshots
            .prune_before(&key, record.iteration)
            .await
            .map_err(ApplicationError::SnapshotStore)
    }

    pub async fn load_checkpoint(&self, id: &AssignmentId) -> ApplicationResult<Option<CheckpointRecord>> {
        let snapshot = self
            .snapshots
            .load_latest(&checkpoint_key(id), None)
            .await
            .map_err(ApplicationError::SnapshotStore)?;
        match snapshot {
            Some(s) => Ok(Some(s.decode().map_err(DomainError::from)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_checkpoint(&self, id: &AssignmentId) -> ApplicationResult<()> {
        self.snapshots
            .prune_before(&checkpoint_key(id), u64::MAX)
            .await
            .map_err(ApplicationError::SnapshotStore)
    }

    /// Checkpoints for every assignment still in the queue.
    pub async fn load_checkpoints(&self, queue: &SharedWorkQueue) -> ApplicationResult<Vec<CheckpointRecord>> {
        let ids: Vec<AssignmentId> = queue.with(|q| q.entries.iter().map(|e| e.assignment.id.clone()).collect());
        let mut records = Vec::new();
        for id in ids {
            if let Some(record) = self.load_checkpoint(&id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub async fn save_results(&mut self, results: &SharedResultBuffer) -> ApplicationResult<()> {
        let version = self.result_buffer_version + 1;
        let snapshot = Snapshot::new(RESULT_BUFFER_ID, RESULT_BUFFER_TYPE, version, &results.snapshot())
            .map_err(DomainError::from)?;
        self.snapshots
            .save(snapshot)
            .await
            .map_err(ApplicationError::SnapshotStore)?;
        self.result_buffer_version = version;
        self.snapshots
            .prune_before(RESULT_BUFFER_ID, version)
            .await
            .map_err(ApplicationError::SnapshotStore)
    }

    pub async fn load_results(&mut self) -> ApplicationResult<ResultBuffer> {
        let snapshot = self
            .snapshots
            .load_latest(RESULT_BUFFER_ID, None)
            .await
            .map_err(ApplicationError::SnapshotStore)?;
        match snapshot {
            Some(s) => {
                self.result_buffer_version = s.aggregate_version;
                Ok(s.decode().map_err(DomainError::from)?)
            }
            None => Ok(ResultBuffer::default()),
        }
    }
}
