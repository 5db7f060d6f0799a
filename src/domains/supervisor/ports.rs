use crate::domains::resources::SlotGrant;
use crate::domains::work_queue::{Assignment, AssignmentId, ComputationResult, Residue, WorkKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable progress marker for one assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub assignment_id: AssignmentId,
    pub iteration: u64,
    pub residue: Residue,
    pub written_at: DateTime<Utc>,
}

/// Progress as of the task's most recent safe point.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    pub iteration: u64,
    pub total: u64,
    pub residue: Residue,
    pub heartbeat_at: DateTime<Utc>,
}

impl TaskProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.iteration as f64 / self.total as f64).min(1.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Running,
    /// Honoured a pause at a safe point.
    Paused,
    /// Honoured a graceful cancel at a safe point.
    Stopped,
    Completed(ComputationResult),
    Failed(String),
}

/// Control surface of one running computation.
///
/// Pause and graceful cancel are requests; the task honours them at its next
/// safe point and reports the new state through `state()`.
pub trait TaskHandle: Send + Sync {
    fn checkpoint(&self) -> TaskProgress;
    fn state(&self) -> TaskState;
    fn pause(&self);
    fn resume(&self);
    /// `graceful = false` abandons the task without waiting for a safe point.
    fn cancel(&self, graceful: bool);
    /// New memory ceiling, picked up at the next stage boundary.
    fn adjust_memory(&self, memory_bytes: u64);
}

/// Answer to a reference-residue lookup. Producing one costs as much as the
/// self-test itself, so kernels compute it off the caller's thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceResidue {
    Ready(Residue),
    /// Asked again later, the same lookup resolves.
    Computing,
    Unavailable,
}

/// The opaque arithmetic engine.
pub trait ComputeKernel: Send + Sync {
    fn launch(
        &self,
        assignment: &Assignment,
        grant: &SlotGrant,
        resume_from: Option<&CheckpointRecord>,
    ) -> Result<Box<dyn TaskHandle>, String>;

    /// Known-good final residue for a self-test workload. Must not block.
    fn reference_residue(&self, _kind: &WorkKind) -> ReferenceResidue {
        ReferenceResidue::Unavailable
    }
}
