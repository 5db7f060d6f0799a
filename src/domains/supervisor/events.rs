use super::ports::CheckpointRecord;
use crate::domains::work_queue::{Assignment, AssignmentId, ComputationResult, RequeueReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FaultReason {
    HeartbeatTimeout { missed: u32 },
    PauseTimeout,
    StopTimeout,
    TaskFailed(String),
}

impl std::fmt::Display for FaultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultReason::HeartbeatTimeout { missed } => write!(f, "missed {missed} heartbeats"),
            FaultReason::PauseTimeout => f.write_str("no safe point within the pause grace period"),
            FaultReason::StopTimeout => f.write_str("no safe point within the stop grace period"),
            FaultReason::TaskFailed(msg) => write!(f, "task failed: {msg}"),
        }
    }
}

/// What the supervisor did during a command or tick. Drained by the engine,
/// which persists checkpoints, forwards results and raises alerts.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Started {
        slot: usize,
        assignment_id: AssignmentId,
        resumed_from: u64,
    },
    CheckpointWritten(CheckpointRecord),
    Paused {
        slot: usize,
    },
    Completed {
        slot: usize,
        assignment: Assignment,
        result: ComputationResult,
    },
    Requeued {
        slot: usize,
        assignment_id: AssignmentId,
        reason: RequeueReason,
        attempts: u32,
    },
    PermanentlyFailed {
        assignment_id: AssignmentId,
        attempts: u32,
    },
    Faulted {
        slot: usize,
        assignment_id: Option<AssignmentId>,
        reason: FaultReason,
    },
    Deferred {
        slot: usize,
        assignment_id: AssignmentId,
        reason: String,
    },
    DiagnosticFinished {
        slot: usize,
        assignment: Assignment,
        outcome: Result<ComputationResult, String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    SlotIdle {
        slot: usize,
    },
}
