use super::ports::{TaskHandle, TaskProgress};
use crate::domains::work_queue::{Assignment, AssignmentId, Residue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Idle,
    Running,
    Paused,
    Stopping,
    Faulted,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotState::Idle => "idle",
            SlotState::Running => "running",
            SlotState::Paused => "paused",
            SlotState::Stopping => "stopping",
            SlotState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Operator,
    Resize,
    Diagnostics,
    Shutdown,
    /// The server dropped the reservation; the work waits for reconfirmation.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum PendingControl {
    Pause { requested_at: DateTime<Utc> },
    Stop { requested_at: DateTime<Utc>, reason: StopReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlotProgress {
    pub iteration: u64,
    pub total: u64,
    pub residue: Residue,
}

impl SlotProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.iteration as f64 / self.total as f64).min(1.0)
    }
}

impl From<&TaskProgress> for SlotProgress {
    fn from(p: &TaskProgress) -> Self {
        Self {
            iteration: p.iteration,
            total: p.total,
            residue: p.residue,
        }
    }
}

/// One supervised execution context.
pub struct WorkerSlot {
    pub index: usize,
    pub state: SlotState,
    pub cpus: Vec<usize>,
    pub memory_bytes: u64,
    pub assignment: Option<Assignment>,
    pub progress: Option<SlotProgress>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub fault: Option<String>,
    pub faulted_at: Option<DateTime<Utc>>,
    pub(crate) handle: Option<Box<dyn TaskHandle>>,
    pub(crate) pending: Option<PendingControl>,
}

impl WorkerSlot {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: SlotState::Idle,
            cpus: Vec::new(),
            memory_bytes: 0,
            assignment: None,
            progress: None,
            last_heartbeat: None,
            started_at: None,
            last_checkpoint_at: None,
            fault: None,
            faulted_at: None,
            handle: None,
            pending: None,
        }
    }

    /// Holds resources: anything but Idle and Faulted.
    pub fn is_active(&self) -> bool {
        matches!(self.state, SlotState::Running | SlotState::Paused | SlotState::Stopping)
    }

    pub fn assignment_id(&self) -> Option<&AssignmentId> {
        self.assignment.as_ref().map(|a| &a.id)
    }

    pub fn fraction_done(&self) -> f64 {
        self.progress.map(|p| p.fraction()).unwrap_or(0.0)
    }

    pub fn view(&self) -> SlotView {
        SlotView {
            index: self.index,
            state: self.state,
            cpus: self.cpus.clone(),
            memory_bytes: self.memory_bytes,
            assignment_id: self.assignment.as_ref().map(|a| a.id.clone()),
            work: self.assignment.as_ref().map(|a| a.kind.label().to_string()),
            exponent: self.assignment.as_ref().map(|a| a.kind.exponent()),
            progress: self.progress,
            last_heartbeat: self.last_heartbeat,
            fault: self.fault.clone(),
        }
    }

    /// Drop everything tied to the finished assignment.
    pub(crate) fn clear(&mut self) {
        self.state = SlotState::Idle;
        self.assignment = None;
        self.progress = None;
        self.last_heartbeat = None;
        self.started_at = None;
        self.last_checkpoint_at = None;
        self.handle = None;
        self.pending = None;
    }
}

impl fmt::Debug for WorkerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSlot")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("assignment", &self.assignment_id())
            .field("progress", &self.progress)
            .finish()
    }
}

/// Read-only copy of a slot for status consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotView {
    pub index: usize,
    pub state: SlotState,
    pub cpus: Vec<usize>,
    pub memory_bytes: u64,
    pub assignment_id: Option<AssignmentId>,
    pub work: Option<String>,
    pub exponent: Option<u64>,
    pub progress: Option<SlotProgress>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub fault: Option<String>,
}
