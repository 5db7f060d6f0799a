use super::assignment::{Assignment, AssignmentId};
use crate::common::DomainEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequeueReason {
    /// Slot faulted or the task failed; counts as a retry.
    Failure,
    /// Graceful stop or resize; not the assignment's fault.
    Stopped,
    /// Start deferred because the grant could not be satisfied.
    Deferred,
    /// Checked out when the process died.
    Recovery,
}

impl RequeueReason {
    pub fn counts_as_retry(&self) -> bool {
        matches!(self, RequeueReason::Failure)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkQueueEvent {
    Enqueued {
        queue_id: String,
        assignment: Assignment,
        seq: u64,
        timestamp: DateTime<Utc>,
    },
    CheckedOut {
        queue_id: String,
        assignment_id: AssignmentId,
        slot: usize,
        timestamp: DateTime<Utc>,
    },
    Requeued {
        queue_id: String,
        assignment_id: AssignmentId,
        reason: RequeueReason,
        timestamp: DateTime<Utc>,
    },
    Acked {
        queue_id: String,
        assignment_id: AssignmentId,
        timestamp: DateTime<Utc>,
    },
    FailedPermanently {
        queue_id: String,
        assignment_id: AssignmentId,
        attempts: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    ReservationRenewed {
        queue_id: String,
        assignment_id: AssignmentId,
        expires_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    MarkedExpired {
        queue_id: String,
        assignment_id: AssignmentId,
        timestamp: DateTime<Utc>,
    },
    Confirmed {
        queue_id: String,
        assignment_id: AssignmentId,
        expires_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    Abandoned {
        queue_id: String,
        assignment_id: AssignmentId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent for WorkQueueEvent {
    fn event_type(&self) -> &'static str {
        match self {
            WorkQueueEvent::Enqueued { .. } => "Enqueued",
            WorkQueueEvent::CheckedOut { .. } => "CheckedOut",
            WorkQueueEvent::Requeued { .. } => "Requeued",
            WorkQueueEvent::Acked { .. } => "Acked",
            WorkQueueEvent::FailedPermanently { .. } => "FailedPermanently",
            WorkQueueEvent::ReservationRenewed { .. } => "ReservationRenewed",
            WorkQueueEvent::MarkedExpired { .. } => "MarkedExpired",
            WorkQueueEvent::Confirmed { .. } => "Confirmed",
            WorkQueueEvent::Abandoned { .. } => "Abandoned",
        }
    }

    fn aggregate_id(&self) -> &str {
        match self {
            WorkQueueEvent::Enqueued { queue_id, .. }
            | WorkQueueEvent::CheckedOut { queue_id, .. }
            | WorkQueueEvent::Requeued { queue_id, .. }
            | WorkQueueEvent::Acked { queue_id, .. }
            | WorkQueueEvent::FailedPermanently { queue_id, .. }
            | WorkQueueEvent::ReservationRenewed { queue_id, .. }
            | WorkQueueEvent::MarkedExpired { queue_id, .. }
            | WorkQueueEvent::Confirmed { queue_id, .. }
            | WorkQueueEvent::Abandoned { queue_id, .. } => queue_id,
        }
    }

    fn schema_version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            WorkQueueEvent::Enqueued { timestamp, .. }
            | WorkQueueEvent::CheckedOut { timestamp, .. }
            | WorkQueueEvent::Requeued { timestamp, .. }
            | WorkQueueEvent::Acked { timestamp, .. }
            | WorkQueueEvent::FailedPermanently { timestamp, .. }
            | WorkQueueEvent::ReservationRenewed { timestamp, .. }
            | WorkQueueEvent::MarkedExpired { timestamp, .. }
            | WorkQueueEvent::Confirmed { timestamp, .. }
            | WorkQueueEvent::Abandoned { timestamp, .. } => *timestamp,
        }
    }
}
