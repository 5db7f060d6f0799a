use crate::domains::work_queue::{Assignment, AssignmentId, ComputationResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A finished result waiting to be reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSubmission {
    pub assignment_id: AssignmentId,
    pub work: String,
    pub exponent: u64,
    pub result: ComputationResult,
    pub computed_at: DateTime<Utc>,
}

impl ResultSubmission {
    pub fn new(assignment: &Assignment, result: ComputationResult, computed_at: DateTime<Utc>) -> Self {
        Self {
            assignment_id: assignment.id.clone(),
            work: assignment.kind.label().to_string(),
            exponent: assignment.kind.exponent(),
            result,
            computed_at,
        }
    }

    /// Same assignment and same payload. The timestamp is not part of the payload.
    pub fn same_payload(&self, other: &ResultSubmission) -> bool {
        self.assignment_id == other.assignment_id && self.result == other.result
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResponse {
    Accepted,
    /// Server asked us to try again later.
    Retry(String),
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed { expires_at: DateTime<Utc> },
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("credentials refused")]
    Unauthorized,
    #[error("unexpected response: {0}")]
    Protocol(String),
}

/// Wire side of the work distribution protocol.
#[async_trait]
pub trait PrimeNetTransport: Send + Sync {
    async fn ping(&self) -> Result<(), TransportError>;

    async fn get_assignments(&self, count: usize) -> Result<Vec<Assignment>, TransportError>;

    /// Must be safe to call twice with the same submission.
    async fn submit_result(&self, submission: &ResultSubmission) -> Result<SubmitResponse, TransportError>;

    async fn renew(&self, id: &AssignmentId, fraction_done: f64) -> Result<RenewOutcome, TransportError>;
}

/// Locally supplied work used in manual mode.
pub trait ManualWorkSource: Send + Sync {
    /// Remove up to `max` assignments from the source.
    fn draw(&self, max: usize) -> Result<Vec<Assignment>, String>;
}
