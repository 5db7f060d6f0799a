use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Assignment not found: {id}")]
    AssignmentNotFound { id: String },

    #[error("Invalid command: {reason}")]
    InvalidCommand { reason: String },

    #[error("Invalid schedule: {reason}")]
    InvalidSchedule { reason: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Infrastructure error: {0}")]
    InfrastructureError(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SupervisorError {
    #[error("Grant unavailable for slot {slot}: {reason}")]
    GrantUnavailable { slot: usize, reason: String },

    #[error("Slot {slot} cannot {operation} while {state}")]
    InvalidTransition {
        slot: usize,
        operation: &'static str,
        state: String,
    },

    #[error("Unknown slot {0}")]
    UnknownSlot(usize),

    #[error("Kernel failed to launch task: {0}")]
    Kernel(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinatorError {
    #[error("PrimeNet unreachable: {0}")]
    NetworkUnavailable(String),

    #[error("Result for {assignment_id} rejected: {reason}")]
    SubmissionRejected { assignment_id: String, reason: String },

    #[error("Reservation for {assignment_id} expired")]
    AssignmentExpired { assignment_id: String },

    #[error("Coordinator is in manual mode")]
    ManualMode,

    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum ApplicationError {
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Event store error: {0}")]
    EventStore(String),

    #[error("Snapshot store error: {0}")]
    SnapshotStore(String),

    #[error("Engine is not running")]
    EngineStopped,

    #[error("Configuration error: {0}")]
    Configuration(#[from] anyhow::Error),
}

pub type DomainResult<T> = Result<T, DomainError>;
pub type ApplicationResult<T> = Result<T, ApplicationError>;
