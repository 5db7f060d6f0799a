use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    GrantUnavailable,
    HeartbeatTimeout,
    SlotFaulted,
    PermanentFailure,
    AssignmentExpired,
    SubmissionRejected,
    HardwareInstability,
    NetworkUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A condition worth an operator's attention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub raised_at: DateTime<Utc>,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
}

impl Alert {
    pub fn new(kind: AlertKind, severity: Severity, message: impl Into<String>, raised_at: DateTime<Utc>) -> Self {
        Self {
            raised_at,
            kind,
            severity,
            message: message.into(),
        }
    }

    pub fn warning(kind: AlertKind, message: impl Into<String>, raised_at: DateTime<Utc>) -> Self {
        Self::new(kind, Severity::Warning, message, raised_at)
    }

    pub fn critical(kind: AlertKind, message: impl Into<String>, raised_at: DateTime<Utc>) -> Self {
        Self::new(kind, Severity::Critical, message, raised_at)
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {:?}: {}", self.severity, self.kind, self.message)
    }
}
