use super::ports::ResultSubmission;
use crate::domains::work_queue::AssignmentId;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedResult {
    pub submission: ResultSubmission,
    pub reason: String,
    pub rejected_at: DateTime<Utc>,
}

/// How long an accepted id is remembered for duplicate suppression.
pub const ACCEPTED_RETENTION_DAYS: i64 = 30;

/// Results not yet accepted by the server, plus the ids it has accepted
/// recently and the ones it rejected.
///
/// Recording a result that is already pending, accepted or rejected is a
/// no-op, so replays after a crash cannot double-submit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultBuffer {
    pending: Vec<ResultSubmission>,
    accepted: BTreeMap<AssignmentId, DateTime<Utc>>,
    rejected: Vec<RejectedResult>,
}

impl ResultBuffer {
    /// Returns true when the submission was newly buffered.
    pub fn record(&mut self, submission: ResultSubmission) -> bool {
        if self.accepted.contains_key(&submission.assignment_id) {
            return false;
        }
        if self.is_rejected(&submission.assignment_id) {
            warn!(
                assignment = %submission.assignment_id,
                "result for an assignment the server rejected; not resubmitting"
            );
            return false;
        }
        if let Some(existing) = self
            .pending
            .iter()
            .find(|p| p.assignment_id == submission.assignment_id)
        {
            if !existing.same_payload(&submission) {
                warn!(
                    assignment = %submission.assignment_id,
                    "conflicting result for a buffered assignment; keeping the first"
                );
            }
            return false;
        }
        self.pending.push(submission);
        true
    }

    pub fn pending(&self) -> &[ResultSubmission] {
        &self.pending
    }

    pub fn rejected(&self) -> &[RejectedResult] {
        &self.rejected
    }

    pub fn is_accepted(&self, id: &AssignmentId) -> bool {
        self.accepted.contains_key(id)
    }

    pub fn is_rejected(&self, id: &AssignmentId) -> bool {
        self.rejected.iter().any(|r| r.submission.assignment_id == *id)
    }

    /// Whether a result for `id` is pending, accepted or rejected.
    pub fn knows(&self, id: &AssignmentId) -> bool {
        self.is_accepted(id) || self.is_rejected(id) || self.pending.iter().any(|p| p.assignment_id == *id)
    }

    /// Accepted ids older than the retention window are forgotten here.
    pub fn mark_accepted(&mut self, id: &AssignmentId, now: DateTime<Utc>) {
        self.pending.retain(|p| p.assignment_id != *id);
        self.accepted.insert(id.clone(), now);
        let horizon = now - Duration::days(ACCEPTED_RETENTION_DAYS);
        self.accepted.retain(|_, at| *at >= horizon);
    }

    pub fn accepted_len(&self) -> usize {
        self.accepted.len()
    }

    pub fn mark_rejected(&mut self, id: &AssignmentId, reason: &str, now: DateTime<Utc>) {
        if let Some(pos) = self.pending.iter().position(|p| p.assignment_id == *id) {
            let submission = self.pending.remove(pos);
            self.rejected.push(RejectedResult {
                submission,
                reason: reason.to_string(),
                rejected_at: now,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// The buffer is appended to by the control loop and flushed by the
/// coordinator; one lock covers it.
#[derive(Debug, Clone, Default)]
pub struct SharedResultBuffer {
    inner: Arc<Mutex<ResultBuffer>>,
}

impl SharedResultBuffer {
    pub fn new(buffer: ResultBuffer) -> Self {
        Self {
            inner: Arc::new(Mutex::new(buffer)),
        }
    }

    pub fn record(&self, submission: ResultSubmission) -> bool {
        self.inner.lock().record(submission)
    }

    pub fn pending(&self) -> Vec<ResultSubmission> {
        self.inner.lock().pending().to_vec()
    }

    pub fn is_accepted(&self, id: &AssignmentId) -> bool {
        self.inner.lock().is_accepted(id)
    }

    pub fn knows(&self, id: &AssignmentId) -> bool {
        self.inner.lock().knows(id)
    }

    pub fn mark_accepted(&self, id: &AssignmentId, now: DateTime<Utc>) {
        self.inner.lock().mark_accepted(id, now)
    }

    pub fn mark_rejected(&self, id: &AssignmentId, reason: &str, now: DateTime<Utc>) {
        self.inner.lock().mark_rejected(id, reason, now)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn rejected_count(&self) -> usize {
        self.inner.lock().rejected().len()
    }

    pub fn snapshot(&self) -> ResultBuffer {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::work_queue::{Assignment, ComputationResult, Residue, WorkKind};

    fn submission(id: &str, residue: u64) -> ResultSubmission {
        let assignment = Assignment::manual(WorkKind::LucasLehmer { exponent: 127 });
        let mut s = ResultSubmission::new(
            &assignment,
            ComputationResult::Residue {
                residue: Residue(residue),
                is_prime: false,
            },
            Utc::now(),
        );
        s.assignment_id = AssignmentId::from(id);
        s
    }

    #[test]
    fn duplicate_records_are_ignored() {
        let mut buffer = ResultBuffer::default();
        assert!(buffer.record(submission("a", 1)));
        assert!(!buffer.record(submission("a", 1)));
        assert!(!buffer.record(submission("a", 2)));
        assert_eq!(buffer.len(), 1);

        buffer.mark_accepted(&AssignmentId::from("a"), Utc::now());
        assert!(buffer.is_empty());
        assert!(!buffer.record(submission("a", 1)));
    }

    #[test]
    fn rejected_results_leave_the_pending_list() {
        let mut buffer = ResultBuffer::default();
        buffer.record(submission("a", 1));
        buffer.mark_rejected(&AssignmentId::from("a"), "bad residue", Utc::now());
        assert!(buffer.is_empty());
        assert_eq!(buffer.rejected().len(), 1);
        assert_eq!(buffer.rejected()[0].reason, "bad residue");
    }

    #[test]
    fn rejected_results_are_not_buffered_again() {
        let mut buffer = ResultBuffer::default();
        buffer.record(submission("a", 1));
        buffer.mark_rejected(&AssignmentId::from("a"), "bad residue", Utc::now());
        assert!(!buffer.record(submission("a", 1)));
        assert!(buffer.is_empty());
        assert!(buffer.knows(&AssignmentId::from("a")));
    }

    #[test]
    fn old_acceptances_are_forgotten() {
        let mut buffer = ResultBuffer::default();
        let start = Utc::now();
        buffer.mark_accepted(&AssignmentId::from("old"), start);
        buffer.mark_accepted(&AssignmentId::from("recent"), start + Duration::days(20));
        assert_eq!(buffer.accepted_len(), 2);

        buffer.mark_accepted(
            &AssignmentId::from("new"),
            start + Duration::days(ACCEPTED_RETENTION_DAYS + 1),
        );
        assert_eq!(buffer.accepted_len(), 2);
        assert!(!buffer.is_accepted(&AssignmentId::from("old")));
        assert!(buffer.is_accepted(&AssignmentId::from("recent")));
    }
}
