use super::assignment::{Assignment, AssignmentId, WorkKind};
use super::events::{RequeueReason, WorkQueueEvent};
use crate::common::{AggregateRoot, DomainError, DomainResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Which work a slot can take, based on its memory grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotClass {
    Standard,
    HighMemory,
}

impl SlotClass {
    pub fn for_memory(memory_bytes: u64, high_memory_threshold: u64) -> Self {
        if memory_bytes >= high_memory_threshold {
            SlotClass::HighMemory
        } else {
            SlotClass::Standard
        }
    }

    pub fn accepts(&self, kind: &WorkKind) -> bool {
        match self {
            SlotClass::HighMemory => true,
            SlotClass::Standard => !kind.needs_high_memory(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryState {
    Queued,
    CheckedOut { slot: usize, since: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub assignment: Assignment,
    pub seq: u64,
    pub attempts: u32,
    pub state: EntryState,
    pub reservation_expires_at: Option<DateTime<Utc>>,
    /// Reservation lapsed; held back from checkout until the server confirms it.
    pub awaiting_confirmation: bool,
}

impl QueueEntry {
    pub fn is_checked_out(&self) -> bool {
        matches!(self.state, EntryState::CheckedOut { .. })
    }

    fn available(&self) -> bool {
        self.state == EntryState::Queued && !self.awaiting_confirmation
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedAssignment {
    pub assignment: Assignment,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    Requeued { attempts: u32 },
    FailedPermanently { attempts: u32 },
}

/// Persisted queue of assignments.
///
/// An assignment is either queued or checked out by exactly one slot. Checkout
/// picks the highest priority first and the lowest sequence number within a
/// priority tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkQueue {
    pub id: String,
    pub entries: Vec<QueueEntry>,
    pub failed: Vec<FailedAssignment>,
    pub next_seq: u64,
    pub max_retries: u32,
    pub version: u64,
    /// Most recently acked ids, oldest first, so a late duplicate of
    /// finished work is not queued again.
    #[serde(default)]
    pub recently_acked: VecDeque<AssignmentId>,
    #[serde(skip)]
    uncommitted_events: Vec<WorkQueueEvent>,
}

const RECENTLY_ACKED_LIMIT: usize = 512;

impl WorkQueue {
    pub fn new(id: impl Into<String>, max_retries: u32) -> Self {
        Self {
            id: id.into(),
            entries: Vec::new(),
            failed: Vec::new(),
            next_seq: 0,
            max_retries,
            version: 0,
            recently_acked: VecDeque::new(),
            uncommitted_events: Vec::new(),
        }
    }

    pub fn enqueue(&mut self, assignment: Assignment) -> DomainResult<()> {
        if assignment.kind.is_diagnostic() {
            return Err(DomainError::InvalidCommand {
                reason: format!("{} work is never queued", assignment.kind.label()),
            });
        }
        if self.contains(&assignment.id) {
            return Err(DomainError::InvalidCommand {
                reason: format!("Assignment {} is already known", assignment.id),
            });
        }
        let event = WorkQueueEvent::Enqueued {
            queue_id: self.id.clone(),
            seq: self.next_seq,
            assignment,
            timestamp: Utc::now(),
        };
        self.record(event)
    }

    /// Hand the best available assignment to `slot`, or `None` when nothing fits.
    pub fn checkout(&mut self, class: SlotClass, slot: usize) -> Option<Assignment> {
        let best = self
            .entries
            .iter()
            .filter(|e| e.available() && class.accepts(&e.assignment.kind))
            .max_by(|a, b| {
                a.assignment
                    .priority
                    .cmp(&b.assignment.priority)
                    .then_with(|| b.seq.cmp(&a.seq))
            })?;
        let assignment = best.assignment.clone();
        let event = WorkQueueEvent::CheckedOut {
            queue_id: self.id.clone(),
            assignment_id: assignment.id.clone(),
            slot,
            timestamp: Utc::now(),
        };
        self.record(event).ok()?;
        Some(assignment)
    }

    pub fn requeue(&mut self, id: &AssignmentId, reason: RequeueReason) -> DomainResult<RequeueOutcome> {
        let entry = self.checked_out_entry(id)?;
        let attempts = entry.attempts + u32::from(reason.counts_as_retry());
        self.record(WorkQueueEvent::Requeued {
            queue_id: self.id.clone(),
            assignment_id: id.clone(),
            reason,
            timestamp: Utc::now(),
        })?;
        if attempts > self.max_retries {
            self.record(WorkQueueEvent::FailedPermanently {
                queue_id: self.id.clone(),
                assignment_id: id.clone(),
                attempts,
                reason: format!("gave up after {attempts} failed attempts"),
                timestamp: Utc::now(),
            })?;
            return Ok(RequeueOutcome::FailedPermanently { attempts });
        }
        Ok(RequeueOutcome::Requeued { attempts })
    }

    pub fn ack(&mut self, id: &AssignmentId) -> DomainResult<()> {
        self.checked_out_entry(id)?;
        self.record(WorkQueueEvent::Acked {
            queue_id: self.id.clone(),
            assignment_id: id.clone(),
            timestamp: Utc::now(),
        })
    }

    pub fn renew_reservation(&mut self, id: &AssignmentId, expires_at: DateTime<Utc>) -> DomainResult<()> {
        self.entry_or_err(id)?;
        self.record(WorkQueueEvent::ReservationRenewed {
            queue_id: self.id.clone(),
            assignment_id: id.clone(),
            expires_at,
            timestamp: Utc::now(),
        })
    }

    /// Reservation lapsed: take the work back (if a slot holds it) and hold it
    /// until the server confirms it is still ours.
    pub fn expire(&mut self, id: &AssignmentId) -> DomainResult<()> {
        self.entry_or_err(id)?;
        self.record(WorkQueueEvent::MarkedExpired {
            queue_id: self.id.clone(),
            assignment_id: id.clone(),
            timestamp: Utc::now(),
        })
    }

    pub fn confirm(&mut self, id: &AssignmentId, expires_at: DateTime<Utc>) -> DomainResult<()> {
        self.entry_or_err(id)?;
        self.record(WorkQueueEvent::Confirmed {
            queue_id: self.id.clone(),
            assignment_id: id.clone(),
            expires_at,
            timestamp: Utc::now(),
        })
    }

    pub fn abandon(&mut self, id: &AssignmentId, reason: &str) -> DomainResult<()> {
        let entry = self.entry_or_err(id)?;
        if entry.is_checked_out() {
            return Err(DomainError::InvalidCommand {
                reason: format!("Assignment {id} is checked out; stop its slot first"),
            });
        }
        self.record(WorkQueueEvent::Abandoned {
            queue_id: self.id.clone(),
            assignment_id: id.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// After a restart nothing is running; return every checkout to the queue.
    pub fn recover_checkouts(&mut self) -> DomainResult<Vec<AssignmentId>> {
        let stale: Vec<AssignmentId> = self
            .entries
            .iter()
            .filter(|e| e.is_checked_out())
            .map(|e| e.assignment.id.clone())
            .collect();
        for id in &stale {
            self.requeue(id, RequeueReason::Recovery)?;
        }
        Ok(stale)
    }

    /// Queued, checked out, set aside, or recently finished.
    pub fn contains(&self, id: &AssignmentId) -> bool {
        self.entry(id).is_some()
            || self.failed.iter().any(|f| f.assignment.id == *id)
            || self.recently_acked.contains(id)
    }

    pub fn entry(&self, id: &AssignmentId) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.assignment.id == *id)
    }

    /// Assignments waiting for a slot.
    pub fn depth(&self) -> usize {
        self.entries.iter().filter(|e| e.state == EntryState::Queued).count()
    }

    pub fn checked_out(&self) -> usize {
        self.entries.iter().filter(|e| e.is_checked_out()).count()
    }

    pub fn awaiting_confirmation(&self) -> Vec<AssignmentId> {
        self.entries
            .iter()
            .filter(|e| e.awaiting_confirmation)
            .map(|e| e.assignment.id.clone())
            .collect()
    }

    /// Entries with a remote reservation that lapses before `horizon`.
    pub fn reservations_due(&self, horizon: DateTime<Utc>) -> Vec<(AssignmentId, DateTime<Utc>)> {
        self.entries
            .iter()
            .filter(|e| !e.awaiting_confirmation)
            .filter_map(|e| e.reservation_expires_at.map(|at| (e.assignment.id.clone(), at)))
            .filter(|(_, at)| *at <= horizon)
            .collect()
    }

    fn entry_or_err(&self, id: &AssignmentId) -> DomainResult<&QueueEntry> {
        self.entry(id).ok_or_else(|| DomainError::AssignmentNotFound { id: id.to_string() })
    }

    fn checked_out_entry(&self, id: &AssignmentId) -> DomainResult<&QueueEntry> {
        let entry = self.entry_or_err(id)?;
        if !entry.is_checked_out() {
            return Err(DomainError::InvalidCommand {
                reason: format!("Assignment {id} is not checked out"),
            });
        }
        Ok(entry)
    }

    fn entry_mut(&mut self, id: &AssignmentId) -> DomainResult<&mut QueueEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.assignment.id == *id)
            .ok_or_else(|| DomainError::AssignmentNotFound { id: id.to_string() })
    }

    fn remove(&mut self, id: &AssignmentId) -> DomainResult<QueueEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.assignment.id == *id)
            .ok_or_else(|| DomainError::AssignmentNotFound { id: id.to_string() })?;
        Ok(self.entries.remove(pos))
    }
}

impl AggregateRoot for WorkQueue {
    type Event = WorkQueueEvent;

    fn aggregate_id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn apply(&mut self, event: &Self::Event) -> DomainResult<()> {
        match event {
            WorkQueueEvent::Enqueued { assignment, seq, .. } => {
                let expires = match assignment.source {
                    super::assignment::AssignmentSource::PrimeNet => assignment.deadline,
                    _ => None,
                };
                self.entries.push(QueueEntry {
                    assignment: assignment.clone(),
                    seq: *seq,
                    attempts: 0,
                    state: EntryState::Queued,
                    reservation_expires_at: expires,
                    awaiting_confirmation: false,
                });
                self.next_seq = self.next_seq.max(seq + 1);
            }
            WorkQueueEvent::CheckedOut { assignment_id, slot, timestamp, .. } => {
                let entry = self.entry_mut(assignment_id)?;
                entry.state = EntryState::CheckedOut {
                    slot: *slot,
                    since: *timestamp,
                };
            }
            WorkQueueEvent::Requeued { assignment_id, reason, .. } => {
                let entry = self.entry_mut(assignment_id)?;
                entry.state = EntryState::Queued;
                if reason.counts_as_retry() {
                    entry.attempts += 1;
                }
            }
            WorkQueueEvent::Acked { assignment_id, .. } => {
                self.remove(assignment_id)?;
                self.recently_acked.push_back(assignment_id.clone());
                if self.recently_acked.len() > RECENTLY_ACKED_LIMIT {
                    self.recently_acked.pop_front();
                }
            }
            WorkQueueEvent::FailedPermanently { assignment_id, attempts, reason, timestamp, .. } => {
                let entry = self.remove(assignment_id)?;
                self.failed.push(FailedAssignment {
                    assignment: entry.assignment,
                    attempts: *attempts,
                    reason: reason.clone(),
                    failed_at: *timestamp,
                });
            }
            WorkQueueEvent::ReservationRenewed { assignment_id, expires_at, .. } => {
                self.entry_mut(assignment_id)?.reservation_expires_at = Some(*expires_at);
            }
            WorkQueueEvent::MarkedExpired { assignment_id, .. } => {
                let entry = self.entry_mut(assignment_id)?;
                entry.state = EntryState::Queued;
                entry.awaiting_confirmation = true;
            }
            WorkQueueEvent::Confirmed { assignment_id, expires_at, .. } => {
                let entry = self.entry_mut(assignment_id)?;
                entry.awaiting_confirmation = false;
                entry.reservation_expires_at = Some(*expires_at);
            }
            WorkQueueEvent::Abandoned { assignment_id, .. } => {
                self.remove(assignment_id)?;
            }
        }
        self.version += 1;
        Ok(())
    }

    fn pending_mut(&mut self) -> &mut Vec<Self::Event> {
        &mut self.uncommitted_events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::work_queue::assignment::{AssignmentSource, Priority};

    fn ll(id: &str, priority: Priority) -> Assignment {
        Assignment::new(
            AssignmentId::from(id),
            WorkKind::LucasLehmer { exponent: 127 },
            priority,
            AssignmentSource::Manual,
        )
    }

    #[test]
    fn checkout_prefers_priority_then_fifo() {
        let mut queue = WorkQueue::new("q", 3);
        queue.enqueue(ll("a", Priority::Normal)).unwrap();
        queue.enqueue(ll("b", Priority::High)).unwrap();
        queue.enqueue(ll("c", Priority::Normal)).unwrap();

        let order: Vec<String> = (0..3)
            .map(|slot| queue.checkout(SlotClass::Standard, slot).unwrap().id.to_string())
            .collect();
        assert_eq!(order, vec!["b", "a", "c"]);
        assert!(queue.checkout(SlotClass::Standard, 3).is_none());
    }

    #[test]
    fn checked_out_work_is_invisible_until_requeued() {
        let mut queue = WorkQueue::new("q", 3);
        queue.enqueue(ll("a", Priority::Normal)).unwrap();
        assert!(queue.checkout(SlotClass::Standard, 0).is_some());
        assert!(queue.checkout(SlotClass::Standard, 1).is_none());

        let outcome = queue.requeue(&"a".into(), RequeueReason::Stopped).unwrap();
        assert_eq!(outcome, RequeueOutcome::Requeued { attempts: 0 });
        assert_eq!(queue.checkout(SlotClass::Standard, 1).unwrap().id.as_str(), "a");
    }

    #[test]
    fn failures_exhaust_retries() {
        let mut queue = WorkQueue::new("q", 1);
        queue.enqueue(ll("a", Priority::Normal)).unwrap();
        queue.checkout(SlotClass::Standard, 0).unwrap();
        assert_eq!(
            queue.requeue(&"a".into(), RequeueReason::Failure).unwrap(),
            RequeueOutcome::Requeued { attempts: 1 }
        );
        queue.checkout(SlotClass::Standard, 0).unwrap();
        assert_eq!(
            queue.requeue(&"a".into(), RequeueReason::Failure).unwrap(),
            RequeueOutcome::FailedPermanently { attempts: 2 }
        );
        assert_eq!(queue.entries.len(), 0);
        assert_eq!(queue.failed.len(), 1);
        assert!(queue.enqueue(ll("a", Priority::Normal)).is_err());
    }

    #[test]
    fn ack_requires_checkout() {
        let mut queue = WorkQueue::new("q", 3);
        queue.enqueue(ll("a", Priority::Normal)).unwrap();
        assert!(queue.ack(&"a".into()).is_err());
        queue.checkout(SlotClass::Standard, 0).unwrap();
        queue.ack(&"a".into()).unwrap();
        assert!(queue.entry(&"a".into()).is_none());
        assert!(queue.ack(&"a".into()).is_err());
    }

    #[test]
    fn finished_work_is_not_queued_again() {
        let mut queue = WorkQueue::new("q", 3);
        queue.enqueue(ll("a", Priority::Normal)).unwrap();
        queue.checkout(SlotClass::Standard, 0).unwrap();
        queue.ack(&"a".into()).unwrap();
        assert!(queue.enqueue(ll("a", Priority::Normal)).is_err());

        let events = queue.take_uncommitted();
        let replayed = WorkQueue::replay(WorkQueue::new("q", 3), events).unwrap();
        assert!(replayed.contains(&"a".into()));
        assert_eq!(replayed.depth(), 0);
    }

    #[test]
    fn standard_slots_skip_stage_two_work() {
        let mut queue = WorkQueue::new("q", 3);
        let pm1 = Assignment::new(
            "pm1".into(),
            WorkKind::PMinus1 { exponent: 1277, b1: 1000, b2: 50000 },
            Priority::Urgent,
            AssignmentSource::Manual,
        );
        queue.enqueue(pm1).unwrap();
        queue.enqueue(ll("ll", Priority::Low)).unwrap();
        assert_eq!(queue.checkout(SlotClass::Standard, 0).unwrap().id.as_str(), "ll");
        assert_eq!(queue.checkout(SlotClass::HighMemory, 1).unwrap().id.as_str(), "pm1");
    }

    #[test]
    fn expired_work_waits_for_confirmation() {
        let mut queue = WorkQueue::new("q", 3);
        queue.enqueue(ll("a", Priority::Normal)).unwrap();
        queue.checkout(SlotClass::Standard, 0).unwrap();
        queue.expire(&"a".into()).unwrap();
        assert_eq!(queue.checked_out(), 0);
        assert!(queue.checkout(SlotClass::Standard, 0).is_none());
        queue.confirm(&"a".into(), Utc::now()).unwrap();
        assert!(queue.checkout(SlotClass::Standard, 0).is_some());
    }

    #[test]
    fn replay_rebuilds_the_same_queue() {
        let mut queue = WorkQueue::new("q", 3);
        queue.enqueue(ll("a", Priority::Normal)).unwrap();
        queue.enqueue(ll("b", Priority::High)).unwrap();
        queue.checkout(SlotClass::Standard, 0).unwrap();
        let events = queue.take_uncommitted();

        let mut replayed = WorkQueue::replay(WorkQueue::new("q", 3), events).unwrap();
        assert_eq!(replayed.version, queue.version);
        assert_eq!(replayed.checked_out(), 1);
        let recovered = replayed.recover_checkouts().unwrap();
        assert_eq!(recovered, vec![AssignmentId::from("b")]);
        assert_eq!(replayed.entry(&"b".into()).unwrap().attempts, 0);
        assert_eq!(replayed.depth(), 2);
    }
}
