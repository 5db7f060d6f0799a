use super::aggregate::{RequeueOutcome, SlotClass, WorkQueue};
use super::assignment::{Assignment, AssignmentId};
use super::events::{RequeueReason, WorkQueueEvent};
use crate::common::{AggregateRoot, DomainResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Thread-safe handle to the work queue. One lock guards the whole structure;
/// checkouts happen once per assignment, so contention stays low.
#[derive(Debug, Clone)]
pub struct SharedWorkQueue {
    inner: Arc<Mutex<WorkQueue>>,
}

impl SharedWorkQueue {
    pub fn new(queue: WorkQueue) -> Self {
        Self {
            inner: Arc::new(Mutex::new(queue)),
        }
    }

    pub fn enqueue(&self, assignment: Assignment) -> DomainResult<()> {
        self.inner.lock().enqueue(assignment)
    }

    pub fn checkout(&self, class: SlotClass, slot: usize) -> Option<Assignment> {
        self.inner.lock().checkout(class, slot)
    }

    pub fn requeue(&self, id: &AssignmentId, reason: RequeueReason) -> DomainResult<RequeueOutcome> {
        self.inner.lock().requeue(id, reason)
    }

    pub fn ack(&self, id: &AssignmentId) -> DomainResult<()> {
        self.inner.lock().ack(id)
    }

    pub fn renew_reservation(&self, id: &AssignmentId, expires_at: DateTime<Utc>) -> DomainResult<()> {
        self.inner.lock().renew_reservation(id, expires_at)
    }

    pub fn expire(&self, id: &AssignmentId) -> DomainResult<()> {
        self.inner.lock().expire(id)
    }

    pub fn confirm(&self, id: &AssignmentId, expires_at: DateTime<Utc>) -> DomainResult<()> {
        self.inner.lock().confirm(id, expires_at)
    }

    pub fn abandon(&self, id: &AssignmentId, reason: &str) -> DomainResult<()> {
        self.inner.lock().abandon(id, reason)
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().depth()
    }

    pub fn checked_out(&self) -> usize {
        self.inner.lock().checked_out()
    }

    pub fn contains(&self, id: &AssignmentId) -> bool {
        self.inner.lock().contains(id)
    }

    /// Drain events recorded since the last call, for persistence.
    pub fn take_uncommitted(&self) -> Vec<WorkQueueEvent> {
        self.inner.lock().take_uncommitted()
    }

    /// Run `f` with the queue locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut WorkQueue) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Point-in-time copy for snapshots and status.
    pub fn snapshot(&self) -> WorkQueue {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::work_queue::assignment::{AssignmentSource, Priority, WorkKind};
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn concurrent_checkouts_never_share_an_assignment() {
        let queue = SharedWorkQueue::new(WorkQueue::new("q", 3));
        for i in 0..200 {
            queue
                .enqueue(Assignment::new(
                    AssignmentId::new(format!("a{i}")),
                    WorkKind::LucasLehmer { exponent: 127 },
                    Priority::Normal,
                    AssignmentSource::Manual,
                ))
                .unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|slot| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(a) = queue.checkout(SlotClass::Standard, slot) {
                        got.push(a.id);
                    }
                    got
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.join().unwrap() {
                total += 1;
                assert!(seen.insert(id), "assignment handed out twice");
            }
        }
        assert_eq!(total, 200);
        assert_eq!(queue.checked_out(), 200);
    }
}
