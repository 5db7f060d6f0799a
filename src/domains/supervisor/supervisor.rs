use super::events::{FaultReason, SupervisorEvent};
use super::ports::{CheckpointRecord, ComputeKernel, TaskProgress, TaskState};
use super::slot::{PendingControl, SlotProgress, SlotState, StopReason, WorkerSlot};
use crate::common::SupervisorError;
use crate::domains::resources::{HardwareProfile, ResourceGrant, SlotGrant};
use crate::domains::work_queue::{
    Assignment, AssignmentId, ComputationResult, RequeueOutcome, RequeueReason, Residue,
    SharedWorkQueue, SlotClass,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before a slot is presumed hung.
    pub missed_heartbeats: u32,
    /// How long a task gets to reach a safe point after pause/stop.
    pub grace_period: Duration,
    pub checkpoint_interval: Duration,
    /// Slots granted at least this much memory may take stage-2 work.
    pub high_memory_threshold: u64,
    /// Faulted slots return to Idle on their own after this long.
    pub auto_reset_after: Option<Duration>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::seconds(30),
            missed_heartbeats: 3,
            grace_period: Duration::seconds(60),
            checkpoint_interval: Duration::minutes(30),
            high_memory_threshold: crate::domains::work_queue::PMINUS1_STAGE2_MIN_MEMORY,
            auto_reset_after: Some(Duration::minutes(5)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorMode {
    /// Slots drain the work queue.
    Normal,
    /// Slots are reserved for torture/benchmark runs.
    Exclusive,
}

/// Owns the worker slots and drives their state machines.
///
/// Only the control thread calls into this type. Tasks run on their own
/// threads behind `TaskHandle`; the supervisor polls them on `tick`.
pub struct WorkerSupervisor {
    settings: SupervisorSettings,
    hardware: HardwareProfile,
    kernel: Arc<dyn ComputeKernel>,
    queue: SharedWorkQueue,
    slots: Vec<WorkerSlot>,
    grant: ResourceGrant,
    checkpoints: HashMap<AssignmentId, CheckpointRecord>,
    mode: SupervisorMode,
    events: Vec<SupervisorEvent>,
}

impl WorkerSupervisor {
    pub fn new(
        settings: SupervisorSettings,
        hardware: HardwareProfile,
        kernel: Arc<dyn ComputeKernel>,
        queue: SharedWorkQueue,
    ) -> Self {
        Self {
            settings,
            hardware,
            kernel,
            queue,
            slots: Vec::new(),
            grant: ResourceGrant::empty(),
            checkpoints: HashMap::new(),
            mode: SupervisorMode::Normal,
            events: Vec::new(),
        }
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&WorkerSlot> {
        self.slots.get(index)
    }

    pub fn grant(&self) -> &ResourceGrant {
        &self.grant
    }

    pub fn mode(&self) -> SupervisorMode {
        self.mode
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn kernel(&self) -> &Arc<dyn ComputeKernel> {
        &self.kernel
    }

    pub fn take_events(&mut self) -> Vec<SupervisorEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn restore_checkpoints(&mut self, records: impl IntoIterator<Item = CheckpointRecord>) {
        for record in records {
            self.checkpoints.insert(record.assignment_id.clone(), record);
        }
    }

    pub fn checkpoint_for(&self, id: &AssignmentId) -> Option<&CheckpointRecord> {
        self.checkpoints.get(id)
    }

    /// Slots holding resources.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_active()).count()
    }

    pub fn is_quiescent(&self) -> bool {
        self.active_count() == 0
    }

    /// Queue work currently on a slot, with its progress fraction.
    pub fn in_progress(&self) -> Vec<(AssignmentId, f64)> {
        self.slots
            .iter()
            .filter(|s| s.is_active())
            .filter_map(|s| {
                let a = s.assignment.as_ref()?;
                (!a.kind.is_diagnostic()).then(|| (a.id.clone(), s.fraction_done()))
            })
            .collect()
    }

    pub fn slot_running(&self, id: &AssignmentId) -> Option<usize> {
        self.slots
            .iter()
            .find(|s| s.is_active() && s.assignment_id() == Some(id))
            .map(|s| s.index)
    }

    /// Adopt a new grant. Stops the least advanced work when the worker
    /// count shrinks and re-divides memory among the survivors.
    /// Returns the slots asked to stop.
    pub fn apply_grant(&mut self, grant: ResourceGrant, now: DateTime<Utc>) -> Vec<usize> {
        self.ensure_slots(grant.slots.len());
        self.grant = grant;

        let mut live: Vec<usize> = self
            .slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Running | SlotState::Paused))
            .map(|s| s.index)
            .collect();

        let excess = live.len().saturating_sub(self.grant.max_workers);
        let mut victims = Vec::new();
        if excess > 0 {
            live.sort_by(|a, b| {
                let (fa, fb) = (self.slots[*a].fraction_done(), self.slots[*b].fraction_done());
                fa.partial_cmp(&fb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.cmp(a))
            });
            victims = live.drain(..excess).collect();
            for &victim in &victims {
                info!(slot = victim, "stopping slot to fit reduced worker grant");
                if let Err(e) = self.stop(victim, now, StopReason::Resize) {
                    warn!(slot = victim, error = %e, "resize stop failed");
                }
            }
        }

        live.sort_unstable();
        for (k, index) in live.iter().enumerate() {
            let Some(memory) = self.grant.slots.get(k).map(|g| g.memory_bytes) else {
                continue;
            };
            let slot = &mut self.slots[*index];
            if slot.memory_bytes != memory {
                if let Some(handle) = &slot.handle {
                    handle.adjust_memory(memory);
                }
                debug!(slot = index, memory, "memory grant adjusted");
                slot.memory_bytes = memory;
            }
        }
        victims
    }

    /// Bind `assignment` to an idle slot and launch it.
    pub fn start(
        &mut self,
        index: usize,
        assignment: Assignment,
        now: DateTime<Utc>,
    ) -> Result<(), SupervisorError> {
        let wants_exclusive = assignment.kind.is_diagnostic();
        if wants_exclusive != (self.mode == SupervisorMode::Exclusive) {
            return Err(SupervisorError::InvalidTransition {
                slot: index,
                operation: "start",
                state: format!("{:?} mode", self.mode),
            });
        }
        let slot = self.slots.get(index).ok_or(SupervisorError::UnknownSlot(index))?;
        if slot.state != SlotState::Idle {
            return Err(SupervisorError::InvalidTransition {
                slot: index,
                operation: "start",
                state: slot.state.to_string(),
            });
        }
        let entry = self.grant.slot(index).cloned().ok_or_else(|| SupervisorError::GrantUnavailable {
            slot: index,
            reason: format!(
                "window {} grants {} workers",
                self.grant.window, self.grant.max_workers
            ),
        })?;
        self.check_grant(index, &entry, &assignment)?;

        let resume = self.checkpoints.get(&assignment.id).cloned();
        let handle = self
            .kernel
            .launch(&assignment, &entry, resume.as_ref())
            .map_err(SupervisorError::Kernel)?;
        let resumed_from = resume.as_ref().map(|r| r.iteration).unwrap_or(0);

        info!(
            slot = index,
            assignment = %assignment.id,
            work = assignment.kind.label(),
            exponent = assignment.kind.exponent(),
            resumed_from,
            "slot started"
        );
        self.events.push(SupervisorEvent::Started {
            slot: index,
            assignment_id: assignment.id.clone(),
            resumed_from,
        });

        let slot = &mut self.slots[index];
        slot.state = SlotState::Running;
        slot.cpus = entry.cpus;
        slot.memory_bytes = entry.memory_bytes;
        slot.progress = Some(SlotProgress {
            iteration: resumed_from,
            total: assignment.kind.total_iterations(),
            residue: resume.map(|r| r.residue).unwrap_or(Residue(0)),
        });
        slot.assignment = Some(assignment);
        slot.last_heartbeat = Some(now);
        slot.started_at = Some(now);
        slot.last_checkpoint_at = Some(now);
        slot.fault = None;
        slot.faulted_at = None;
        slot.handle = Some(handle);
        slot.pending = None;
        Ok(())
    }

    fn check_grant(
        &self,
        index: usize,
        entry: &SlotGrant,
        assignment: &Assignment,
    ) -> Result<(), SupervisorError> {
        let unavailable = |reason: String| SupervisorError::GrantUnavailable { slot: index, reason };
        let others: Vec<&WorkerSlot> = self
            .slots
            .iter()
            .filter(|s| s.index != index && s.is_active())
            .collect();

        if others.len() >= self.grant.max_workers {
            return Err(unavailable(format!(
                "all {} worker grants in use",
                self.grant.max_workers
            )));
        }
        let needed = assignment.kind.min_memory_bytes();
        if entry.memory_bytes < needed {
            return Err(unavailable(format!(
                "{} needs {} bytes, slot grant is {}",
                assignment.kind.label(),
                needed,
                entry.memory_bytes
            )));
        }
        let used: u64 = others.iter().map(|s| s.memory_bytes).sum();
        if used + entry.memory_bytes > self.grant.memory_ceiling_bytes {
            return Err(unavailable(format!(
                "{} bytes in use, ceiling {}",
                used, self.grant.memory_ceiling_bytes
            )));
        }
        let busy: HashSet<usize> = others.iter().flat_map(|s| s.cpus.iter().copied()).collect();
        if let Some(cpu) = entry.cpus.iter().find(|c| busy.contains(c)) {
            return Err(unavailable(format!("cpu {cpu} is bound to another slot")));
        }
        if !self.grant.hyperthreading {
            let busy_cores: HashSet<usize> = busy.iter().map(|c| self.hardware.core_of(*c)).collect();
            if let Some(cpu) = entry.cpus.iter().find(|c| busy_cores.contains(&self.hardware.core_of(**c))) {
                return Err(unavailable(format!(
                    "core of cpu {cpu} is shared and hyperthreading is not allowed"
                )));
            }
        }
        Ok(())
    }

    /// Pull queued work into idle slots. Returns the number started.
    pub fn fill_idle_slots(&mut self, now: DateTime<Utc>) -> usize {
        if self.mode != SupervisorMode::Normal {
            return 0;
        }
        let mut started = 0;
        let candidates = self.grant.max_workers.min(self.slots.len());
        for index in 0..candidates {
            if self.active_count() >= self.grant.max_workers {
                break;
            }
            if self.slots[index].state != SlotState::Idle {
                continue;
            }
            let Some(memory) = self.grant.slot(index).map(|g| g.memory_bytes) else {
                continue;
            };
            let class = SlotClass::for_memory(memory, self.settings.high_memory_threshold);
            let Some(assignment) = self.queue.checkout(class, index) else {
                continue;
            };
            let id = assignment.id.clone();
            match self.start(index, assignment, now) {
                Ok(()) => started += 1,
                Err(SupervisorError::GrantUnavailable { reason, .. }) => {
                    debug!(slot = index, assignment = %id, %reason, "start deferred");
                    self.requeue(index, &id, RequeueReason::Deferred);
                    self.events.push(SupervisorEvent::Deferred {
                        slot: index,
                        assignment_id: id,
                        reason,
                    });
                }
                Err(e) => {
                    warn!(slot = index, assignment = %id, error = %e, "start failed");
                    self.requeue(index, &id, RequeueReason::Failure);
                }
            }
        }
        started
    }

    /// Ask a running task to pause at its next safe point.
    pub fn pause(&mut self, index: usize, now: DateTime<Utc>) -> Result<(), SupervisorError> {
        let slot = self.slots.get_mut(index).ok_or(SupervisorError::UnknownSlot(index))?;
        if slot.state != SlotState::Running || slot.pending.is_some() {
            return Err(SupervisorError::InvalidTransition {
                slot: index,
                operation: "pause",
                state: slot.state.to_string(),
            });
        }
        if let Some(handle) = &slot.handle {
            handle.pause();
        }
        slot.pending = Some(PendingControl::Pause { requested_at: now });
        Ok(())
    }

    pub fn resume(&mut self, index: usize, now: DateTime<Utc>) -> Result<(), SupervisorError> {
        let slot = self.slots.get_mut(index).ok_or(SupervisorError::UnknownSlot(index))?;
        if slot.state != SlotState::Paused {
            return Err(SupervisorError::InvalidTransition {
                slot: index,
                operation: "resume",
                state: slot.state.to_string(),
            });
        }
        if let Some(handle) = &slot.handle {
            handle.resume();
        }
        slot.state = SlotState::Running;
        // Paused tasks do not beat; restart the heartbeat clock.
        slot.last_heartbeat = Some(now);
        Ok(())
    }

    /// Graceful stop. The task checkpoints at its next safe point; the
    /// assignment is requeued (or acked if it finished meanwhile) on a later tick.
    pub fn stop(
        &mut self,
        index: usize,
        now: DateTime<Utc>,
        reason: StopReason,
    ) -> Result<(), SupervisorError> {
        let slot = self.slots.get_mut(index).ok_or(SupervisorError::UnknownSlot(index))?;
        match slot.state {
            SlotState::Idle | SlotState::Stopping => Ok(()),
            SlotState::Faulted => Err(SupervisorError::InvalidTransition {
                slot: index,
                operation: "stop",
                state: slot.state.to_string(),
            }),
            SlotState::Running | SlotState::Paused => {
                if let Some(handle) = &slot.handle {
                    handle.cancel(true);
                }
                slot.state = SlotState::Stopping;
                slot.pending = Some(PendingControl::Stop {
                    requested_at: now,
                    reason,
                });
                Ok(())
            }
        }
    }

    pub fn stop_all(&mut self, now: DateTime<Utc>, reason: StopReason) {
        for index in 0..self.slots.len() {
            if matches!(self.slots[index].state, SlotState::Running | SlotState::Paused) {
                if let Err(e) = self.stop(index, now, reason) {
                    warn!(slot = index, error = %e, "could not stop slot");
                }
            }
        }
    }

    /// Operator reset of a faulted slot.
    pub fn reset(&mut self, index: usize) -> Result<(), SupervisorError> {
        let slot = self.slots.get_mut(index).ok_or(SupervisorError::UnknownSlot(index))?;
        if slot.state != SlotState::Faulted {
            return Err(SupervisorError::InvalidTransition {
                slot: index,
                operation: "reset",
                state: slot.state.to_string(),
            });
        }
        slot.clear();
        slot.fault = None;
        slot.faulted_at = None;
        self.events.push(SupervisorEvent::SlotIdle { slot: index });
        Ok(())
    }

    /// Reserve all slots for diagnostics. Running queue work is stopped and requeued.
    pub fn enter_exclusive(&mut self, now: DateTime<Utc>) {
        self.stop_all(now, StopReason::Diagnostics);
        self.mode = SupervisorMode::Exclusive;
    }

    /// Return to queue draining. Any diagnostic task still running is stopped.
    pub fn leave_exclusive(&mut self, now: DateTime<Utc>) {
        self.stop_all(now, StopReason::Diagnostics);
        self.mode = SupervisorMode::Normal;
    }

    /// Poll every slot once.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        for index in 0..self.slots.len() {
            self.tick_slot(index, now);
        }
    }

    fn tick_slot(&mut self, index: usize, now: DateTime<Utc>) {
        let slot = &mut self.slots[index];
        match slot.state {
            SlotState::Idle => return,
            SlotState::Faulted => {
                if let (Some(after), Some(at)) = (self.settings.auto_reset_after, slot.faulted_at) {
                    if now - at >= after {
                        info!(slot = index, "auto-resetting faulted slot");
                        if let Err(e) = self.reset(index) {
                            warn!(slot = index, error = %e, "auto-reset failed");
                        }
                    }
                }
                return;
            }
            SlotState::Running | SlotState::Paused | SlotState::Stopping => {}
        }

        let Some(handle) = slot.handle.as_ref() else {
            return;
        };
        let task_state = handle.state();
        let progress = handle.checkpoint();
        slot.progress = Some(SlotProgress::from(&progress));
        if slot.last_heartbeat.map_or(true, |last| progress.heartbeat_at > last) {
            slot.last_heartbeat = Some(progress.heartbeat_at);
        }

        match task_state {
            TaskState::Completed(result) => return self.finish(index, result, now),
            TaskState::Failed(msg) => return self.fault(index, FaultReason::TaskFailed(msg), now),
            TaskState::Stopped => return self.finish_stop(index, &progress, now),
            TaskState::Paused => {
                if matches!(slot.pending, Some(PendingControl::Pause { .. })) {
                    slot.state = SlotState::Paused;
                    slot.pending = None;
                    self.write_checkpoint(index, &progress, now);
                    self.events.push(SupervisorEvent::Paused { slot: index });
                    return;
                }
            }
            TaskState::Running => {}
        }

        let slot = &self.slots[index];
        match slot.pending {
            Some(PendingControl::Pause { requested_at }) if now - requested_at > self.settings.grace_period => {
                return self.fault(index, FaultReason::PauseTimeout, now);
            }
            Some(PendingControl::Stop { requested_at, .. }) if now - requested_at > self.settings.grace_period => {
                return self.fault(index, FaultReason::StopTimeout, now);
            }
            _ => {}
        }

        if slot.state != SlotState::Running || slot.pending.is_some() {
            return;
        }

        if let Some(last) = slot.last_heartbeat {
            let interval = self.settings.heartbeat_interval.num_milliseconds().max(1);
            let missed = ((now - last).num_milliseconds() / interval).max(0) as u32;
            if missed >= self.settings.missed_heartbeats {
                return self.fault(index, FaultReason::HeartbeatTimeout { missed }, now);
            }
        }

        let due = slot
            .last_checkpoint_at
            .map_or(true, |at| now - at >= self.settings.checkpoint_interval);
        if due {
            self.write_checkpoint(index, &progress, now);
        }
    }

    fn write_checkpoint(&mut self, index: usize, progress: &TaskProgress, now: DateTime<Utc>) {
        let slot = &mut self.slots[index];
        slot.last_checkpoint_at = Some(now);
        let Some(assignment) = slot.assignment.as_ref() else {
            return;
        };
        if assignment.kind.is_diagnostic() {
            return;
        }
        let previous = self.checkpoints.get(&assignment.id).map(|c| c.iteration).unwrap_or(0);
        if progress.iteration <= previous {
            return;
        }
        let record = CheckpointRecord {
            assignment_id: assignment.id.clone(),
            iteration: progress.iteration,
            residue: progress.residue,
            written_at: now,
        };
        self.checkpoints.insert(record.assignment_id.clone(), record.clone());
        self.events.push(SupervisorEvent::CheckpointWritten(record));
    }

    fn finish(&mut self, index: usize, result: ComputationResult, now: DateTime<Utc>) {
        let slot = &mut self.slots[index];
        let started_at = slot.started_at.unwrap_or(now);
        let Some(assignment) = slot.assignment.take() else {
            slot.clear();
            return;
        };
        slot.clear();

        if assignment.kind.is_diagnostic() {
            self.events.push(SupervisorEvent::DiagnosticFinished {
                slot: index,
                assignment,
                outcome: Ok(result),
                started_at,
                finished_at: now,
            });
        } else {
            if let Err(e) = self.queue.ack(&assignment.id) {
                warn!(assignment = %assignment.id, error = %e, "completed work was no longer checked out");
            }
            self.checkpoints.remove(&assignment.id);
            info!(slot = index, assignment = %assignment.id, "assignment completed");
            self.events.push(SupervisorEvent::Completed {
                slot: index,
                assignment,
                result,
            });
        }
        self.events.push(SupervisorEvent::SlotIdle { slot: index });
    }

    fn finish_stop(&mut self, index: usize, progress: &TaskProgress, now: DateTime<Utc>) {
        self.write_checkpoint(index, progress, now);
        let slot = &mut self.slots[index];
        let started_at = slot.started_at.unwrap_or(now);
        let reason = match slot.pending {
            Some(PendingControl::Stop { reason, .. }) => Some(reason),
            _ => None,
        };
        let assignment = slot.assignment.take();
        slot.clear();

        if let Some(assignment) = assignment {
            if assignment.kind.is_diagnostic() {
                self.events.push(SupervisorEvent::DiagnosticFinished {
                    slot: index,
                    assignment,
                    outcome: Err("stopped before completion".to_string()),
                    started_at,
                    finished_at: now,
                });
            } else if reason == Some(StopReason::Expired) {
                self.expire(&assignment.id);
            } else {
                self.requeue(index, &assignment.id, RequeueReason::Stopped);
            }
        }
        debug!(slot = index, ?reason, "slot stopped");
        self.events.push(SupervisorEvent::SlotIdle { slot: index });
    }

    /// Abandon the task and mark the slot Faulted. Progress since the last
    /// checkpoint is not trusted.
    fn fault(&mut self, index: usize, reason: FaultReason, now: DateTime<Utc>) {
        let slot = &mut self.slots[index];
        if let Some(handle) = slot.handle.take() {
            handle.cancel(false);
        }
        let stop_reason = match slot.pending {
            Some(PendingControl::Stop { reason, .. }) => Some(reason),
            _ => None,
        };
        let started_at = slot.started_at.unwrap_or(now);
        let assignment = slot.assignment.take();
        slot.clear();
        slot.state = SlotState::Faulted;
        slot.fault = Some(reason.to_string());
        slot.faulted_at = Some(now);

        warn!(slot = index, %reason, "slot faulted");
        self.events.push(SupervisorEvent::Faulted {
            slot: index,
            assignment_id: assignment.as_ref().map(|a| a.id.clone()),
            reason: reason.clone(),
        });

        let Some(assignment) = assignment else {
            return;
        };
        if assignment.kind.is_diagnostic() {
            self.events.push(SupervisorEvent::DiagnosticFinished {
                slot: index,
                assignment,
                outcome: Err(reason.to_string()),
                started_at,
                finished_at: now,
            });
            return;
        }
        let failed = self.requeue(index, &assignment.id, RequeueReason::Failure);
        if !failed && stop_reason == Some(StopReason::Expired) {
            self.expire(&assignment.id);
        }
    }

    /// Returns true when the assignment was given up on.
    fn requeue(&mut self, index: usize, id: &AssignmentId, reason: RequeueReason) -> bool {
        match self.queue.requeue(id, reason) {
            Ok(RequeueOutcome::Requeued { attempts }) => {
                self.events.push(SupervisorEvent::Requeued {
                    slot: index,
                    assignment_id: id.clone(),
                    reason,
                    attempts,
                });
                false
            }
            Ok(RequeueOutcome::FailedPermanently { attempts }) => {
                self.checkpoints.remove(id);
                self.events.push(SupervisorEvent::PermanentlyFailed {
                    assignment_id: id.clone(),
                    attempts,
                });
                true
            }
            Err(e) => {
                warn!(assignment = %id, error = %e, "requeue failed");
                false
            }
        }
    }

    fn expire(&mut self, id: &AssignmentId) {
        if let Err(e) = self.queue.expire(id) {
            warn!(assignment = %id, error = %e, "could not mark assignment expired");
        }
    }

    fn ensure_slots(&mut self, count: usize) {
        while self.slots.len() < count {
            let index = self.slots.len();
            self.slots.push(WorkerSlot::new(index));
        }
    }
}
