use super::storage::EngineStorage;
use crate::common::{ApplicationError, ApplicationResult, EventStore, SnapshotStore};
use crate::domains::diagnostics::{BenchmarkConfig, DiagnosticReport, DiagnosticsController, TortureConfig};
use crate::domains::journal::DynJournal;
use crate::domains::primenet::{
    CoordinatorSession, CoordinatorSettings, Credentials, ManualWorkSource, PrimeNetCoordinator, PrimeNetTransport,
    ResultSubmission, SharedResultBuffer, SyncReport,
};
use crate::domains::resources::{compute_grant, HardwareProfile, ResourceSchedule, TimeOfDay, WorkerDemand};
use crate::domains::status::{Alert, AlertKind, ScheduleStatus, Severity, StatusPublisher, StatusSnapshot};
use crate::domains::supervisor::{
    ComputeKernel, FaultReason, StopReason, SupervisorEvent, SupervisorSettings, WorkerSlot, WorkerSupervisor,
};
use crate::domains::work_queue::{Assignment, AssignmentId, SharedWorkQueue};
use chrono::{DateTime, Local, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Clone)]
pub enum EngineCommand {
    ApplySchedule(ResourceSchedule),
    /// Start draining the queue, optionally with a new demand.
    StartWorkers(Option<WorkerDemand>),
    StopWorkers,
    RunTorture(Option<TortureConfig>),
    RunBenchmark(Option<BenchmarkConfig>),
    AbortDiagnostics,
    SetManualMode(bool),
    SetEmergency(bool),
    Enqueue(Assignment),
    ResetSlot(usize),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    Accepted,
    Rejected(String),
}

impl CommandReply {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CommandReply::Accepted)
    }
}

struct Envelope {
    command: EngineCommand,
    reply: oneshot::Sender<CommandReply>,
}

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Envelope>,
    status: watch::Receiver<StatusSnapshot>,
}

impl EngineHandle {
    pub async fn send(&self, command: EngineCommand) -> ApplicationResult<CommandReply> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Envelope { command, reply })
            .await
            .map_err(|_| ApplicationError::EngineStopped)?;
        rx.await.map_err(|_| ApplicationError::EngineStopped)
    }

    pub async fn apply_schedule(&self, schedule: ResourceSchedule) -> ApplicationResult<CommandReply> {
        self.send(EngineCommand::ApplySchedule(schedule)).await
    }

    pub async fn start_workers(&self, demand: Option<WorkerDemand>) -> ApplicationResult<CommandReply> {
        self.send(EngineCommand::StartWorkers(demand)).await
    }

    pub async fn stop_workers(&self) -> ApplicationResult<CommandReply> {
        self.send(EngineCommand::StopWorkers).await
    }

    pub async fn run_torture(&self, config: Option<TortureConfig>) -> ApplicationResult<CommandReply> {
        self.send(EngineCommand::RunTorture(config)).await
    }

    pub async fn run_benchmark(&self, config: Option<BenchmarkConfig>) -> ApplicationResult<CommandReply> {
        self.send(EngineCommand::RunBenchmark(config)).await
    }

    pub async fn set_manual_mode(&self, enabled: bool) -> ApplicationResult<CommandReply> {
        self.send(EngineCommand::SetManualMode(enabled)).await
    }

    pub async fn set_emergency(&self, active: bool) -> ApplicationResult<CommandReply> {
        self.send(EngineCommand::SetEmergency(active)).await
    }

    pub async fn enqueue(&self, assignment: Assignment) -> ApplicationResult<CommandReply> {
        self.send(EngineCommand::Enqueue(assignment)).await
    }

    pub async fn shutdown(&self) -> ApplicationResult<CommandReply> {
        self.send(EngineCommand::Shutdown).await
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for(&self, predicate: impl Fn(&StatusSnapshot) -> bool) -> ApplicationResult<StatusSnapshot> {
        let mut rx = self.status.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if predicate(&current) {
                    return Ok(current.clone());
                }
            }
            rx.changed().await.map_err(|_| ApplicationError::EngineStopped)?;
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub queue_id: String,
    pub tick_interval: Duration,
    pub sync_interval: Duration,
    pub max_retries: u32,
    pub snapshot_frequency: u64,
    /// Drain the queue from the first step without waiting for `StartWorkers`.
    pub autostart: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            queue_id: "work-queue".to_string(),
            tick_interval: Duration::from_secs(1),
            sync_interval: Duration::from_secs(60),
            max_retries: 3,
            snapshot_frequency: 100,
            autostart: true,
        }
    }
}

pub struct CoordinatorParts {
    pub settings: CoordinatorSettings,
    pub endpoint: String,
    pub credentials: Credentials,
    pub proxy: Option<String>,
    pub transport: Arc<dyn PrimeNetTransport>,
    pub manual_source: Option<Arc<dyn ManualWorkSource>>,
    pub manual_mode: bool,
}

/// Everything the engine is built from.
pub struct EngineParts {
    pub settings: EngineSettings,
    pub hardware: HardwareProfile,
    pub demand: WorkerDemand,
    pub schedule: ResourceSchedule,
    pub supervisor: SupervisorSettings,
    pub kernel: Arc<dyn ComputeKernel>,
    pub coordinator: CoordinatorParts,
    pub event_store: Arc<dyn EventStore>,
    pub snapshot_store: Arc<dyn SnapshotStore>,
    pub journal: DynJournal,
}

/// The control loop. Owns every stateful component; one step at a time:
/// plan the grant, tick the slots, route their events, advance diagnostics,
/// fill idle slots, persist, publish.
pub struct Engine {
    settings: EngineSettings,
    hardware: HardwareProfile,
    demand: WorkerDemand,
    schedule: ResourceSchedule,
    running: bool,
    supervisor: WorkerSupervisor,
    queue: SharedWorkQueue,
    coordinator: PrimeNetCoordinator,
    diagnostics: DiagnosticsController,
    publisher: StatusPublisher,
    storage: EngineStorage,
    journal: DynJournal,
    deferred: HashSet<AssignmentId>,
    /// Completed work whose checkpoint is dropped once its result is durable.
    settled: Vec<AssignmentId>,
    results_dirty: bool,
    shutting_down: bool,
    commands: mpsc::Receiver<Envelope>,
    commands_tx: mpsc::Sender<Envelope>,
}

impl Engine {
    /// Restore durable state and assemble the engine. Checked-out work from a
    /// previous run goes back to the queue and resumes from its checkpoint.
    pub async fn bootstrap(parts: EngineParts) -> ApplicationResult<Self> {
        let EngineParts {
            settings,
            hardware,
            demand,
            schedule,
            supervisor,
            kernel,
            coordinator,
            event_store,
            snapshot_store,
            journal,
        } = parts;
        schedule.validate()?;

        let mut storage = EngineStorage::new(event_store, snapshot_store, settings.snapshot_frequency);
        let mut queue = storage.load_queue(&settings.queue_id, settings.max_retries).await?;
        let recovered = queue.recover_checkouts()?;
        let results = SharedResultBuffer::new(storage.load_results().await?);
        // A result saved just before a crash can outlive its queue ack.
        let finished: Vec<AssignmentId> = queue
            .entries
            .iter()
            .map(|e| e.assignment.id.clone())
            .filter(|id| results.knows(id))
            .collect();
        for id in &finished {
            queue.abandon(id, "result already recorded")?;
            storage.delete_checkpoint(id).await?;
        }
        let queue = SharedWorkQueue::new(queue);
        storage.persist_queue(&queue).await?;

        let checkpoints = storage.load_checkpoints(&queue).await?;

        let resumable = checkpoints.len();
        let mut supervisor = WorkerSupervisor::new(supervisor, hardware.clone(), kernel, queue.clone());
        supervisor.restore_checkpoints(checkpoints);

        let now = Utc::now();
        let session = CoordinatorSession::new(
            coordinator.endpoint,
            coordinator.credentials,
            coordinator.proxy,
            results.clone(),
        );
        let mut primenet = PrimeNetCoordinator::new(coordinator.settings, session, coordinator.transport);
        if let Some(source) = coordinator.manual_source {
            primenet = primenet.with_manual_source(source);
        }
        if coordinator.manual_mode {
            primenet.set_manual_mode(true, now);
        }

        info!(
            queued = queue.depth(),
            recovered = recovered.len(),
            retired = finished.len(),
            resumable,
            buffered_results = results.len(),
            "engine state restored"
        );
        journal.info(&format!(
            "client started: {} assignments queued, {} recovered, {} results awaiting submission",
            queue.depth(),
            recovered.len(),
            results.len()
        ));

        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let running = settings.autostart;
        let engine = Self {
            settings,
            hardware,
            demand,
            schedule,
            running,
            supervisor,
            queue,
            coordinator: primenet,
            diagnostics: DiagnosticsController::new(),
            publisher: StatusPublisher::new(),
            storage,
            journal,
            deferred: HashSet::new(),
            settled: Vec::new(),
            results_dirty: false,
            shutting_down: false,
            commands,
            commands_tx,
        };
        engine.publish(now);
        Ok(engine)
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            commands: self.commands_tx.clone(),
            status: self.publisher.subscribe(),
        }
    }

    pub fn queue(&self) -> &SharedWorkQueue {
        &self.queue
    }

    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    pub fn coordinator(&self) -> &PrimeNetCoordinator {
        &self.coordinator
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Drive the engine until a `Shutdown` command arrives, then stop every
    /// slot at a safe point and persist.
    pub async fn run(mut self) -> ApplicationResult<()> {
        let mut tick = interval(self.settings.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sync = interval(self.settings.sync_interval);
        sync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_ms = self.settings.tick_interval.as_millis() as u64,
            sync_secs = self.settings.sync_interval.as_secs(),
            "engine running"
        );

        loop {
            tokio::select! {
                Some(envelope) = self.commands.recv() => {
                    let reply = self.handle_command(envelope.command, Utc::now());
                    let _ = envelope.reply.send(reply);
                    if self.shutting_down {
                        break;
                    }
                    self.step(Utc::now()).await;
                }
                _ = tick.tick() => {
                    self.step(Utc::now()).await;
                }
                _ = sync.tick() => {
                    self.sync(Utc::now()).await;
                    self.publish(Utc::now());
                }
            }
        }

        self.shutdown().await
    }

    pub fn handle_command(&mut self, command: EngineCommand, now: DateTime<Utc>) -> CommandReply {
        debug!(?command, "engine command");
        match command {
            EngineCommand::ApplySchedule(schedule) => {
                if let Err(e) = schedule.validate() {
                    return CommandReply::Rejected(e.to_string());
                }
                info!(windows = schedule.windows.len(), "schedule replaced");
                self.schedule = schedule;
                CommandReply::Accepted
            }
            EngineCommand::StartWorkers(demand) => {
                if self.diagnostics.is_active() {
                    return CommandReply::Rejected("a diagnostic run is in progress".to_string());
                }
                if let Some(demand) = demand {
                    self.demand = demand;
                }
                self.running = true;
                self.journal
                    .info(&format!("workers started ({} requested)", self.demand.workers()));
                CommandReply::Accepted
            }
            EngineCommand::StopWorkers => {
                if let Some(report) = self.diagnostics.abort(&mut self.supervisor, now) {
                    self.on_report(report);
                }
                self.running = false;
                self.supervisor.stop_all(now, StopReason::Operator);
                self.journal.info("workers stopped");
                CommandReply::Accepted
            }
            EngineCommand::RunTorture(config) => {
                let config = config.unwrap_or_else(|| TortureConfig::for_hardware(&self.hardware));
                match self.diagnostics.begin_torture(&config, &self.hardware, now) {
                    Ok(cases) => {
                        self.journal.info(&format!("torture test started: {cases} cases"));
                        CommandReply::Accepted
                    }
                    Err(reason) => CommandReply::Rejected(reason),
                }
            }
            EngineCommand::RunBenchmark(config) => {
                let config = config.unwrap_or_else(|| BenchmarkConfig::for_hardware(&self.hardware));
                match self.diagnostics.begin_benchmark(&config, now) {
                    Ok(cases) => {
                        self.journal.info(&format!("benchmark started: {cases} cases"));
                        CommandReply::Accepted
                    }
                    Err(reason) => CommandReply::Rejected(reason),
                }
            }
            EngineCommand::AbortDiagnostics => match self.diagnostics.abort(&mut self.supervisor, now) {
                Some(report) => {
                    self.on_report(report);
                    CommandReply::Accepted
                }
                None => CommandReply::Rejected("no diagnostic run in progress".to_string()),
            },
            EngineCommand::SetManualMode(enabled) => {
                self.coordinator.set_manual_mode(enabled, now);
                CommandReply::Accepted
            }
            EngineCommand::SetEmergency(active) => {
                if self.schedule.emergency.is_none() {
                    return CommandReply::Rejected("no emergency tier configured".to_string());
                }
                self.schedule.emergency_active = active;
                self.journal.warn(if active {
                    "emergency resource tier engaged"
                } else {
                    "emergency resource tier released"
                });
                CommandReply::Accepted
            }
            EngineCommand::Enqueue(assignment) => match self.queue.enqueue(assignment) {
                Ok(()) => CommandReply::Accepted,
                Err(e) => CommandReply::Rejected(e.to_string()),
            },
            EngineCommand::ResetSlot(index) => match self.supervisor.reset(index) {
                Ok(()) => CommandReply::Accepted,
                Err(e) => CommandReply::Rejected(e.to_string()),
            },
            EngineCommand::Shutdown => {
                self.shutting_down = true;
                CommandReply::Accepted
            }
        }
    }

    /// One control step.
    pub async fn step(&mut self, now: DateTime<Utc>) {
        self.plan(now);
        self.supervisor.tick(now);
        self.drain_events(now).await;

        if let Some(report) = self.diagnostics.step(&mut self.supervisor, now) {
            self.on_report(report);
        }
        if self.running && !self.diagnostics.is_active() {
            let started = self.supervisor.fill_idle_slots(now);
            if started > 0 {
                debug!(started, "idle slots filled");
            }
        }
        self.drain_events(now).await;

        self.collect_alerts();
        self.persist().await;
        self.publish(now);
    }

    /// Exchange results and reservations with the server, then act on what changed.
    pub async fn sync(&mut self, now: DateTime<Utc>) -> SyncReport {
        let in_progress = self.supervisor.in_progress();
        let report = self.coordinator.sync(&self.queue, &in_progress, now).await;

        for id in &report.expired_in_flight {
            if let Some(slot) = self.supervisor.slot_running(id) {
                warn!(assignment = %id, slot, "reservation lapsed while running; stopping");
                if let Err(e) = self.supervisor.stop(slot, now, StopReason::Expired) {
                    warn!(slot, error = %e, "could not stop slot");
                }
            }
        }
        for id in &report.abandoned {
            self.forget_checkpoint(id).await;
        }
        if report.flushed.accepted > 0 || !report.flushed.rejected.is_empty() {
            self.results_dirty = true;
        }
        if report.pulled > 0 {
            self.journal
                .info(&format!("received {} new assignments", report.pulled));
        }

        self.collect_alerts();
        self.persist().await;
        report
    }

    /// Recompute the grant for the current schedule window and hand it to
    /// the supervisor when it differs from the one in force.
    fn plan(&mut self, now: DateTime<Utc>) {
        let at = TimeOfDay::from_time(now.with_timezone(&Local).time());
        let grant = compute_grant(&self.hardware, &self.demand, &self.schedule, at);
        if grant == *self.supervisor.grant() {
            return;
        }

        let previous = self.supervisor.grant().window.clone();
        info!(
            window = %grant.window,
            workers = grant.slots.len(),
            memory_mb = grant.total_memory() / (1024 * 1024),
            "resource grant changed"
        );
        if previous != grant.window {
            self.journal.info(&format!(
                "schedule window {} in force: up to {} workers, {} MB",
                grant.window,
                grant.slots.len(),
                grant.memory_ceiling_bytes / (1024 * 1024)
            ));
        }
        let stopped = self.supervisor.apply_grant(grant, now);
        if !stopped.is_empty() {
            self.journal
                .info(&format!("stopping workers {stopped:?} to fit the new grant"));
        }
    }

    async fn drain_events(&mut self, now: DateTime<Utc>) {
        for event in self.supervisor.take_events() {
            self.diagnostics.on_event(&event);
            match event {
                SupervisorEvent::Started {
                    slot,
                    assignment_id,
                    resumed_from,
                } => {
                    self.deferred.remove(&assignment_id);
                    if resumed_from > 0 {
                        self.journal.info(&format!(
                            "worker {slot} resuming {assignment_id} from iteration {resumed_from}"
                        ));
                    } else {
                        debug!(slot, assignment = %assignment_id, "work started");
                    }
                }
                SupervisorEvent::CheckpointWritten(record) => {
                    if let Err(e) = self.storage.save_checkpoint(&record).await {
                        error!(assignment = %record.assignment_id, error = %e, "failed to persist checkpoint");
                    }
                }
                SupervisorEvent::Completed {
                    slot,
                    assignment,
                    result,
                } => {
                    self.journal.result(&result.summary(&assignment));
                    info!(slot, assignment = %assignment.id, "assignment completed");
                    let submission = ResultSubmission::new(&assignment, result, now);
                    if !self.coordinator.record_result(submission) {
                        debug!(assignment = %assignment.id, "result already recorded");
                    }
                    self.results_dirty = true;
                    self.settled.push(assignment.id);
                }
                SupervisorEvent::Requeued {
                    slot,
                    assignment_id,
                    reason,
                    attempts,
                } => {
                    debug!(slot, assignment = %assignment_id, ?reason, attempts, "work requeued");
                }
                SupervisorEvent::PermanentlyFailed {
                    assignment_id,
                    attempts,
                } => {
                    self.forget_checkpoint(&assignment_id).await;
                    self.raise(Alert::critical(
                        AlertKind::PermanentFailure,
                        format!("assignment {assignment_id} failed {attempts} times and was set aside"),
                        now,
                    ));
                }
                SupervisorEvent::Faulted {
                    slot,
                    assignment_id,
                    reason,
                } => {
                    let kind = match reason {
                        FaultReason::HeartbeatTimeout { .. } => AlertKind::HeartbeatTimeout,
                        _ => AlertKind::SlotFaulted,
                    };
                    let on = assignment_id
                        .map(|id| format!(" while running {id}"))
                        .unwrap_or_default();
                    self.raise(Alert::warning(kind, format!("worker {slot} faulted{on}: {reason}"), now));
                }
                SupervisorEvent::Deferred {
                    slot,
                    assignment_id,
                    reason,
                } => {
                    if self.deferred.insert(assignment_id.clone()) {
                        self.raise(Alert::warning(
                            AlertKind::GrantUnavailable,
                            format!("{assignment_id} deferred on worker {slot}: {reason}"),
                            now,
                        ));
                    }
                }
                SupervisorEvent::Paused { slot } => debug!(slot, "worker paused"),
                SupervisorEvent::DiagnosticFinished { .. } | SupervisorEvent::SlotIdle { .. } => {}
            }
        }
    }

    async fn forget_checkpoint(&self, id: &AssignmentId) {
        if let Err(e) = self.storage.delete_checkpoint(id).await {
            warn!(assignment = %id, error = %e, "failed to delete checkpoint");
        }
    }

    fn on_report(&mut self, report: DiagnosticReport) {
        match report {
            DiagnosticReport::Torture(report) => {
                if report.aborted {
                    self.journal.warn("torture test aborted");
                } else if report.passed() {
                    self.journal
                        .info(&format!("torture test passed: {} cases", report.cases.len()));
                } else {
                    for case in report.instabilities() {
                        self.journal.error(&format!(
                            "torture case {} failed: {:?}",
                            case.case.label(),
                            case.verdict
                        ));
                    }
                }
            }
            DiagnosticReport::Benchmark(report) => {
                for m in &report.ranked {
                    self.journal.info(&format!(
                        "benchmark {}: {:.3} ms/iter, {:.1} iter/s",
                        m.case.label(),
                        m.ms_per_iteration,
                        m.iterations_per_sec
                    ));
                }
                for (case, reason) in &report.skipped {
                    self.journal
                        .warn(&format!("benchmark {} skipped: {reason}", case.label()));
                }
            }
        }
    }

    fn raise(&mut self, alert: Alert) {
        match alert.severity {
            Severity::Critical => self.journal.error(&alert.to_string()),
            Severity::Warning => self.journal.warn(&alert.to_string()),
            Severity::Info => self.journal.info(&alert.to_string()),
        }
        self.publisher.raise(alert);
    }

    fn collect_alerts(&mut self) {
        let mut alerts = self.coordinator.take_alerts();
        alerts.extend(self.diagnostics.take_alerts());
        for alert in alerts {
            self.raise(alert);
        }
    }

    /// Results go to disk before the queue acks that retire their work, so a
    /// crash in between recomputes rather than loses a result.
    async fn persist(&mut self) {
        if let Err(e) = self.persist_results().await {
            error!(error = %e, settled = self.settled.len(), "failed to persist result buffer; holding queue acks");
            return;
        }
        if let Err(e) = self.storage.persist_queue(&self.queue).await {
            error!(error = %e, backlog = self.storage.backlog_len(), "failed to persist work queue");
        }
    }

    async fn persist_results(&mut self) -> ApplicationResult<()> {
        if self.results_dirty {
            self.storage.save_results(self.coordinator.results()).await?;
            self.results_dirty = false;
        }
        for id in std::mem::take(&mut self.settled) {
            self.forget_checkpoint(&id).await;
        }
        Ok(())
    }

    pub fn status(&self, now: DateTime<Utc>) -> StatusSnapshot {
        let grant = self.supervisor.grant();
        let (queue_depth, checked_out, awaiting_confirmation, permanently_failed) = self.queue.with(|q| {
            (
                q.depth(),
                q.checked_out(),
                q.awaiting_confirmation().len(),
                q.failed.len(),
            )
        });
        let results = self.coordinator.results().snapshot();
        StatusSnapshot {
            taken_at: now,
            slots: self.supervisor.slots().iter().map(WorkerSlot::view).collect(),
            queue_depth,
            checked_out,
            awaiting_confirmation,
            permanently_failed,
            coordinator_health: self.coordinator.health(),
            last_contact: self.coordinator.session().last_contact,
            buffered_results: results.len(),
            rejected_results: results.rejected().to_vec(),
            schedule_window: ScheduleStatus {
                window: grant.window.clone(),
                emergency: grant.emergency,
                max_workers: grant.max_workers,
                memory_ceiling_bytes: grant.memory_ceiling_bytes,
                hyperthreading: grant.hyperthreading,
            },
            mode: self.supervisor.mode(),
            diagnostics: self.diagnostics.describe(),
            last_torture: self.diagnostics.last_torture().cloned(),
            last_benchmark: self.diagnostics.last_benchmark().cloned(),
            alerts: Vec::new(),
        }
    }

    fn publish(&self, now: DateTime<Utc>) {
        self.publisher.publish(self.status(now));
    }

    /// Stop every slot at its next safe point (bounded by the grace period,
    /// after which the supervisor faults the slot), then persist everything.
    pub async fn shutdown(&mut self) -> ApplicationResult<()> {
        info!("engine shutting down");
        self.shutting_down = true;
        let now = Utc::now();
        if let Some(report) = self.diagnostics.abort(&mut self.supervisor, now) {
            self.on_report(report);
        }
        self.supervisor.stop_all(now, StopReason::Shutdown);

        let poll = self.settings.tick_interval.min(Duration::from_millis(100));
        let grace = self
            .supervisor
            .settings()
            .grace_period
            .to_std()
            .unwrap_or(Duration::from_secs(60));
        let deadline = tokio::time::Instant::now() + grace + self.settings.tick_interval * 2;
        loop {
            let now = Utc::now();
            self.supervisor.tick(now);
            self.drain_events(now).await;
            if self.supervisor.is_quiescent() || tokio::time::Instant::now() >= deadline {
                break;
            }
            sleep(poll).await;
        }
        if !self.supervisor.is_quiescent() {
            warn!(active = self.supervisor.active_count(), "slots still active at shutdown");
        }

        self.collect_alerts();
        self.results_dirty = true;
        self.persist_results().await?;
        self.storage.persist_queue(&self.queue).await?;
        self.publish(Utc::now());
        self.journal.info("client stopped");
        Ok(())
    }
}
