use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use primenet_client::adapters::inbound::{FileEventStore, FileSnapshotStore, InMemoryEventStore, InMemorySnapshotStore};
use primenet_client::adapters::outbound::{init_noop_journal, SimulatedKernel, SimulatedKernelSettings};
use primenet_client::application::{
    CoordinatorParts, Engine, EngineCommand, EngineParts, EngineSettings, EngineStorage, RESULT_BUFFER_ID,
};
use primenet_client::domains::diagnostics::TortureConfig;
use primenet_client::domains::journal::{DynJournal, Journal};
use primenet_client::domains::primenet::{
    CoordinatorHealth, CoordinatorSettings, Credentials, PrimeNetTransport, RenewOutcome, ResultSubmission,
    SubmitResponse, TransportError,
};
use primenet_client::domains::resources::{
    HardwareProfile, ResourceSchedule, ScheduleWindow, TimeOfDay, WindowLimits, WorkerDemand, GIB, MIB,
};
use primenet_client::domains::status::AlertKind;
use primenet_client::domains::supervisor::{
    CheckpointRecord, ComputeKernel, SlotState, SupervisorSettings, TaskHandle, TaskProgress, TaskState,
};
use primenet_client::domains::work_queue::{
    Assignment, AssignmentId, AssignmentSource, MemoryPattern, Priority, Residue, WorkKind,
};
use primenet_client::common::{EventStore, Snapshot, SnapshotStore};
use primenet_client::domains::resources::SlotGrant;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[derive(Default)]
struct ScriptedTransport {
    online: bool,
    submissions: Mutex<Vec<AssignmentId>>,
}

impl ScriptedTransport {
    fn offline() -> Self {
        Self::default()
    }

    fn online() -> Self {
        Self {
            online: true,
            ..Self::default()
        }
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.online {
            Ok(())
        } else {
            Err(TransportError::Unreachable("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl PrimeNetTransport for ScriptedTransport {
    async fn ping(&self) -> Result<(), TransportError> {
        self.check()
    }

    async fn get_assignments(&self, _count: usize) -> Result<Vec<Assignment>, TransportError> {
        self.check().map(|_| Vec::new())
    }

    async fn submit_result(&self, submission: &ResultSubmission) -> Result<SubmitResponse, TransportError> {
        self.check()?;
        self.submissions.lock().push(submission.assignment_id.clone());
        Ok(SubmitResponse::Accepted)
    }

    async fn renew(&self, _id: &AssignmentId, _fraction_done: f64) -> Result<RenewOutcome, TransportError> {
        self.check()?;
        Ok(RenewOutcome::Renewed {
            expires_at: Utc::now() + ChronoDuration::days(30),
        })
    }
}

/// Online, but the server reports every reservation as lapsed.
struct ExpiringTransport;

#[async_trait]
impl PrimeNetTransport for ExpiringTransport {
    async fn ping(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn get_assignments(&self, _count: usize) -> Result<Vec<Assignment>, TransportError> {
        Ok(Vec::new())
    }

    async fn submit_result(&self, _submission: &ResultSubmission) -> Result<SubmitResponse, TransportError> {
        Ok(SubmitResponse::Accepted)
    }

    async fn renew(&self, _id: &AssignmentId, _fraction_done: f64) -> Result<RenewOutcome, TransportError> {
        Ok(RenewOutcome::Expired)
    }
}

/// Fails result-buffer writes while `failing` is set; everything else goes through.
#[derive(Default)]
struct FlakyResultStore {
    inner: InMemorySnapshotStore,
    failing: AtomicBool,
}

#[async_trait]
impl SnapshotStore for FlakyResultStore {
    async fn save(&self, snapshot: Snapshot) -> Result<(), String> {
        if snapshot.aggregate_id == RESULT_BUFFER_ID && self.failing.load(Ordering::SeqCst) {
            return Err("no space left on device".to_string());
        }
        self.inner.save(snapshot).await
    }

    async fn load_latest(&self, aggregate_id: &str, at_most: Option<u64>) -> Result<Option<Snapshot>, String> {
        self.inner.load_latest(aggregate_id, at_most).await
    }

    async fn prune_before(&self, aggregate_id: &str, version: u64) -> Result<(), String> {
        self.inner.prune_before(aggregate_id, version).await
    }
}

#[derive(Default)]
struct RecordingJournal(Mutex<Vec<String>>);

impl RecordingJournal {
    fn lines(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

impl Journal for RecordingJournal {
    fn info(&self, msg: &str) {
        self.0.lock().push(msg.to_string());
    }
    fn warn(&self, msg: &str) {
        self.0.lock().push(msg.to_string());
    }
    fn error(&self, msg: &str) {
        self.0.lock().push(msg.to_string());
    }
}

/// Never makes progress and never reports a heartbeat after launch.
struct HungKernel;

struct HungTask {
    started: chrono::DateTime<Utc>,
}

impl TaskHandle for HungTask {
    fn checkpoint(&self) -> TaskProgress {
        TaskProgress {
            iteration: 0,
            total: 1000,
            residue: Residue(4),
            heartbeat_at: self.started,
        }
    }
    fn state(&self) -> TaskState {
        TaskState::Running
    }
    fn pause(&self) {}
    fn resume(&self) {}
    fn cancel(&self, _graceful: bool) {}
    fn adjust_memory(&self, _memory_bytes: u64) {}
}

impl ComputeKernel for HungKernel {
    fn launch(
        &self,
        _assignment: &Assignment,
        _grant: &SlotGrant,
        _resume_from: Option<&CheckpointRecord>,
    ) -> Result<Box<dyn TaskHandle>, String> {
        Ok(Box::new(HungTask { started: Utc::now() }))
    }
}

fn whole_day(label: &str, gb: u64, max_workers: usize) -> ResourceSchedule {
    ResourceSchedule::new(
        vec![ScheduleWindow {
            label: label.to_string(),
            start: TimeOfDay::midnight(),
            end: TimeOfDay::midnight(),
            limits: WindowLimits {
                memory_ceiling_bytes: gb * GIB,
                max_workers,
                allow_hyperthreading: false,
            },
        }],
        64 * MIB,
    )
    .unwrap()
}

fn throttled_kernel() -> Arc<dyn ComputeKernel> {
    Arc::new(SimulatedKernel::new(SimulatedKernelSettings {
        batch: 100,
        throttle: Some(Duration::from_millis(5)),
        pin_threads: false,
        corrupt_diagnostics: false,
    }))
}

fn parts(
    workers: usize,
    kernel: Arc<dyn ComputeKernel>,
    transport: Arc<dyn PrimeNetTransport>,
    events: Arc<dyn EventStore>,
    snapshots: Arc<dyn SnapshotStore>,
    journal: DynJournal,
) -> EngineParts {
    EngineParts {
        settings: EngineSettings::default(),
        hardware: HardwareProfile::new(4, 1),
        demand: WorkerDemand::uniform(workers, GIB),
        schedule: whole_day("night", 8, 4),
        supervisor: SupervisorSettings::default(),
        kernel,
        coordinator: CoordinatorParts {
            settings: CoordinatorSettings {
                failure_threshold: 1,
                backoff_base: ChronoDuration::seconds(1),
                ..CoordinatorSettings::default()
            },
            endpoint: "http://primenet.invalid".to_string(),
            credentials: Credentials {
                user_id: "tester".to_string(),
                computer_id: "rig-1".to_string(),
                api_key: None,
            },
            proxy: None,
            transport,
            manual_source: None,
            manual_mode: false,
        },
        event_store: events,
        snapshot_store: snapshots,
        journal,
    }
}

fn in_memory(workers: usize, kernel: Arc<dyn ComputeKernel>, transport: Arc<dyn PrimeNetTransport>) -> EngineParts {
    parts(
        workers,
        kernel,
        transport,
        Arc::new(InMemoryEventStore::new()),
        Arc::new(InMemorySnapshotStore::new()),
        init_noop_journal(),
    )
}

fn ll(id: &str, exponent: u64, priority: Priority) -> Assignment {
    Assignment::new(
        AssignmentId::new(id),
        WorkKind::LucasLehmer { exponent },
        priority,
        AssignmentSource::Manual,
    )
}

#[tokio::test]
async fn test_high_priority_first_and_degraded_when_unreachable() {
    let mut engine = Engine::bootstrap(in_memory(4, throttled_kernel(), Arc::new(ScriptedTransport::offline())))
        .await
        .unwrap();
    for a in [
        ll("N1", 110503, Priority::Normal),
        ll("N2", 132049, Priority::Normal),
        ll("H1", 216091, Priority::High),
    ] {
        engine.queue().enqueue(a).unwrap();
    }

    let now = Utc::now();
    engine.step(now).await;
    let status = engine.status(now);
    assert_eq!(status.schedule_window.window, "night");
    assert_eq!(status.schedule_window.max_workers, 4);
    assert_eq!(status.slots.len(), 4);
    assert_eq!(status.slots[0].assignment_id, Some(AssignmentId::new("H1")));
    assert_eq!(status.checked_out, 3);

    let report = engine.sync(now).await;
    assert_eq!(report.pulled, 0);
    let status = engine.status(now);
    assert_eq!(status.coordinator_health, CoordinatorHealth::Degraded);
    assert_eq!(status.buffered_results, 0);
    assert_eq!(status.running_slots(), 3);
}

#[tokio::test]
async fn test_restart_resumes_from_checkpoint() {
    let dir = TempDir::new().unwrap();
    let events: Arc<dyn EventStore> = Arc::new(FileEventStore::new(dir.path().join("events")));
    let snapshots: Arc<dyn SnapshotStore> = Arc::new(FileSnapshotStore::new(dir.path().join("snapshots")));

    {
        let mut engine = Engine::bootstrap(parts(
            1,
            throttled_kernel(),
            Arc::new(ScriptedTransport::offline()),
            events.clone(),
            snapshots.clone(),
            init_noop_journal(),
        ))
        .await
        .unwrap();
        engine.queue().enqueue(ll("M1", 110503, Priority::Normal)).unwrap();
        engine.step(Utc::now()).await;
        assert_eq!(engine.status(Utc::now()).checked_out, 1);

        let storage = EngineStorage::new(events.clone(), snapshots.clone(), 100);
        storage
            .save_checkpoint(&CheckpointRecord {
                assignment_id: AssignmentId::new("M1"),
                iteration: 1000,
                residue: Residue(0xDEAD_BEEF),
                written_at: Utc::now(),
            })
            .await
            .unwrap();
        // Dropped without a shutdown, as after a crash.
    }

    let journal = Arc::new(RecordingJournal::default());
    let mut engine = Engine::bootstrap(parts(
        1,
        throttled_kernel(),
        Arc::new(ScriptedTransport::offline()),
        events,
        snapshots,
        journal.clone(),
    ))
    .await
    .unwrap();
    engine.step(Utc::now()).await;
    engine.step(Utc::now()).await;

    let status = engine.status(Utc::now());
    assert_eq!(status.slots[0].assignment_id, Some(AssignmentId::new("M1")));
    let progress = status.slots[0].progress.unwrap();
    assert!(progress.iteration >= 1000, "restarted at {}", progress.iteration);
    assert!(journal
        .lines()
        .iter()
        .any(|l| l.contains("resuming M1 from iteration 1000")));
}

#[tokio::test]
async fn test_stop_returns_slot_to_idle_and_requeues() {
    let mut engine = Engine::bootstrap(in_memory(1, throttled_kernel(), Arc::new(ScriptedTransport::offline())))
        .await
        .unwrap();
    engine.queue().enqueue(ll("S1", 110503, Priority::Normal)).unwrap();
    engine.step(Utc::now()).await;
    assert_eq!(engine.status(Utc::now()).slots[0].state, SlotState::Running);

    assert!(engine
        .handle_command(EngineCommand::StopWorkers, Utc::now())
        .is_accepted());
    let mut idle = false;
    for _ in 0..200 {
        engine.step(Utc::now()).await;
        if engine.status(Utc::now()).slots[0].state == SlotState::Idle {
            idle = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(idle, "slot never reached idle");

    let status = engine.status(Utc::now());
    assert_eq!(status.queue_depth, 1);
    assert_eq!(status.checked_out, 0);
    assert_eq!(status.buffered_results, 0);
    let attempts = engine.queue().with(|q| q.entry(&AssignmentId::new("S1")).map(|e| e.attempts));
    assert_eq!(attempts, Some(0));
}

#[tokio::test]
async fn test_completed_result_is_submitted_once() {
    let transport = Arc::new(ScriptedTransport::online());
    let mut engine = Engine::bootstrap(in_memory(
        1,
        Arc::new(SimulatedKernel::new(SimulatedKernelSettings {
            pin_threads: false,
            ..SimulatedKernelSettings::default()
        })),
        transport.clone(),
    ))
    .await
    .unwrap();
    engine.queue().enqueue(ll("R1", 127, Priority::Normal)).unwrap();

    for _ in 0..200 {
        engine.step(Utc::now()).await;
        if engine.coordinator().results().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(engine.coordinator().results().len(), 1);

    let first = engine.sync(Utc::now()).await;
    assert_eq!(first.flushed.accepted, 1);
    let second = engine.sync(Utc::now()).await;
    assert_eq!(second.flushed.accepted, 0);

    assert_eq!(transport.submissions.lock().len(), 1);
    assert!(engine.coordinator().results().is_accepted(&AssignmentId::new("R1")));
    assert_eq!(engine.status(Utc::now()).coordinator_health, CoordinatorHealth::Healthy);
}

#[tokio::test]
async fn test_missed_heartbeats_fault_the_slot_once() {
    let mut parts = in_memory(1, Arc::new(HungKernel), Arc::new(ScriptedTransport::offline()));
    parts.supervisor = SupervisorSettings {
        heartbeat_interval: ChronoDuration::seconds(10),
        missed_heartbeats: 3,
        ..SupervisorSettings::default()
    };
    let mut engine = Engine::bootstrap(parts).await.unwrap();
    engine.queue().enqueue(ll("H1", 110503, Priority::Normal)).unwrap();

    let start = Utc::now();
    engine.step(start).await;
    engine.step(start + ChronoDuration::seconds(15)).await;
    assert_eq!(engine.status(start).slots[0].state, SlotState::Running);

    engine.step(start + ChronoDuration::seconds(45)).await;
    engine.step(start + ChronoDuration::seconds(60)).await;

    let status = engine.status(start + ChronoDuration::seconds(60));
    assert_eq!(status.slots[0].state, SlotState::Faulted);
    let attempts = engine.queue().with(|q| q.entry(&AssignmentId::new("H1")).map(|e| e.attempts));
    assert_eq!(attempts, Some(1));
    assert_eq!(status.queue_depth, 1);

    let published = engine.handle().snapshot();
    assert!(published
        .alerts
        .iter()
        .any(|a| a.kind == AlertKind::HeartbeatTimeout));
}

#[tokio::test]
async fn test_handle_round_trip_and_shutdown() {
    let engine = Engine::bootstrap(in_memory(1, throttled_kernel(), Arc::new(ScriptedTransport::offline())))
        .await
        .unwrap();
    let handle = engine.handle();
    let task = tokio::spawn(engine.run());

    assert!(handle
        .enqueue(ll("Q1", 110503, Priority::High))
        .await
        .unwrap()
        .is_accepted());
    let snapshot = handle
        .wait_for(|s| s.slots.first().and_then(|slot| slot.assignment_id.clone()) == Some(AssignmentId::new("Q1")))
        .await
        .unwrap();
    assert_eq!(snapshot.checked_out, 1);

    assert!(!handle.set_emergency(true).await.unwrap().is_accepted());
    assert!(handle.shutdown().await.unwrap().is_accepted());
    task.await.unwrap().unwrap();

    assert!(handle.stop_workers().await.is_err());
}

#[tokio::test]
async fn test_result_outlives_a_failed_result_write() {
    let events = Arc::new(InMemoryEventStore::new());
    let snapshots = Arc::new(FlakyResultStore::default());
    snapshots.failing.store(true, Ordering::SeqCst);
    let mut engine = Engine::bootstrap(parts(
        1,
        Arc::new(SimulatedKernel::new(SimulatedKernelSettings {
            pin_threads: false,
            ..SimulatedKernelSettings::default()
        })),
        Arc::new(ScriptedTransport::offline()),
        events.clone(),
        snapshots.clone(),
        init_noop_journal(),
    ))
    .await
    .unwrap();
    let storage = EngineStorage::new(events.clone(), snapshots.clone(), 100);
    let id = AssignmentId::new("R1");
    storage
        .save_checkpoint(&CheckpointRecord {
            assignment_id: id.clone(),
            iteration: 1,
            residue: Residue(14),
            written_at: Utc::now(),
        })
        .await
        .unwrap();
    engine.queue().enqueue(ll("R1", 127, Priority::Normal)).unwrap();

    for _ in 0..200 {
        engine.step(Utc::now()).await;
        if engine.coordinator().results().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(engine.coordinator().results().len(), 1);
    assert!(storage.load_checkpoint(&id).await.unwrap().is_some());
    assert!(events.load_by_type("Acked", None).await.unwrap().is_empty());

    snapshots.failing.store(false, Ordering::SeqCst);
    engine.step(Utc::now()).await;
    assert!(storage.load_checkpoint(&id).await.unwrap().is_none());
    assert_eq!(events.load_by_type("Acked", None).await.unwrap().len(), 1);
    let mut reloaded = EngineStorage::new(events, snapshots, 100);
    assert_eq!(reloaded.load_results().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_reservation_lapsing_mid_run_holds_the_work() {
    let events: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let snapshots: Arc<dyn SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
    let mut engine = Engine::bootstrap(parts(
        1,
        throttled_kernel(),
        Arc::new(ExpiringTransport),
        events.clone(),
        snapshots.clone(),
        init_noop_journal(),
    ))
    .await
    .unwrap();
    let mut assignment = Assignment::new(
        AssignmentId::new("E1"),
        WorkKind::LucasLehmer { exponent: 110503 },
        Priority::Normal,
        AssignmentSource::PrimeNet,
    );
    assignment.deadline = Some(Utc::now() + ChronoDuration::hours(2));
    engine.queue().enqueue(assignment).unwrap();

    engine.step(Utc::now()).await;
    assert_eq!(engine.status(Utc::now()).slots[0].state, SlotState::Running);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = engine.sync(Utc::now()).await;
    assert_eq!(report.expired_in_flight, vec![AssignmentId::new("E1")]);

    let mut idle = false;
    for _ in 0..200 {
        engine.step(Utc::now()).await;
        if engine.status(Utc::now()).slots[0].state == SlotState::Idle {
            idle = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(idle, "slot never reached idle");

    let id = AssignmentId::new("E1");
    let waiting = engine.queue().with(|q| q.awaiting_confirmation());
    assert_eq!(waiting, vec![id.clone()]);
    let status = engine.status(Utc::now());
    assert_eq!(status.checked_out, 0);
    assert_eq!(status.awaiting_confirmation, 1);
    assert!(engine
        .handle()
        .snapshot()
        .alerts
        .iter()
        .any(|a| a.kind == AlertKind::AssignmentExpired));
    assert!(engine.coordinator().results().is_empty());
    let storage = EngineStorage::new(events, snapshots, 100);
    let checkpoint = storage.load_checkpoint(&id).await.unwrap();
    assert!(checkpoint.map_or(false, |c| c.iteration > 0));
}

#[tokio::test]
async fn test_step_stays_responsive_while_reference_is_computed() {
    let mut engine = Engine::bootstrap(in_memory(
        1,
        Arc::new(SimulatedKernel::new(SimulatedKernelSettings {
            pin_threads: false,
            ..SimulatedKernelSettings::default()
        })),
        Arc::new(ScriptedTransport::offline()),
    ))
    .await
    .unwrap();
    let config = TortureConfig {
        fft_sizes_k: vec![4],
        worker_counts: vec![1],
        patterns: vec![MemoryPattern::Blend],
        iterations: 500_000_000,
        expected_residue: None,
    };
    assert!(engine
        .handle_command(EngineCommand::RunTorture(Some(config)), Utc::now())
        .is_accepted());

    for _ in 0..3 {
        let started = Instant::now();
        engine.step(Utc::now()).await;
        assert!(started.elapsed() < Duration::from_millis(200), "step took {:?}", started.elapsed());
        assert!(engine.status(Utc::now()).diagnostics.is_some());
    }
    assert!(engine
        .handle_command(EngineCommand::AbortDiagnostics, Utc::now())
        .is_accepted());
}
