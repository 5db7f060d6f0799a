use async_trait::async_trait;
use chrono::Utc;
use primenet_client::adapters::inbound::{FileEventStore, FileSnapshotStore};
use primenet_client::adapters::outbound::{init_noop_journal, SimulatedKernel, SimulatedKernelSettings, WorktodoFile};
use primenet_client::application::{CoordinatorParts, Engine, EngineParts, EngineSettings};
use primenet_client::domains::primenet::{
    CoordinatorHealth, CoordinatorSettings, Credentials, ManualWorkSource, PrimeNetTransport, RenewOutcome,
    ResultSubmission, SubmitResponse, TransportError,
};
use primenet_client::domains::resources::{HardwareProfile, ResourceSchedule, WindowLimits, WorkerDemand, GIB, MIB};
use primenet_client::domains::supervisor::SupervisorSettings;
use primenet_client::domains::work_queue::{Assignment, AssignmentId};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Fails the test if the engine talks to the server while in manual mode.
struct NoNetwork;

#[async_trait]
impl PrimeNetTransport for NoNetwork {
    async fn ping(&self) -> Result<(), TransportError> {
        panic!("ping in manual mode")
    }
    async fn get_assignments(&self, _count: usize) -> Result<Vec<Assignment>, TransportError> {
        panic!("get_assignments in manual mode")
    }
    async fn submit_result(&self, _submission: &ResultSubmission) -> Result<SubmitResponse, TransportError> {
        panic!("submit_result in manual mode")
    }
    async fn renew(&self, _id: &AssignmentId, _fraction_done: f64) -> Result<RenewOutcome, TransportError> {
        panic!("renew in manual mode")
    }
}

fn parts(data: &Path, worktodo: &Path, autostart: bool) -> EngineParts {
    EngineParts {
        settings: EngineSettings {
            autostart,
            snapshot_frequency: 2,
            ..EngineSettings::default()
        },
        hardware: HardwareProfile::new(2, 1),
        demand: WorkerDemand::uniform(1, 512 * MIB),
        schedule: ResourceSchedule::uniform(
            WindowLimits {
                memory_ceiling_bytes: GIB,
                max_workers: 1,
                allow_hyperthreading: false,
            },
            64 * MIB,
        ),
        supervisor: SupervisorSettings::default(),
        kernel: Arc::new(SimulatedKernel::new(SimulatedKernelSettings {
            pin_threads: false,
            ..SimulatedKernelSettings::default()
        })),
        coordinator: CoordinatorParts {
            settings: CoordinatorSettings {
                low_water_mark: 3,
                pull_batch: 2,
                ..CoordinatorSettings::default()
            },
            endpoint: "http://primenet.invalid".to_string(),
            credentials: Credentials {
                user_id: "tester".to_string(),
                computer_id: "rig-1".to_string(),
                api_key: None,
            },
            proxy: None,
            transport: Arc::new(NoNetwork),
            manual_source: Some(Arc::new(WorktodoFile::new(worktodo)) as Arc<dyn ManualWorkSource>),
            manual_mode: true,
        },
        event_store: Arc::new(FileEventStore::new(data.join("events"))),
        snapshot_store: Arc::new(FileSnapshotStore::new(data.join("snapshots"))),
        journal: init_noop_journal(),
    }
}

#[tokio::test]
async fn test_worktodo_feeds_the_queue_in_manual_mode() {
    let dir = TempDir::new().unwrap();
    let worktodo = dir.path().join("worktodo.txt");
    fs::write(
        &worktodo,
        "Test=W1,110503\nnot an assignment\nPRP=W2,1,2,132049,-1\nTest=W3,216091\n",
    )
    .unwrap();

    let mut engine = Engine::bootstrap(parts(dir.path(), &worktodo, false)).await.unwrap();
    let report = engine.sync(Utc::now()).await;
    assert_eq!(report.pulled, 2);
    assert_eq!(engine.queue().depth(), 2);
    assert_eq!(
        fs::read_to_string(&worktodo).unwrap(),
        "not an assignment\nTest=W3,216091\n"
    );

    let report = engine.sync(Utc::now()).await;
    assert_eq!(report.pulled, 1);
    assert_eq!(fs::read_to_string(&worktodo).unwrap(), "not an assignment\n");

    let status = engine.status(Utc::now());
    assert_eq!(status.coordinator_health, CoordinatorHealth::Manual);
    assert_eq!(status.queue_depth, 3);
}

#[tokio::test]
async fn test_queue_survives_restart_through_file_stores() {
    let dir = TempDir::new().unwrap();
    let worktodo = dir.path().join("worktodo.txt");
    fs::write(&worktodo, "Test=A1,110503\nTest=A2,132049\nTest=A3,216091\n").unwrap();

    {
        let mut engine = Engine::bootstrap(parts(dir.path(), &worktodo, false)).await.unwrap();
        engine.sync(Utc::now()).await;
        engine.sync(Utc::now()).await;
        assert_eq!(engine.queue().depth(), 3);
    }

    let engine = Engine::bootstrap(parts(dir.path(), &worktodo, false)).await.unwrap();
    let ids: Vec<String> = engine
        .queue()
        .with(|q| q.entries.iter().map(|e| e.assignment.id.to_string()).collect());
    assert_eq!(ids, vec!["A1", "A2", "A3"]);
    assert!(dir.path().join("snapshots").join("work-queue").exists());
}

#[tokio::test]
async fn test_buffered_results_survive_restart() {
    let dir = TempDir::new().unwrap();
    let worktodo = dir.path().join("worktodo.txt");
    fs::write(&worktodo, "Test=SMALL,127\n").unwrap();

    {
        let mut engine = Engine::bootstrap(parts(dir.path(), &worktodo, true)).await.unwrap();
        engine.sync(Utc::now()).await;
        for _ in 0..200 {
            engine.step(Utc::now()).await;
            if engine.coordinator().results().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.coordinator().results().len(), 1);
    }

    let engine = Engine::bootstrap(parts(dir.path(), &worktodo, false)).await.unwrap();
    let status = engine.status(Utc::now());
    assert_eq!(status.buffered_results, 1);
    assert_eq!(status.queue_depth, 0);
    assert_eq!(
        engine.coordinator().results().pending()[0].assignment_id,
        AssignmentId::new("SMALL")
    );
}
