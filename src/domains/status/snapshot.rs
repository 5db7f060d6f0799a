use super::alert::Alert;
use crate::domains::diagnostics::{BenchmarkReport, TortureReport};
use crate::domains::primenet::{CoordinatorHealth, RejectedResult};
use crate::domains::supervisor::{SlotView, SupervisorMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStatus {
    pub window: String,
    pub emergency: bool,
    pub max_workers: usize,
    pub memory_ceiling_bytes: u64,
    pub hyperthreading: bool,
}

/// Read-only picture of the whole client, rebuilt after every control step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub taken_at: DateTime<Utc>,
    pub slots: Vec<SlotView>,
    pub queue_depth: usize,
    pub checked_out: usize,
    pub awaiting_confirmation: usize,
    pub permanently_failed: usize,
    pub coordinator_health: CoordinatorHealth,
    pub last_contact: Option<DateTime<Utc>>,
    pub buffered_results: usize,
    pub rejected_results: Vec<RejectedResult>,
    pub schedule_window: ScheduleStatus,
    pub mode: SupervisorMode,
    pub diagnostics: Option<String>,
    pub last_torture: Option<TortureReport>,
    pub last_benchmark: Option<BenchmarkReport>,
    /// Most recent first.
    pub alerts: Vec<Alert>,
}

impl StatusSnapshot {
    pub fn empty() -> Self {
        Self {
            taken_at: Utc::now(),
            slots: Vec::new(),
            queue_depth: 0,
            checked_out: 0,
            awaiting_confirmation: 0,
            permanently_failed: 0,
            coordinator_health: CoordinatorHealth::Healthy,
            last_contact: None,
            buffered_results: 0,
            rejected_results: Vec::new(),
            schedule_window: ScheduleStatus {
                window: "unplanned".to_string(),
                emergency: false,
                max_workers: 0,
                memory_ceiling_bytes: 0,
                hyperthreading: false,
            },
            mode: SupervisorMode::Normal,
            diagnostics: None,
            last_torture: None,
            last_benchmark: None,
            alerts: Vec::new(),
        }
    }

    pub fn running_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.assignment_id.is_some()).count()
    }
}
