use super::matrix::{benchmark_matrix, torture_matrix, BenchmarkConfig, DiagnosticCase, TortureConfig};
use crate::domains::resources::HardwareProfile;
use crate::domains::status::{Alert, AlertKind};
use crate::domains::supervisor::{
    ReferenceResidue, StopReason, SupervisorEvent, SupervisorMode, WorkerSupervisor,
};
use crate::domains::work_queue::{
    Assignment, AssignmentId, AssignmentSource, ComputationResult, Priority, Residue, WorkKind,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CaseVerdict {
    Pass,
    HardwareInstability { detail: String },
    /// Could not be run under the current grant.
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TortureCaseReport {
    pub case: DiagnosticCase,
    pub verdict: CaseVerdict,
    pub elapsed_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TortureReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cases: Vec<TortureCaseReport>,
    pub aborted: bool,
}

impl TortureReport {
    pub fn passed(&self) -> bool {
        !self.aborted && self.instabilities().next().is_none()
    }

    pub fn instabilities(&self) -> impl Iterator<Item = &TortureCaseReport> {
        self.cases
            .iter()
            .filter(|c| matches!(c.verdict, CaseVerdict::HardwareInstability { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkMeasurement {
    pub case: DiagnosticCase,
    /// Summed over all workers in the case.
    pub iterations_per_sec: f64,
    /// Per worker.
    pub ms_per_iteration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Fastest first.
    pub ranked: Vec<BenchmarkMeasurement>,
    pub skipped: Vec<(DiagnosticCase, String)>,
    pub aborted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiagnosticReport {
    Torture(TortureReport),
    Benchmark(BenchmarkReport),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOutcome {
    pub outcome: Result<ComputationResult, String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Torture verdict for one case: every worker must finish the full iteration
/// count with the expected residue. Without a reference the workers must agree.
pub fn judge_torture(case: &DiagnosticCase, expected: Option<Residue>, outcomes: &[WorkerOutcome]) -> CaseVerdict {
    let mut residues = Vec::with_capacity(outcomes.len());
    for (worker, outcome) in outcomes.iter().enumerate() {
        match &outcome.outcome {
            Ok(ComputationResult::Diagnostic { residue, iterations }) => {
                if *iterations != case.iterations {
                    return CaseVerdict::HardwareInstability {
                        detail: format!(
                            "worker {worker} completed {iterations} of {} iterations",
                            case.iterations
                        ),
                    };
                }
                residues.push(*residue);
            }
            Ok(other) => {
                return CaseVerdict::HardwareInstability {
                    detail: format!("worker {worker} returned {other:?}"),
                }
            }
            Err(reason) => {
                return CaseVerdict::HardwareInstability {
                    detail: format!("worker {worker} failed: {reason}"),
                }
            }
        }
    }
    let reference = match expected.or_else(|| residues.first().copied()) {
        Some(r) => r,
        None => {
            return CaseVerdict::Skipped {
                reason: "no workers ran".to_string(),
            }
        }
    };
    match residues.iter().position(|r| *r != reference) {
        Some(worker) => CaseVerdict::HardwareInstability {
            detail: format!(
                "worker {worker} residue {} does not match {}",
                residues[worker], reference
            ),
        },
        None => CaseVerdict::Pass,
    }
}

/// Throughput of one benchmark case, or the reason it has none.
pub fn measure(case: &DiagnosticCase, outcomes: &[WorkerOutcome]) -> Result<BenchmarkMeasurement, String> {
    if outcomes.is_empty() {
        return Err("no workers ran".to_string());
    }
    if let Some(err) = outcomes.iter().find_map(|o| o.outcome.as_ref().err()) {
        return Err(err.clone());
    }
    let start = outcomes.iter().map(|o| o.started_at).min().unwrap_or_else(Utc::now);
    let end = outcomes.iter().map(|o| o.finished_at).max().unwrap_or(start);
    let wall_ms = (end - start).num_milliseconds().max(1) as f64;
    let total_iterations = case.iterations as f64 * outcomes.len() as f64;
    Ok(BenchmarkMeasurement {
        case: case.clone(),
        iterations_per_sec: total_iterations * 1000.0 / wall_ms,
        ms_per_iteration: wall_ms / case.iterations.max(1) as f64,
    })
}

pub fn rank(measurements: &mut [BenchmarkMeasurement]) {
    measurements.sort_by(|a, b| {
        b.iterations_per_sec
            .partial_cmp(&a.iterations_per_sec)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

enum RunKind {
    Torture { expected: Option<Residue> },
    Benchmark,
}

/// Residue a case is judged against.
enum Expected {
    Known(Option<Residue>),
    /// The kernel is still producing it.
    Awaiting(WorkKind),
}

impl Expected {
    fn lookup(supervisor: &WorkerSupervisor, kind: &WorkKind) -> Self {
        match supervisor.kernel().reference_residue(kind) {
            ReferenceResidue::Ready(residue) => Expected::Known(Some(residue)),
            ReferenceResidue::Computing => Expected::Awaiting(kind.clone()),
            ReferenceResidue::Unavailable => Expected::Known(None),
        }
    }

    fn residue(&self) -> Option<Residue> {
        match self {
            Expected::Known(residue) => *residue,
            Expected::Awaiting(_) => None,
        }
    }
}

struct CaseInFlight {
    case: DiagnosticCase,
    expected: Expected,
    started_at: DateTime<Utc>,
    outstanding: HashSet<AssignmentId>,
    finished: Vec<WorkerOutcome>,
}

struct ActiveRun {
    kind: RunKind,
    pending: VecDeque<DiagnosticCase>,
    total: usize,
    current: Option<CaseInFlight>,
    started_at: DateTime<Utc>,
    torture: Vec<TortureCaseReport>,
    measurements: Vec<BenchmarkMeasurement>,
    skipped: Vec<(DiagnosticCase, String)>,
}

/// Runs torture and benchmark matrices on the worker slots, one case at a
/// time, with the supervisor held in exclusive mode.
#[derive(Default)]
pub struct DiagnosticsController {
    active: Option<ActiveRun>,
    last_torture: Option<TortureReport>,
    last_benchmark: Option<BenchmarkReport>,
    alerts: Vec<Alert>,
}

impl DiagnosticsController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn last_torture(&self) -> Option<&TortureReport> {
        self.last_torture.as_ref()
    }

    pub fn last_benchmark(&self) -> Option<&BenchmarkReport> {
        self.last_benchmark.as_ref()
    }

    pub fn take_alerts(&mut self) -> Vec<Alert> {
        std::mem::take(&mut self.alerts)
    }

    /// "torture 3/12 (64K x4 Blend)" while a run is active.
    pub fn describe(&self) -> Option<String> {
        let run = self.active.as_ref()?;
        let name = match run.kind {
            RunKind::Torture { .. } => "torture",
            RunKind::Benchmark => "benchmark",
        };
        let done = run.total - run.pending.len();
        Some(match &run.current {
            Some(c) => format!("{name} {done}/{} ({})", run.total, c.case.label()),
            None => format!("{name} {done}/{}", run.total),
        })
    }

    pub fn begin_torture(
        &mut self,
        config: &TortureConfig,
        hardware: &HardwareProfile,
        now: DateTime<Utc>,
    ) -> Result<usize, String> {
        let cases = torture_matrix(config, hardware);
        self.begin(
            RunKind::Torture {
                expected: config.expected_residue,
            },
            cases,
            now,
        )
    }

    pub fn begin_benchmark(&mut self, config: &BenchmarkConfig, now: DateTime<Utc>) -> Result<usize, String> {
        self.begin(RunKind::Benchmark, benchmark_matrix(config), now)
    }

    fn begin(&mut self, kind: RunKind, cases: Vec<DiagnosticCase>, now: DateTime<Utc>) -> Result<usize, String> {
        if self.active.is_some() {
            return Err("a diagnostic run is already in progress".to_string());
        }
        if cases.is_empty() {
            return Err("the configuration produced no cases".to_string());
        }
        let total = cases.len();
        self.active = Some(ActiveRun {
            kind,
            pending: cases.into(),
            total,
            current: None,
            started_at: now,
            torture: Vec::new(),
            measurements: Vec::new(),
            skipped: Vec::new(),
        });
        Ok(total)
    }

    /// Feed supervisor events; only diagnostic completions of the current case matter.
    pub fn on_event(&mut self, event: &SupervisorEvent) {
        let SupervisorEvent::DiagnosticFinished {
            assignment,
            outcome,
            started_at,
            finished_at,
            ..
        } = event
        else {
            return;
        };
        let Some(current) = self.active.as_mut().and_then(|r| r.current.as_mut()) else {
            return;
        };
        if current.outstanding.remove(&assignment.id) {
            current.finished.push(WorkerOutcome {
                outcome: outcome.clone(),
                started_at: *started_at,
                finished_at: *finished_at,
            });
        }
    }

    /// Advance the run. Returns the report when the last case finishes.
    pub fn step(&mut self, supervisor: &mut WorkerSupervisor, now: DateTime<Utc>) -> Option<DiagnosticReport> {
        let run = self.active.as_mut()?;
        if supervisor.mode() != SupervisorMode::Exclusive {
            info!("entering exclusive mode for diagnostics");
            supervisor.enter_exclusive(now);
            return None;
        }

        if let Some(current) = run.current.as_mut().filter(|c| c.outstanding.is_empty()) {
            if let Expected::Awaiting(kind) = &current.expected {
                let resolved = Expected::lookup(supervisor, kind);
                if let Expected::Awaiting(_) = resolved {
                    return None;
                }
                current.expected = resolved;
            }
            if let Some(done) = run.current.take() {
                self.conclude(done, now);
            }
        }
        let run = self.active.as_mut()?;
        if run.current.is_some() || !supervisor.is_quiescent() {
            return None;
        }

        match run.pending.pop_front() {
            Some(case) => {
                self.launch(case, supervisor, now);
                None
            }
            None => {
                supervisor.leave_exclusive(now);
                self.finish(false, now)
            }
        }
    }

    /// Stop the run early. Queue work resumes on the next fill.
    pub fn abort(&mut self, supervisor: &mut WorkerSupervisor, now: DateTime<Utc>) -> Option<DiagnosticReport> {
        self.active.as_ref()?;
        warn!("diagnostic run aborted");
        supervisor.leave_exclusive(now);
        self.finish(true, now)
    }

    fn launch(&mut self, case: DiagnosticCase, supervisor: &mut WorkerSupervisor, now: DateTime<Utc>) {
        let Some(run) = self.active.as_mut() else {
            return;
        };
        let kind = case.work_kind();
        let expected = match run.kind {
            RunKind::Torture { expected: Some(residue) } => Expected::Known(Some(residue)),
            RunKind::Torture { expected: None } => Expected::lookup(supervisor, &kind),
            RunKind::Benchmark => Expected::Known(None),
        };

        let mut outstanding = HashSet::new();
        for slot in 0..case.workers {
            let assignment = Assignment::new(
                AssignmentId::generate(),
                kind.clone(),
                Priority::Urgent,
                AssignmentSource::Diagnostic,
            );
            let id = assignment.id.clone();
            if let Err(e) = supervisor.start(slot, assignment, now) {
                warn!(case = %case.label(), error = %e, "diagnostic case skipped");
                supervisor.stop_all(now, StopReason::Diagnostics);
                let reason = e.to_string();
                match run.kind {
                    RunKind::Torture { .. } => run.torture.push(TortureCaseReport {
                        case,
                        verdict: CaseVerdict::Skipped { reason },
                        elapsed_ms: 0,
                    }),
                    RunKind::Benchmark => run.skipped.push((case, reason)),
                }
                return;
            }
            outstanding.insert(id);
        }
        info!(case = %case.label(), "diagnostic case started");
        run.current = Some(CaseInFlight {
            case,
            expected,
            started_at: now,
            outstanding,
            finished: Vec::new(),
        });
    }

    fn conclude(&mut self, done: CaseInFlight, now: DateTime<Utc>) {
        let Some(run) = self.active.as_mut() else {
            return;
        };
        match run.kind {
            RunKind::Torture { .. } => {
                let verdict = judge_torture(&done.case, done.expected.residue(), &done.finished);
                if let CaseVerdict::HardwareInstability { detail } = &verdict {
                    warn!(case = %done.case.label(), %detail, "hardware instability");
                    self.alerts.push(Alert::critical(
                        AlertKind::HardwareInstability,
                        format!("torture {}: {detail}", done.case.label()),
                        now,
                    ));
                }
                run.torture.push(TortureCaseReport {
                    elapsed_ms: (now - done.started_at).num_milliseconds(),
                    case: done.case,
                    verdict,
                });
            }
            RunKind::Benchmark => match measure(&done.case, &done.finished) {
                Ok(m) => run.measurements.push(m),
                Err(reason) => run.skipped.push((done.case, reason)),
            },
        }
    }

    fn finish(&mut self, aborted: bool, now: DateTime<Utc>) -> Option<DiagnosticReport> {
        let run = self.active.take()?;
        let report = match run.kind {
            RunKind::Torture { .. } => {
                let report = TortureReport {
                    started_at: run.started_at,
                    finished_at: now,
                    cases: run.torture,
                    aborted,
                };
                info!(passed = report.passed(), cases = report.cases.len(), "torture run finished");
                self.last_torture = Some(report.clone());
                DiagnosticReport::Torture(report)
            }
            RunKind::Benchmark => {
                let mut ranked = run.measurements;
                rank(&mut ranked);
                let report = BenchmarkReport {
                    started_at: run.started_at,
                    finished_at: now,
                    ranked,
                    skipped: run.skipped,
                    aborted,
                };
                info!(measured = report.ranked.len(), "benchmark finished");
                self.last_benchmark = Some(report.clone());
                DiagnosticReport::Benchmark(report)
            }
        };
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::work_queue::MemoryPattern;
    use chrono::Duration;

    fn case(iterations: u64) -> DiagnosticCase {
        DiagnosticCase {
            index: 0,
            fft_len_k: 64,
            workers: 2,
            pattern: Some(MemoryPattern::Blend),
            iterations,
        }
    }

    fn ok(residue: u64, iterations: u64) -> WorkerOutcome {
        let now = Utc::now();
        WorkerOutcome {
            outcome: Ok(ComputationResult::Diagnostic {
                residue: Residue(residue),
                iterations,
            }),
            started_at: now,
            finished_at: now + Duration::seconds(2),
        }
    }

    #[test]
    fn matching_residues_pass() {
        let verdict = judge_torture(&case(100), Some(Residue(7)), &[ok(7, 100), ok(7, 100)]);
        assert_eq!(verdict, CaseVerdict::Pass);
    }

    #[test]
    fn residue_mismatch_is_instability() {
        let verdict = judge_torture(&case(100), Some(Residue(7)), &[ok(7, 100), ok(8, 100)]);
        assert!(matches!(verdict, CaseVerdict::HardwareInstability { .. }));
    }

    #[test]
    fn workers_must_agree_without_reference() {
        assert_eq!(judge_torture(&case(100), None, &[ok(3, 100), ok(3, 100)]), CaseVerdict::Pass);
        assert!(matches!(
            judge_torture(&case(100), None, &[ok(3, 100), ok(4, 100)]),
            CaseVerdict::HardwareInstability { .. }
        ));
    }

    #[test]
    fn short_run_is_instability() {
        let verdict = judge_torture(&case(100), Some(Residue(7)), &[ok(7, 60)]);
        assert!(matches!(verdict, CaseVerdict::HardwareInstability { .. }));
    }

    #[test]
    fn benchmark_ranks_fastest_first() {
        let slow = measure(&case(100), &[ok(0, 100)]).unwrap();
        let mut fast_case = case(400);
        fast_case.index = 1;
        let fast = measure(&fast_case, &[ok(0, 400)]).unwrap();
        let mut all = vec![slow, fast];
        rank(&mut all);
        assert_eq!(all[0].case.index, 1);
        assert!((all[1].iterations_per_sec - 50.0).abs() < 1e-9);
        assert!((all[1].ms_per_iteration - 20.0).abs() < 1e-9);
    }
}
