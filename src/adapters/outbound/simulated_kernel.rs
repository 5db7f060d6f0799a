//! In-process stand-in for the arithmetic engine.
//!
//! Each task runs on its own OS thread and performs Lucas-style squarings
//! modulo the Mersenne prime 2^61 - 1 in batches. The gap between batches is
//! the task's safe point: pause, cancel and heartbeats all happen there. The
//! residue sequence is a pure function of the work kind and the iteration
//! count, so a task resumed from a checkpoint lands on exactly the residue an
//! uninterrupted run would have produced.

use super::affinity::pin_current_thread;
use crate::domains::resources::SlotGrant;
use crate::domains::supervisor::{
    CheckpointRecord, ComputeKernel, ReferenceResidue, TaskHandle, TaskProgress, TaskState,
};
use crate::domains::work_queue::{Assignment, ComputationResult, MemoryPattern, Residue, WorkKind};
use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MODULUS: u64 = (1 << 61) - 1;

fn mulmod(a: u64, b: u64) -> u64 {
    let product = u128::from(a) * u128::from(b);
    let folded = (product as u64 & MODULUS) + (product >> 61) as u64;
    if folded >= MODULUS {
        folded - MODULUS
    } else {
        folded
    }
}

fn step(x: u64) -> u64 {
    let squared = mulmod(x, x);
    if squared >= 2 {
        squared - 2
    } else {
        squared + MODULUS - 2
    }
}

fn seed(kind: &WorkKind) -> u64 {
    match kind {
        WorkKind::LucasLehmer { .. } => 4,
        WorkKind::Prp { base, .. } => u64::from(*base).max(3),
        WorkKind::PMinus1 { exponent, b1, .. } => ((exponent ^ b1) % MODULUS) | 3,
        WorkKind::Ecm { exponent, b1, curves, .. } => ((exponent ^ b1 ^ (u64::from(*curves) << 40)) % MODULUS) | 5,
        WorkKind::Torture {
            fft_len_k,
            exponent,
            pattern,
            ..
        } => {
            let tag = match pattern {
                MemoryPattern::SmallFft => 1,
                MemoryPattern::LargeFft => 2,
                MemoryPattern::Blend => 3,
            };
            ((exponent ^ (u64::from(*fft_len_k) << 32) ^ (tag << 56)) % MODULUS) | 3
        }
        WorkKind::Benchmark { fft_len_k, exponent, .. } => ((exponent ^ (u64::from(*fft_len_k) << 32)) % MODULUS) | 7,
    }
}

fn run_from(mut x: u64, from: u64, to: u64) -> u64 {
    for _ in from..to {
        x = step(x);
    }
    x
}

fn result_for(kind: &WorkKind, residue: u64, iterations: u64) -> ComputationResult {
    let residue = Residue(residue);
    match kind {
        WorkKind::LucasLehmer { .. } | WorkKind::Prp { .. } => ComputationResult::Residue {
            residue,
            is_prime: residue.0 == 0,
        },
        WorkKind::PMinus1 { .. } | WorkKind::Ecm { .. } => ComputationResult::NoFactor { residue },
        WorkKind::Torture { .. } | WorkKind::Benchmark { .. } => ComputationResult::Diagnostic { residue, iterations },
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedKernelSettings {
    /// Iterations between safe points.
    pub batch: u64,
    /// Sleep after each batch, to stretch runs out in tests and demos.
    pub throttle: Option<Duration>,
    /// Pin task threads to their granted CPUs.
    pub pin_threads: bool,
    /// Flip a bit in every self-test residue, emulating unstable hardware.
    pub corrupt_diagnostics: bool,
}

impl Default for SimulatedKernelSettings {
    fn default() -> Self {
        Self {
            batch: 10_000,
            throttle: None,
            pin_threads: true,
            corrupt_diagnostics: false,
        }
    }
}

/// Reference residues by self-test kind; `None` while still being computed.
type ReferenceTable = Arc<Mutex<HashMap<WorkKind, Option<Residue>>>>;

#[derive(Debug, Default)]
pub struct SimulatedKernel {
    settings: SimulatedKernelSettings,
    references: ReferenceTable,
}

impl SimulatedKernel {
    pub fn new(settings: SimulatedKernelSettings) -> Self {
        Self {
            settings,
            references: ReferenceTable::default(),
        }
    }
}

impl ComputeKernel for SimulatedKernel {
    fn launch(
        &self,
        assignment: &Assignment,
        grant: &SlotGrant,
        resume_from: Option<&CheckpointRecord>,
    ) -> Result<Box<dyn TaskHandle>, String> {
        let kind = assignment.kind.clone();
        let total = kind.total_iterations();
        let (iteration, residue) = match resume_from {
            Some(cp) if cp.iteration <= total => (cp.iteration, cp.residue.0),
            Some(cp) => {
                return Err(format!(
                    "checkpoint for {} is past the end ({} > {})",
                    cp.assignment_id, cp.iteration, total
                ))
            }
            None => (0, seed(&kind)),
        };

        let shared = Arc::new(Shared {
            control: Mutex::new(Control::default()),
            wake: Condvar::new(),
            progress: Mutex::new(TaskProgress {
                iteration,
                total,
                residue: Residue(residue),
                heartbeat_at: Utc::now(),
            }),
            state: Mutex::new(TaskState::Running),
            memory_bytes: AtomicU64::new(grant.memory_bytes),
        });

        let worker = TaskLoop {
            shared: shared.clone(),
            kind,
            cpus: grant.cpus.clone(),
            settings: self.settings.clone(),
        };
        std::thread::Builder::new()
            .name(format!("worker-{}", grant.slot))
            .spawn(move || worker.run())
            .map_err(|e| format!("failed to spawn worker thread: {e}"))?;

        debug!(
            "Launched {} on slot {} at iteration {}/{}",
            assignment.id, grant.slot, iteration, total
        );
        Ok(Box::new(SimulatedTask { shared }))
    }

    fn reference_residue(&self, kind: &WorkKind) -> ReferenceResidue {
        if !kind.is_diagnostic() {
            return ReferenceResidue::Unavailable;
        }
        {
            let mut table = self.references.lock();
            match table.get(kind) {
                Some(Some(residue)) => return ReferenceResidue::Ready(*residue),
                Some(None) => return ReferenceResidue::Computing,
                None => {
                    table.insert(kind.clone(), None);
                }
            }
        }

        let references = self.references.clone();
        let job = kind.clone();
        let spawned = std::thread::Builder::new()
            .name("reference-residue".to_string())
            .spawn(move || {
                let residue = Residue(run_from(seed(&job), 0, job.total_iterations()));
                references.lock().insert(job, Some(residue));
            });
        match spawned {
            Ok(_) => ReferenceResidue::Computing,
            Err(e) => {
                warn!("No reference residue for {}: {}", kind.label(), e);
                self.references.lock().remove(kind);
                ReferenceResidue::Unavailable
            }
        }
    }
}

#[derive(Debug, Default)]
struct Control {
    paused: bool,
    cancel: Option<bool>,
}

struct Shared {
    control: Mutex<Control>,
    wake: Condvar,
    progress: Mutex<TaskProgress>,
    state: Mutex<TaskState>,
    memory_bytes: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: TaskState) {
        *self.state.lock() = state;
    }
}

struct TaskLoop {
    shared: Arc<Shared>,
    kind: WorkKind,
    cpus: Vec<usize>,
    settings: SimulatedKernelSettings,
}

impl TaskLoop {
    fn run(self) {
        if self.settings.pin_threads && !self.cpus.is_empty() {
            if let Err(e) = pin_current_thread(&self.cpus) {
                warn!("Running unpinned, could not pin to {:?}: {}", self.cpus, e);
            }
        }

        let (mut iteration, total, mut x) = {
            let p = self.shared.progress.lock();
            (p.iteration, p.total, p.residue.0)
        };
        let mut memory = self.shared.memory_bytes.load(Ordering::Relaxed);
        let batch = self.settings.batch.max(1);

        loop {
            if !self.safe_point() {
                return;
            }

            let current = self.shared.memory_bytes.load(Ordering::Relaxed);
            if current != memory {
                debug!("Memory ceiling now {} bytes", current);
                memory = current;
            }

            if iteration >= total {
                let residue = if self.settings.corrupt_diagnostics && self.kind.is_diagnostic() {
                    x ^ 1
                } else {
                    x
                };
                self.shared
                    .set_state(TaskState::Completed(result_for(&self.kind, residue, iteration)));
                return;
            }

            let end = iteration.saturating_add(batch).min(total);
            x = run_from(x, iteration, end);
            iteration = end;
            *self.shared.progress.lock() = TaskProgress {
                iteration,
                total,
                residue: Residue(x),
                heartbeat_at: Utc::now(),
            };

            if let Some(throttle) = self.settings.throttle {
                std::thread::sleep(throttle);
            }
        }
    }

    /// Honour pause and cancel requests. Returns false when the task must exit.
    fn safe_point(&self) -> bool {
        let mut control = self.shared.control.lock();
        if control.cancel.is_some() {
            self.shared.set_state(TaskState::Stopped);
            return false;
        }
        if !control.paused {
            return true;
        }

        self.shared.set_state(TaskState::Paused);
        while control.paused && control.cancel.is_none() {
            self.shared.wake.wait(&mut control);
        }
        if control.cancel.is_some() {
            self.shared.set_state(TaskState::Stopped);
            return false;
        }
        self.shared.set_state(TaskState::Running);
        self.shared.progress.lock().heartbeat_at = Utc::now();
        true
    }
}

pub struct SimulatedTask {
    shared: Arc<Shared>,
}

impl TaskHandle for SimulatedTask {
    fn checkpoint(&self) -> TaskProgress {
        self.shared.progress.lock().clone()
    }

    fn state(&self) -> TaskState {
        self.shared.state.lock().clone()
    }

    fn pause(&self) {
        self.shared.control.lock().paused = true;
    }

    fn resume(&self) {
        self.shared.control.lock().paused = false;
        self.shared.wake.notify_all();
    }

    fn cancel(&self, graceful: bool) {
        self.shared.control.lock().cancel = Some(graceful);
        self.shared.wake.notify_all();
    }

    fn adjust_memory(&self, memory_bytes: u64) {
        self.shared.memory_bytes.store(memory_bytes, Ordering::Relaxed);
    }
}

impl Drop for SimulatedTask {
    fn drop(&mut self) {
        // An abandoned handle must not leave its thread spinning.
        self.shared.control.lock().cancel.get_or_insert(false);
        self.shared.wake.notify_all();
    }
}
