use crate::domains::resources::hardware::MIB;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssignmentId(String);

impl AssignmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssignmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssignmentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryPattern {
    /// FFT data stays in L2; stresses the FPU and cache.
    SmallFft,
    /// FFT data spills out of L3; stresses the memory controller.
    LargeFft,
    /// Mix of both.
    Blend,
}

/// The kind of computation, with the parameters that kind needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkKind {
    LucasLehmer {
        exponent: u64,
    },
    Prp {
        base: u32,
        exponent: u64,
    },
    PMinus1 {
        exponent: u64,
        b1: u64,
        b2: u64,
    },
    Ecm {
        exponent: u64,
        b1: u64,
        b2: u64,
        curves: u32,
    },
    Torture {
        fft_len_k: u32,
        exponent: u64,
        iterations: u64,
        pattern: MemoryPattern,
    },
    Benchmark {
        fft_len_k: u32,
        exponent: u64,
        iterations: u64,
    },
}

/// Stage 2 of P-1 needs at least this much to be worth running.
pub const PMINUS1_STAGE2_MIN_MEMORY: u64 = 256 * MIB;
/// Per-curve stage 2 memory for ECM.
pub const ECM_STAGE2_MIN_MEMORY: u64 = 64 * MIB;

impl WorkKind {
    pub fn label(&self) -> &'static str {
        match self {
            WorkKind::LucasLehmer { .. } => "LL",
            WorkKind::Prp { .. } => "PRP",
            WorkKind::PMinus1 { .. } => "P-1",
            WorkKind::Ecm { .. } => "ECM",
            WorkKind::Torture { .. } => "torture",
            WorkKind::Benchmark { .. } => "benchmark",
        }
    }

    pub fn exponent(&self) -> u64 {
        match self {
            WorkKind::LucasLehmer { exponent }
            | WorkKind::Prp { exponent, .. }
            | WorkKind::PMinus1 { exponent, .. }
            | WorkKind::Ecm { exponent, .. }
            | WorkKind::Torture { exponent, .. }
            | WorkKind::Benchmark { exponent, .. } => *exponent,
        }
    }

    /// Total number of kernel steps for the whole assignment.
    pub fn total_iterations(&self) -> u64 {
        match self {
            WorkKind::LucasLehmer { exponent } => exponent.saturating_sub(2).max(1),
            WorkKind::Prp { exponent, .. } => (*exponent).max(1),
            // Stage 1 costs about 1.44 * B1 squarings; stage 2 is cheaper per prime.
            WorkKind::PMinus1 { b1, b2, .. } => (b1 * 1443 / 1000 + b2.saturating_sub(*b1) / 20).max(1),
            WorkKind::Ecm { b1, b2, curves, .. } => {
                ((b1 * 1443 / 1000 + b2.saturating_sub(*b1) / 20) * u64::from(*curves)).max(1)
            }
            WorkKind::Torture { iterations, .. } | WorkKind::Benchmark { iterations, .. } => {
                (*iterations).max(1)
            }
        }
    }

    /// Memory the kind cannot run without.
    pub fn min_memory_bytes(&self) -> u64 {
        match self {
            WorkKind::PMinus1 { b1, b2, .. } if b2 > b1 => PMINUS1_STAGE2_MIN_MEMORY,
            WorkKind::Ecm { b1, b2, .. } if b2 > b1 => ECM_STAGE2_MIN_MEMORY,
            _ => 0,
        }
    }

    pub fn needs_high_memory(&self) -> bool {
        self.min_memory_bytes() > 0
    }

    pub fn is_diagnostic(&self) -> bool {
        matches!(self, WorkKind::Torture { .. } | WorkKind::Benchmark { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentSource {
    PrimeNet,
    Manual,
    Diagnostic,
}

/// One unit of work. Immutable once accepted into the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub kind: WorkKind,
    pub priority: Priority,
    pub source: AssignmentSource,
    pub deadline: Option<DateTime<Utc>>,
    pub issued_at: DateTime<Utc>,
}

impl Assignment {
    pub fn new(id: AssignmentId, kind: WorkKind, priority: Priority, source: AssignmentSource) -> Self {
        Self {
            id,
            kind,
            priority,
            source,
            deadline: None,
            issued_at: Utc::now(),
        }
    }

    pub fn manual(kind: WorkKind) -> Self {
        Self::new(AssignmentId::generate(), kind, Priority::Normal, AssignmentSource::Manual)
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// 64-bit verification residue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Residue(pub u64);

impl fmt::Display for Residue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// What a finished assignment produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum ComputationResult {
    /// LL/PRP final residue.
    Residue { residue: Residue, is_prime: bool },
    /// P-1/ECM found a factor.
    Factor { factor: String },
    /// P-1/ECM ran to its bounds without a factor.
    NoFactor { residue: Residue },
    /// Torture/benchmark run.
    Diagnostic { residue: Residue, iterations: u64 },
}

impl ComputationResult {
    pub fn residue(&self) -> Option<Residue> {
        match self {
            ComputationResult::Residue { residue, .. }
            | ComputationResult::NoFactor { residue }
            | ComputationResult::Diagnostic { residue, .. } => Some(*residue),
            ComputationResult::Factor { .. } => None,
        }
    }

    /// One-line summary for the results journal.
    pub fn summary(&self, assignment: &Assignment) -> String {
        let p = assignment.kind.exponent();
        match self {
            ComputationResult::Residue { is_prime: true, .. } => {
                format!("M{p} is prime! ({}, AID: {})", assignment.kind.label(), assignment.id)
            }
            ComputationResult::Residue { residue, .. } => format!(
                "M{p} is not prime. {} RES64: {residue}, AID: {}",
                assignment.kind.label(),
                assignment.id
            ),
            ComputationResult::Factor { factor } => format!(
                "M{p} has a factor: {factor} ({}), AID: {}",
                assignment.kind.label(),
                assignment.id
            ),
            ComputationResult::NoFactor { .. } => format!(
                "M{p} completed {}, no factor, AID: {}",
                assignment.kind.label(),
                assignment.id
            ),
            ComputationResult::Diagnostic { residue, iterations } => format!(
                "{} {p}: {iterations} iterations, residue {residue}",
                assignment.kind.label()
            ),
        }
    }
}
