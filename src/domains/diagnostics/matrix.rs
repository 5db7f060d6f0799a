use crate::domains::resources::HardwareProfile;
use crate::domains::work_queue::{MemoryPattern, Residue, WorkKind};
use serde::{Deserialize, Serialize};

/// Roughly the largest Mersenne exponent an FFT of `fft_len_k` K words handles.
pub fn exponent_for_fft(fft_len_k: u32) -> u64 {
    let bits_per_word = 17u64;
    let exponent = u64::from(fft_len_k) * 1024 * bits_per_word;
    exponent | 1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TortureConfig {
    /// Candidate FFT sizes in K; each pattern picks the ones that fit it.
    pub fft_sizes_k: Vec<u32>,
    pub worker_counts: Vec<usize>,
    pub patterns: Vec<MemoryPattern>,
    pub iterations: u64,
    /// Overrides the kernel's reference residue for every case.
    #[serde(default)]
    pub expected_residue: Option<Residue>,
}

impl TortureConfig {
    /// FFT sizes spanning in-cache and out-of-cache for this machine.
    pub fn for_hardware(hardware: &HardwareProfile) -> Self {
        let small = hardware.in_cache_fft_limit_k().max(4);
        let large = hardware.out_of_cache_fft_floor_k().max(small * 2);
        let mut fft_sizes_k = vec![4, small / 2, small, large, large * 2];
        fft_sizes_k.retain(|k| *k >= 4);
        fft_sizes_k.sort_unstable();
        fft_sizes_k.dedup();
        Self {
            fft_sizes_k,
            worker_counts: vec![hardware.physical_cores.max(1)],
            patterns: vec![MemoryPattern::SmallFft, MemoryPattern::LargeFft, MemoryPattern::Blend],
            iterations: 10_000,
            expected_residue: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub fft_sizes_k: Vec<u32>,
    pub worker_counts: Vec<usize>,
    pub iterations: u64,
}

impl BenchmarkConfig {
    pub fn for_hardware(hardware: &HardwareProfile) -> Self {
        let mut worker_counts = vec![1, hardware.physical_cores.max(1)];
        if hardware.has_hyperthreading() {
            worker_counts.push(hardware.logical_cpus());
        }
        worker_counts.dedup();
        Self {
            fft_sizes_k: vec![256, 512, 1024, 2048, 4096],
            worker_counts,
            iterations: 1_000,
        }
    }
}

/// One configuration of a diagnostic run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticCase {
    pub index: usize,
    pub fft_len_k: u32,
    pub workers: usize,
    /// Torture only.
    pub pattern: Option<MemoryPattern>,
    pub iterations: u64,
}

impl DiagnosticCase {
    pub fn work_kind(&self) -> WorkKind {
        let exponent = exponent_for_fft(self.fft_len_k);
        match self.pattern {
            Some(pattern) => WorkKind::Torture {
                fft_len_k: self.fft_len_k,
                exponent,
                iterations: self.iterations,
                pattern,
            },
            None => WorkKind::Benchmark {
                fft_len_k: self.fft_len_k,
                exponent,
                iterations: self.iterations,
            },
        }
    }

    pub fn label(&self) -> String {
        match self.pattern {
            Some(pattern) => format!("{}K x{} {:?}", self.fft_len_k, self.workers, pattern),
            None => format!("{}K x{}", self.fft_len_k, self.workers),
        }
    }
}

fn fits(pattern: MemoryPattern, fft_len_k: u32, hardware: &HardwareProfile) -> bool {
    match pattern {
        MemoryPattern::SmallFft => fft_len_k <= hardware.in_cache_fft_limit_k(),
        MemoryPattern::LargeFft => fft_len_k >= hardware.out_of_cache_fft_floor_k(),
        MemoryPattern::Blend => true,
    }
}

/// Pattern-major, then worker count, then FFT size ascending.
pub fn torture_matrix(config: &TortureConfig, hardware: &HardwareProfile) -> Vec<DiagnosticCase> {
    let mut cases = Vec::new();
    for &pattern in &config.patterns {
        for &workers in &config.worker_counts {
            for &fft_len_k in &config.fft_sizes_k {
                if !fits(pattern, fft_len_k, hardware) {
                    continue;
                }
                cases.push(DiagnosticCase {
                    index: cases.len(),
                    fft_len_k,
                    workers,
                    pattern: Some(pattern),
                    iterations: config.iterations,
                });
            }
        }
    }
    cases
}

pub fn benchmark_matrix(config: &BenchmarkConfig) -> Vec<DiagnosticCase> {
    let mut cases = Vec::new();
    for &workers in &config.worker_counts {
        for &fft_len_k in &config.fft_sizes_k {
            cases.push(DiagnosticCase {
                index: cases.len(),
                fft_len_k,
                workers,
                pattern: None,
                iterations: config.iterations,
            });
        }
    }
    cases
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn torture_patterns_respect_cache_limits() {
        let hardware = HardwareProfile::new(4, 2);
        let config = TortureConfig {
            fft_sizes_k: vec![8, 64, 1024],
            worker_counts: vec![1, 4],
            patterns: vec![MemoryPattern::SmallFft, MemoryPattern::LargeFft, MemoryPattern::Blend],
            iterations: 100,
            expected_residue: None,
        };
        let cases = torture_matrix(&config, &hardware);

        for case in &cases {
            match case.pattern {
                Some(MemoryPattern::SmallFft) => {
                    assert!(case.fft_len_k <= hardware.in_cache_fft_limit_k())
                }
                Some(MemoryPattern::LargeFft) => {
                    assert!(case.fft_len_k >= hardware.out_of_cache_fft_floor_k())
                }
                _ => {}
            }
        }
        let blend = cases.iter().filter(|c| c.pattern == Some(MemoryPattern::Blend)).count();
        assert_eq!(blend, 3 * 2);
        assert!(cases.iter().enumerate().all(|(i, c)| c.index == i));
    }

    #[test]
    fn benchmark_matrix_is_workers_by_sizes() {
        let config = BenchmarkConfig {
            fft_sizes_k: vec![256, 512],
            worker_counts: vec![1, 2, 4],
            iterations: 50,
        };
        let cases = benchmark_matrix(&config);
        assert_eq!(cases.len(), 6);
        assert!(matches!(cases[0].work_kind(), WorkKind::Benchmark { fft_len_k: 256, .. }));
    }

    #[test]
    fn default_torture_sizes_cover_both_cache_regimes() {
        let hardware = HardwareProfile::new(8, 2);
        let config = TortureConfig::for_hardware(&hardware);
        let cases = torture_matrix(&config, &hardware);
        assert!(cases.iter().any(|c| c.pattern == Some(MemoryPattern::SmallFft)));
        assert!(cases.iter().any(|c| c.pattern == Some(MemoryPattern::LargeFft)));
    }
}
