use serde::{Deserialize, Serialize};

/// Static facts about the machine. Detected once at startup, overridable from config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub physical_cores: usize,
    pub threads_per_core: usize,
    pub l2_cache_kb: u64,
    pub l3_cache_kb: u64,
    pub total_memory_bytes: u64,
}

impl HardwareProfile {
    pub fn new(physical_cores: usize, threads_per_core: usize) -> Self {
        Self {
            physical_cores: physical_cores.max(1),
            threads_per_core: threads_per_core.max(1),
            l2_cache_kb: 1024,
            l3_cache_kb: 8192,
            total_memory_bytes: 8 * GIB,
        }
    }

    /// Probe the running machine. Memory and cache sizes keep the `new`
    /// defaults where the platform does not expose them.
    pub fn detect() -> Self {
        let physical = num_cpus::get_physical().max(1);
        let logical = num_cpus::get().max(physical);
        let mut profile = Self::new(physical, logical / physical);
        if let Some(bytes) = platform::total_memory_bytes() {
            profile.total_memory_bytes = bytes;
        }
        if let Some(kb) = platform::cache_kb(2) {
            profile.l2_cache_kb = kb;
        }
        if let Some(kb) = platform::cache_kb(3) {
            profile.l3_cache_kb = kb;
        }
        profile
    }

    pub fn has_hyperthreading(&self) -> bool {
        self.threads_per_core > 1
    }

    pub fn logical_cpus(&self) -> usize {
        self.physical_cores * self.threads_per_core
    }

    /// Logical CPU id for thread `thread` of physical core `core`.
    ///
    /// Follows the usual Linux enumeration where sibling threads are numbered
    /// `physical_cores` apart.
    pub fn logical_id(&self, core: usize, thread: usize) -> usize {
        thread * self.physical_cores + core
    }

    /// Physical core that owns a logical CPU id.
    pub fn core_of(&self, logical: usize) -> usize {
        logical % self.physical_cores
    }

    /// Largest FFT length (in K) whose working set still fits in L2.
    ///
    /// A K of FFT length is 1024 doubles, 8 KiB.
    pub fn in_cache_fft_limit_k(&self) -> u32 {
        ((self.l2_cache_kb / 8).max(4)) as u32
    }

    /// Smallest FFT length (in K) that no longer fits in L3.
    pub fn out_of_cache_fft_floor_k(&self) -> u32 {
        ((self.l3_cache_kb / 8).max(8) * 2) as u32
    }
}

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

#[cfg(target_os = "linux")]
mod platform {
    use std::fs;

    pub fn total_memory_bytes() -> Option<u64> {
        super::parse_meminfo_total(&fs::read_to_string("/proc/meminfo").ok()?)
    }

    /// Size of the first data or unified cache at `level` seen by cpu0.
    pub fn cache_kb(level: u32) -> Option<u64> {
        let entries = fs::read_dir("/sys/devices/system/cpu/cpu0/cache").ok()?;
        for entry in entries.flatten() {
            let dir = entry.path();
            let read = |name: &str| fs::read_to_string(dir.join(name)).ok();
            if read("level").and_then(|l| l.trim().parse::<u32>().ok()) != Some(level) {
                continue;
            }
            if read("type").map_or(false, |t| t.trim() == "Instruction") {
                continue;
            }
            if let Some(kb) = read("size").and_then(|s| super::parse_cache_size_kb(&s)) {
                return Some(kb);
            }
        }
        None
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    pub fn total_memory_bytes() -> Option<u64> {
        None
    }

    pub fn cache_kb(_level: u32) -> Option<u64> {
        None
    }
}

/// `MemTotal:       16318112 kB` -> bytes.
fn parse_meminfo_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

/// Sysfs cache sizes look like `1024K` or `32M`.
fn parse_cache_size_kb(size: &str) -> Option<u64> {
    let size = size.trim();
    let (digits, unit) = size.split_at(size.find(|c: char| !c.is_ascii_digit()).unwrap_or(size.len()));
    let value: u64 = digits.parse().ok()?;
    match unit {
        "" | "K" => Some(value),
        "M" => Some(value * 1024),
        _ => None,
    }
}
