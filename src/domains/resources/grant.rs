use super::hardware::HardwareProfile;
use super::schedule::{ResourceSchedule, TimeOfDay};
use serde::{Deserialize, Serialize};

/// Per-slot share of a grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotGrant {
    pub slot: usize,
    pub memory_bytes: u64,
    /// Logical CPU ids the slot's task is pinned to.
    pub cpus: Vec<usize>,
    /// True when the slot shares a physical core with another slot.
    pub shares_core: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceGrant {
    pub window: String,
    pub emergency: bool,
    pub max_workers: usize,
    pub memory_ceiling_bytes: u64,
    pub hyperthreading: bool,
    pub slots: Vec<SlotGrant>,
    /// Slots that existed in the request but lost their grant, highest index first.
    pub shutdown_slots: Vec<usize>,
}

impl ResourceGrant {
    pub fn memory_per_worker(&self) -> Vec<u64> {
        self.slots.iter().map(|s| s.memory_bytes).collect()
    }

    pub fn slot(&self, index: usize) -> Option<&SlotGrant> {
        self.slots.iter().find(|s| s.slot == index)
    }

    pub fn total_memory(&self) -> u64 {
        self.slots.iter().map(|s| s.memory_bytes).sum()
    }

    /// A grant with nothing in it, used before the first plan is computed.
    pub fn empty() -> Self {
        Self {
            window: "unplanned".to_string(),
            emergency: false,
            max_workers: 0,
            memory_ceiling_bytes: 0,
            hyperthreading: false,
            slots: Vec::new(),
            shutdown_slots: Vec::new(),
        }
    }
}

/// What the operator asks for, before the schedule and hardware cut it down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDemand {
    /// Desired memory per worker, one entry per requested worker.
    pub memory_per_worker: Vec<u64>,
}

impl WorkerDemand {
    pub fn uniform(workers: usize, memory_bytes: u64) -> Self {
        Self {
            memory_per_worker: vec![memory_bytes; workers],
        }
    }

    pub fn workers(&self) -> usize {
        self.memory_per_worker.len()
    }
}

/// Turn hardware facts, operator demand and the schedule into a concrete grant.
///
/// Pure. Guarantees `total_memory() <= memory_ceiling_bytes` and
/// `max_workers <= physical_cores * (hyperthreading ? min(threads_per_core, 2) : 1)`.
pub fn compute_grant(
    hardware: &HardwareProfile,
    demand: &WorkerDemand,
    schedule: &ResourceSchedule,
    at: TimeOfDay,
) -> ResourceGrant {
    let Some(active) = schedule.active_at(at) else {
        return ResourceGrant::empty();
    };
    let limits = &active.limits;
    let hyperthreading = limits.allow_hyperthreading && hardware.has_hyperthreading();
    // At most two workers per core, however many threads it exposes.
    let cpu_cap = hardware.physical_cores * if hyperthreading { hardware.threads_per_core.min(2) } else { 1 };

    let requested = demand.workers();
    let mut workers = requested.min(limits.max_workers).min(cpu_cap);
    let ceiling = limits.memory_ceiling_bytes;
    let floor = schedule.min_memory_per_worker_bytes;

    let mut memory = scale_memory(&demand.memory_per_worker[..workers], ceiling);
    while workers > 0 && memory.iter().any(|m| *m < floor) {
        workers -= 1;
        memory = scale_memory(&demand.memory_per_worker[..workers], ceiling);
    }

    let cpus = assign_cpus(hardware, workers);
    let slots = memory
        .into_iter()
        .zip(cpus)
        .enumerate()
        .map(|(slot, (memory_bytes, (cpus, shares_core)))| SlotGrant {
            slot,
            memory_bytes,
            cpus,
            shares_core,
        })
        .collect();

    ResourceGrant {
        window: active.label,
        emergency: active.emergency,
        max_workers: workers,
        memory_ceiling_bytes: ceiling,
        hyperthreading,
        slots,
        shutdown_slots: (workers..requested).rev().collect(),
    }
}

/// Scale each demand by `ceiling / total` when the total does not fit.
fn scale_memory(demands: &[u64], ceiling: u64) -> Vec<u64> {
    let total: u128 = demands.iter().map(|d| *d as u128).sum();
    if total <= ceiling as u128 {
        return demands.to_vec();
    }
    demands
        .iter()
        .map(|d| ((*d as u128 * ceiling as u128) / total) as u64)
        .collect()
}

/// Spread `workers` over the machine.
///
/// With no more workers than physical cores each worker gets a disjoint block
/// of whole cores, including their sibling threads. Beyond that, workers get
/// one logical CPU each and siblings end up sharing a physical core.
fn assign_cpus(hardware: &HardwareProfile, workers: usize) -> Vec<(Vec<usize>, bool)> {
    if workers == 0 {
        return Vec::new();
    }
    let cores = hardware.physical_cores;
    if workers <= cores {
        let base = cores / workers;
        let extra = cores % workers;
        let mut next = 0;
        return (0..workers)
            .map(|w| {
                let take = base + usize::from(w < extra);
                let cpus = (next..next + take)
                    .flat_map(|core| {
                        (0..hardware.threads_per_core).map(move |t| hardware.logical_id(core, t))
                    })
                    .collect::<Vec<_>>();
                next += take;
                (sorted(cpus), false)
            })
            .collect();
    }
    (0..workers)
        .map(|w| {
            let core = w % cores;
            let thread = w / cores;
            (vec![hardware.logical_id(core, thread)], true)
        })
        .collect()
}

fn sorted(mut v: Vec<usize>) -> Vec<usize> {
    v.sort_unstable();
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::resources::hardware::GIB;
    use crate::domains::resources::schedule::WindowLimits;
    use std::collections::HashSet;

    fn schedule(gb: u64, max_workers: usize, ht: bool, floor: u64) -> ResourceSchedule {
        ResourceSchedule::uniform(
            WindowLimits {
                memory_ceiling_bytes: gb * GIB,
                max_workers,
                allow_hyperthreading: ht,
            },
            floor,
        )
    }

    fn noon() -> TimeOfDay {
        "12:00".parse().unwrap()
    }

    #[test]
    fn four_cores_no_ht_eight_gb() {
        let hw = HardwareProfile::new(4, 1);
        let grant = compute_grant(&hw, &WorkerDemand::uniform(4, GIB), &schedule(8, 8, false, 0), noon());
        assert_eq!(grant.max_workers, 4);
        assert_eq!(grant.memory_per_worker(), vec![GIB; 4]);
        assert!(grant.shutdown_slots.is_empty());
        let all: HashSet<usize> = grant.slots.iter().flat_map(|s| s.cpus.clone()).collect();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn memory_is_scaled_proportionally_when_over_ceiling() {
        let hw = HardwareProfile::new(4, 1);
        let demand = WorkerDemand {
            memory_per_worker: vec![4 * GIB, 2 * GIB, 2 * GIB],
        };
        let grant = compute_grant(&hw, &demand, &schedule(4, 4, false, 0), noon());
        assert_eq!(grant.max_workers, 3);
        assert_eq!(grant.memory_per_worker(), vec![2 * GIB, GIB, GIB]);
        assert!(grant.total_memory() <= grant.memory_ceiling_bytes);
    }

    #[test]
    fn floor_drops_highest_slots_first() {
        let hw = HardwareProfile::new(8, 1);
        let demand = WorkerDemand::uniform(6, 2 * GIB);
        // 3 GiB over 6 workers is 512 MiB each, under the 1 GiB floor.
        let grant = compute_grant(&hw, &demand, &schedule(3, 8, false, GIB), noon());
        assert_eq!(grant.max_workers, 3);
        assert_eq!(grant.shutdown_slots, vec![5, 4, 3]);
        assert!(grant.memory_per_worker().iter().all(|m| *m >= GIB));
        assert!(grant.total_memory() <= 3 * GIB);
    }

    #[test]
    fn worker_cap_respects_hyperthreading_permission() {
        let hw = HardwareProfile::new(4, 2);
        let demand = WorkerDemand::uniform(16, 0);
        let no_ht = compute_grant(&hw, &demand, &schedule(8, 16, false, 0), noon());
        assert_eq!(no_ht.max_workers, 4);
        assert!(no_ht.slots.iter().all(|s| !s.shares_core));

        let ht = compute_grant(&hw, &demand, &schedule(8, 16, true, 0), noon());
        assert_eq!(ht.max_workers, 8);
        assert!(ht.slots.iter().all(|s| s.shares_core));
        let ids: HashSet<usize> = ht.slots.iter().flat_map(|s| s.cpus.clone()).collect();
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn wide_smt_still_caps_at_two_workers_per_core() {
        let hw = HardwareProfile::new(4, 4);
        let grant = compute_grant(&hw, &WorkerDemand::uniform(16, 0), &schedule(8, 16, true, 0), noon());
        assert_eq!(grant.max_workers, 8);
        let cores: HashSet<usize> = grant.slots.iter().flat_map(|s| s.cpus.iter().map(|c| hw.core_of(*c))).collect();
        assert_eq!(cores.len(), 4);
    }

    #[test]
    fn fewer_workers_get_whole_cores() {
        let hw = HardwareProfile::new(4, 2);
        let grant = compute_grant(&hw, &WorkerDemand::uniform(2, 0), &schedule(8, 4, false, 0), noon());
        assert_eq!(grant.slots[0].cpus, vec![0, 1, 4, 5]);
        assert_eq!(grant.slots[1].cpus, vec![2, 3, 6, 7]);
    }

    #[test]
    fn zero_floor_never_starves_a_slot_with_demand() {
        let hw = HardwareProfile::new(2, 1);
        let demand = WorkerDemand::uniform(2, 10 * GIB);
        let grant = compute_grant(&hw, &demand, &schedule(1, 2, false, 0), noon());
        assert_eq!(grant.max_workers, 2);
        assert!(grant.memory_per_worker().iter().all(|m| *m > 0));
    }
}
