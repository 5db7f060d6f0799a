use primenet_client::domains::resources::{
    compute_grant, HardwareProfile, ResourceSchedule, TimeOfDay, WindowLimits, WorkerDemand, GIB, MIB,
};
use primenet_client::domains::work_queue::{
    Assignment, AssignmentId, AssignmentSource, Priority, SharedWorkQueue, SlotClass, WorkKind, WorkQueue,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

fn limits(gb: u64, max_workers: usize, ht: bool) -> WindowLimits {
    WindowLimits {
        memory_ceiling_bytes: gb * GIB,
        max_workers,
        allow_hyperthreading: ht,
    }
}

#[test]
fn test_every_minute_has_exactly_one_window() {
    let schedule = ResourceSchedule::day_night(
        TimeOfDay::new(7, 30).unwrap(),
        TimeOfDay::new(23, 0).unwrap(),
        limits(2, 2, false),
        limits(8, 4, true),
        128 * MIB,
    )
    .unwrap();

    for minute in 0..24 * 60 {
        let at = TimeOfDay::new(minute / 60, minute % 60).unwrap();
        assert!(schedule.window_at(at).is_some(), "no window at {at}");
    }
    let mut overlapping = schedule.windows.clone();
    overlapping[0].end = TimeOfDay::new(23, 30).unwrap();
    assert!(ResourceSchedule::new(overlapping, 128 * MIB).is_err());
    assert_eq!(schedule.window_at(TimeOfDay::new(7, 29).unwrap()).unwrap().label, "night");
    assert_eq!(schedule.window_at(TimeOfDay::new(7, 30).unwrap()).unwrap().label, "day");
}

#[test]
fn test_emergency_tier_overrides_current_window() {
    let mut schedule = ResourceSchedule::uniform(limits(8, 4, false), 128 * MIB).with_emergency(limits(1, 1, false));
    let hw = HardwareProfile::new(4, 2);
    let demand = WorkerDemand::uniform(4, GIB);
    let noon = TimeOfDay::new(12, 0).unwrap();

    assert_eq!(compute_grant(&hw, &demand, &schedule, noon).slots.len(), 4);
    schedule.emergency_active = true;
    let grant = compute_grant(&hw, &demand, &schedule, noon);
    assert!(grant.emergency);
    assert_eq!(grant.slots.len(), 1);
    assert!(grant.total_memory() <= GIB);
}

#[test]
fn test_concurrent_checkout_never_hands_out_twice() {
    let queue = SharedWorkQueue::new(WorkQueue::new("queue", 3));
    for p in 0..64u64 {
        queue
            .enqueue(Assignment::new(
                AssignmentId::new(format!("A{p}")),
                WorkKind::LucasLehmer { exponent: 1000 + p },
                Priority::Normal,
                AssignmentSource::Manual,
            ))
            .unwrap();
    }

    let queue = Arc::new(queue);
    let workers: Vec<_> = (0..8)
        .map(|slot| {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut taken = Vec::new();
                while let Some(a) = queue.checkout(SlotClass::Standard, slot) {
                    taken.push(a.id);
                }
                taken
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for worker in workers {
        for id in worker.join().unwrap() {
            assert!(seen.insert(id), "assignment handed out twice");
        }
    }
    assert_eq!(seen.len(), 64);
    assert_eq!(queue.checked_out(), 64);
}
