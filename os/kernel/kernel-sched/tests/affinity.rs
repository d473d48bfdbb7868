use kernel_sched::{
    Algorithm, CpuIndex, NodeState, ProcessorMask, SchedulerConfig, SchedulerError,
    SchedulerIndex, System, SystemConfig, ThreadAttributes, ThreadId, ThreadState,
};

const CPU0: CpuIndex = CpuIndex::new(0);
const CPU1: CpuIndex = CpuIndex::new(1);

fn started(system: &System, priority: u64) -> ThreadId {
    let thread = system.create_thread(ThreadAttributes::new(priority)).unwrap();
    system.start_thread(thread).unwrap();
    thread
}

#[test]
fn pinning_overrides_affinity_until_unpinned() {
    let system = System::new(&SystemConfig::single(Algorithm::EdfSmp, 2)).unwrap();
    let thread = started(&system, 5);

    system.pin(thread, CPU1).unwrap();
    assert_eq!(system.heir(CPU1), Some(thread));
    assert_eq!(system.thread_cpu(thread).unwrap(), CPU1);

    system.set_affinity(thread, ProcessorMask::single(CPU0)).unwrap();
    assert_eq!(system.heir(CPU1), Some(thread));
    let snapshot = system.snapshot(SchedulerIndex::new(0)).unwrap();
    assert_eq!(snapshot.nodes, [(thread, NodeState::Scheduled, 2)]);

    system.unpin(thread).unwrap();
    assert_eq!(system.heir(CPU0), Some(thread));
    let snapshot = system.snapshot(SchedulerIndex::new(0)).unwrap();
    assert_eq!(snapshot.nodes, [(thread, NodeState::Scheduled, 1)]);
    assert!(system.is_idle(system.heir(CPU1).unwrap()));
    system.check_invariants().unwrap();
}

#[test]
fn affine_thread_preempts_only_its_processor() {
    let system = System::new(&SystemConfig::single(Algorithm::EdfSmp, 2)).unwrap();
    let x = started(&system, 10);
    let y = started(&system, 10);

    let urgent = system.create_thread(ThreadAttributes::new(1)).unwrap();
    system.set_affinity(urgent, ProcessorMask::single(CPU1)).unwrap();
    system.start_thread(urgent).unwrap();

    assert_eq!(system.heir(CPU1), Some(urgent));
    let on_cpu0 = system.heir(CPU0).unwrap();
    assert!(on_cpu0 == x || on_cpu0 == y);
    let preempted = if on_cpu0 == x { y } else { x };
    assert_eq!(system.thread_state(preempted).unwrap(), ThreadState::Ready);
    system.check_invariants().unwrap();
}

#[test]
fn affine_thread_waits_for_its_processor() {
    let system = System::new(&SystemConfig::single(Algorithm::EdfSmp, 2)).unwrap();
    let x = started(&system, 10);
    let y = started(&system, 10);

    let affine = system.create_thread(ThreadAttributes::new(20)).unwrap();
    system.set_affinity(affine, ProcessorMask::single(CPU0)).unwrap();
    system.start_thread(affine).unwrap();
    assert_eq!(system.thread_state(affine).unwrap(), ThreadState::Ready);

    let on_cpu0 = system.heir(CPU0).unwrap();
    let on_cpu1 = system.heir(CPU1).unwrap();
    assert!([x, y].contains(&on_cpu0) && [x, y].contains(&on_cpu1));

    // The freed processor goes to the affine thread by swapping it with the
    // thread on its own processor.
    system.block(on_cpu1).unwrap();
    assert_eq!(system.heir(CPU0), Some(affine));
    assert_eq!(system.heir(CPU1), Some(on_cpu0));
    assert_eq!(system.thread_state(affine).unwrap(), ThreadState::Scheduled);
    assert_eq!(system.thread_cpu(on_cpu0).unwrap(), CPU1);
    system.check_invariants().unwrap();

    system.block(on_cpu0).unwrap();
    assert_eq!(system.heir(CPU0), Some(affine));
    assert!(system.is_idle(system.heir(CPU1).unwrap()));
    system.check_invariants().unwrap();
}

#[test]
fn moving_the_affinity_of_a_running_thread() {
    let system = System::new(&SystemConfig::single(Algorithm::EdfSmp, 2)).unwrap();
    let thread = started(&system, 5);
    let cpu = system.thread_cpu(thread).unwrap();
    let other = if cpu == CPU0 { CPU1 } else { CPU0 };

    system.set_affinity(thread, ProcessorMask::single(other)).unwrap();
    assert_eq!(system.heir(other), Some(thread));
    assert!(system.is_idle(system.heir(cpu).unwrap()));

    system.set_affinity(thread, ProcessorMask::first(2)).unwrap();
    system.check_invariants().unwrap();
}

#[test]
fn edf_accepts_all_or_one_processor() {
    let system = System::new(&SystemConfig::single(Algorithm::EdfSmp, 3)).unwrap();
    let thread = system.create_thread(ThreadAttributes::new(5)).unwrap();

    system.set_affinity(thread, ProcessorMask::first(3)).unwrap();
    system.set_affinity(thread, ProcessorMask::single(CPU1)).unwrap();
    system.set_affinity(thread, ProcessorMask::first(64)).unwrap();
    assert_eq!(
        system.set_affinity(thread, ProcessorMask::first(2)),
        Err(SchedulerError::InvalidAffinity)
    );
}

#[test]
fn priority_smp_needs_every_owned_processor() {
    let system = System::new(&SystemConfig::single(Algorithm::PrioritySmp, 2)).unwrap();
    let thread = started(&system, 5);

    system.set_affinity(thread, ProcessorMask::first(2)).unwrap();
    system.set_affinity(thread, ProcessorMask::first(8)).unwrap();
    assert_eq!(
        system.set_affinity(thread, ProcessorMask::single(CPU1)),
        Err(SchedulerError::InvalidAffinity)
    );
}

#[test]
fn pinning_is_restricted() {
    let config = SystemConfig::partitioned(2)
        .with_scheduler(SchedulerConfig::new(
            "left",
            Algorithm::EdfSmp,
            ProcessorMask::single(CPU0),
        ))
        .with_scheduler(SchedulerConfig::new(
            "right",
            Algorithm::PrioritySmp,
            ProcessorMask::single(CPU1),
        ));
    let system = System::new(&config).unwrap();
    let thread = started(&system, 5);

    assert_eq!(
        system.pin(thread, CPU1),
        Err(SchedulerError::ProcessorNotOwned {
            cpu: CPU1,
            scheduler: SchedulerIndex::new(0)
        })
    );
    assert_eq!(system.unpin(thread), Err(SchedulerError::IncorrectState));

    system.pin(thread, CPU0).unwrap();
    assert_eq!(system.pin(thread, CPU0), Err(SchedulerError::IncorrectState));
    assert_eq!(
        system.add_helping_node(thread, SchedulerIndex::new(1)),
        Err(SchedulerError::IncorrectState)
    );
    assert_eq!(
        system.pin(thread, CpuIndex::new(5)),
        Err(SchedulerError::InvalidProcessor(CpuIndex::new(5)))
    );

    system.unpin(thread).unwrap();
    system.add_helping_node(thread, SchedulerIndex::new(1)).unwrap();
    assert_eq!(system.pin(thread, CPU0), Err(SchedulerError::IncorrectState));
}

#[test]
fn blocked_thread_can_be_pinned() {
    let system = System::new(&SystemConfig::single(Algorithm::EdfSmp, 2)).unwrap();
    let thread = system.create_thread(ThreadAttributes::new(5)).unwrap();
    system.pin(thread, CPU1).unwrap();
    assert_eq!(system.thread_state(thread).unwrap(), ThreadState::Blocked);

    system.start_thread(thread).unwrap();
    assert_eq!(system.heir(CPU1), Some(thread));
}
