use kernel_sched::{
    Algorithm, CpuBudget, CpuIndex, GroupOrder, NodeState, PriorityActions, PriorityNode,
    ProcessorMask, SchedulerConfig, SchedulerError, SchedulerIndex, System, SystemConfig,
    ThreadAttributes, ThreadId, ThreadState,
};

const CPU0: CpuIndex = CpuIndex::new(0);
const CPU1: CpuIndex = CpuIndex::new(1);
const HOME: SchedulerIndex = SchedulerIndex::new(0);

fn system(algorithm: Algorithm, processors: usize) -> System {
    System::new(&SystemConfig::single(algorithm, processors)).unwrap()
}

fn started(system: &System, priority: u64) -> ThreadId {
    let thread = system.create_thread(ThreadAttributes::new(priority)).unwrap();
    system.start_thread(thread).unwrap();
    thread
}

fn equal_priorities_run_in_arrival_order(algorithm: Algorithm) {
    let system = system(algorithm, 1);
    let first = started(&system, 5);
    let second = started(&system, 5);
    let urgent = started(&system, 3);

    assert_eq!(system.dispatch(CPU0).unwrap(), urgent);
    system.block(urgent).unwrap();
    assert_eq!(system.dispatch(CPU0).unwrap(), first);
    system.block(first).unwrap();
    assert_eq!(system.dispatch(CPU0).unwrap(), second);
    system.block(second).unwrap();

    let idle = system.dispatch(CPU0).unwrap();
    assert!(system.is_idle(idle));
    system.check_invariants().unwrap();
}

#[test]
fn priority_smp_runs_equal_priorities_in_arrival_order() {
    equal_priorities_run_in_arrival_order(Algorithm::PrioritySmp);
}

#[test]
fn edf_smp_runs_equal_priorities_in_arrival_order() {
    equal_priorities_run_in_arrival_order(Algorithm::EdfSmp);
}

#[test]
fn preempted_thread_resumes_before_its_peers() {
    let system = system(Algorithm::PrioritySmp, 1);
    let first = started(&system, 5);
    let second = started(&system, 5);
    let snapshot = system.snapshot(HOME).unwrap();
    assert_eq!(snapshot.ready, [vec![second]]);

    let urgent = started(&system, 1);
    let snapshot = system.snapshot(HOME).unwrap();
    assert_eq!(snapshot.scheduled, [(CPU0, Some(urgent))]);
    assert_eq!(snapshot.ready, [vec![first, second]]);
}

#[test]
fn most_important_threads_occupy_all_processors() {
    let system = system(Algorithm::PrioritySmp, 2);
    let low = started(&system, 30);
    let mid = started(&system, 20);
    let high = started(&system, 10);

    let snapshot = system.snapshot(HOME).unwrap();
    let mut scheduled: Vec<_> = snapshot.scheduled.iter().filter_map(|&(_, t)| t).collect();
    scheduled.sort();
    assert_eq!(scheduled, [mid, high]);
    assert_eq!(snapshot.ready, [vec![low]]);
    assert_eq!(snapshot.ready_idle, 2);
    assert_eq!(system.thread_state(low).unwrap(), ThreadState::Ready);
    system.check_invariants().unwrap();

    system.block(mid).unwrap();
    assert_eq!(system.thread_state(low).unwrap(), ThreadState::Scheduled);
    system.check_invariants().unwrap();
}

#[test]
fn raising_a_ready_thread_preempts_the_lowest() {
    let system = system(Algorithm::EdfSmp, 1);
    let running = started(&system, 10);
    let waiting = started(&system, 20);
    assert_eq!(system.heir(CPU0), Some(running));

    assert_eq!(system.set_priority(waiting, 5).unwrap(), 20);
    assert_eq!(system.heir(CPU0), Some(waiting));
    assert_eq!(system.priority(waiting).unwrap(), 5);
    assert_eq!(system.thread_state(running).unwrap(), ThreadState::Ready);
    system.check_invariants().unwrap();
}

#[test]
fn lowering_the_running_thread_hands_over() {
    let system = system(Algorithm::PrioritySmp, 1);
    let running = started(&system, 10);
    let waiting = started(&system, 20);

    system.set_priority(running, 30).unwrap();
    assert_eq!(system.heir(CPU0), Some(waiting));
    system.set_priority(running, 20).unwrap();
    assert_eq!(system.heir(CPU0), Some(waiting));
}

#[test]
fn inherited_priority_is_dropped_on_release() {
    let system = system(Algorithm::PrioritySmp, 1);
    let holder = system.create_thread(ThreadAttributes::new(10)).unwrap();
    let mut actions = PriorityActions::new();

    let inherited = PriorityNode::new(system.map_priority(HOME, 2).unwrap());
    system.priority_add(holder, &inherited, &mut actions).unwrap();
    assert_eq!(system.priority(holder).unwrap(), 10);
    system.apply_priority_actions(&mut actions);
    assert_eq!(system.priority(holder).unwrap(), 2);

    system.priority_remove(holder, &inherited, &mut actions).unwrap();
    system.apply_priority_actions(&mut actions);
    assert_eq!(system.priority(holder).unwrap(), 10);
    assert!(actions.is_empty());
}

#[test]
fn changed_contribution_takes_effect() {
    let system = system(Algorithm::EdfSmp, 1);
    let holder = started(&system, 10);
    let other = started(&system, 6);
    assert_eq!(system.heir(CPU0), Some(other));

    let mut actions = PriorityActions::new();
    let mut ceiling = PriorityNode::new(system.map_priority(HOME, 8).unwrap());
    system.priority_add(holder, &ceiling, &mut actions).unwrap();
    system.apply_priority_actions(&mut actions);
    assert_eq!(system.heir(CPU0), Some(other));

    ceiling.set_priority(system.map_priority(HOME, 4).unwrap());
    system
        .priority_change(holder, &ceiling, GroupOrder::Last, &mut actions)
        .unwrap();
    system.apply_priority_actions(&mut actions);
    assert_eq!(system.priority(holder).unwrap(), 4);
    assert_eq!(system.heir(CPU0), Some(holder));
}

#[test]
fn released_job_outranks_background_threads() {
    let system = system(Algorithm::EdfSmp, 1);
    let background = started(&system, 1);
    let periodic = started(&system, 200);
    assert_eq!(system.heir(CPU0), Some(background));

    let mut actions = PriorityActions::new();
    let mut job = PriorityNode::new(Default::default());
    system
        .release_job(periodic, &mut job, 1_000, &mut actions)
        .unwrap();
    system.apply_priority_actions(&mut actions);
    assert_eq!(system.heir(CPU0), Some(periodic));
    assert_eq!(system.priority(periodic).unwrap(), 1_000);

    system.cancel_job(periodic, &job, &mut actions).unwrap();
    system.apply_priority_actions(&mut actions);
    assert_eq!(system.heir(CPU0), Some(background));
    assert_eq!(system.priority(periodic).unwrap(), 200);
}

#[test]
fn earlier_deadline_wins() {
    let system = system(Algorithm::EdfSmp, 1);
    let a = started(&system, 100);
    let b = started(&system, 100);
    let mut actions = PriorityActions::new();
    let mut job_a = PriorityNode::new(Default::default());
    let mut job_b = PriorityNode::new(Default::default());

    system.release_job(a, &mut job_a, 500, &mut actions).unwrap();
    system.release_job(b, &mut job_b, 300, &mut actions).unwrap();
    system.apply_priority_actions(&mut actions);
    assert_eq!(system.heir(CPU0), Some(b));

    system.release_job(b, &mut job_b, 800, &mut actions).unwrap();
    system.apply_priority_actions(&mut actions);
    assert_eq!(system.heir(CPU0), Some(a));
}

#[test]
fn time_slice_rotates_equal_priorities() {
    let config = SystemConfig::single(Algorithm::PrioritySmp, 1).with_ticks_per_timeslice(2);
    let system = System::new(&config).unwrap();
    let sliced = ThreadAttributes::new(5).with_budget(CpuBudget::Timeslice);
    let a = system.create_thread(sliced).unwrap();
    let b = system.create_thread(sliced).unwrap();
    system.start_thread(a).unwrap();
    system.start_thread(b).unwrap();

    assert_eq!(system.dispatch(CPU0).unwrap(), a);
    system.tick(CPU0).unwrap();
    assert_eq!(system.heir(CPU0), Some(a));
    system.tick(CPU0).unwrap();
    assert_eq!(system.heir(CPU0), Some(b));
    assert!(system.dispatch_necessary(CPU0));

    assert_eq!(system.dispatch(CPU0).unwrap(), b);
    system.tick(CPU0).unwrap();
    system.tick(CPU0).unwrap();
    assert_eq!(system.dispatch(CPU0).unwrap(), a);
}

#[test]
fn threads_without_budget_keep_the_processor() {
    let system = system(Algorithm::PrioritySmp, 1);
    let a = started(&system, 5);
    let _b = started(&system, 5);
    system.dispatch(CPU0).unwrap();
    for _ in 0..200 {
        system.tick(CPU0).unwrap();
    }
    assert_eq!(system.heir(CPU0), Some(a));
}

#[test]
fn yield_moves_behind_equal_priorities() {
    let system = system(Algorithm::EdfSmp, 1);
    let a = started(&system, 5);
    let b = started(&system, 5);
    let c = started(&system, 6);

    system.yield_thread(a).unwrap();
    assert_eq!(system.heir(CPU0), Some(b));
    let snapshot = system.snapshot(HOME).unwrap();
    assert_eq!(snapshot.ready[0], [a, c]);

    system.yield_thread(c).unwrap();
    assert_eq!(system.heir(CPU0), Some(b));
}

#[test]
fn deleted_thread_leaves_no_trace() {
    let system = system(Algorithm::PrioritySmp, 1);
    let a = started(&system, 5);
    let b = started(&system, 6);
    system.delete_thread(a).unwrap();

    assert_eq!(system.heir(CPU0), Some(b));
    assert_eq!(system.thread_state(a), Err(SchedulerError::InvalidThread(a)));
    let snapshot = system.snapshot(HOME).unwrap();
    assert!(snapshot.nodes.iter().all(|&(t, _, _)| t != a));
    assert_eq!(snapshot.nodes, [(b, NodeState::Scheduled, 0)]);
}

#[test]
fn recreated_threads_do_not_answer_to_old_handles() {
    let system = system(Algorithm::PrioritySmp, 1);
    let mut deleted = Vec::new();
    for _ in 0..3 {
        let thread = started(&system, 5);
        system.delete_thread(thread).unwrap();
        deleted.push(thread);
    }

    let live = started(&system, 5);
    for old in deleted {
        assert_ne!(old, live);
        assert_eq!(system.unblock(old), Err(SchedulerError::InvalidThread(old)));
    }
    assert_eq!(system.heir(CPU0), Some(live));
    system.check_invariants().unwrap();
}

#[test]
fn requests_are_validated() {
    let system = system(Algorithm::PrioritySmp, 2);
    let idle = system.heir(CPU0).unwrap();
    let thread = system.create_thread(ThreadAttributes::new(5)).unwrap();

    assert_eq!(
        system.create_thread(ThreadAttributes::new(255)),
        Err(SchedulerError::InvalidPriority {
            priority: 255,
            maximum: 254
        })
    );
    assert_eq!(
        system.create_thread(ThreadAttributes::new(1).with_scheduler(SchedulerIndex::new(3))),
        Err(SchedulerError::InvalidScheduler(SchedulerIndex::new(3)))
    );
    assert_eq!(system.block(idle), Err(SchedulerError::IdleThread(idle)));
    assert_eq!(
        system.unblock(ThreadId::new(99)),
        Err(SchedulerError::InvalidThread(ThreadId::new(99)))
    );
    assert_eq!(
        system.set_priority(thread, 300),
        Err(SchedulerError::InvalidPriority {
            priority: 300,
            maximum: 254
        })
    );
    assert_eq!(
        system.set_affinity(thread, ProcessorMask::single(CPU0)),
        Err(SchedulerError::InvalidAffinity)
    );
    assert_eq!(
        system.set_affinity(thread, ProcessorMask::EMPTY),
        Err(SchedulerError::InvalidAffinity)
    );
    assert_eq!(
        system.dispatch(CpuIndex::new(7)),
        Err(SchedulerError::InvalidProcessor(CpuIndex::new(7)))
    );

    system.start_thread(thread).unwrap();
    assert_eq!(system.start_thread(thread), Err(SchedulerError::IncorrectState));
    system.unblock(thread).unwrap();
    system.check_invariants().unwrap();
}

#[test]
fn configuration_is_validated() {
    let doubled = SystemConfig::partitioned(2)
        .with_scheduler(SchedulerConfig::new(
            "a",
            Algorithm::EdfSmp,
            ProcessorMask::first(2),
        ))
        .with_scheduler(SchedulerConfig::new(
            "b",
            Algorithm::PrioritySmp,
            ProcessorMask::single(CPU1),
        ));
    assert_eq!(
        System::new(&doubled).map(|_| ()),
        Err(SchedulerError::ProcessorOwned {
            cpu: CPU1,
            owner: SchedulerIndex::new(0)
        })
    );

    let outside = SystemConfig::partitioned(1).with_scheduler(SchedulerConfig::new(
        "a",
        Algorithm::EdfSmp,
        ProcessorMask::first(2),
    ));
    assert_eq!(
        System::new(&outside).map(|_| ()),
        Err(SchedulerError::InvalidProcessor(CPU1))
    );

    assert_eq!(
        System::new(&SystemConfig::single(Algorithm::EdfSmp, 65)).map(|_| ()),
        Err(SchedulerError::TooManyProcessors(65))
    );
}
