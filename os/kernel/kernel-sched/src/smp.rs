//! The SMP scheduling engine shared by all algorithms.
//!
//! An instance keeps its nodes in two sets: the *scheduled* chain holds the
//! nodes owning one of its processors (most important first), the *ready*
//! set holds everything else that wants to run. Idle threads are ordinary
//! nodes at the lowest priority, so both sets are never short of a node.
//!
//! ```text
//!            enqueue / unblock                     block / withdraw
//!   Blocked ──────────────────► Ready ◄──────────────────────┐
//!      ▲                         │  ▲                        │
//!      │         try_to_schedule │  │ preempt                │
//!      │                         ▼  │                        │
//!      └─────────────────────── Scheduled ───────────────────┘
//! ```
//!
//! A node that must keep its processor while its owner cannot run (the
//! sticky level is positive) lends the processor to an idle thread; the
//! node's user is then the idle thread and the owner takes over again as
//! soon as it becomes ready.
//!
//! The algorithms plug into the engine through [`SmpPolicy`].

use crate::error::{InternalError, fatal};
use crate::operations::{SchedulerOperations, SchedulerSnapshot};
use crate::{
    Context, CpuIndex, GroupOrder, NodeState, PriorityActions, PriorityControl, PriorityNode,
    ProcessorMask, SchedulerIndex, SchedulerNode, ThreadId, ThreadState,
};
use alloc::collections::BTreeSet;
use alloc::vec::Vec;

/// State shared by every SMP policy.
#[derive(Debug)]
pub struct SmpBase {
    index: SchedulerIndex,
    name: &'static str,
    maximum_priority: u64,
    pub(crate) processors: ProcessorMask,
    /// Scheduled nodes, most important first; the last one is the lowest.
    pub(crate) scheduled: Vec<ThreadId>,
}

impl SmpBase {
    #[must_use]
    pub const fn new(index: SchedulerIndex, name: &'static str, maximum_priority: u64) -> Self {
        Self {
            index,
            name,
            maximum_priority,
            processors: ProcessorMask::EMPTY,
            scheduled: Vec::new(),
        }
    }

    #[must_use]
    pub const fn index(&self) -> SchedulerIndex {
        self.index
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn maximum_priority(&self) -> u64 {
        self.maximum_priority
    }

    #[must_use]
    pub const fn processors(&self) -> ProcessorMask {
        self.processors
    }

    #[must_use]
    pub fn scheduled(&self) -> &[ThreadId] {
        &self.scheduled
    }

    pub(crate) fn extract_scheduled(&mut self, node: ThreadId) {
        match self.scheduled.iter().position(|&n| n == node) {
            Some(position) => {
                self.scheduled.remove(position);
            }
            None => fatal(InternalError::NotQueued(node)),
        }
    }
}

/// Place of a ready node: priority first, then generation.
///
/// The thread only makes keys unique; a node's key must not change while
/// the node is in a ready set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ReadyKey {
    pub priority: PriorityControl,
    pub generation: i64,
    pub thread: ThreadId,
}

impl ReadyKey {
    pub(crate) fn of(ctx: &Context, index: SchedulerIndex, thread: ThreadId) -> Self {
        let node = ctx.node(thread, index);
        Self {
            priority: node.queued_priority(),
            generation: node.generation(),
            thread,
        }
    }

    /// Strictly more important than `other`.
    pub(crate) fn precedes(self, other: Self) -> bool {
        (self.priority, self.generation) < (other.priority, other.generation)
    }
}

/// FIFO and LIFO insertion counters.
///
/// Appending draws from a counter going up, prepending from one going down,
/// so an appended node sorts after and a prepended node before every node of
/// its priority.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Generations([i64; 2]);

impl Default for Generations {
    fn default() -> Self {
        Self::new()
    }
}

impl Generations {
    pub(crate) const fn new() -> Self {
        Self([-1, 0])
    }

    pub(crate) fn next(&mut self, insert: PriorityControl) -> i64 {
        let index = usize::from(insert.append());
        let generation = self.0[index];
        self.0[index] = if insert.append() {
            generation + 1
        } else {
            generation - 1
        };
        generation
    }
}

/// Inserts into `set`, treating a present key as corruption.
pub(crate) fn insert_ready_key(set: &mut BTreeSet<ReadyKey>, key: ReadyKey) {
    if !set.insert(key) {
        fatal(InternalError::AlreadyQueued(key.thread));
    }
}

pub(crate) fn extract_ready_key(set: &mut BTreeSet<ReadyKey>, key: ReadyKey) {
    if !set.remove(&key) {
        fatal(InternalError::NotQueued(key.thread));
    }
}

/// Removes the least important idle node of `set`.
pub(crate) fn take_idle(
    ctx: &Context,
    index: SchedulerIndex,
    set: &mut BTreeSet<ReadyKey>,
) -> ThreadId {
    let Some(key) = set
        .iter()
        .rev()
        .find(|key| ctx.thread(key.thread).is_idle())
        .copied()
    else {
        fatal(InternalError::NoIdleNode(index));
    };
    set.remove(&key);
    key.thread
}

/// Inserts `node` into the scheduled chain before the first node it orders before.
pub(crate) fn insert_scheduled_ordered<P: SmpPolicy + ?Sized>(
    policy: &mut P,
    ctx: &Context,
    node: ThreadId,
    insert: PriorityControl,
) {
    let scheduled = &policy.base().scheduled;
    let position = scheduled
        .iter()
        .position(|&next| policy.order(ctx, insert, node, next))
        .unwrap_or(scheduled.len());
    policy.base_mut().scheduled.insert(position, node);
}

/// Algorithm specific hooks of the SMP engine.
///
/// Nodes are named by their owner; the engine guarantees that a node is in
/// at most one of the sets when a hook runs, and that the queued priority and
/// generation of a node only change while it is in neither set. Hooks never
/// change node states.
pub trait SmpPolicy: Send {
    fn base(&self) -> &SmpBase;

    fn base_mut(&mut self) -> &mut SmpBase;

    fn map_priority(&self, priority: u64) -> PriorityControl;

    fn unmap_priority(&self, priority: PriorityControl) -> u64;

    /// Whether `node`, inserted with `insert`, goes before `next`.
    fn order(&self, ctx: &Context, insert: PriorityControl, node: ThreadId, next: ThreadId) -> bool {
        let _ = node;
        insert <= ctx.node(next, self.base().index()).queued_priority()
    }

    /// Called before `node` is enqueued with `insert`.
    fn update_generation(&mut self, ctx: &mut Context, node: ThreadId, insert: PriorityControl) {
        let _ = (ctx, node, insert);
    }

    /// The ready set holds at least one node every processor may run.
    fn has_ready(&self) -> bool;

    /// Most important ready node a processor vacated by `filter` may run.
    fn highest_ready(&self, ctx: &Context, filter: ThreadId) -> Option<ThreadId>;

    /// Scheduled node `filter` competes with.
    fn lowest_scheduled(&self, ctx: &Context, filter: ThreadId) -> Option<ThreadId> {
        let _ = (ctx, filter);
        self.base().scheduled.last().copied()
    }

    fn insert_ready(&mut self, ctx: &mut Context, node: ThreadId, insert: PriorityControl);

    fn extract_from_ready(&mut self, ctx: &mut Context, node: ThreadId);

    fn insert_scheduled(&mut self, ctx: &mut Context, node: ThreadId, insert: PriorityControl) {
        insert_scheduled_ordered(self, ctx, node, insert);
    }

    fn extract_from_scheduled(&mut self, ctx: &mut Context, node: ThreadId) {
        let _ = ctx;
        self.base_mut().extract_scheduled(node);
    }

    fn move_from_scheduled_to_ready(&mut self, ctx: &mut Context, node: ThreadId);

    fn move_from_ready_to_scheduled(&mut self, ctx: &mut Context, node: ThreadId) {
        self.extract_from_ready(ctx, node);
        let insert = ctx.node(node, self.base().index()).queued_priority().appended();
        self.insert_scheduled(ctx, node, insert);
    }

    /// Hands `cpu` to the user of the scheduled node.
    fn allocate_processor(&mut self, ctx: &mut Context, node: ThreadId, cpu: CpuIndex) {
        allocate_exact(ctx, self.base().index(), node, cpu);
    }

    /// Takes an idle node out of the ready set.
    fn get_idle(&mut self, ctx: &mut Context) -> ThreadId;

    /// Returns an idle node taken with [`Self::get_idle`].
    fn release_idle(&mut self, ctx: &mut Context, idle: ThreadId);

    fn register_idle(&mut self, ctx: &mut Context, idle: ThreadId, cpu: CpuIndex) {
        let _ = (ctx, idle, cpu);
    }

    fn pin(&mut self, ctx: &mut Context, node: ThreadId, cpu: CpuIndex) {
        let _ = (ctx, node, cpu);
    }

    fn unpin(&mut self, ctx: &mut Context, node: ThreadId) {
        let _ = (ctx, node);
    }

    fn accepts_affinity(&self, online: ProcessorMask, affinity: ProcessorMask) -> bool;

    /// Records the affinity of `node`.
    ///
    /// Returns the ready queue index the node must move to now, or `None` if
    /// its queue placement is unaffected.
    fn record_affinity(
        &mut self,
        ctx: &mut Context,
        node: ThreadId,
        online: ProcessorMask,
        affinity: ProcessorMask,
    ) -> Option<usize> {
        let _ = (ctx, node, online, affinity);
        None
    }

    /// Priority of a job with the given deadline, if the algorithm has jobs.
    fn job_priority(&self, deadline: u64) -> Option<PriorityControl> {
        let _ = deadline;
        None
    }

    /// Ready queues with their nodes, most important first.
    fn ready_queues(&self) -> Vec<Vec<ThreadId>>;
}

/// Assigns `cpu` to the user of `node`, nothing else moves.
pub(crate) fn allocate_exact(
    ctx: &mut Context,
    index: SchedulerIndex,
    node: ThreadId,
    cpu: CpuIndex,
) {
    let user = ctx.node(node, index).user();
    ctx.set_thread_cpu(user, cpu);
    ctx.update_heir(cpu, user);
}

/// Assigns `cpu` to the user of `node`, unless the user already runs on
/// another processor of the instance; then the user stays and the heir of
/// that processor moves to `cpu` instead.
pub(crate) fn allocate_lazy(
    ctx: &mut Context,
    index: SchedulerIndex,
    node: ThreadId,
    cpu: CpuIndex,
) {
    let user = ctx.node(node, index).user();
    let user_cpu = ctx.thread(user).cpu();

    if cpu != user_cpu
        && ctx.is_executing_on_a_processor(user)
        && ctx.cpu(user_cpu).scheduler() == Some(index)
        && let Some(heir) = ctx.cpu(user_cpu).heir()
    {
        ctx.update_heir(user_cpu, user);
        ctx.set_thread_cpu(heir, cpu);
        ctx.update_heir(cpu, heir);
        return;
    }

    ctx.set_thread_cpu(user, cpu);
    ctx.update_heir(cpu, user);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Allocation {
    Policy,
    Exact,
}

/// A scheduler instance driven by the SMP engine.
#[derive(Debug)]
pub struct SmpScheduler<P> {
    policy: P,
}

impl<P: SmpPolicy> SmpScheduler<P> {
    #[must_use]
    pub const fn new(policy: P) -> Self {
        Self { policy }
    }

    #[must_use]
    pub const fn policy(&self) -> &P {
        &self.policy
    }

    fn idx(&self) -> SchedulerIndex {
        self.policy.base().index()
    }

    fn node<'c>(&self, ctx: &'c Context, node: ThreadId) -> &'c SchedulerNode {
        ctx.node(node, self.idx())
    }

    fn node_mut<'c>(&self, ctx: &'c mut Context, node: ThreadId) -> &'c mut SchedulerNode {
        ctx.node_mut(node, self.idx())
    }

    fn set_node_state(&self, ctx: &mut Context, node: ThreadId, state: NodeState) {
        self.node_mut(ctx, node).state = state;
    }

    fn set_queued_priority(&self, ctx: &mut Context, node: ThreadId, priority: PriorityControl) {
        self.node_mut(ctx, node).queued_priority = priority;
    }

    fn use_idle_thread(&mut self, ctx: &mut Context, node: ThreadId) -> ThreadId {
        let idle = self.policy.get_idle(ctx);
        self.node_mut(ctx, node).set_user(idle);
        log::trace!("{}: {idle} substitutes for {node}", self.policy.base().name());
        idle
    }

    fn release_idle_thread(&mut self, ctx: &mut Context, node: ThreadId, idle: ThreadId) {
        let scheduler_node = self.node_mut(ctx, node);
        let owner = scheduler_node.owner();
        scheduler_node.set_user(owner);
        self.policy.release_idle(ctx, idle);
    }

    fn release_idle_thread_if_necessary(
        &mut self,
        ctx: &mut Context,
        node: ThreadId,
    ) -> Option<ThreadId> {
        let idle = self.node(ctx, node).idle()?;
        self.release_idle_thread(ctx, node, idle);
        Some(idle)
    }

    /// The owner takes its processor back from the idle thread.
    fn discard_idle_thread(&mut self, ctx: &mut Context, thread: ThreadId, node: ThreadId) {
        let Some(idle) = self.node(ctx, node).idle() else {
            return;
        };
        self.release_idle_thread(ctx, node, idle);
        let cpu = ctx.thread(idle).cpu();
        ctx.set_thread_cpu(thread, cpu);
        ctx.update_heir(cpu, thread);
    }

    /// Decides whether `node` may take a processor; `false` leaves it blocked.
    fn try_to_schedule(&mut self, ctx: &mut Context, node: ThreadId) -> bool {
        let owner = self.node(ctx, node).owner();
        let owner_state = ctx.thread(owner).state();
        let sticky_level = self.node(ctx, node).sticky_level();

        if owner_state == ThreadState::Ready {
            ctx.cancel_ask_for_help(owner);
            ctx.thread_mut(owner).state = ThreadState::Scheduled;
            return true;
        }

        if (owner_state == ThreadState::Scheduled && sticky_level <= 1) || sticky_level == 0 {
            self.set_node_state(ctx, node, NodeState::Blocked);
            return false;
        }

        self.use_idle_thread(ctx, node);
        true
    }

    fn allocate(&mut self, ctx: &mut Context, node: ThreadId, cpu: CpuIndex, how: Allocation) {
        self.set_node_state(ctx, node, NodeState::Scheduled);
        match how {
            Allocation::Policy => self.policy.allocate_processor(ctx, node, cpu),
            Allocation::Exact => allocate_exact(ctx, self.idx(), node, cpu),
        }
    }

    /// Gives the processor of `victim` to `scheduled`.
    fn preempt(
        &mut self,
        ctx: &mut Context,
        scheduled: ThreadId,
        victim: ThreadId,
        victim_idle: Option<ThreadId>,
        how: Allocation,
    ) {
        self.set_node_state(ctx, victim, NodeState::Ready);
        let owner = self.node(ctx, victim).owner();

        let cpu = if let Some(idle) = victim_idle {
            ctx.thread(idle).cpu()
        } else {
            let thread = ctx.thread_mut(owner);
            if thread.state == ThreadState::Scheduled {
                thread.state = ThreadState::Ready;
                if thread.helping_nodes() > 0 {
                    ctx.request_ask_for_help(owner);
                }
            }
            ctx.thread(owner).cpu()
        };

        log::trace!(
            "{}: {scheduled} preempts {victim} on {cpu}",
            self.policy.base().name()
        );
        self.allocate(ctx, scheduled, cpu, how);
    }

    fn highest_ready(&self, ctx: &Context, filter: ThreadId) -> ThreadId {
        self.policy
            .highest_ready(ctx, filter)
            .unwrap_or_else(|| fatal(InternalError::NoIdleNode(self.idx())))
    }

    fn enqueue_to_scheduled(
        &mut self,
        ctx: &mut Context,
        node: ThreadId,
        insert: PriorityControl,
        lowest: ThreadId,
    ) {
        let lowest_idle = self.release_idle_thread_if_necessary(ctx, lowest);
        self.policy.move_from_scheduled_to_ready(ctx, lowest);

        if self.try_to_schedule(ctx, node) {
            self.preempt(ctx, node, lowest, lowest_idle, Allocation::Policy);
            self.policy.insert_scheduled(ctx, node, insert);
        } else {
            if lowest_idle.is_some() {
                self.use_idle_thread(ctx, lowest);
            }
            self.policy.move_from_ready_to_scheduled(ctx, lowest);
        }
    }

    /// Places a node that is in neither set; returns `true` if it did not
    /// get a processor.
    fn enqueue(&mut self, ctx: &mut Context, node: ThreadId, insert: PriorityControl) -> bool {
        self.policy.update_generation(ctx, node, insert);

        match self.policy.lowest_scheduled(ctx, node) {
            Some(lowest) if self.policy.order(ctx, insert, node, lowest) => {
                self.enqueue_to_scheduled(ctx, node, insert, lowest);
                false
            }
            _ => {
                self.set_node_state(ctx, node, NodeState::Ready);
                self.policy.insert_ready(ctx, node, insert);
                true
            }
        }
    }

    /// Places a scheduled node that was taken off the scheduled chain.
    fn enqueue_scheduled(&mut self, ctx: &mut Context, node: ThreadId, insert: PriorityControl) {
        self.policy.update_generation(ctx, node, insert);
        let node_idle = self.release_idle_thread_if_necessary(ctx, node);
        let sticky_level = self.node(ctx, node).sticky_level();

        loop {
            let highest = match self.policy.highest_ready(ctx, node) {
                Some(highest)
                    if !(sticky_level > 0 && self.policy.order(ctx, insert, node, highest)) =>
                {
                    highest
                }
                _ => {
                    if let Some(idle) = node_idle {
                        let owner = self.node(ctx, node).owner();
                        if ctx.thread(owner).state() == ThreadState::Ready {
                            ctx.cancel_ask_for_help(owner);
                            ctx.thread_mut(owner).state = ThreadState::Scheduled;
                            let cpu = ctx.thread(idle).cpu();
                            ctx.set_thread_cpu(owner, cpu);
                            ctx.update_heir(cpu, owner);
                        } else {
                            self.use_idle_thread(ctx, node);
                        }
                    }
                    self.policy.insert_scheduled(ctx, node, insert);
                    return;
                }
            };

            if self.try_to_schedule(ctx, highest) {
                self.preempt(ctx, highest, node, node_idle, Allocation::Policy);
                self.policy.move_from_ready_to_scheduled(ctx, highest);
                self.policy.insert_ready(ctx, node, insert);
                return;
            }

            self.policy.extract_from_ready(ctx, highest);
        }
    }

    /// Hands the processor of the leaving `victim` to the best ready node.
    fn schedule_highest_ready(&mut self, ctx: &mut Context, victim: ThreadId, cpu: CpuIndex) {
        self.set_node_state(ctx, victim, NodeState::Blocked);
        self.policy.extract_from_scheduled(ctx, victim);

        loop {
            let highest = self.highest_ready(ctx, victim);
            if self.try_to_schedule(ctx, highest) {
                self.allocate(ctx, highest, cpu, Allocation::Policy);
                self.policy.move_from_ready_to_scheduled(ctx, highest);
                return;
            }
            self.policy.extract_from_ready(ctx, highest);
        }
    }

    /// Like [`Self::schedule_highest_ready`], but `victim` stays ready.
    fn preempt_and_schedule_highest_ready(&mut self, ctx: &mut Context, victim: ThreadId) {
        self.set_node_state(ctx, victim, NodeState::Ready);
        let victim_idle = self.release_idle_thread_if_necessary(ctx, victim);

        loop {
            let highest = self.highest_ready(ctx, victim);
            if self.try_to_schedule(ctx, highest) {
                self.preempt(ctx, highest, victim, victim_idle, Allocation::Policy);
                self.policy.move_from_ready_to_scheduled(ctx, highest);
                return;
            }
            self.policy.extract_from_ready(ctx, highest);
        }
    }

    fn is_visible(&self, ctx: &Context, node: ThreadId, cpu: CpuIndex) -> bool {
        let rqi = self.node(ctx, node).queue_index().ready;
        rqi == 0 || rqi - 1 == cpu.get()
    }
}

impl<P: SmpPolicy> SchedulerOperations for SmpScheduler<P> {
    fn name(&self) -> &'static str {
        self.policy.base().name()
    }

    fn index(&self) -> SchedulerIndex {
        self.idx()
    }

    fn processors(&self) -> ProcessorMask {
        self.policy.base().processors()
    }

    fn maximum_priority(&self) -> u64 {
        self.policy.base().maximum_priority()
    }

    fn map_priority(&self, priority: u64) -> PriorityControl {
        self.policy.map_priority(priority)
    }

    fn unmap_priority(&self, priority: PriorityControl) -> u64 {
        self.policy.unmap_priority(priority)
    }

    fn node_initialize(&mut self, ctx: &mut Context, thread: ThreadId, priority: PriorityControl) {
        self.node_mut(ctx, thread).initialize(thread, priority);
    }

    fn block(&mut self, ctx: &mut Context, thread: ThreadId) {
        let sticky_level = self.node_mut(ctx, thread).decrement_sticky_level();
        ctx.cancel_ask_for_help(thread);
        let cpu = ctx.thread(thread).cpu();
        ctx.thread_mut(thread).state = ThreadState::Blocked;
        let state = self.node(ctx, thread).state();

        if sticky_level > 0 {
            if state == NodeState::Scheduled && self.node(ctx, thread).idle().is_none() {
                let idle = self.use_idle_thread(ctx, thread);
                ctx.set_thread_cpu(idle, cpu);
                ctx.update_heir(cpu, idle);
            }
            return;
        }

        match state {
            NodeState::Scheduled => self.schedule_highest_ready(ctx, thread, cpu),
            NodeState::Ready => {
                self.set_node_state(ctx, thread, NodeState::Blocked);
                self.policy.extract_from_ready(ctx, thread);
            }
            NodeState::Blocked | NodeState::Unused => {}
        }
    }

    fn unblock(&mut self, ctx: &mut Context, thread: ThreadId) {
        self.node_mut(ctx, thread).increment_sticky_level();
        let state = self.node(ctx, thread).state();

        if state == NodeState::Scheduled {
            ctx.thread_mut(thread).state = ThreadState::Scheduled;
            self.discard_idle_thread(ctx, thread, thread);
            return;
        }

        ctx.thread_mut(thread).state = ThreadState::Ready;
        let priority = self.node(ctx, thread).priority().purified();
        if priority != self.node(ctx, thread).queued_priority() {
            self.set_queued_priority(ctx, thread, priority);
        }

        if state == NodeState::Blocked {
            let needs_help = self.enqueue(ctx, thread, priority.appended());
            if needs_help && ctx.thread(thread).helping_nodes() > 0 {
                ctx.request_ask_for_help(thread);
            }
        } else {
            ctx.request_ask_for_help(thread);
        }
    }

    fn update_priority(&mut self, ctx: &mut Context, thread: ThreadId) {
        let insert = self.node(ctx, thread).priority();
        let priority = insert.purified();

        if priority == self.node(ctx, thread).queued_priority() {
            if ctx.thread(thread).is_ready() {
                self.ask_for_help(ctx, thread);
            }
            return;
        }

        match self.node(ctx, thread).state() {
            NodeState::Scheduled => {
                self.policy.extract_from_scheduled(ctx, thread);
                self.set_queued_priority(ctx, thread, priority);
                self.enqueue_scheduled(ctx, thread, insert);
            }
            NodeState::Ready => {
                self.policy.extract_from_ready(ctx, thread);
                self.set_queued_priority(ctx, thread, priority);
                self.enqueue(ctx, thread, insert);
            }
            NodeState::Blocked | NodeState::Unused => {
                self.set_queued_priority(ctx, thread, priority);
                if ctx.thread(thread).is_ready() {
                    self.ask_for_help(ctx, thread);
                }
            }
        }
    }

    fn yield_thread(&mut self, ctx: &mut Context, thread: ThreadId) {
        let insert = self.node(ctx, thread).queued_priority().appended();
        match self.node(ctx, thread).state() {
            NodeState::Scheduled => {
                self.policy.extract_from_scheduled(ctx, thread);
                self.enqueue_scheduled(ctx, thread, insert);
            }
            NodeState::Ready => {
                self.policy.extract_from_ready(ctx, thread);
                self.enqueue(ctx, thread, insert);
            }
            NodeState::Blocked | NodeState::Unused => {}
        }
    }

    fn ask_for_help(&mut self, ctx: &mut Context, thread: ThreadId) -> bool {
        // Nothing to gain for a pinned thread; stop the caller's search.
        if ctx.thread(thread).pinned().is_some() {
            return true;
        }

        if ctx.thread(thread).state() != ThreadState::Ready {
            return false;
        }

        match self.node(ctx, thread).state() {
            NodeState::Blocked => {
                let insert = self.node(ctx, thread).queued_priority();
                self.policy.update_generation(ctx, thread, insert);
                match self.policy.lowest_scheduled(ctx, thread) {
                    Some(lowest) if self.policy.order(ctx, insert, thread, lowest) => {
                        ctx.cancel_ask_for_help(thread);
                        ctx.thread_mut(thread).state = ThreadState::Scheduled;
                        let lowest_idle = self.release_idle_thread_if_necessary(ctx, lowest);
                        self.preempt(ctx, thread, lowest, lowest_idle, Allocation::Policy);
                        self.policy.move_from_scheduled_to_ready(ctx, lowest);
                        self.policy.insert_scheduled(ctx, thread, insert);
                        true
                    }
                    _ => {
                        self.set_node_state(ctx, thread, NodeState::Ready);
                        self.policy.insert_ready(ctx, thread, insert);
                        false
                    }
                }
            }
            NodeState::Scheduled => {
                ctx.cancel_ask_for_help(thread);
                ctx.thread_mut(thread).state = ThreadState::Scheduled;
                self.discard_idle_thread(ctx, thread, thread);
                true
            }
            NodeState::Ready | NodeState::Unused => false,
        }
    }

    fn reconsider_help_request(&mut self, ctx: &mut Context, thread: ThreadId) {
        let node = self.node(ctx, thread);
        if ctx.thread(thread).state() == ThreadState::Scheduled
            && node.state() == NodeState::Ready
            && node.sticky_level() == 1
        {
            self.set_node_state(ctx, thread, NodeState::Blocked);
            self.policy.extract_from_ready(ctx, thread);
        }
    }

    fn withdraw_node(&mut self, ctx: &mut Context, thread: ThreadId, next_state: ThreadState) {
        match self.node(ctx, thread).state() {
            NodeState::Scheduled => {
                let cpu = match self.release_idle_thread_if_necessary(ctx, thread) {
                    Some(idle) => ctx.thread(idle).cpu(),
                    None => {
                        let cpu = ctx.thread(thread).cpu();
                        ctx.thread_mut(thread).state = next_state;
                        cpu
                    }
                };
                self.schedule_highest_ready(ctx, thread, cpu);
            }
            NodeState::Ready => {
                self.set_node_state(ctx, thread, NodeState::Blocked);
                self.policy.extract_from_ready(ctx, thread);
            }
            NodeState::Blocked | NodeState::Unused => {}
        }
    }

    fn make_sticky(&mut self, ctx: &mut Context, thread: ThreadId) {
        if self.node(ctx, thread).state() != NodeState::Blocked {
            return;
        }

        let priority = self.node(ctx, thread).priority().purified();
        if priority != self.node(ctx, thread).queued_priority() {
            self.set_queued_priority(ctx, thread, priority);
        }
        self.enqueue(ctx, thread, priority.appended());
    }

    fn clean_sticky(&mut self, ctx: &mut Context, thread: ThreadId) {
        if self.node(ctx, thread).state() != NodeState::Scheduled {
            return;
        }

        if let Some(idle) = self.node(ctx, thread).idle() {
            self.release_idle_thread(ctx, thread, idle);
            let cpu = ctx.thread(idle).cpu();
            self.schedule_highest_ready(ctx, thread, cpu);
        }
    }

    fn pin(&mut self, ctx: &mut Context, thread: ThreadId, cpu: CpuIndex) {
        self.policy.pin(ctx, thread, cpu);
    }

    fn unpin(&mut self, ctx: &mut Context, thread: ThreadId, cpu: CpuIndex) {
        let _ = cpu;
        self.policy.unpin(ctx, thread);
    }

    fn start_idle(&mut self, ctx: &mut Context, idle: ThreadId, cpu: CpuIndex) {
        ctx.thread_mut(idle).state = ThreadState::Scheduled;
        self.set_node_state(ctx, idle, NodeState::Scheduled);
        ctx.set_thread_cpu(idle, cpu);
        ctx.update_heir(cpu, idle);
        self.policy.base_mut().processors.insert(cpu);
        self.policy.register_idle(ctx, idle, cpu);
        self.policy.base_mut().scheduled.push(idle);
    }

    fn add_processor(&mut self, ctx: &mut Context, idle: ThreadId) {
        let cpu = ctx.thread(idle).cpu();
        ctx.thread_mut(idle).state = ThreadState::Scheduled;
        self.set_node_state(ctx, idle, NodeState::Scheduled);
        ctx.update_heir(cpu, idle);
        self.policy.base_mut().processors.insert(cpu);
        self.policy.register_idle(ctx, idle, cpu);

        if self.policy.has_ready() {
            let insert = self.node(ctx, idle).queued_priority().appended();
            self.enqueue_scheduled(ctx, idle, insert);
        } else {
            self.policy.base_mut().scheduled.push(idle);
        }
    }

    fn remove_processor(&mut self, ctx: &mut Context, cpu: CpuIndex) -> ThreadId {
        let index = self.idx();
        let Some(victim) = self
            .policy
            .base()
            .scheduled
            .iter()
            .copied()
            .find(|&node| ctx.thread(ctx.node(node, index).user()).cpu() == cpu)
        else {
            fatal(InternalError::NoScheduledNode(cpu));
        };

        self.policy.extract_from_scheduled(ctx, victim);
        self.policy.base_mut().processors.remove(cpu);

        if ctx.thread(victim).is_idle() {
            return victim;
        }

        let victim_idle = self.release_idle_thread_if_necessary(ctx, victim);
        let idle = self.policy.get_idle(ctx);
        self.preempt(ctx, idle, victim, victim_idle, Allocation::Exact);
        let insert = self.node(ctx, victim).queued_priority().appended();
        self.enqueue(ctx, victim, insert);
        idle
    }

    fn accepts_affinity(&self, online: ProcessorMask, affinity: ProcessorMask) -> bool {
        self.policy.accepts_affinity(online, affinity)
    }

    fn set_affinity(
        &mut self,
        ctx: &mut Context,
        thread: ThreadId,
        online: ProcessorMask,
        affinity: ProcessorMask,
    ) {
        let Some(rqi) = self.policy.record_affinity(ctx, thread, online, affinity) else {
            return;
        };

        let insert = self.node(ctx, thread).queued_priority().appended();
        match self.node(ctx, thread).state() {
            NodeState::Scheduled => {
                self.policy.extract_from_scheduled(ctx, thread);
                self.preempt_and_schedule_highest_ready(ctx, thread);
                self.node_mut(ctx, thread).queue_index.ready = rqi;
                self.enqueue(ctx, thread, insert);
            }
            NodeState::Ready => {
                self.policy.extract_from_ready(ctx, thread);
                self.node_mut(ctx, thread).queue_index.ready = rqi;
                self.enqueue(ctx, thread, insert);
            }
            NodeState::Blocked | NodeState::Unused => {
                self.node_mut(ctx, thread).queue_index.ready = rqi;
            }
        }
    }

    fn release_job(
        &self,
        ctx: &mut Context,
        thread: ThreadId,
        job: &mut PriorityNode,
        deadline: u64,
        actions: &mut PriorityActions,
    ) {
        let Some(priority) = self.policy.job_priority(deadline) else {
            return;
        };

        job.set_priority(priority);
        if ctx.is_contributing(thread, job) {
            ctx.priority_change(thread, job, GroupOrder::Last, actions);
        } else {
            ctx.priority_add(thread, job, actions);
        }
    }

    fn cancel_job(
        &self,
        ctx: &mut Context,
        thread: ThreadId,
        job: &PriorityNode,
        actions: &mut PriorityActions,
    ) {
        if ctx.is_contributing(thread, job) {
            ctx.priority_remove(thread, job, actions);
        }
    }

    fn snapshot(&self, ctx: &Context) -> SchedulerSnapshot {
        let index = self.idx();
        let real = |thread: ThreadId| !ctx.thread(thread).is_idle();

        let mut scheduled: Vec<_> = self
            .policy
            .base()
            .scheduled
            .iter()
            .map(|&node| {
                let cpu = ctx.thread(ctx.node(node, index).user()).cpu();
                (cpu, real(node).then_some(node))
            })
            .collect();
        scheduled.sort_unstable_by_key(|&(cpu, _)| cpu);

        let queues = self.policy.ready_queues();
        let ready = queues
            .iter()
            .map(|queue| queue.iter().copied().filter(|&t| real(t)).collect())
            .collect();
        let ready_idle = queues.iter().flatten().filter(|&&t| !real(t)).count();

        let nodes = ctx
            .threads()
            .filter(|thread| !thread.is_idle())
            .filter_map(|thread| {
                let node = thread.node(index)?;
                (node.state() != NodeState::Unused)
                    .then(|| (thread.id(), node.state(), node.queue_index().ready))
            })
            .collect();

        SchedulerSnapshot {
            processors: self.processors(),
            scheduled,
            ready,
            ready_idle,
            nodes,
        }
    }

    fn check_invariants(&self, ctx: &Context) -> Result<(), InternalError> {
        let index = self.idx();
        let ready: Vec<ThreadId> = self
            .policy
            .ready_queues()
            .into_iter()
            .flatten()
            .filter(|&node| ctx.thread(node).state() == ThreadState::Ready)
            .collect();

        for &scheduled in &self.policy.base().scheduled {
            let node = ctx.node(scheduled, index);
            if node.state() != NodeState::Scheduled {
                return Err(InternalError::NotQueued(scheduled));
            }

            let cpu = ctx.thread(node.user()).cpu();
            let violated = ready.iter().any(|&candidate| {
                self.is_visible(ctx, candidate, cpu)
                    && ctx
                        .node(candidate, index)
                        .queued_priority()
                        .is_higher_than(node.queued_priority())
            });
            if violated {
                return Err(InternalError::VisibilityViolated {
                    cpu,
                    thread: scheduled,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Thread;

    const SCHEDULER: SchedulerIndex = SchedulerIndex::new(0);
    const CPU0: CpuIndex = CpuIndex::new(0);
    const CPU1: CpuIndex = CpuIndex::new(1);

    fn context_with(threads: usize) -> (Context, Vec<ThreadId>) {
        let mut ctx = Context::new(2, 1);
        ctx.cpu_mut(CPU0).scheduler = Some(SCHEDULER);
        ctx.cpu_mut(CPU1).scheduler = Some(SCHEDULER);
        let ids = (0..threads)
            .map(|_| {
                ctx.insert_thread(|id| {
                    Thread::new(
                        id,
                        SCHEDULER,
                        1,
                        PriorityNode::new(PriorityControl::from_value(5)),
                        ProcessorMask::first(2),
                    )
                })
            })
            .collect();
        (ctx, ids)
    }

    #[test]
    fn lazy_allocation_keeps_an_executing_thread_in_place() {
        let (mut ctx, ids) = context_with(2);
        let (running, heir) = (ids[0], ids[1]);
        ctx.set_thread_cpu(running, CPU0);
        ctx.cpu_mut(CPU0).executing = Some(running);
        ctx.cpu_mut(CPU0).heir = Some(heir);

        allocate_lazy(&mut ctx, SCHEDULER, running, CPU1);
        assert_eq!(ctx.cpu(CPU0).heir(), Some(running));
        assert_eq!(ctx.cpu(CPU1).heir(), Some(heir));
        assert_eq!(ctx.thread(heir).cpu(), CPU1);
        assert_eq!(ctx.thread(running).cpu(), CPU0);
    }

    #[test]
    fn lazy_allocation_of_a_waiting_thread_is_exact() {
        let (mut ctx, ids) = context_with(1);
        let thread = ids[0];
        allocate_lazy(&mut ctx, SCHEDULER, thread, CPU1);
        assert_eq!(ctx.cpu(CPU1).heir(), Some(thread));
        assert_eq!(ctx.thread(thread).cpu(), CPU1);
        assert!(ctx.cpu(CPU1).dispatch_necessary());
    }

    #[test]
    fn ready_keys_order_by_priority_then_generation() {
        let key = |priority, generation, thread| ReadyKey {
            priority: PriorityControl::from_value(priority),
            generation,
            thread: ThreadId::new(thread),
        };
        let mut set = BTreeSet::new();
        set.insert(key(5, 1, 0));
        set.insert(key(5, -1, 1));
        set.insert(key(3, 7, 2));
        set.insert(key(5, 0, 3));

        let order: Vec<_> = set.iter().map(|k| k.thread.get()).collect();
        assert_eq!(order, [2, 1, 3, 0]);
        assert!(key(5, -1, 1).precedes(key(5, 0, 3)));
        assert!(!key(5, 0, 3).precedes(key(5, 0, 9)));
    }
}
