//! Earliest deadline first scheduling with one-to-one affinity.
//!
//! Priorities are deadlines. Threads without a job run in the background,
//! above the deadline range, ordered by their ordinary priority:
//!
//! ```text
//!  raw bit  63          62 .. 1                    0
//!          ┌──────────┬──────────────────────────┬────────┐
//!          │background│ priority or deadline     │ append │
//!          └──────────┴──────────────────────────┴────────┘
//! ```
//!
//! Ready queue `0` takes every node that may run anywhere. Queue `k + 1`
//! takes the nodes restricted to processor `k`, either through their
//! affinity or through pinning. At most one node of each affine queue is
//! scheduled at a time; the affine queues with ready nodes and no scheduled
//! one challenge queue `0` when a processor becomes free.

use crate::error::{InternalError, fatal};
use crate::smp::{
    Generations, ReadyKey, SmpBase, SmpPolicy, SmpScheduler, allocate_exact, extract_ready_key,
    insert_ready_key, insert_scheduled_ordered, take_idle,
};
use crate::{Context, CpuIndex, PriorityControl, ProcessorMask, SchedulerIndex, ThreadId};
use alloc::collections::{BTreeSet, VecDeque};
use alloc::vec::Vec;

/// Set in the value of every priority that is not a deadline.
pub const EDF_BACKGROUND: u64 = 1 << 62;

/// A scheduler instance using [`EdfSmp`].
pub type EdfSmpScheduler = SmpScheduler<EdfSmp>;

#[derive(Debug, Default)]
struct ReadyQueue {
    nodes: BTreeSet<ReadyKey>,
    /// The scheduled node filed in this queue, affine queues only.
    affine_scheduled: Option<ThreadId>,
    /// Node last allocated to the processor of this queue.
    allocated: Option<ThreadId>,
}

#[derive(Debug)]
pub struct EdfSmp {
    base: SmpBase,
    generations: Generations,
    ready: Vec<ReadyQueue>,
    /// Affine queues with ready nodes but no scheduled node.
    affine_queues: VecDeque<usize>,
}

impl EdfSmp {
    #[must_use]
    pub fn new(
        index: SchedulerIndex,
        name: &'static str,
        maximum_priority: u64,
        processor_count: usize,
    ) -> Self {
        Self {
            base: SmpBase::new(index, name, maximum_priority),
            generations: Generations::new(),
            ready: (0..=processor_count).map(|_| ReadyQueue::default()).collect(),
            affine_queues: VecDeque::new(),
        }
    }

    fn key(&self, ctx: &Context, node: ThreadId) -> ReadyKey {
        ReadyKey::of(ctx, self.base.index(), node)
    }

    fn rqi(&self, ctx: &Context, node: ThreadId) -> usize {
        ctx.node(node, self.base.index()).queue_index().ready
    }

    fn link(&mut self, rqi: usize) {
        if !self.affine_queues.contains(&rqi) {
            self.affine_queues.push_back(rqi);
        }
    }

    fn unlink(&mut self, rqi: usize) {
        self.affine_queues.retain(|&q| q != rqi);
    }

    fn activate_if_necessary(&mut self, rqi: usize) {
        let queue = &self.ready[rqi];
        if rqi != 0 && queue.nodes.is_empty() && queue.affine_scheduled.is_none() {
            self.link(rqi);
        }
    }

    fn set_allocated(&mut self, node: ThreadId, cpu: CpuIndex) {
        self.ready[cpu.get() + 1].allocated = Some(node);
    }

    fn allocated(&self, cpu: CpuIndex) -> ThreadId {
        self.ready[cpu.get() + 1]
            .allocated
            .unwrap_or_else(|| fatal(InternalError::NoScheduledNode(cpu)))
    }

    /// Picks the more important of two queue heads, keeping `highest` on ties.
    fn challenge(highest: Option<ReadyKey>, challenger: Option<ReadyKey>) -> Option<ReadyKey> {
        match (highest, challenger) {
            (Some(highest), Some(challenger)) if challenger.precedes(highest) => Some(challenger),
            (None, challenger) => challenger,
            (highest, _) => highest,
        }
    }
}

impl SmpPolicy for EdfSmp {
    fn base(&self) -> &SmpBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SmpBase {
        &mut self.base
    }

    fn map_priority(&self, priority: u64) -> PriorityControl {
        PriorityControl::from_value(priority | EDF_BACKGROUND)
    }

    fn unmap_priority(&self, priority: PriorityControl) -> u64 {
        priority.value() & !EDF_BACKGROUND
    }

    /// Inserting after equal priorities unless the generation says otherwise.
    fn order(&self, ctx: &Context, insert: PriorityControl, node: ThreadId, next: ThreadId) -> bool {
        let index = self.base.index();
        let insert = insert.purified();
        let next = ctx.node(next, index);
        insert < next.queued_priority()
            || (insert == next.queued_priority()
                && ctx.node(node, index).generation() <= next.generation())
    }

    fn update_generation(&mut self, ctx: &mut Context, node: ThreadId, insert: PriorityControl) {
        let generation = self.generations.next(insert);
        ctx.node_mut(node, self.base.index()).generation = generation;
    }

    fn has_ready(&self) -> bool {
        !self.ready[0].nodes.is_empty()
    }

    fn highest_ready(&self, ctx: &Context, filter: ThreadId) -> Option<ThreadId> {
        let mut highest = self.ready[0].nodes.first().copied();

        let rqi = self.rqi(ctx, filter);
        if rqi != 0 {
            highest = Self::challenge(highest, self.ready[rqi].nodes.first().copied());
        }

        for &affine in &self.affine_queues {
            highest = Self::challenge(highest, self.ready[affine].nodes.first().copied());
        }

        highest.map(|key| key.thread)
    }

    fn lowest_scheduled(&self, ctx: &Context, filter: ThreadId) -> Option<ThreadId> {
        let rqi = self.rqi(ctx, filter);
        if rqi != 0
            && let Some(affine) = self.ready[rqi].affine_scheduled
        {
            return Some(affine);
        }
        self.base.scheduled.last().copied()
    }

    fn insert_ready(&mut self, ctx: &mut Context, node: ThreadId, insert: PriorityControl) {
        let _ = insert;
        let rqi = self.rqi(ctx, node);
        self.activate_if_necessary(rqi);
        let key = self.key(ctx, node);
        insert_ready_key(&mut self.ready[rqi].nodes, key);
    }

    fn extract_from_ready(&mut self, ctx: &mut Context, node: ThreadId) {
        let rqi = self.rqi(ctx, node);
        let key = self.key(ctx, node);
        extract_ready_key(&mut self.ready[rqi].nodes, key);

        let queue = &self.ready[rqi];
        if rqi != 0 && queue.nodes.is_empty() && queue.affine_scheduled.is_none() {
            self.unlink(rqi);
        }
    }

    fn insert_scheduled(&mut self, ctx: &mut Context, node: ThreadId, insert: PriorityControl) {
        insert_scheduled_ordered(self, ctx, node, insert);

        let rqi = self.rqi(ctx, node);
        if rqi != 0 {
            self.ready[rqi].affine_scheduled = Some(node);
            if !self.ready[rqi].nodes.is_empty() {
                self.unlink(rqi);
            }
        }
    }

    fn extract_from_scheduled(&mut self, ctx: &mut Context, node: ThreadId) {
        self.base.extract_scheduled(node);

        let rqi = self.rqi(ctx, node);
        if rqi != 0 && !self.ready[rqi].nodes.is_empty() {
            self.link(rqi);
        }
        self.ready[rqi].affine_scheduled = None;
    }

    /// The preempted node goes before all ready nodes of its priority.
    fn move_from_scheduled_to_ready(&mut self, ctx: &mut Context, node: ThreadId) {
        self.extract_from_scheduled(ctx, node);
        let insert = ctx.node(node, self.base.index()).queued_priority();
        self.update_generation(ctx, node, insert);
        let rqi = self.rqi(ctx, node);
        self.activate_if_necessary(rqi);
        let key = self.key(ctx, node);
        insert_ready_key(&mut self.ready[rqi].nodes, key);
    }

    /// A node restricted to one processor always gets that processor; the
    /// node allocated there before takes the processor offered instead.
    fn allocate_processor(&mut self, ctx: &mut Context, node: ThreadId, cpu: CpuIndex) {
        let index = self.base.index();
        let rqi = self.rqi(ctx, node);
        let mut cpu = cpu;

        if rqi != 0 && cpu.get() != rqi - 1 {
            let affine_cpu = CpuIndex::new(rqi - 1);
            let displaced = self.allocated(affine_cpu);
            self.set_allocated(displaced, cpu);
            allocate_exact(ctx, index, displaced, cpu);
            cpu = affine_cpu;
        }

        self.set_allocated(node, cpu);
        allocate_exact(ctx, index, node, cpu);
    }

    fn get_idle(&mut self, ctx: &mut Context) -> ThreadId {
        take_idle(ctx, self.base.index(), &mut self.ready[0].nodes)
    }

    fn release_idle(&mut self, ctx: &mut Context, idle: ThreadId) {
        let insert = ctx.node(idle, self.base.index()).queued_priority().appended();
        self.update_generation(ctx, idle, insert);
        let key = self.key(ctx, idle);
        insert_ready_key(&mut self.ready[0].nodes, key);
    }

    fn register_idle(&mut self, ctx: &mut Context, idle: ThreadId, cpu: CpuIndex) {
        self.set_allocated(idle, cpu);
        let insert = ctx.node(idle, self.base.index()).queued_priority().appended();
        self.update_generation(ctx, idle, insert);
    }

    fn pin(&mut self, ctx: &mut Context, node: ThreadId, cpu: CpuIndex) {
        let queue_index = &mut ctx.node_mut(node, self.base.index()).queue_index;
        queue_index.pinning = cpu.get() + 1;
        queue_index.ready = queue_index.pinning;
    }

    fn unpin(&mut self, ctx: &mut Context, node: ThreadId) {
        let queue_index = &mut ctx.node_mut(node, self.base.index()).queue_index;
        queue_index.ready = queue_index.affinity;
        queue_index.pinning = 0;
    }

    /// All online processors, or exactly one processor of this instance.
    fn accepts_affinity(&self, online: ProcessorMask, affinity: ProcessorMask) -> bool {
        affinity == online
            || (affinity.only().is_some() && affinity.intersects(self.base.processors()))
    }

    fn record_affinity(
        &mut self,
        ctx: &mut Context,
        node: ThreadId,
        online: ProcessorMask,
        affinity: ProcessorMask,
    ) -> Option<usize> {
        let rqi = if affinity == online {
            0
        } else {
            affinity.only().map_or(0, |cpu| cpu.get() + 1)
        };

        let queue_index = &mut ctx.node_mut(node, self.base.index()).queue_index;
        queue_index.affinity = rqi;
        (queue_index.pinning == 0).then_some(rqi)
    }

    fn job_priority(&self, deadline: u64) -> Option<PriorityControl> {
        Some(PriorityControl::from_value(
            deadline.min(EDF_BACKGROUND - 1),
        ))
    }

    fn ready_queues(&self) -> Vec<Vec<ThreadId>> {
        self.ready
            .iter()
            .map(|queue| queue.nodes.iter().map(|key| key.thread).collect())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(processors: usize) -> EdfSmp {
        EdfSmp::new(SchedulerIndex::new(0), "EDF", 255, processors)
    }

    #[test]
    fn background_priorities_follow_every_deadline() {
        let edf = policy(1);
        let background = edf.map_priority(0);
        assert_eq!(edf.unmap_priority(background), 0);
        assert_eq!(edf.unmap_priority(edf.map_priority(255)), 255);

        let latest = edf.job_priority(u64::MAX).unwrap_or_default();
        assert_eq!(latest.value(), EDF_BACKGROUND - 1);
        assert!(latest.is_higher_than(background));
    }

    #[test]
    fn deadlines_order_jobs() {
        let edf = policy(1);
        let early = edf.job_priority(100).unwrap_or_default();
        let late = edf.job_priority(200).unwrap_or_default();
        assert!(early.is_higher_than(late));
        assert_eq!(edf.unmap_priority(early), 100);
    }

    #[test]
    fn affinity_is_all_or_one() {
        let mut edf = policy(4);
        edf.base.processors = ProcessorMask::first(2);
        let online = ProcessorMask::first(4);

        assert!(edf.accepts_affinity(online, online));
        assert!(edf.accepts_affinity(online, ProcessorMask::single(CpuIndex::new(1))));
        assert!(!edf.accepts_affinity(online, ProcessorMask::single(CpuIndex::new(3))));
        assert!(!edf.accepts_affinity(online, ProcessorMask::first(2)));
        assert!(!edf.accepts_affinity(online, ProcessorMask::EMPTY));
    }

    #[test]
    fn ties_go_to_the_head_queue() {
        let a = ReadyKey {
            priority: PriorityControl::from_value(5),
            generation: 0,
            thread: ThreadId::new(1),
        };
        let b = ReadyKey {
            thread: ThreadId::new(2),
            ..a
        };
        let c = ReadyKey {
            generation: -1,
            thread: ThreadId::new(3),
            ..a
        };

        assert_eq!(EdfSmp::challenge(Some(a), Some(b)), Some(a));
        assert_eq!(EdfSmp::challenge(Some(a), Some(c)), Some(c));
        assert_eq!(EdfSmp::challenge(None, Some(b)), Some(b));
        assert_eq!(EdfSmp::challenge(Some(a), None), Some(a));
    }

    #[test]
    fn affine_queues_link_once() {
        let mut edf = policy(2);
        edf.activate_if_necessary(2);
        edf.link(2);
        edf.activate_if_necessary(0);
        assert_eq!(edf.affine_queues, [2]);
        edf.unlink(2);
        assert!(edf.affine_queues.is_empty());
    }
}
