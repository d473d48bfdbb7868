//! Fixed priority scheduling over all processors of an instance.

use crate::smp::{
    Generations, ReadyKey, SmpBase, SmpPolicy, SmpScheduler, allocate_lazy, extract_ready_key,
    insert_ready_key, take_idle,
};
use crate::{Context, CpuIndex, PriorityControl, ProcessorMask, SchedulerIndex, ThreadId};
use alloc::collections::BTreeSet;
use alloc::vec::Vec;

/// A scheduler instance using [`PrioritySmp`].
pub type PrioritySmpScheduler = SmpScheduler<PrioritySmp>;

/// One ready set; FIFO among equal priorities, except that a preempted
/// node goes back to the head of its priority.
#[derive(Debug)]
pub struct PrioritySmp {
    base: SmpBase,
    generations: Generations,
    ready: BTreeSet<ReadyKey>,
}

impl PrioritySmp {
    #[must_use]
    pub const fn new(index: SchedulerIndex, name: &'static str, maximum_priority: u64) -> Self {
        Self {
            base: SmpBase::new(index, name, maximum_priority),
            generations: Generations::new(),
            ready: BTreeSet::new(),
        }
    }
}

impl SmpPolicy for PrioritySmp {
    fn base(&self) -> &SmpBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SmpBase {
        &mut self.base
    }

    fn map_priority(&self, priority: u64) -> PriorityControl {
        PriorityControl::from_value(priority)
    }

    fn unmap_priority(&self, priority: PriorityControl) -> u64 {
        priority.value()
    }

    fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    fn highest_ready(&self, ctx: &Context, filter: ThreadId) -> Option<ThreadId> {
        let _ = (ctx, filter);
        self.ready.first().map(|key| key.thread)
    }

    fn insert_ready(&mut self, ctx: &mut Context, node: ThreadId, insert: PriorityControl) {
        let index = self.base.index();
        ctx.node_mut(node, index).generation = self.generations.next(insert);
        let key = ReadyKey::of(ctx, index, node);
        insert_ready_key(&mut self.ready, key);
    }

    fn extract_from_ready(&mut self, ctx: &mut Context, node: ThreadId) {
        let key = ReadyKey::of(ctx, self.base.index(), node);
        extract_ready_key(&mut self.ready, key);
    }

    fn move_from_scheduled_to_ready(&mut self, ctx: &mut Context, node: ThreadId) {
        self.extract_from_scheduled(ctx, node);
        let insert = ctx.node(node, self.base.index()).queued_priority().purified();
        self.insert_ready(ctx, node, insert);
    }

    fn allocate_processor(&mut self, ctx: &mut Context, node: ThreadId, cpu: CpuIndex) {
        allocate_lazy(ctx, self.base.index(), node, cpu);
    }

    fn get_idle(&mut self, ctx: &mut Context) -> ThreadId {
        take_idle(ctx, self.base.index(), &mut self.ready)
    }

    fn release_idle(&mut self, ctx: &mut Context, idle: ThreadId) {
        let insert = ctx.node(idle, self.base.index()).queued_priority().appended();
        self.insert_ready(ctx, idle, insert);
    }

    /// The affinity must cover every processor of the instance.
    fn accepts_affinity(&self, online: ProcessorMask, affinity: ProcessorMask) -> bool {
        let _ = online;
        self.base.processors().is_subset_of(affinity)
    }

    fn ready_queues(&self) -> Vec<Vec<ThreadId>> {
        alloc::vec![self.ready.iter().map(|key| key.thread).collect()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_map_to_themselves() {
        let policy = PrioritySmp::new(SchedulerIndex::new(0), "SMP", 255);
        assert_eq!(policy.map_priority(7), PriorityControl::from_value(7));
        assert_eq!(policy.unmap_priority(PriorityControl::from_value(7).appended()), 7);
    }

    #[test]
    fn affinity_must_cover_the_instance() {
        let mut policy = PrioritySmp::new(SchedulerIndex::new(0), "SMP", 255);
        policy.base.processors = ProcessorMask::first(2);
        let online = ProcessorMask::first(4);
        assert!(policy.accepts_affinity(online, online));
        assert!(policy.accepts_affinity(online, ProcessorMask::first(2)));
        assert!(!policy.accepts_affinity(online, ProcessorMask::single(CpuIndex::new(0))));
    }

    #[test]
    fn generations_keep_fifo_and_lifo_bands() {
        let mut generations = Generations::default();
        let p = PriorityControl::from_value(3);
        assert_eq!(generations.next(p.appended()), 0);
        assert_eq!(generations.next(p.appended()), 1);
        assert_eq!(generations.next(p), -1);
        assert_eq!(generations.next(p), -2);
    }
}
