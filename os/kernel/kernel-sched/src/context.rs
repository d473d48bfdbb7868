//! Threads and per-processor dispatch state.
//!
//! Every scheduler operation receives the [`Context`] explicitly; there are no
//! global tables. In a [`System`](crate::System) it lives behind its own lock,
//! always acquired after the instance lock.

use crate::error::{InternalError, fatal};
use crate::{
    CpuIndex, GroupOrder, PriorityActions, PriorityNode, SchedulerIndex, SchedulerNode, Thread,
    ThreadId,
};
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// Dispatch state of one processor.
#[derive(Debug, Default)]
pub struct PerCpu {
    pub(crate) scheduler: Option<SchedulerIndex>,
    pub(crate) heir: Option<ThreadId>,
    pub(crate) executing: Option<ThreadId>,
    pub(crate) dispatch_necessary: bool,
    pub(crate) help_requests: VecDeque<ThreadId>,
}

impl PerCpu {
    /// Instance owning the processor.
    #[must_use]
    pub const fn scheduler(&self) -> Option<SchedulerIndex> {
        self.scheduler
    }

    /// Thread selected to run next.
    #[must_use]
    pub const fn heir(&self) -> Option<ThreadId> {
        self.heir
    }

    #[must_use]
    pub const fn executing(&self) -> Option<ThreadId> {
        self.executing
    }

    #[must_use]
    pub const fn dispatch_necessary(&self) -> bool {
        self.dispatch_necessary
    }

    /// Threads waiting for an ask-for-help pass on this processor.
    pub fn help_requests(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.help_requests.iter().copied()
    }
}

/// Low half of a [`ThreadId`] selects the slot, the high half carries the
/// slot generation so a handle of a deleted thread never resolves again.
const SLOT_BITS: u32 = usize::BITS / 2;
const SLOT_MASK: usize = (1 << SLOT_BITS) - 1;

#[derive(Debug, Default)]
struct Slot {
    generation: usize,
    thread: Option<Thread>,
}

const fn compose(slot: usize, generation: usize) -> ThreadId {
    ThreadId::new(slot | (generation << SLOT_BITS))
}

const fn split(id: ThreadId) -> (usize, usize) {
    (id.get() & SLOT_MASK, id.get() >> SLOT_BITS)
}

#[derive(Debug)]
pub struct Context {
    slots: Vec<Slot>,
    free: Vec<usize>,
    cpus: Vec<PerCpu>,
    scheduler_count: usize,
}

impl Context {
    #[must_use]
    pub fn new(processor_count: usize, scheduler_count: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            cpus: (0..processor_count).map(|_| PerCpu::default()).collect(),
            scheduler_count,
        }
    }

    #[must_use]
    pub const fn scheduler_count(&self) -> usize {
        self.scheduler_count
    }

    #[must_use]
    pub fn processor_count(&self) -> usize {
        self.cpus.len()
    }

    pub(crate) fn insert_thread(&mut self, build: impl FnOnce(ThreadId) -> Thread) -> ThreadId {
        let slot = self.free.pop().unwrap_or_else(|| {
            self.slots.push(Slot::default());
            self.slots.len() - 1
        });
        let id = compose(slot, self.slots[slot].generation);
        self.slots[slot].thread = Some(build(id));
        id
    }

    /// Frees the slot of `id`; later lookups of `id` fail.
    pub(crate) fn remove_thread(&mut self, id: ThreadId) -> Option<Thread> {
        let (index, generation) = split(id);
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        let thread = slot.thread.take()?;
        slot.generation = (slot.generation + 1) & SLOT_MASK;
        self.free.push(index);
        Some(thread)
    }

    fn slot(&self, id: ThreadId) -> Option<&Slot> {
        let (index, generation) = split(id);
        self.slots
            .get(index)
            .filter(|slot| slot.generation == generation)
    }

    #[must_use]
    pub fn try_thread(&self, id: ThreadId) -> Option<&Thread> {
        self.slot(id).and_then(|slot| slot.thread.as_ref())
    }

    pub(crate) fn try_thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        let (index, generation) = split(id);
        self.slots
            .get_mut(index)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.thread.as_mut())
    }

    #[must_use]
    pub fn thread(&self, id: ThreadId) -> &Thread {
        self.try_thread(id)
            .unwrap_or_else(|| fatal(InternalError::MissingThread(id)))
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> &mut Thread {
        self.try_thread_mut(id)
            .unwrap_or_else(|| fatal(InternalError::MissingThread(id)))
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.slots.iter().filter_map(|slot| slot.thread.as_ref())
    }

    #[must_use]
    pub fn node(&self, thread: ThreadId, scheduler: SchedulerIndex) -> &SchedulerNode {
        self.thread(thread)
            .node(scheduler)
            .unwrap_or_else(|| fatal(InternalError::MissingNode { thread, scheduler }))
    }

    pub(crate) fn node_mut(&mut self, thread: ThreadId, scheduler: SchedulerIndex) -> &mut SchedulerNode {
        self.thread_mut(thread)
            .node_mut(scheduler)
            .unwrap_or_else(|| fatal(InternalError::MissingNode { thread, scheduler }))
    }

    #[must_use]
    pub fn cpu(&self, cpu: CpuIndex) -> &PerCpu {
        &self.cpus[cpu.get()]
    }

    pub(crate) fn cpu_mut(&mut self, cpu: CpuIndex) -> &mut PerCpu {
        &mut self.cpus[cpu.get()]
    }

    pub fn cpus(&self) -> impl Iterator<Item = (CpuIndex, &PerCpu)> {
        self.cpus
            .iter()
            .enumerate()
            .map(|(i, cpu)| (CpuIndex::new(i), cpu))
    }

    pub(crate) fn set_thread_cpu(&mut self, thread: ThreadId, cpu: CpuIndex) {
        self.thread_mut(thread).cpu = cpu;
    }

    /// Makes `heir` the next thread to run on `cpu`.
    pub(crate) fn update_heir(&mut self, cpu: CpuIndex, heir: ThreadId) {
        let per_cpu = self.cpu_mut(cpu);
        if per_cpu.heir != Some(heir) {
            log::trace!("{cpu}: heir {heir}");
            per_cpu.heir = Some(heir);
        }
        per_cpu.dispatch_necessary = true;
    }

    /// The thread runs right now (as opposed to being only the heir).
    #[must_use]
    pub fn is_executing_on_a_processor(&self, thread: ThreadId) -> bool {
        let cpu = self.thread(thread).cpu;
        self.cpu(cpu).executing == Some(thread)
    }

    /// Queues an ask-for-help pass for `thread` on the processor it last used.
    pub(crate) fn request_ask_for_help(&mut self, thread: ThreadId) {
        let cpu = {
            let thread = self.thread_mut(thread);
            if thread.ask_for_help_cpu.is_some() {
                return;
            }
            thread.ask_for_help_cpu = Some(thread.cpu);
            thread.cpu
        };
        log::trace!("{thread} asks for help on {cpu}");
        let per_cpu = self.cpu_mut(cpu);
        per_cpu.help_requests.push_back(thread);
        per_cpu.dispatch_necessary = true;
    }

    pub(crate) fn cancel_ask_for_help(&mut self, thread: ThreadId) {
        if let Some(cpu) = self.thread_mut(thread).ask_for_help_cpu.take() {
            self.cpu_mut(cpu).help_requests.retain(|&t| t != thread);
        }
    }

    pub(crate) fn take_help_request(&mut self, cpu: CpuIndex) -> Option<ThreadId> {
        let thread = self.cpu_mut(cpu).help_requests.pop_front()?;
        if let Some(t) = self.try_thread_mut(thread) {
            t.ask_for_help_cpu = None;
        }
        Some(thread)
    }

    /// Adds a contribution to the thread's home aggregation.
    pub fn priority_add(
        &mut self,
        thread: ThreadId,
        contributor: &PriorityNode,
        actions: &mut PriorityActions,
    ) {
        let home = self.thread(thread).home();
        let kind = self.node_mut(thread, home).wait_mut().insert(contributor);
        actions.push(thread, home, kind, GroupOrder::Last);
    }

    /// Re-ranks a contribution whose priority was changed in place.
    pub fn priority_change(
        &mut self,
        thread: ThreadId,
        contributor: &PriorityNode,
        order: GroupOrder,
        actions: &mut PriorityActions,
    ) {
        let home = self.thread(thread).home();
        let kind = self.node_mut(thread, home).wait_mut().change(contributor);
        actions.push(thread, home, kind, order);
    }

    pub fn priority_remove(
        &mut self,
        thread: ThreadId,
        contributor: &PriorityNode,
        actions: &mut PriorityActions,
    ) {
        let home = self.thread(thread).home();
        let kind = self.node_mut(thread, home).wait_mut().extract(contributor);
        actions.push(thread, home, kind, GroupOrder::First);
    }

    /// Whether `contributor` currently contributes to the home aggregation.
    #[must_use]
    pub fn is_contributing(&self, thread: ThreadId, contributor: &PriorityNode) -> bool {
        let home = self.thread(thread).home();
        self.node(thread, home).wait().contains(contributor.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PriorityControl, ProcessorMask};

    const HOME: SchedulerIndex = SchedulerIndex::new(0);

    fn spawn(ctx: &mut Context) -> ThreadId {
        ctx.insert_thread(|id| {
            Thread::new(
                id,
                HOME,
                1,
                PriorityNode::new(PriorityControl::from_value(5)),
                ProcessorMask::first(1),
            )
        })
    }

    #[test]
    fn deleted_slots_are_reused() {
        let mut ctx = Context::new(1, 1);
        let keep = spawn(&mut ctx);

        for _ in 0..3 {
            let id = spawn(&mut ctx);
            assert!(ctx.remove_thread(id).is_some());
        }
        assert_eq!(ctx.slots.len(), 2);
        assert_eq!(ctx.threads().count(), 1);
        assert_eq!(ctx.thread(keep).id(), keep);
    }

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut ctx = Context::new(1, 1);
        let old = spawn(&mut ctx);
        ctx.remove_thread(old);
        let new = spawn(&mut ctx);

        assert_ne!(old, new);
        assert_eq!(split(old).0, split(new).0);
        assert!(ctx.try_thread(old).is_none());
        assert!(ctx.remove_thread(old).is_none());
        assert_eq!(ctx.thread(new).id(), new);
    }
}
