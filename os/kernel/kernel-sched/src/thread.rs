use crate::{
    CpuIndex, PriorityActionKind, PriorityControl, PriorityNode, ProcessorMask, SchedulerIndex,
    SchedulerNode, ThreadId,
};
use alloc::vec::Vec;

/// Scheduler view of a thread, across all instances.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ThreadState {
    /// No node of the thread is scheduled and none wants to be.
    #[default]
    Blocked,
    /// One node of the thread owns a processor and the thread uses it.
    Scheduled,
    /// The thread is ready but no node got a processor for it.
    Ready,
}

/// Processor budget policy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CpuBudget {
    /// Runs until it blocks or is preempted.
    #[default]
    None,
    /// Yields to threads of equal priority after a time slice.
    Timeslice,
}

/// Scheduler-relevant part of a thread control block.
#[derive(Debug)]
pub struct Thread {
    id: ThreadId,
    is_idle: bool,
    /// Not blocked for any reason outside the scheduler.
    pub(crate) ready: bool,
    pub(crate) state: ThreadState,
    pub(crate) cpu: CpuIndex,
    home: SchedulerIndex,
    nodes: Vec<SchedulerNode>,
    pub(crate) helping: Vec<SchedulerIndex>,
    pub(crate) pinned: Option<(SchedulerIndex, CpuIndex)>,
    pub(crate) ask_for_help_cpu: Option<CpuIndex>,
    pub(crate) affinity: ProcessorMask,
    pub(crate) real_priority: PriorityNode,
    /// Bumped whenever the home node settles a new priority.
    pub(crate) priority_epoch: u64,
    budget: CpuBudget,
    pub(crate) budget_remaining: u32,
}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        home: SchedulerIndex,
        scheduler_count: usize,
        real_priority: PriorityNode,
        affinity: ProcessorMask,
    ) -> Self {
        Self {
            id,
            is_idle: false,
            ready: false,
            state: ThreadState::Blocked,
            cpu: CpuIndex::new(0),
            home,
            nodes: (0..scheduler_count).map(|_| SchedulerNode::new(id)).collect(),
            helping: Vec::new(),
            pinned: None,
            ask_for_help_cpu: None,
            affinity,
            real_priority,
            priority_epoch: 0,
            budget: CpuBudget::None,
            budget_remaining: 0,
        }
    }

    pub(crate) fn new_idle(
        id: ThreadId,
        home: SchedulerIndex,
        scheduler_count: usize,
        real_priority: PriorityNode,
        cpu: CpuIndex,
    ) -> Self {
        let mut thread = Self::new(
            id,
            home,
            scheduler_count,
            real_priority,
            ProcessorMask::single(cpu),
        );
        thread.is_idle = true;
        thread.ready = true;
        thread.cpu = cpu;
        thread
    }

    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }

    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.is_idle
    }

    /// Not blocked by anything outside the scheduler.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready
    }

    #[must_use]
    pub const fn state(&self) -> ThreadState {
        self.state
    }

    /// Processor the thread is assigned to or last ran on.
    #[must_use]
    pub const fn cpu(&self) -> CpuIndex {
        self.cpu
    }

    #[must_use]
    pub const fn home(&self) -> SchedulerIndex {
        self.home
    }

    /// Moves an idle thread to the instance that takes over its processor.
    pub(crate) const fn set_home(&mut self, home: SchedulerIndex) {
        self.home = home;
    }

    #[must_use]
    pub fn node(&self, scheduler: SchedulerIndex) -> Option<&SchedulerNode> {
        self.nodes.get(scheduler.get())
    }

    pub(crate) fn node_mut(&mut self, scheduler: SchedulerIndex) -> Option<&mut SchedulerNode> {
        self.nodes.get_mut(scheduler.get())
    }

    #[must_use]
    pub fn home_node(&self) -> &SchedulerNode {
        &self.nodes[self.home.get()]
    }

    /// Instances other than home where the thread may get help.
    #[must_use]
    pub fn helping(&self) -> &[SchedulerIndex] {
        &self.helping
    }

    #[must_use]
    pub fn helping_nodes(&self) -> usize {
        self.helping.len()
    }

    /// Home first, then the helping instances.
    pub fn scheduler_indices(&self) -> impl Iterator<Item = SchedulerIndex> + '_ {
        core::iter::once(self.home).chain(self.helping.iter().copied())
    }

    #[must_use]
    pub const fn pinned(&self) -> Option<CpuIndex> {
        match self.pinned {
            Some((_, cpu)) => Some(cpu),
            None => None,
        }
    }

    #[must_use]
    pub const fn affinity(&self) -> ProcessorMask {
        self.affinity
    }

    #[must_use]
    pub const fn real_priority(&self) -> &PriorityNode {
        &self.real_priority
    }

    /// Makes the real priority the first contribution of the home aggregation.
    pub(crate) fn attach_real_priority(&mut self) {
        let wait = self.nodes[self.home.get()].wait_mut();
        wait.insert(&self.real_priority);
        wait.take_action();
    }

    /// Changes the real priority in place and re-ranks it at home.
    pub(crate) fn set_real_priority(&mut self, priority: PriorityControl) -> PriorityActionKind {
        self.real_priority.set_priority(priority);
        self.nodes[self.home.get()]
            .wait_mut()
            .change(&self.real_priority)
    }

    #[must_use]
    pub const fn budget(&self) -> CpuBudget {
        self.budget
    }

    pub(crate) const fn set_budget(&mut self, budget: CpuBudget, ticks: u32) {
        self.budget = budget;
        self.budget_remaining = ticks;
    }

    /// Consumes one tick of the time slice; `true` once it is used up.
    pub(crate) const fn consume_tick(&mut self) -> bool {
        match self.budget {
            CpuBudget::None => false,
            CpuBudget::Timeslice => {
                self.budget_remaining = self.budget_remaining.saturating_sub(1);
                self.budget_remaining == 0
            }
        }
    }

    #[must_use]
    pub const fn ask_for_help_cpu(&self) -> Option<CpuIndex> {
        self.ask_for_help_cpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeslice_expires_after_budget() {
        let mut thread = Thread::new(
            ThreadId::new(1),
            SchedulerIndex::new(0),
            1,
            PriorityNode::new(PriorityControl::from_value(1)),
            ProcessorMask::first(1),
        );
        assert!(!thread.consume_tick());
        thread.set_budget(CpuBudget::Timeslice, 2);
        assert!(!thread.consume_tick());
        assert!(thread.consume_tick());
    }

    #[test]
    fn home_comes_first() {
        let mut thread = Thread::new(
            ThreadId::new(1),
            SchedulerIndex::new(1),
            3,
            PriorityNode::new(PriorityControl::from_value(1)),
            ProcessorMask::first(2),
        );
        thread.helping.push(SchedulerIndex::new(0));
        let order: Vec<_> = thread.scheduler_indices().map(SchedulerIndex::get).collect();
        assert_eq!(order, [1, 0]);
        assert_eq!(thread.helping_nodes(), 1);
        assert!(thread.node(SchedulerIndex::new(2)).is_some());
        assert!(thread.node(SchedulerIndex::new(3)).is_none());
    }

    #[test]
    fn real_priority_feeds_home_aggregation() {
        let mut thread = Thread::new(
            ThreadId::new(2),
            SchedulerIndex::new(0),
            1,
            PriorityNode::new(PriorityControl::from_value(10)),
            ProcessorMask::first(1),
        );
        thread.attach_real_priority();
        let wait = thread.home_node().wait();
        assert_eq!(wait.priority(), Some(PriorityControl::from_value(10)));
        assert_eq!(wait.pending_action(), PriorityActionKind::Invalid);

        let kind = thread.set_real_priority(PriorityControl::from_value(3));
        assert_eq!(kind, PriorityActionKind::Change);
        assert_eq!(
            thread.home_node().wait().priority(),
            Some(PriorityControl::from_value(3))
        );
    }
}
