//! The operation table every scheduling algorithm provides.

use crate::error::InternalError;
use crate::{
    Context, CpuBudget, CpuIndex, NodeState, PriorityActions, PriorityControl, PriorityNode,
    ProcessorMask, SchedulerIndex, ThreadId, ThreadState,
};
use alloc::vec::Vec;

/// Operations of one scheduler instance.
///
/// Node arguments are implied: an operation on `thread` acts on the thread's
/// node in this instance. All operations run under the instance lock and are
/// total over valid input; requests that cannot be honored are rejected by
/// [`System`](crate::System) beforehand.
pub trait SchedulerOperations: Send {
    fn name(&self) -> &'static str;

    fn index(&self) -> SchedulerIndex;

    /// Processors currently owned.
    fn processors(&self) -> ProcessorMask;

    /// Largest user priority; idle threads run at this priority.
    fn maximum_priority(&self) -> u64;

    fn map_priority(&self, priority: u64) -> PriorityControl;

    fn unmap_priority(&self, priority: PriorityControl) -> u64;

    /// Prepares the node of `thread` for this instance; the node starts blocked.
    fn node_initialize(&mut self, ctx: &mut Context, thread: ThreadId, priority: PriorityControl);

    fn block(&mut self, ctx: &mut Context, thread: ThreadId);

    fn unblock(&mut self, ctx: &mut Context, thread: ThreadId);

    /// Refiles the node after its priority was written.
    fn update_priority(&mut self, ctx: &mut Context, thread: ThreadId);

    /// Moves the node behind all nodes of equal priority.
    fn yield_thread(&mut self, ctx: &mut Context, thread: ThreadId);

    /// Offers the ready `thread` a processor of this instance.
    ///
    /// Returns `true` if the thread got one, or if asking elsewhere is pointless.
    fn ask_for_help(&mut self, ctx: &mut Context, thread: ThreadId) -> bool;

    /// Drops a ready node the thread no longer needs because it is scheduled
    /// through another instance.
    fn reconsider_help_request(&mut self, ctx: &mut Context, thread: ThreadId);

    /// Removes the node from this instance, leaving the thread in `next_state`
    /// if the node was scheduled.
    fn withdraw_node(&mut self, ctx: &mut Context, thread: ThreadId, next_state: ThreadState);

    /// The node's sticky level was raised.
    fn make_sticky(&mut self, ctx: &mut Context, thread: ThreadId);

    /// The node's sticky level was lowered.
    fn clean_sticky(&mut self, ctx: &mut Context, thread: ThreadId);

    /// Restricts the blocked node to `cpu`.
    fn pin(&mut self, ctx: &mut Context, thread: ThreadId, cpu: CpuIndex);

    fn unpin(&mut self, ctx: &mut Context, thread: ThreadId, cpu: CpuIndex);

    /// Installs the idle thread of `cpu` during system start.
    fn start_idle(&mut self, ctx: &mut Context, idle: ThreadId, cpu: CpuIndex);

    /// Takes over the processor of `idle`.
    fn add_processor(&mut self, ctx: &mut Context, idle: ThreadId);

    /// Gives up `cpu`; returns the idle thread that leaves with it.
    fn remove_processor(&mut self, ctx: &mut Context, cpu: CpuIndex) -> ThreadId;

    /// Whether `affinity` can be represented for threads of this instance.
    fn accepts_affinity(&self, online: ProcessorMask, affinity: ProcessorMask) -> bool;

    fn set_affinity(
        &mut self,
        ctx: &mut Context,
        thread: ThreadId,
        online: ProcessorMask,
        affinity: ProcessorMask,
    );

    /// Turns the job node into a deadline contribution.
    fn release_job(
        &self,
        ctx: &mut Context,
        thread: ThreadId,
        job: &mut PriorityNode,
        deadline: u64,
        actions: &mut PriorityActions,
    ) {
        let _ = (ctx, thread, job, deadline, actions);
    }

    /// Withdraws the deadline contribution of the job node.
    fn cancel_job(
        &self,
        ctx: &mut Context,
        thread: ThreadId,
        job: &PriorityNode,
        actions: &mut PriorityActions,
    ) {
        let _ = (ctx, thread, job, actions);
    }

    /// Clock tick on the processor executing `executing`.
    fn tick(&mut self, ctx: &mut Context, executing: ThreadId, ticks_per_timeslice: u32) {
        let thread = ctx.thread_mut(executing);
        if thread.is_idle() || !thread.is_ready() || thread.budget() != CpuBudget::Timeslice {
            return;
        }

        if thread.consume_tick() {
            thread.budget_remaining = ticks_per_timeslice;
            log::trace!("{executing}: time slice expired");
            self.yield_thread(ctx, executing);
        }
    }

    fn snapshot(&self, ctx: &Context) -> SchedulerSnapshot;

    /// Checks that no processor runs a node less important than a ready node
    /// it could run instead.
    fn check_invariants(&self, ctx: &Context) -> Result<(), InternalError>;
}

/// Observable state of one instance, without generation counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub processors: ProcessorMask,
    /// Real thread scheduled per owned processor; `None` for an idle thread.
    pub scheduled: Vec<(CpuIndex, Option<ThreadId>)>,
    /// Real threads per ready queue, most important first.
    pub ready: Vec<Vec<ThreadId>>,
    /// Idle threads waiting in the ready set.
    pub ready_idle: usize,
    /// State and ready queue index of every real thread's node.
    pub nodes: Vec<(ThreadId, NodeState, usize)>,
}
