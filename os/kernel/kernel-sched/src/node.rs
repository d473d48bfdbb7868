//! Per-thread, per-instance scheduler state.

use crate::{GroupOrder, PriorityAggregation, PriorityControl, ThreadId};
use kernel_sync::SeqLock;

/// Life cycle state of a [`SchedulerNode`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Not initialized for its instance.
    #[default]
    Unused,
    /// Neither scheduled nor in a ready queue.
    Blocked,
    /// Owns a processor of its instance.
    Scheduled,
    /// Waits in a ready queue.
    Ready,
}

/// Which thread consumes the processor time a node was granted.
///
/// A node is normally used by its owner. While the owner cannot execute but
/// the node must stay scheduled (it holds a sticky resource), an idle thread
/// borrows the node and keeps the processor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeUser {
    Owned(ThreadId),
    Borrowed { owner: ThreadId, helper: ThreadId },
}

impl NodeUser {
    #[must_use]
    pub const fn owner(self) -> ThreadId {
        match self {
            Self::Owned(owner) | Self::Borrowed { owner, .. } => owner,
        }
    }

    #[must_use]
    pub const fn user(self) -> ThreadId {
        match self {
            Self::Owned(owner) => owner,
            Self::Borrowed { helper, .. } => helper,
        }
    }

    #[must_use]
    pub const fn helper(self) -> Option<ThreadId> {
        match self {
            Self::Owned(_) => None,
            Self::Borrowed { helper, .. } => Some(helper),
        }
    }
}

/// Ready queue selection of a node.
///
/// `ready` is the queue the node is filed in: `0` admits every processor,
/// `k` admits processor `k - 1` only. It equals `pinning` while that is
/// non-zero and `affinity` otherwise.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ReadyQueueIndex {
    pub ready: usize,
    pub affinity: usize,
    pub pinning: usize,
}

#[derive(Debug)]
pub struct SchedulerNode {
    user: NodeUser,
    sticky_level: u32,
    priority: SeqLock<PriorityControl>,
    wait: PriorityAggregation,
    pub(crate) state: NodeState,
    /// Purified priority the node is currently filed with.
    pub(crate) queued_priority: PriorityControl,
    pub(crate) generation: i64,
    pub(crate) queue_index: ReadyQueueIndex,
}

impl SchedulerNode {
    #[must_use]
    pub fn new(owner: ThreadId) -> Self {
        Self {
            user: NodeUser::Owned(owner),
            sticky_level: 0,
            priority: SeqLock::new(PriorityControl::new()),
            wait: PriorityAggregation::new(),
            state: NodeState::Unused,
            queued_priority: PriorityControl::new(),
            generation: 0,
            queue_index: ReadyQueueIndex::default(),
        }
    }

    /// Resets the scheduling state for a fresh start on an instance.
    ///
    /// The wait aggregation is left alone; its contributors belong to others.
    pub fn initialize(&mut self, owner: ThreadId, priority: PriorityControl) {
        self.user = NodeUser::Owned(owner);
        self.sticky_level = 0;
        *self.priority.get_mut() = priority;
        self.state = NodeState::Blocked;
        self.queued_priority = priority.purified();
        self.generation = 0;
        self.queue_index = ReadyQueueIndex::default();
    }

    /// Marks the node as no longer belonging to its instance.
    pub(crate) const fn retire(&mut self) {
        self.state = NodeState::Unused;
        self.sticky_level = 0;
        self.user = NodeUser::Owned(self.user.owner());
    }

    #[must_use]
    pub const fn owner(&self) -> ThreadId {
        self.user.owner()
    }

    /// The thread currently consuming this node's processor time.
    #[must_use]
    pub const fn user(&self) -> ThreadId {
        self.user.user()
    }

    #[must_use]
    pub const fn node_user(&self) -> NodeUser {
        self.user
    }

    pub(crate) const fn set_user(&mut self, thread: ThreadId) {
        let owner = self.user.owner();
        self.user = if thread.get() == owner.get() {
            NodeUser::Owned(owner)
        } else {
            NodeUser::Borrowed {
                owner,
                helper: thread,
            }
        };
    }

    /// Idle thread substituting for the owner.
    #[must_use]
    pub const fn idle(&self) -> Option<ThreadId> {
        self.user.helper()
    }

    /// Current priority, including the append flag.
    ///
    /// Safe against a concurrent [`Self::set_priority`].
    #[must_use]
    pub fn priority(&self) -> PriorityControl {
        self.priority.read()
    }

    pub fn set_priority(&self, priority: PriorityControl, order: GroupOrder) {
        self.priority.write(priority.with_group_order(order));
    }

    #[must_use]
    pub const fn sticky_level(&self) -> u32 {
        self.sticky_level
    }

    pub(crate) const fn increment_sticky_level(&mut self) {
        self.sticky_level += 1;
    }

    pub(crate) fn decrement_sticky_level(&mut self) -> u32 {
        debug_assert!(self.sticky_level > 0, "sticky level underflow");
        self.sticky_level = self.sticky_level.saturating_sub(1);
        self.sticky_level
    }

    #[must_use]
    pub const fn wait(&self) -> &PriorityAggregation {
        &self.wait
    }

    pub const fn wait_mut(&mut self) -> &mut PriorityAggregation {
        &mut self.wait
    }

    #[must_use]
    pub const fn state(&self) -> NodeState {
        self.state
    }

    #[must_use]
    pub const fn queued_priority(&self) -> PriorityControl {
        self.queued_priority
    }

    #[must_use]
    pub const fn generation(&self) -> i64 {
        self.generation
    }

    #[must_use]
    pub const fn queue_index(&self) -> ReadyQueueIndex {
        self.queue_index
    }
}
