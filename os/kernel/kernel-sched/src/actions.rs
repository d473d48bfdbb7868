use crate::{GroupOrder, PriorityActionKind, SchedulerIndex, ThreadId};
use alloc::vec::Vec;

/// Pending propagation of one aggregation into its scheduler node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PriorityAction {
    pub thread: ThreadId,
    pub scheduler: SchedulerIndex,
    pub kind: PriorityActionKind,
    pub group_order: GroupOrder,
}

/// Deferred priority actions.
///
/// Contribution changes only record what happened. The list is applied later
/// with [`System::apply_priority_actions`](crate::System::apply_priority_actions),
/// outside of any other scheduler instance lock. Repeated actions on the same
/// target collapse into one.
#[derive(Clone, Debug, Default)]
pub struct PriorityActions {
    actions: Vec<PriorityAction>,
}

impl PriorityActions {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    pub fn push(
        &mut self,
        thread: ThreadId,
        scheduler: SchedulerIndex,
        kind: PriorityActionKind,
        group_order: GroupOrder,
    ) {
        if kind == PriorityActionKind::Invalid {
            return;
        }

        if let Some(action) = self
            .actions
            .iter_mut()
            .find(|a| a.thread == thread && a.scheduler == scheduler)
        {
            action.kind = action.kind.merge(kind);
            action.group_order = group_order;
        } else {
            self.actions.push(PriorityAction {
                thread,
                scheduler,
                kind,
                group_order,
            });
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PriorityAction> {
        self.actions.iter()
    }

    /// Removes all entries, skipping those that collapsed to nothing.
    pub fn drain(&mut self) -> impl Iterator<Item = PriorityAction> + '_ {
        self.actions
            .drain(..)
            .filter(|a| a.kind != PriorityActionKind::Invalid)
    }
}
