//! Priority aggregation.
//!
//! An aggregation merges any number of [`PriorityNode`] contributions into the
//! minimum (most important) one. The aggregation is itself represented by a
//! priority node so that it can contribute to another aggregation.
//!
//! ```text
//!   real priority ─┐
//!   mutex ceiling ─┼──► PriorityAggregation ──► node() ──► (another aggregation)
//!   inherited     ─┘          │
//!                             └── pending PriorityActionKind
//! ```
//!
//! Contributors of equal priority are ranked by insertion; the earliest
//! inserted one represents the aggregation. Changing a contributor keeps its
//! rank.

use crate::PriorityControl;
use crate::error::{InternalError, fatal};
use alloc::collections::{BTreeMap, BTreeSet};
use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_PRIORITY_NODE: AtomicU64 = AtomicU64::new(1);

/// Identity of a [`PriorityNode`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriorityNodeId(u64);

/// One priority contribution.
///
/// Owned by whatever created it (a lock, a job, the thread itself); an
/// aggregation only records its identity and priority.
#[derive(Debug)]
pub struct PriorityNode {
    id: PriorityNodeId,
    priority: PriorityControl,
}

impl PriorityNode {
    #[must_use]
    pub fn new(priority: PriorityControl) -> Self {
        Self {
            id: PriorityNodeId(NEXT_PRIORITY_NODE.fetch_add(1, Ordering::Relaxed)),
            priority,
        }
    }

    #[must_use]
    pub const fn id(&self) -> PriorityNodeId {
        self.id
    }

    #[must_use]
    pub const fn priority(&self) -> PriorityControl {
        self.priority
    }

    pub const fn set_priority(&mut self, priority: PriorityControl) {
        self.priority = priority;
    }
}

/// What happened to an aggregation since its last settle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PriorityActionKind {
    /// Nothing observable.
    #[default]
    Invalid,
    /// The first contributor arrived.
    Add,
    /// The minimum changed.
    Change,
    /// The last contributor left.
    Remove,
}

impl PriorityActionKind {
    /// Collapses two consecutive actions into one.
    #[must_use]
    pub const fn merge(self, next: Self) -> Self {
        match (self, next) {
            (Self::Invalid, next) => next,
            (current, Self::Invalid) => current,
            (Self::Add, Self::Change | Self::Add) => Self::Add,
            (Self::Add, Self::Remove) => Self::Invalid,
            (Self::Remove, Self::Add | Self::Change) => Self::Change,
            (Self::Change | Self::Remove, next) => next,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Rank {
    priority: PriorityControl,
    inserted: u64,
    id: PriorityNodeId,
}

/// Minimum over a set of contributors.
#[derive(Debug)]
pub struct PriorityAggregation {
    node: PriorityNode,
    ranked: BTreeSet<Rank>,
    ranks: BTreeMap<PriorityNodeId, Rank>,
    next_insert: u64,
    action: PriorityActionKind,
}

impl Default for PriorityAggregation {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityAggregation {
    #[must_use]
    pub fn new() -> Self {
        Self {
            node: PriorityNode::new(PriorityControl::new()),
            ranked: BTreeSet::new(),
            ranks: BTreeMap::new(),
            next_insert: 0,
            action: PriorityActionKind::Invalid,
        }
    }

    /// Aggregation with one contributor and nothing pending.
    #[must_use]
    pub fn with_contributor(contributor: &PriorityNode) -> Self {
        let mut aggregation = Self::new();
        aggregation.insert(contributor);
        aggregation.action = PriorityActionKind::Invalid;
        aggregation
    }

    /// The settled minimum, or `None` without contributors.
    #[must_use]
    pub fn priority(&self) -> Option<PriorityControl> {
        (!self.ranked.is_empty()).then_some(self.node.priority)
    }

    /// The node representing this aggregation in an outer aggregation.
    #[must_use]
    pub const fn node(&self) -> &PriorityNode {
        &self.node
    }

    #[must_use]
    pub fn minimum_contributor(&self) -> Option<PriorityNodeId> {
        self.ranked.first().map(|rank| rank.id)
    }

    #[must_use]
    pub fn contains(&self, id: PriorityNodeId) -> bool {
        self.ranks.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// Contributors from most to least important.
    pub fn contributors(&self) -> impl Iterator<Item = (PriorityNodeId, PriorityControl)> + '_ {
        self.ranked.iter().map(|rank| (rank.id, rank.priority))
    }

    #[must_use]
    pub const fn pending_action(&self) -> PriorityActionKind {
        self.action
    }

    /// Clears and returns the pending action.
    pub const fn take_action(&mut self) -> PriorityActionKind {
        core::mem::replace(&mut self.action, PriorityActionKind::Invalid)
    }

    /// Adds a contributor; returns the action it caused.
    pub fn insert(&mut self, contributor: &PriorityNode) -> PriorityActionKind {
        if self.ranks.contains_key(&contributor.id) {
            fatal(InternalError::ContributorPresent);
        }

        let rank = Rank {
            priority: contributor.priority.purified(),
            inserted: self.next_insert,
            id: contributor.id,
        };
        self.next_insert += 1;

        let was_empty = self.ranked.is_empty();
        self.ranked.insert(rank);
        self.ranks.insert(contributor.id, rank);

        if was_empty {
            self.node.priority = rank.priority;
            self.record(PriorityActionKind::Add)
        } else if self.settle() {
            self.record(PriorityActionKind::Change)
        } else {
            PriorityActionKind::Invalid
        }
    }

    /// Re-ranks a contributor after its priority was changed in place.
    pub fn change(&mut self, contributor: &PriorityNode) -> PriorityActionKind {
        let Some(old) = self.ranks.get(&contributor.id).copied() else {
            fatal(InternalError::ContributorMissing);
        };

        let rank = Rank {
            priority: contributor.priority.purified(),
            ..old
        };
        self.ranked.remove(&old);
        self.ranked.insert(rank);
        self.ranks.insert(contributor.id, rank);

        if self.settle() {
            self.record(PriorityActionKind::Change)
        } else {
            PriorityActionKind::Invalid
        }
    }

    pub fn extract(&mut self, contributor: &PriorityNode) -> PriorityActionKind {
        let Some(rank) = self.ranks.remove(&contributor.id) else {
            fatal(InternalError::ContributorMissing);
        };
        self.ranked.remove(&rank);

        if self.ranked.is_empty() {
            self.record(PriorityActionKind::Remove)
        } else if self.settle() {
            self.record(PriorityActionKind::Change)
        } else {
            PriorityActionKind::Invalid
        }
    }

    fn settle(&mut self) -> bool {
        match self.ranked.first() {
            Some(min) if min.priority != self.node.priority => {
                self.node.priority = min.priority;
                true
            }
            _ => false,
        }
    }

    const fn record(&mut self, kind: PriorityActionKind) -> PriorityActionKind {
        self.action = self.action.merge(kind);
        kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prio(value: u64) -> PriorityControl {
        PriorityControl::from_value(value)
    }

    #[test]
    fn first_contributor_adds() {
        let mut agg = PriorityAggregation::new();
        let a = PriorityNode::new(prio(10));
        assert_eq!(agg.priority(), None);
        assert_eq!(agg.insert(&a), PriorityActionKind::Add);
        assert_eq!(agg.priority(), Some(prio(10)));
        assert_eq!(agg.node().priority(), prio(10));
    }

    #[test]
    fn less_important_contributor_changes_nothing() {
        let a = PriorityNode::new(prio(10));
        let b = PriorityNode::new(prio(20));
        let mut agg = PriorityAggregation::with_contributor(&a);
        assert_eq!(agg.insert(&b), PriorityActionKind::Invalid);
        assert_eq!(agg.priority(), Some(prio(10)));
        assert_eq!(agg.pending_action(), PriorityActionKind::Invalid);
        assert_eq!(agg.len(), 2);
    }

    #[test]
    fn more_important_contributor_changes_minimum() {
        let a = PriorityNode::new(prio(10));
        let b = PriorityNode::new(prio(2));
        let mut agg = PriorityAggregation::with_contributor(&a);
        assert_eq!(agg.insert(&b), PriorityActionKind::Change);
        assert_eq!(agg.priority(), Some(prio(2)));
        assert_eq!(agg.extract(&b), PriorityActionKind::Change);
        assert_eq!(agg.priority(), Some(prio(10)));
        assert_eq!(agg.take_action(), PriorityActionKind::Change);
        assert_eq!(agg.pending_action(), PriorityActionKind::Invalid);
    }

    #[test]
    fn change_in_place_reranks() {
        let mut a = PriorityNode::new(prio(10));
        let b = PriorityNode::new(prio(8));
        let mut agg = PriorityAggregation::with_contributor(&a);
        agg.insert(&b);
        a.set_priority(prio(1));
        assert_eq!(agg.change(&a), PriorityActionKind::Change);
        assert_eq!(agg.minimum_contributor(), Some(a.id()));
        a.set_priority(prio(30));
        assert_eq!(agg.change(&a), PriorityActionKind::Change);
        assert_eq!(agg.priority(), Some(prio(8)));
        assert_eq!(agg.minimum_contributor(), Some(b.id()));
    }

    #[test]
    fn last_removal_leaves_priority_unset() {
        let a = PriorityNode::new(prio(4));
        let mut agg = PriorityAggregation::with_contributor(&a);
        assert_eq!(agg.extract(&a), PriorityActionKind::Remove);
        assert_eq!(agg.priority(), None);
        assert!(agg.is_empty());
    }

    #[test]
    fn equal_contributors_are_ranked_by_insertion() {
        let first = PriorityNode::new(prio(5));
        let mut second = PriorityNode::new(prio(5));
        let top = PriorityNode::new(prio(3));
        let mut agg = PriorityAggregation::new();
        agg.insert(&first);
        agg.insert(&second);
        agg.insert(&top);
        assert_eq!(agg.minimum_contributor(), Some(top.id()));

        agg.extract(&top);
        assert_eq!(agg.minimum_contributor(), Some(first.id()));

        // A change keeps the insertion rank.
        second.set_priority(prio(5));
        agg.change(&second);
        assert_eq!(agg.minimum_contributor(), Some(first.id()));
    }

    #[test]
    fn append_flag_does_not_affect_rank() {
        let a = PriorityNode::new(prio(5).appended());
        let b = PriorityNode::new(prio(5));
        let mut agg = PriorityAggregation::new();
        agg.insert(&a);
        assert_eq!(agg.insert(&b), PriorityActionKind::Invalid);
        assert_eq!(agg.priority(), Some(prio(5)));
        assert_eq!(agg.minimum_contributor(), Some(a.id()));
    }

    #[test]
    fn merge_collapses_sequences() {
        use PriorityActionKind::{Add, Change, Invalid, Remove};
        assert_eq!(Add.merge(Change), Add);
        assert_eq!(Add.merge(Remove), Invalid);
        assert_eq!(Change.merge(Change), Change);
        assert_eq!(Change.merge(Remove), Remove);
        assert_eq!(Remove.merge(Add), Change);
        assert_eq!(Invalid.merge(Remove), Remove);
        assert_eq!(Change.merge(Invalid), Change);
    }

    #[test]
    fn aggregation_nests() {
        let a = PriorityNode::new(prio(7));
        let inner = PriorityAggregation::with_contributor(&a);
        let own = PriorityNode::new(prio(9));
        let mut outer = PriorityAggregation::with_contributor(&own);
        outer.insert(inner.node());
        assert_eq!(outer.priority(), Some(prio(7)));
        assert_eq!(outer.minimum_contributor(), Some(inner.node().id()));
    }

    #[test]
    #[should_panic(expected = "already present")]
    fn double_insert_is_fatal() {
        let a = PriorityNode::new(prio(1));
        let mut agg = PriorityAggregation::with_contributor(&a);
        agg.insert(&a);
    }
}
