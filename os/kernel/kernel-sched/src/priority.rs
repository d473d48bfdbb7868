//! Priority control values.
//!
//! A [`PriorityControl`] is the mapped, scheduler-internal form of a priority.
//! Lower values are more important. Bit 0 selects where a node goes among
//! nodes of equal priority:
//!
//! ```text
//!   63                                                   1   0
//!  ┌──────────────────────────────────────────────────────┬───┐
//!  │ value: mapped priority or job deadline               │ A │
//!  └──────────────────────────────────────────────────────┴───┘
//!                                            A = 1: append (FIFO)
//!                                            A = 0: prepend (LIFO)
//! ```
//!
//! Comparing the raw bits therefore orders an appending insert after every
//! node of the same value, and a prepending insert before them.

use bitfield_struct::bitfield;
use core::cmp::Ordering;

/// Mapped priority plus the append flag.
#[bitfield(u64, order = Lsb)]
#[derive(PartialEq, Eq, Hash)]
pub struct PriorityControl {
    /// Insert after (FIFO) instead of before (LIFO) nodes of equal value.
    pub append: bool,
    /// The mapped priority.
    #[bits(63)]
    pub value: u64,
}

impl PriorityControl {
    /// Largest representable mapped value.
    pub const VALUE_MAX: u64 = (1 << 63) - 1;

    #[must_use]
    pub const fn from_value(value: u64) -> Self {
        Self::new().with_value(value)
    }

    /// Same value with the append flag set.
    #[must_use]
    pub const fn appended(self) -> Self {
        self.with_append(true)
    }

    /// Same value with the append flag cleared.
    #[must_use]
    pub const fn purified(self) -> Self {
        self.with_append(false)
    }

    #[must_use]
    pub const fn with_group_order(self, order: GroupOrder) -> Self {
        match order {
            GroupOrder::First => self.purified(),
            GroupOrder::Last => self.appended(),
        }
    }

    #[must_use]
    pub const fn group_order(self) -> GroupOrder {
        if self.append() {
            GroupOrder::Last
        } else {
            GroupOrder::First
        }
    }

    /// Strictly more important, ignoring the append flag.
    #[must_use]
    pub const fn is_higher_than(self, other: Self) -> bool {
        self.value() < other.value()
    }
}

impl PartialOrd for PriorityControl {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityControl {
    fn cmp(&self, other: &Self) -> Ordering {
        self.into_bits().cmp(&other.into_bits())
    }
}

/// Placement of a node among nodes of equal priority.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum GroupOrder {
    /// Prepend: before all nodes of equal priority.
    First,
    /// Append: after all nodes of equal priority.
    #[default]
    Last,
}
