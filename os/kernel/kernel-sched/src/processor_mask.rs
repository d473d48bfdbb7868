use crate::CpuIndex;
use core::fmt;

/// Width of a [`ProcessorMask`].
pub const MAX_PROCESSORS: usize = 64;

/// Set of processors, one bit per [`CpuIndex`].
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ProcessorMask(u64);

impl ProcessorMask {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Processors `0..count`.
    #[must_use]
    pub const fn first(count: usize) -> Self {
        if count >= MAX_PROCESSORS {
            Self(u64::MAX)
        } else {
            Self((1_u64 << count) - 1)
        }
    }

    #[must_use]
    pub const fn single(cpu: CpuIndex) -> Self {
        Self(1_u64 << cpu.get())
    }

    #[must_use]
    pub const fn contains(self, cpu: CpuIndex) -> bool {
        cpu.get() < MAX_PROCESSORS && self.0 & (1_u64 << cpu.get()) != 0
    }

    #[must_use]
    pub const fn with(self, cpu: CpuIndex) -> Self {
        Self(self.0 | (1_u64 << cpu.get()))
    }

    #[must_use]
    pub const fn without(self, cpu: CpuIndex) -> Self {
        Self(self.0 & !(1_u64 << cpu.get()))
    }

    pub const fn insert(&mut self, cpu: CpuIndex) {
        *self = self.with(cpu);
    }

    pub const fn remove(&mut self, cpu: CpuIndex) {
        *self = self.without(cpu);
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    #[must_use]
    pub const fn and(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub const fn or(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn is_subset_of(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Highest processor in the set.
    #[must_use]
    pub const fn last(self) -> Option<CpuIndex> {
        if self.0 == 0 {
            None
        } else {
            Some(CpuIndex::new(
                MAX_PROCESSORS - 1 - self.0.leading_zeros() as usize,
            ))
        }
    }

    /// The processor if the set holds exactly one.
    #[must_use]
    pub const fn only(self) -> Option<CpuIndex> {
        if self.0.count_ones() == 1 {
            self.last()
        } else {
            None
        }
    }

    pub fn iter(self) -> impl Iterator<Item = CpuIndex> {
        (0..MAX_PROCESSORS)
            .map(CpuIndex::new)
            .filter(move |&cpu| self.contains(cpu))
    }
}

impl FromIterator<CpuIndex> for ProcessorMask {
    fn from_iter<I: IntoIterator<Item = CpuIndex>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, Self::with)
    }
}

impl fmt::Debug for ProcessorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(CpuIndex::get)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_covers_prefix() {
        assert_eq!(ProcessorMask::first(0), ProcessorMask::EMPTY);
        assert_eq!(ProcessorMask::first(3).bits(), 0b111);
        assert_eq!(ProcessorMask::first(64).bits(), u64::MAX);
        assert_eq!(ProcessorMask::first(3).count(), 3);
    }

    #[test]
    fn last_and_only() {
        let mask: ProcessorMask = [CpuIndex::new(1), CpuIndex::new(5)].into_iter().collect();
        assert_eq!(mask.last(), Some(CpuIndex::new(5)));
        assert_eq!(mask.only(), None);
        assert_eq!(
            ProcessorMask::single(CpuIndex::new(7)).only(),
            Some(CpuIndex::new(7))
        );
        assert_eq!(ProcessorMask::EMPTY.last(), None);
    }

    #[test]
    fn subset_and_intersection() {
        let all = ProcessorMask::first(4);
        let one = ProcessorMask::single(CpuIndex::new(2));
        assert!(one.is_subset_of(all));
        assert!(!all.is_subset_of(one));
        assert!(all.intersects(one));
        assert_eq!(all.without(CpuIndex::new(2)).and(one), ProcessorMask::EMPTY);
        assert!(!all.contains(CpuIndex::new(70)));
    }

    #[test]
    fn iterates_in_ascending_order() {
        let mask = ProcessorMask::from_bits(0b1010_0001);
        let cpus: Vec<_> = mask.iter().map(CpuIndex::get).collect();
        assert_eq!(cpus, [0, 5, 7]);
    }
}
