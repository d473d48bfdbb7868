//! Index newtypes for threads, processors and scheduler instances.

use core::fmt;

macro_rules! index_newtype {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(index: usize) -> Self {
                Self(index)
            }

            #[inline]
            #[must_use]
            pub const fn get(self) -> usize {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(index: usize) -> Self {
                Self(index)
            }
        }
    };
}

index_newtype!(
    /// Handle of a thread control block in the [`Context`](crate::Context) arena.
    ThreadId,
    "thread#"
);

index_newtype!(
    /// Processor index, `0..processor_count`.
    CpuIndex,
    "cpu"
);

index_newtype!(
    /// Position of a scheduler instance in the system configuration.
    SchedulerIndex,
    "sched"
);
