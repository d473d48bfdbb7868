//! Static system configuration.

use crate::{CpuIndex, ProcessorMask};
use alloc::vec::Vec;

/// Clock ticks a time-sliced thread may run before it yields.
pub const DEFAULT_TICKS_PER_TIMESLICE: u32 = 50;

/// Numerically largest (least important) user priority; also used by idle threads.
pub const DEFAULT_MAXIMUM_PRIORITY: u64 = 255;

/// Scheduling algorithm of one instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Algorithm {
    /// Earliest deadline first with one-processor affinity and pinning.
    EdfSmp,
    /// Fixed priority with lazy processor allocation.
    PrioritySmp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub name: &'static str,
    pub algorithm: Algorithm,
    /// Processors owned at start.
    pub processors: ProcessorMask,
    pub maximum_priority: u64,
}

impl SchedulerConfig {
    #[must_use]
    pub const fn new(name: &'static str, algorithm: Algorithm, processors: ProcessorMask) -> Self {
        Self {
            name,
            algorithm,
            processors,
            maximum_priority: DEFAULT_MAXIMUM_PRIORITY,
        }
    }

    #[must_use]
    pub const fn with_maximum_priority(mut self, maximum_priority: u64) -> Self {
        self.maximum_priority = maximum_priority;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemConfig {
    pub processor_count: usize,
    pub ticks_per_timeslice: u32,
    pub schedulers: Vec<SchedulerConfig>,
}

impl SystemConfig {
    /// One instance owning processors `0..processor_count`.
    #[must_use]
    pub fn single(algorithm: Algorithm, processor_count: usize) -> Self {
        let name = match algorithm {
            Algorithm::EdfSmp => "EDF SMP",
            Algorithm::PrioritySmp => "priority SMP",
        };
        Self {
            processor_count,
            ticks_per_timeslice: DEFAULT_TICKS_PER_TIMESLICE,
            schedulers: alloc::vec![SchedulerConfig::new(
                name,
                algorithm,
                ProcessorMask::first(processor_count),
            )],
        }
    }

    /// No instances yet; add them with [`Self::with_scheduler`].
    #[must_use]
    pub const fn partitioned(processor_count: usize) -> Self {
        Self {
            processor_count,
            ticks_per_timeslice: DEFAULT_TICKS_PER_TIMESLICE,
            schedulers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.schedulers.push(scheduler);
        self
    }

    #[must_use]
    pub const fn with_ticks_per_timeslice(mut self, ticks: u32) -> Self {
        self.ticks_per_timeslice = ticks;
        self
    }

    /// Processors `0..processor_count`.
    #[must_use]
    pub const fn online_processors(&self) -> ProcessorMask {
        ProcessorMask::first(self.processor_count)
    }

    /// Instance owning `cpu` at start.
    #[must_use]
    pub fn owner_of(&self, cpu: CpuIndex) -> Option<usize> {
        self.schedulers
            .iter()
            .position(|s| s.processors.contains(cpu))
    }
}
