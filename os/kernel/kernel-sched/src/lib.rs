//! # SMP Scheduler Core
//!
//! Priority and earliest-deadline-first scheduling for a symmetric
//! multiprocessor kernel, with priority aggregation for locking protocols.
//!
//! ## Layers
//!
//! ```text
//!  ┌───────────────────────────────────────────────────────────────┐
//!  │ System        threads, processors, validation, locking        │
//!  ├───────────────────────────────────────────────────────────────┤
//!  │ SchedulerOperations   the operation table of one instance     │
//!  │   └── SmpScheduler<P>  engine shared by all algorithms        │
//!  │         ├── EdfSmp        deadlines, affine ready queues      │
//!  │         └── PrioritySmp   fixed priorities, one ready set     │
//!  ├───────────────────────────────────────────────────────────────┤
//!  │ Context       thread arena, per-processor heir and executing   │
//!  │ SchedulerNode per thread and instance: state, priority, user   │
//!  │ PriorityAggregation   contributions merged into one minimum   │
//!  └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Priorities
//!
//! Lower values are more important. Every instance maps user priorities into
//! a [`PriorityControl`], whose lowest bit tells whether a node goes before
//! or after the nodes of equal priority. The effective priority of a thread
//! is the minimum of its contributions: its real priority, inherited or
//! ceiling priorities of locks it holds, and the deadline of a released job.
//! Contribution changes are recorded in [`PriorityActions`] and applied
//! later with [`System::apply_priority_actions`].
//!
//! ## Processors
//!
//! Each processor belongs to at most one instance. Every processor has an
//! idle thread; idle threads are ordinary nodes at the maximum priority, so a
//! processor always has an heir. A thread may hold nodes in instances other
//! than its home and be helped by them when its home has no processor for it.
//!
//! ## Example
//!
//! ```
//! use kernel_sched::{Algorithm, CpuIndex, System, SystemConfig, ThreadAttributes};
//!
//! let system = System::new(&SystemConfig::single(Algorithm::PrioritySmp, 1)).unwrap();
//! let low = system.create_thread(ThreadAttributes::new(5)).unwrap();
//! let high = system.create_thread(ThreadAttributes::new(3)).unwrap();
//! system.start_thread(low).unwrap();
//! system.start_thread(high).unwrap();
//!
//! assert_eq!(system.dispatch(CpuIndex::new(0)).unwrap(), high);
//! system.block(high).unwrap();
//! assert_eq!(system.dispatch(CpuIndex::new(0)).unwrap(), low);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod actions;
mod aggregation;
mod config;
mod context;
mod edf_smp;
mod error;
mod ids;
mod node;
mod operations;
mod priority;
mod priority_smp;
mod processor_mask;
mod smp;
mod system;
mod thread;

pub use actions::{PriorityAction, PriorityActions};
pub use aggregation::{PriorityActionKind, PriorityAggregation, PriorityNode, PriorityNodeId};
pub use config::{
    Algorithm, DEFAULT_MAXIMUM_PRIORITY, DEFAULT_TICKS_PER_TIMESLICE, SchedulerConfig,
    SystemConfig,
};
pub use context::{Context, PerCpu};
pub use edf_smp::{EDF_BACKGROUND, EdfSmp, EdfSmpScheduler};
pub use error::{InternalError, SchedulerError};
pub use ids::{CpuIndex, SchedulerIndex, ThreadId};
pub use node::{NodeState, NodeUser, ReadyQueueIndex, SchedulerNode};
pub use operations::{SchedulerOperations, SchedulerSnapshot};
pub use priority::{GroupOrder, PriorityControl};
pub use priority_smp::{PrioritySmp, PrioritySmpScheduler};
pub use processor_mask::{MAX_PROCESSORS, ProcessorMask};
pub use smp::{SmpBase, SmpPolicy, SmpScheduler};
pub use system::{System, ThreadAttributes};
pub use thread::{CpuBudget, Thread, ThreadState};
