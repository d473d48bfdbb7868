use crate::{CpuIndex, SchedulerIndex, ThreadId};

/// Requests rejected by [`System`](crate::System) before they reach a scheduler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("no such thread: {0}")]
    InvalidThread(ThreadId),
    #[error("no such scheduler instance: {0}")]
    InvalidScheduler(SchedulerIndex),
    #[error("no such processor: {0}")]
    InvalidProcessor(CpuIndex),
    #[error("{cpu} is already owned by {owner}")]
    ProcessorOwned { cpu: CpuIndex, owner: SchedulerIndex },
    #[error("{cpu} is not owned by {scheduler}")]
    ProcessorNotOwned {
        cpu: CpuIndex,
        scheduler: SchedulerIndex,
    },
    #[error("{0} is still required by a thread")]
    ProcessorInUse(CpuIndex),
    #[error("too many processors: {0}")]
    TooManyProcessors(usize),
    #[error("priority {priority} exceeds the maximum {maximum}")]
    InvalidPriority { priority: u64, maximum: u64 },
    #[error("processor affinity not supported by the scheduler")]
    InvalidAffinity,
    #[error("{0} is an idle thread")]
    IdleThread(ThreadId),
    #[error("operation not allowed in the current thread state")]
    IncorrectState,
}

/// Corrupted scheduler state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InternalError {
    #[error("{0} does not exist")]
    MissingThread(ThreadId),
    #[error("{thread} has no node in {scheduler}")]
    MissingNode {
        thread: ThreadId,
        scheduler: SchedulerIndex,
    },
    #[error("{0} is already queued")]
    AlreadyQueued(ThreadId),
    #[error("{0} is not queued")]
    NotQueued(ThreadId),
    #[error("ready set of {0} has no idle node")]
    NoIdleNode(SchedulerIndex),
    #[error("{0} has no scheduled node")]
    NoScheduledNode(CpuIndex),
    #[error("priority contributor is already present")]
    ContributorPresent,
    #[error("priority contributor is missing")]
    ContributorMissing,
    #[error("{thread} on {cpu} is less important than a ready node it can see")]
    VisibilityViolated { cpu: CpuIndex, thread: ThreadId },
}

/// Fatal error path for corrupted scheduler state; never returns.
#[cold]
#[track_caller]
pub(crate) fn fatal(error: InternalError) -> ! {
    log::error!("scheduler fatal error: {error}");
    panic!("scheduler fatal error: {error}");
}
