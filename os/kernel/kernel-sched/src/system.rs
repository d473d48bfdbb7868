//! The thread and processor layer on top of the scheduler instances.
//!
//! [`System`] owns every scheduler instance and the [`Context`]. It validates
//! requests, turns them into scheduler operations and takes the locks:
//!
//! ```text
//!   System
//!    ├── schedulers[0]: TicketMutex<Box<dyn SchedulerOperations>> ─┐
//!    ├── schedulers[1]: TicketMutex<Box<dyn SchedulerOperations>> ─┼─► context: TicketMutex<Context>
//!    └── ...                                                       ─┘
//! ```
//!
//! An instance lock is always taken before the context lock, and at most one
//! instance lock is held at a time. Work spanning several instances (priority
//! propagation to helping nodes, help requests) visits them one after the other.
//!
//! Node priorities live in a [`SeqLock`](kernel_sync::SeqLock), yet every
//! access made through [`System`] already holds the context lock, so the
//! lock-free read path is not taken here. It serves callers that read a
//! node's priority without the context lock.

use crate::edf_smp::{EDF_BACKGROUND, EdfSmp, EdfSmpScheduler};
use crate::error::{InternalError, SchedulerError, fatal};
use crate::operations::{SchedulerOperations, SchedulerSnapshot};
use crate::priority_smp::{PrioritySmp, PrioritySmpScheduler};
use crate::{
    Algorithm, Context, CpuBudget, CpuIndex, GroupOrder, MAX_PROCESSORS, NodeState, PriorityAction,
    PriorityActions, PriorityControl, PriorityNode, ProcessorMask, SchedulerIndex, SystemConfig,
    Thread, ThreadId, ThreadState,
};
use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_sync::TicketMutex;

type Instance = TicketMutex<Box<dyn SchedulerOperations>>;

/// Scheduling attributes of a new thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ThreadAttributes {
    /// Home scheduler instance.
    pub scheduler: SchedulerIndex,
    /// Real priority, in the numbering of the home instance.
    pub priority: u64,
    pub budget: CpuBudget,
}

impl ThreadAttributes {
    #[must_use]
    pub const fn new(priority: u64) -> Self {
        Self {
            scheduler: SchedulerIndex::new(0),
            priority,
            budget: CpuBudget::None,
        }
    }

    #[must_use]
    pub const fn with_scheduler(mut self, scheduler: SchedulerIndex) -> Self {
        self.scheduler = scheduler;
        self
    }

    #[must_use]
    pub const fn with_budget(mut self, budget: CpuBudget) -> Self {
        self.budget = budget;
        self
    }
}

pub struct System {
    schedulers: Vec<Instance>,
    context: TicketMutex<Context>,
    online: ProcessorMask,
    ticks_per_timeslice: u32,
}

impl core::fmt::Debug for System {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("System")
            .field("schedulers", &self.schedulers.len())
            .field("online", &self.online)
            .field("ticks_per_timeslice", &self.ticks_per_timeslice)
            .finish_non_exhaustive()
    }
}

/// The thread must exist and must not be an idle thread.
fn user_thread(ctx: &Context, thread: ThreadId) -> Result<&Thread, SchedulerError> {
    let t = ctx
        .try_thread(thread)
        .ok_or(SchedulerError::InvalidThread(thread))?;
    if t.is_idle() {
        return Err(SchedulerError::IdleThread(thread));
    }
    Ok(t)
}

fn check_priority(scheduler: &dyn SchedulerOperations, priority: u64) -> Result<(), SchedulerError> {
    let maximum = scheduler.maximum_priority();
    if priority >= maximum {
        return Err(SchedulerError::InvalidPriority {
            priority,
            maximum: maximum - 1,
        });
    }
    Ok(())
}

impl System {
    /// Builds the instances of `config` and starts an idle thread on every
    /// processor.
    ///
    /// # Errors
    /// Rejects configurations with no or too many processors, processors
    /// outside the system, processors owned twice, instances without
    /// processors and maximum priorities beyond the priority range.
    pub fn new(config: &SystemConfig) -> Result<Self, SchedulerError> {
        let processor_count = config.processor_count;
        if processor_count > MAX_PROCESSORS {
            return Err(SchedulerError::TooManyProcessors(processor_count));
        }
        if processor_count == 0 {
            return Err(SchedulerError::InvalidProcessor(CpuIndex::new(0)));
        }
        if config.schedulers.is_empty() {
            return Err(SchedulerError::InvalidScheduler(SchedulerIndex::new(0)));
        }

        let online = config.online_processors();
        let scheduler_count = config.schedulers.len();
        let mut owned = ProcessorMask::EMPTY;
        let mut instances: Vec<Box<dyn SchedulerOperations>> = Vec::with_capacity(scheduler_count);

        for (i, scheduler) in config.schedulers.iter().enumerate() {
            let index = SchedulerIndex::new(i);
            if let Some(cpu) = scheduler.processors.iter().find(|&cpu| !online.contains(cpu)) {
                return Err(SchedulerError::InvalidProcessor(cpu));
            }
            if let Some(cpu) = scheduler.processors.and(owned).iter().next() {
                let owner = config.owner_of(cpu).map_or(index, SchedulerIndex::new);
                return Err(SchedulerError::ProcessorOwned { cpu, owner });
            }
            if scheduler.processors.is_empty() {
                return Err(SchedulerError::InvalidScheduler(index));
            }
            if scheduler.maximum_priority == 0 || scheduler.maximum_priority >= EDF_BACKGROUND {
                return Err(SchedulerError::InvalidPriority {
                    priority: scheduler.maximum_priority,
                    maximum: EDF_BACKGROUND - 1,
                });
            }
            owned = owned.or(scheduler.processors);

            let name = scheduler.name;
            let maximum = scheduler.maximum_priority;
            let instance: Box<dyn SchedulerOperations> = match scheduler.algorithm {
                Algorithm::EdfSmp => Box::new(EdfSmpScheduler::new(EdfSmp::new(
                    index,
                    name,
                    maximum,
                    processor_count,
                ))),
                Algorithm::PrioritySmp => {
                    Box::new(PrioritySmpScheduler::new(PrioritySmp::new(index, name, maximum)))
                }
            };
            instances.push(instance);
        }

        let mut ctx = Context::new(processor_count, scheduler_count);
        for cpu in online.iter() {
            if let Some(owner) = config.owner_of(cpu) {
                let index = SchedulerIndex::new(owner);
                let scheduler = &mut instances[owner];
                let priority = scheduler
                    .map_priority(scheduler.maximum_priority())
                    .appended();
                let idle = ctx.insert_thread(|id| {
                    Thread::new_idle(id, index, scheduler_count, PriorityNode::new(priority), cpu)
                });
                scheduler.node_initialize(&mut ctx, idle, priority);
                ctx.cpu_mut(cpu).scheduler = Some(index);
                scheduler.start_idle(&mut ctx, idle, cpu);
            } else {
                let idle = ctx.insert_thread(|id| {
                    Thread::new_idle(
                        id,
                        SchedulerIndex::new(0),
                        scheduler_count,
                        PriorityNode::new(PriorityControl::new()),
                        cpu,
                    )
                });
                ctx.cpu_mut(cpu).heir = Some(idle);
            }

            let per_cpu = ctx.cpu_mut(cpu);
            per_cpu.executing = per_cpu.heir;
            per_cpu.dispatch_necessary = false;
        }

        log::debug!(
            "scheduler system with {processor_count} processors and {scheduler_count} instances"
        );

        Ok(Self {
            schedulers: instances.into_iter().map(TicketMutex::new).collect(),
            context: TicketMutex::new(ctx),
            online,
            ticks_per_timeslice: config.ticks_per_timeslice,
        })
    }

    #[must_use]
    pub const fn online_processors(&self) -> ProcessorMask {
        self.online
    }

    #[must_use]
    pub fn scheduler_count(&self) -> usize {
        self.schedulers.len()
    }

    fn instance(&self, index: SchedulerIndex) -> Result<&Instance, SchedulerError> {
        self.schedulers
            .get(index.get())
            .ok_or(SchedulerError::InvalidScheduler(index))
    }

    fn check_processor(&self, cpu: CpuIndex) -> Result<(), SchedulerError> {
        if self.online.contains(cpu) {
            Ok(())
        } else {
            Err(SchedulerError::InvalidProcessor(cpu))
        }
    }

    /// Runs `f` under the lock of instance `index` and the context lock.
    fn locked<U>(
        &self,
        index: SchedulerIndex,
        f: impl FnOnce(&mut dyn SchedulerOperations, &mut Context) -> U,
    ) -> Result<U, SchedulerError> {
        let mut scheduler = self.instance(index)?.lock();
        let mut ctx = self.context.lock();
        Ok(f(&mut **scheduler, &mut ctx))
    }

    fn home_of(&self, thread: ThreadId) -> Result<SchedulerIndex, SchedulerError> {
        let ctx = self.context.lock();
        user_thread(&ctx, thread).map(Thread::home)
    }

    /// Runs `f` under the locks of the home instance of the user `thread`.
    fn with_home<U>(
        &self,
        thread: ThreadId,
        f: impl FnOnce(&mut dyn SchedulerOperations, &mut Context) -> Result<U, SchedulerError>,
    ) -> Result<U, SchedulerError> {
        let home = self.home_of(thread)?;
        self.locked(home, |scheduler, ctx| {
            user_thread(ctx, thread)?;
            f(scheduler, ctx)
        })?
    }

    /// Creates a blocked thread.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidScheduler`] for an unknown home instance,
    /// [`SchedulerError::InvalidPriority`] unless the priority is below the
    /// instance maximum.
    pub fn create_thread(&self, attributes: ThreadAttributes) -> Result<ThreadId, SchedulerError> {
        let home = attributes.scheduler;
        let online = self.online;
        let ticks = self.ticks_per_timeslice;

        self.locked(home, |scheduler, ctx| {
            check_priority(scheduler, attributes.priority)?;
            let priority = scheduler.map_priority(attributes.priority);
            let scheduler_count = ctx.scheduler_count();
            let id = ctx.insert_thread(|id| {
                Thread::new(id, home, scheduler_count, PriorityNode::new(priority), online)
            });
            scheduler.node_initialize(ctx, id, priority);

            let thread = ctx.thread_mut(id);
            thread.attach_real_priority();
            thread.set_budget(attributes.budget, ticks);
            log::debug!(
                "{id}: created on {} with priority {}",
                scheduler.name(),
                attributes.priority
            );
            Ok(id)
        })?
    }

    /// Makes a created thread ready for the first time.
    ///
    /// # Errors
    /// [`SchedulerError::IncorrectState`] if the thread is already ready.
    pub fn start_thread(&self, thread: ThreadId) -> Result<(), SchedulerError> {
        self.with_home(thread, |scheduler, ctx| {
            if ctx.thread(thread).is_ready() {
                return Err(SchedulerError::IncorrectState);
            }
            ctx.thread_mut(thread).ready = true;
            scheduler.unblock(ctx, thread);
            log::debug!("{thread}: started");
            Ok(())
        })
    }

    /// Blocks and removes the thread.
    ///
    /// # Errors
    /// [`SchedulerError::IncorrectState`] while the thread holds a sticky
    /// resource.
    pub fn delete_thread(&self, thread: ThreadId) -> Result<(), SchedulerError> {
        let home = self.home_of(thread)?;
        {
            let ctx = self.context.lock();
            let t = user_thread(&ctx, thread)?;
            let sticky = t.home_node().sticky_level() > u32::from(t.is_ready())
                || t.helping()
                    .iter()
                    .filter_map(|&index| t.node(index))
                    .any(|node| node.sticky_level() > 0);
            if sticky {
                return Err(SchedulerError::IncorrectState);
            }
        }

        self.block(thread)?;

        let helping = self.context.lock().thread(thread).helping().to_vec();
        for index in helping {
            self.locked(index, |_, ctx| {
                ctx.node_mut(thread, index).retire();
            })?;
        }

        self.locked(home, |_, ctx| {
            ctx.cancel_ask_for_help(thread);
            ctx.node_mut(thread, home).retire();
            ctx.remove_thread(thread);
        })?;
        log::debug!("{thread}: deleted");
        Ok(())
    }

    /// Blocks the thread for a reason outside the scheduler.
    ///
    /// Blocking a blocked thread does nothing.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidThread`] or [`SchedulerError::IdleThread`].
    pub fn block(&self, thread: ThreadId) -> Result<(), SchedulerError> {
        let helping = self.with_home(thread, |scheduler, ctx| {
            if !ctx.thread(thread).is_ready() {
                return Ok(Vec::new());
            }
            ctx.thread_mut(thread).ready = false;
            scheduler.block(ctx, thread);
            log::debug!("{thread}: blocked");
            Ok(ctx.thread(thread).helping().to_vec())
        })?;

        for index in helping {
            self.locked(index, |scheduler, ctx| {
                if ctx.try_thread(thread).is_some_and(|t| !t.is_ready()) {
                    scheduler.withdraw_node(ctx, thread, ThreadState::Blocked);
                }
            })?;
        }
        Ok(())
    }

    /// Unblocks the thread; unblocking a ready thread does nothing.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidThread`] or [`SchedulerError::IdleThread`].
    pub fn unblock(&self, thread: ThreadId) -> Result<(), SchedulerError> {
        self.with_home(thread, |scheduler, ctx| {
            if ctx.thread(thread).is_ready() {
                return Ok(());
            }
            ctx.thread_mut(thread).ready = true;
            scheduler.unblock(ctx, thread);
            log::debug!("{thread}: unblocked");
            Ok(())
        })
    }

    /// Moves the thread behind the other threads of its priority.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidThread`] or [`SchedulerError::IdleThread`].
    pub fn yield_thread(&self, thread: ThreadId) -> Result<(), SchedulerError> {
        self.with_home(thread, |scheduler, ctx| {
            if ctx.thread(thread).is_ready() {
                scheduler.yield_thread(ctx, thread);
            }
            Ok(())
        })
    }

    /// Changes the real priority; returns the previous one.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidPriority`] unless the priority is below the
    /// maximum of the home instance.
    pub fn set_priority(&self, thread: ThreadId, priority: u64) -> Result<u64, SchedulerError> {
        let mut actions = PriorityActions::new();
        let previous = self.with_home(thread, |scheduler, ctx| {
            check_priority(scheduler, priority)?;
            let home = scheduler.index();
            let t = ctx.thread_mut(thread);
            let previous = scheduler.unmap_priority(t.real_priority().priority());
            let kind = t.set_real_priority(scheduler.map_priority(priority));
            actions.push(thread, home, kind, GroupOrder::Last);
            Ok(previous)
        })?;
        self.apply_priority_actions(&mut actions);
        log::debug!("{thread}: real priority {previous} -> {priority}");
        Ok(previous)
    }

    /// Maps a priority of instance `scheduler` for use in a [`PriorityNode`].
    ///
    /// # Errors
    /// [`SchedulerError::InvalidScheduler`] or [`SchedulerError::InvalidPriority`].
    pub fn map_priority(
        &self,
        scheduler: SchedulerIndex,
        priority: u64,
    ) -> Result<PriorityControl, SchedulerError> {
        let instance = self.instance(scheduler)?.lock();
        check_priority(&**instance, priority)?;
        Ok(instance.map_priority(priority))
    }

    /// Adds a contribution to the thread's priority.
    ///
    /// Takes effect with [`Self::apply_priority_actions`].
    ///
    /// # Errors
    /// [`SchedulerError::InvalidThread`] or [`SchedulerError::IdleThread`].
    pub fn priority_add(
        &self,
        thread: ThreadId,
        contributor: &PriorityNode,
        actions: &mut PriorityActions,
    ) -> Result<(), SchedulerError> {
        let mut ctx = self.context.lock();
        user_thread(&ctx, thread)?;
        ctx.priority_add(thread, contributor, actions);
        Ok(())
    }

    /// Re-ranks a contribution after its priority was changed.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidThread`] or [`SchedulerError::IdleThread`].
    pub fn priority_change(
        &self,
        thread: ThreadId,
        contributor: &PriorityNode,
        order: GroupOrder,
        actions: &mut PriorityActions,
    ) -> Result<(), SchedulerError> {
        let mut ctx = self.context.lock();
        user_thread(&ctx, thread)?;
        ctx.priority_change(thread, contributor, order, actions);
        Ok(())
    }

    /// # Errors
    /// [`SchedulerError::InvalidThread`] or [`SchedulerError::IdleThread`].
    pub fn priority_remove(
        &self,
        thread: ThreadId,
        contributor: &PriorityNode,
        actions: &mut PriorityActions,
    ) -> Result<(), SchedulerError> {
        let mut ctx = self.context.lock();
        user_thread(&ctx, thread)?;
        ctx.priority_remove(thread, contributor, actions);
        Ok(())
    }

    /// Propagates recorded contribution changes into the scheduler nodes.
    ///
    /// For every target the settled aggregation minimum is written to the
    /// node first, then the owning instance refiles the node. Helping nodes
    /// follow with the home priority mapped into their instance.
    pub fn apply_priority_actions(&self, actions: &mut PriorityActions) {
        for PriorityAction {
            thread,
            scheduler,
            group_order,
            ..
        } in actions.drain()
        {
            let (settled, epoch) = {
                let mut ctx = self.context.lock();
                let Some(t) = ctx.try_thread_mut(thread) else {
                    continue;
                };
                let Some(node) = t.node_mut(scheduler) else {
                    continue;
                };
                node.wait_mut().take_action();
                let Some(priority) = node.wait().priority() else {
                    continue;
                };
                node.set_priority(priority, group_order);
                t.priority_epoch += 1;
                (priority, t.priority_epoch)
            };

            let Ok(Some((helping, unmapped))) = self.locked(scheduler, |instance, ctx| {
                let t = ctx.try_thread(thread)?;
                let helping = (t.home() == scheduler).then(|| t.helping().to_vec());
                instance.update_priority(ctx, thread);
                Some((helping.unwrap_or_default(), instance.unmap_priority(settled)))
            }) else {
                continue;
            };

            // A newer settle propagates its own value.
            for index in helping {
                let refiled = self.locked(index, |instance, ctx| {
                    let Some(t) = ctx.try_thread(thread) else {
                        return;
                    };
                    let Some(node) = t.node(index).filter(|_| t.priority_epoch == epoch) else {
                        return;
                    };
                    let mapped = instance.map_priority(unmapped.min(instance.maximum_priority()));
                    node.set_priority(mapped, group_order);
                    instance.update_priority(ctx, thread);
                });
                if let Err(error) = refiled {
                    log::trace!("{thread}: helping node in {index} not refiled: {error}");
                }
            }
        }
    }

    /// Releases a job with the given absolute deadline.
    ///
    /// The job node becomes (or stays) a contribution of the thread; apply
    /// `actions` afterwards. Algorithms without jobs ignore the request.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidThread`] or [`SchedulerError::IdleThread`].
    pub fn release_job(
        &self,
        thread: ThreadId,
        job: &mut PriorityNode,
        deadline: u64,
        actions: &mut PriorityActions,
    ) -> Result<(), SchedulerError> {
        self.with_home(thread, |scheduler, ctx| {
            scheduler.release_job(ctx, thread, job, deadline, actions);
            log::debug!("{thread}: job released, deadline {deadline}");
            Ok(())
        })
    }

    /// # Errors
    /// [`SchedulerError::InvalidThread`] or [`SchedulerError::IdleThread`].
    pub fn cancel_job(
        &self,
        thread: ThreadId,
        job: &PriorityNode,
        actions: &mut PriorityActions,
    ) -> Result<(), SchedulerError> {
        self.with_home(thread, |scheduler, ctx| {
            scheduler.cancel_job(ctx, thread, job, actions);
            log::debug!("{thread}: job cancelled");
            Ok(())
        })
    }

    /// Restricts the processors the thread may run on.
    ///
    /// Only processors that are online count. While the thread is pinned the
    /// affinity is recorded but has no effect until it is unpinned.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidAffinity`] if no online processor remains or
    /// the home instance cannot represent the set.
    pub fn set_affinity(
        &self,
        thread: ThreadId,
        affinity: ProcessorMask,
    ) -> Result<(), SchedulerError> {
        let online = self.online;
        let affinity = affinity.and(online);
        if affinity.is_empty() {
            return Err(SchedulerError::InvalidAffinity);
        }

        self.with_home(thread, |scheduler, ctx| {
            if !scheduler.accepts_affinity(online, affinity) {
                return Err(SchedulerError::InvalidAffinity);
            }
            ctx.thread_mut(thread).affinity = affinity;
            scheduler.set_affinity(ctx, thread, online, affinity);
            log::debug!("{thread}: affinity {affinity:?}");
            Ok(())
        })
    }

    /// Binds the thread to `cpu` until [`Self::unpin`].
    ///
    /// # Errors
    /// [`SchedulerError::ProcessorNotOwned`] unless the home instance owns
    /// `cpu`; [`SchedulerError::IncorrectState`] if the thread is pinned
    /// already, has helping nodes or holds a sticky resource.
    pub fn pin(&self, thread: ThreadId, cpu: CpuIndex) -> Result<(), SchedulerError> {
        self.check_processor(cpu)?;
        self.with_home(thread, |scheduler, ctx| {
            let home = scheduler.index();
            if !scheduler.processors().contains(cpu) {
                return Err(SchedulerError::ProcessorNotOwned {
                    cpu,
                    scheduler: home,
                });
            }

            let t = ctx.thread(thread);
            let ready = t.is_ready();
            if t.pinned().is_some()
                || t.helping_nodes() > 0
                || t.home_node().sticky_level() > u32::from(ready)
            {
                return Err(SchedulerError::IncorrectState);
            }

            if ready {
                ctx.thread_mut(thread).ready = false;
                scheduler.block(ctx, thread);
            }
            scheduler.pin(ctx, thread, cpu);
            ctx.thread_mut(thread).pinned = Some((home, cpu));
            if ready {
                ctx.thread_mut(thread).ready = true;
                scheduler.unblock(ctx, thread);
            }
            log::debug!("{thread}: pinned to {cpu}");
            Ok(())
        })
    }

    /// # Errors
    /// [`SchedulerError::IncorrectState`] if the thread is not pinned or
    /// holds a sticky resource.
    pub fn unpin(&self, thread: ThreadId) -> Result<(), SchedulerError> {
        self.with_home(thread, |scheduler, ctx| {
            let t = ctx.thread(thread);
            let ready = t.is_ready();
            let Some(cpu) = t.pinned() else {
                return Err(SchedulerError::IncorrectState);
            };
            if t.home_node().sticky_level() > u32::from(ready) {
                return Err(SchedulerError::IncorrectState);
            }

            if ready {
                ctx.thread_mut(thread).ready = false;
                scheduler.block(ctx, thread);
            }
            scheduler.unpin(ctx, thread, cpu);
            ctx.thread_mut(thread).pinned = None;
            if ready {
                ctx.thread_mut(thread).ready = true;
                scheduler.unblock(ctx, thread);
            }
            log::debug!("{thread}: unpinned from {cpu}");
            Ok(())
        })
    }

    /// Hands an unowned processor to instance `scheduler`.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidProcessor`] for an offline processor,
    /// [`SchedulerError::ProcessorOwned`] if another instance owns it.
    pub fn add_processor(
        &self,
        scheduler: SchedulerIndex,
        cpu: CpuIndex,
    ) -> Result<(), SchedulerError> {
        self.check_processor(cpu)?;
        self.locked(scheduler, |instance, ctx| {
            if let Some(owner) = ctx.cpu(cpu).scheduler() {
                return Err(SchedulerError::ProcessorOwned { cpu, owner });
            }

            let Some(idle) = ctx.cpu(cpu).heir() else {
                fatal(InternalError::NoScheduledNode(cpu));
            };
            let priority = instance
                .map_priority(instance.maximum_priority())
                .appended();
            ctx.thread_mut(idle).set_home(scheduler);
            instance.node_initialize(ctx, idle, priority);
            ctx.cpu_mut(cpu).scheduler = Some(scheduler);
            instance.add_processor(ctx, idle);
            log::debug!("{cpu} added to {}", instance.name());
            Ok(())
        })?
    }

    /// Takes `cpu` away from instance `scheduler`; an idle thread keeps it.
    ///
    /// # Errors
    /// [`SchedulerError::ProcessorNotOwned`] unless the instance owns `cpu`;
    /// [`SchedulerError::ProcessorInUse`] if a thread is pinned to it, needs
    /// it for its affinity, or it is the last processor of an instance that
    /// still has threads.
    pub fn remove_processor(
        &self,
        scheduler: SchedulerIndex,
        cpu: CpuIndex,
    ) -> Result<(), SchedulerError> {
        self.check_processor(cpu)?;
        self.locked(scheduler, |instance, ctx| {
            if !instance.processors().contains(cpu) {
                return Err(SchedulerError::ProcessorNotOwned { cpu, scheduler });
            }

            let remaining = instance.processors().without(cpu);
            let in_use = ctx.threads().filter(|t| !t.is_idle()).any(|t| {
                let uses = t.home() == scheduler || t.helping().contains(&scheduler);
                t.pinned() == Some(cpu)
                    || (uses && remaining.is_empty())
                    || (t.home() == scheduler && !t.affinity().intersects(remaining))
            });
            if in_use {
                return Err(SchedulerError::ProcessorInUse(cpu));
            }

            let idle = instance.remove_processor(ctx, cpu);
            ctx.node_mut(idle, scheduler).retire();
            ctx.cpu_mut(cpu).scheduler = None;
            ctx.update_heir(cpu, idle);
            log::debug!("{cpu} removed from {}", instance.name());
            Ok(())
        })?
    }

    /// Gives the thread a node in instance `scheduler` through which it may
    /// be helped.
    ///
    /// # Errors
    /// [`SchedulerError::IncorrectState`] if the thread is pinned, or the
    /// instance is its home or helps it already.
    pub fn add_helping_node(
        &self,
        thread: ThreadId,
        scheduler: SchedulerIndex,
    ) -> Result<(), SchedulerError> {
        self.instance(scheduler)?;
        let unmapped = self.with_home(thread, |home, ctx| {
            let t = ctx.thread(thread);
            if t.home() == scheduler || t.helping().contains(&scheduler) || t.pinned().is_some()
            {
                return Err(SchedulerError::IncorrectState);
            }
            Ok(home.unmap_priority(t.home_node().priority()))
        })?;

        self.locked(scheduler, |instance, ctx| {
            user_thread(ctx, thread)?;
            let priority = instance.map_priority(unmapped.min(instance.maximum_priority()));
            instance.node_initialize(ctx, thread, priority);
            let t = ctx.thread_mut(thread);
            t.helping.push(scheduler);
            if t.state() == ThreadState::Ready {
                ctx.request_ask_for_help(thread);
            }
            log::debug!("{thread}: helping node on {}", instance.name());
            Ok(())
        })?
    }

    /// # Errors
    /// [`SchedulerError::IncorrectState`] if the instance does not help the
    /// thread or the node is sticky.
    pub fn remove_helping_node(
        &self,
        thread: ThreadId,
        scheduler: SchedulerIndex,
    ) -> Result<(), SchedulerError> {
        self.locked(scheduler, |instance, ctx| {
            let t = user_thread(ctx, thread)?;
            if !t.helping().contains(&scheduler) || ctx.node(thread, scheduler).sticky_level() > 0
            {
                return Err(SchedulerError::IncorrectState);
            }

            let next_state = if t.is_ready() {
                ThreadState::Ready
            } else {
                ThreadState::Blocked
            };
            instance.withdraw_node(ctx, thread, next_state);
            ctx.node_mut(thread, scheduler).retire();
            let t = ctx.thread_mut(thread);
            t.helping.retain(|&index| index != scheduler);
            if t.state() == ThreadState::Ready {
                ctx.request_ask_for_help(thread);
            }
            log::debug!("{thread}: helping node on {} removed", instance.name());
            Ok(())
        })?
    }

    fn node_instance(&self, thread: ThreadId, scheduler: SchedulerIndex) -> Result<(), SchedulerError> {
        self.instance(scheduler)?;
        let ctx = self.context.lock();
        let t = user_thread(&ctx, thread)?;
        if t.scheduler_indices().any(|index| index == scheduler) {
            Ok(())
        } else {
            Err(SchedulerError::InvalidScheduler(scheduler))
        }
    }

    /// The thread acquired a sticky resource: its node in `scheduler` keeps a
    /// processor even while the thread is blocked.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidScheduler`] unless the thread has a node there.
    pub fn make_sticky(&self, thread: ThreadId, scheduler: SchedulerIndex) -> Result<(), SchedulerError> {
        self.node_instance(thread, scheduler)?;
        self.locked(scheduler, |instance, ctx| {
            ctx.node_mut(thread, scheduler).increment_sticky_level();
            instance.make_sticky(ctx, thread);
        })
    }

    /// # Errors
    /// [`SchedulerError::InvalidScheduler`] unless the thread has a node
    /// there, [`SchedulerError::IncorrectState`] unless it was made sticky.
    pub fn clean_sticky(&self, thread: ThreadId, scheduler: SchedulerIndex) -> Result<(), SchedulerError> {
        self.node_instance(thread, scheduler)?;
        self.locked(scheduler, |instance, ctx| {
            let t = ctx.thread(thread);
            let floor = u32::from(t.is_ready() && t.home() == scheduler);
            if ctx.node(thread, scheduler).sticky_level() <= floor {
                return Err(SchedulerError::IncorrectState);
            }
            ctx.node_mut(thread, scheduler).decrement_sticky_level();
            instance.clean_sticky(ctx, thread);
            Ok(())
        })?
    }

    /// Offers the ready thread a processor of its home instance, then of each
    /// helping instance; `true` once one accepts.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidThread`] or [`SchedulerError::IdleThread`].
    pub fn ask_for_help(&self, thread: ThreadId) -> Result<bool, SchedulerError> {
        let indices: Vec<_> = {
            let ctx = self.context.lock();
            user_thread(&ctx, thread)?.scheduler_indices().collect()
        };

        for index in indices {
            let helped = self.locked(index, |instance, ctx| {
                let has_node = ctx
                    .try_thread(thread)
                    .and_then(|t| t.node(index))
                    .is_some_and(|node| node.state() != NodeState::Unused);
                has_node && instance.ask_for_help(ctx, thread)
            })?;
            if helped {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Performs a thread dispatch on `cpu`: serves the pending help requests,
    /// lets the other instances of the heir drop their ready nodes and makes
    /// the heir the executing thread. Returns the executing thread.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidProcessor`] for an offline processor.
    pub fn dispatch(&self, cpu: CpuIndex) -> Result<ThreadId, SchedulerError> {
        self.check_processor(cpu)?;

        loop {
            let request = self.context.lock().take_help_request(cpu);
            let Some(thread) = request else {
                break;
            };
            log::trace!("{cpu}: serving help request of {thread}");
            if let Err(error) = self.ask_for_help(thread) {
                log::trace!("{cpu}: help request of {thread} dropped: {error}");
            }
        }

        let reconsider = {
            let ctx = self.context.lock();
            ctx.cpu(cpu).heir().and_then(|heir| {
                let t = ctx.thread(heir);
                (!t.is_idle() && t.state() == ThreadState::Scheduled)
                    .then(|| (heir, t.scheduler_indices().collect::<Vec<_>>()))
            })
        };
        if let Some((heir, indices)) = reconsider {
            for index in indices {
                self.locked(index, |instance, ctx| {
                    if ctx.try_thread(heir).is_some() {
                        instance.reconsider_help_request(ctx, heir);
                    }
                })?;
            }
        }

        let mut ctx = self.context.lock();
        let per_cpu = ctx.cpu_mut(cpu);
        let Some(heir) = per_cpu.heir else {
            fatal(InternalError::NoScheduledNode(cpu));
        };
        if per_cpu.executing != Some(heir) {
            log::trace!("{cpu}: dispatching {heir}");
        }
        per_cpu.executing = Some(heir);
        per_cpu.dispatch_necessary = false;
        Ok(heir)
    }

    /// Clock tick on `cpu`; charges the executing thread's time slice.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidProcessor`] for an offline processor.
    pub fn tick(&self, cpu: CpuIndex) -> Result<(), SchedulerError> {
        self.check_processor(cpu)?;
        let owner = self.context.lock().cpu(cpu).scheduler();
        let Some(owner) = owner else {
            return Ok(());
        };

        let ticks = self.ticks_per_timeslice;
        self.locked(owner, |instance, ctx| {
            let Some(executing) = ctx.cpu(cpu).executing() else {
                return;
            };
            let has_node = ctx
                .try_thread(executing)
                .and_then(|t| t.node(owner))
                .is_some_and(|node| node.state() != NodeState::Unused);
            if has_node {
                instance.tick(ctx, executing, ticks);
            }
        })
    }

    /// Thread selected to run next on `cpu`.
    #[must_use]
    pub fn heir(&self, cpu: CpuIndex) -> Option<ThreadId> {
        self.online
            .contains(cpu)
            .then(|| self.context.lock().cpu(cpu).heir())
            .flatten()
    }

    #[must_use]
    pub fn executing(&self, cpu: CpuIndex) -> Option<ThreadId> {
        self.online
            .contains(cpu)
            .then(|| self.context.lock().cpu(cpu).executing())
            .flatten()
    }

    #[must_use]
    pub fn dispatch_necessary(&self, cpu: CpuIndex) -> bool {
        self.online.contains(cpu) && self.context.lock().cpu(cpu).dispatch_necessary()
    }

    /// Instance owning `cpu`.
    #[must_use]
    pub fn owner(&self, cpu: CpuIndex) -> Option<SchedulerIndex> {
        self.online
            .contains(cpu)
            .then(|| self.context.lock().cpu(cpu).scheduler())
            .flatten()
    }

    #[must_use]
    pub fn is_idle(&self, thread: ThreadId) -> bool {
        self.context
            .lock()
            .try_thread(thread)
            .is_some_and(Thread::is_idle)
    }

    /// # Errors
    /// [`SchedulerError::InvalidThread`] for an unknown thread.
    pub fn thread_state(&self, thread: ThreadId) -> Result<ThreadState, SchedulerError> {
        self.context
            .lock()
            .try_thread(thread)
            .map(Thread::state)
            .ok_or(SchedulerError::InvalidThread(thread))
    }

    /// Processor the thread is assigned to or last ran on.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidThread`] for an unknown thread.
    pub fn thread_cpu(&self, thread: ThreadId) -> Result<CpuIndex, SchedulerError> {
        self.context
            .lock()
            .try_thread(thread)
            .map(Thread::cpu)
            .ok_or(SchedulerError::InvalidThread(thread))
    }

    /// Current priority of the thread's home node, in the numbering of the
    /// home instance.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidThread`] or [`SchedulerError::IdleThread`].
    pub fn priority(&self, thread: ThreadId) -> Result<u64, SchedulerError> {
        self.with_home(thread, |scheduler, ctx| {
            Ok(scheduler.unmap_priority(ctx.thread(thread).home_node().priority()))
        })
    }

    /// # Errors
    /// [`SchedulerError::InvalidScheduler`] for an unknown instance.
    pub fn snapshot(&self, scheduler: SchedulerIndex) -> Result<SchedulerSnapshot, SchedulerError> {
        self.locked(scheduler, |instance, ctx| instance.snapshot(ctx))
    }

    /// Verifies every instance.
    ///
    /// # Errors
    /// The first violation found.
    pub fn check_invariants(&self) -> Result<(), InternalError> {
        for instance in &self.schedulers {
            let instance = instance.lock();
            let ctx = self.context.lock();
            instance.check_invariants(&ctx)?;
        }
        Ok(())
    }
}
