//! # Kernel synchronization primitives
//!
//! Locks used by the scheduler core and the rest of the kernel:
//!
//! | Type            | Discipline              | Used for                             |
//! |-----------------|-------------------------|--------------------------------------|
//! | [`SpinMutex`]   | test-and-test-and-set   | short, uncontended critical sections |
//! | [`TicketMutex`] | FIFO tickets            | per-scheduler-instance locks         |
//! | [`SeqLock`]     | optimistic reads        | per-node priority values             |
//!
//! A [`SeqLock`] never makes a reader wait on a writer for longer than the write
//! itself: the reader observes the sequence counter before and after copying the
//! value and simply retries when the two differ.
//!
//! ```text
//!  writer:  seq=2n+1 ──► write value ──► seq=2n+2
//!  reader:  s1=seq ──► copy value ──► s2=seq ──► s1 == s2 && even ? done : retry
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw_spin;
mod raw_ticket;
mod seq_lock;

pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use raw_ticket::RawTicket;
pub use seq_lock::SeqLock;

/// A mutex backed by a [`RawSpin`] lock.
pub type SpinMutex<T> = Mutex<T, RawSpin>;

/// A mutex backed by a FIFO [`RawTicket`] lock.
pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

/// Acquisition half of a raw lock.
pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
    fn raw_is_locked(&self) -> bool;
}

/// Release half of a raw lock.
pub trait RawUnlock {
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn raw_unlock(&self);
}
