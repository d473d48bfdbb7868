use crate::RawSpin;
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering, fence};

/// Sequence lock for small `Copy` values.
///
/// Writers are serialized by an internal [`RawSpin`]. Readers never take a
/// lock; they copy the value between two loads of the sequence counter and
/// retry when a writer was active in between. An odd counter marks a write in
/// progress.
pub struct SeqLock<T> {
    sequence: AtomicUsize,
    writer: RawSpin,
    value: UnsafeCell<T>,
}

// SAFETY: writers are serialized by `writer`; readers only copy the value and
// discard copies that overlapped a write.
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}
unsafe impl<T: Copy + Send> Send for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            sequence: AtomicUsize::new(0),
            writer: RawSpin::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Returns a value that was stored by some completed write.
    #[inline]
    pub fn read(&self) -> T {
        loop {
            let before = self.sequence.load(Ordering::Acquire);
            if before & 1 != 0 {
                spin_loop();
                continue;
            }

            // SAFETY: `T: Copy`, so a torn copy has no drop glue; the
            // sequence check below discards it.
            let value = unsafe { ptr::read_volatile(self.value.get()) };
            fence(Ordering::Acquire);

            let after = self.sequence.load(Ordering::Relaxed);
            if before == after {
                return value;
            }
            spin_loop();
        }
    }

    #[inline]
    pub fn write(&self, value: T) {
        self.writer.lock();
        let sequence = self.sequence.load(Ordering::Relaxed);
        self.sequence
            .store(sequence.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        // SAFETY: `writer` is held, no other write runs
        unsafe { ptr::write_volatile(self.value.get(), value) };

        self.sequence
            .store(sequence.wrapping_add(2), Ordering::Release);
        // SAFETY: locked at the top of this function
        unsafe { self.writer.unlock() };
    }

    /// Reads the current value and writes back `f(value)` as one write.
    #[inline]
    pub fn update(&self, f: impl FnOnce(T) -> T) {
        self.writer.lock();
        // SAFETY: `writer` is held, so the value is stable
        let current = unsafe { ptr::read_volatile(self.value.get()) };
        let next = f(current);
        let sequence = self.sequence.load(Ordering::Relaxed);
        self.sequence
            .store(sequence.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        // SAFETY: `writer` is held, no other write runs
        unsafe { ptr::write_volatile(self.value.get(), next) };

        self.sequence
            .store(sequence.wrapping_add(2), Ordering::Release);
        // SAFETY: locked at the top of this function
        unsafe { self.writer.unlock() };
    }

    /// Number of completed writes.
    #[inline]
    pub fn writes(&self) -> usize {
        self.sequence.load(Ordering::Relaxed) / 2
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Copy + Default> Default for SeqLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy> Clone for SeqLock<T> {
    fn clone(&self) -> Self {
        Self::new(self.read())
    }
}

impl<T: Copy + core::fmt::Debug> core::fmt::Debug for SeqLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("SeqLock").field(&self.read()).finish()
    }
}
