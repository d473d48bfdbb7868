use kernel_sync::{SpinMutex, TicketMutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let m = TicketMutex::new(0_u32);
    {
        let mut g = m.lock();
        *g = 41;
        assert!(m.is_locked());
    }
    assert!(!m.is_locked());

    let mut g = m.lock();
    *g += 1;
    assert_eq!(*g, 42);
}

#[test]
fn try_lock_fails_while_held() {
    let m = TicketMutex::new(1_u8);

    let g1 = m.try_lock();
    assert!(g1.is_some());
    assert!(m.try_lock().is_none());

    drop(g1);
    assert!(m.try_lock().is_some());
    assert!(!m.is_locked());
}

#[test]
fn failed_try_lock_leaves_holder_alone() {
    let m = SpinMutex::new(3_u8);
    let held = m.lock();
    for _ in 0..4 {
        assert!(m.try_lock().is_none());
    }
    assert!(m.is_locked());
    drop(held);
    assert!(!m.is_locked());
}

#[test]
fn with_lock_returns_closure_result() {
    let m = TicketMutex::new(String::from("a"));
    let len = m.with_lock(|s| {
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);
    assert_eq!(m.with_lock(|s| s.clone()), "ab");
}

#[test]
fn get_mut_and_into_inner() {
    let mut m = TicketMutex::new(vec![1, 2, 3]);
    m.get_mut().push(4);
    assert_eq!(m.into_inner(), vec![1, 2, 3, 4]);
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(TicketMutex::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let lock = Arc::clone(&lock);
        let in_cs = Arc::clone(&in_cs);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                lock.with_lock(|v| {
                    let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(prev, 0, "mutual exclusion violated");
                    *v += 1;
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                });
                thread::yield_now();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
    assert_eq!(in_cs.load(Ordering::SeqCst), 0);
}

#[test]
fn lock_is_released_on_panic() {
    let m = TicketMutex::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        m.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    assert!(!m.is_locked());
    assert_eq!(m.with_lock(|v| *v), 123);
}
