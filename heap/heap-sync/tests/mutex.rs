use heap_sync::{SpinMutex, TaskId, current_task, set_task_source};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn guard_unlocks_on_drop() {
    let m = SpinMutex::new(0_u32);

    {
        let mut g = m.lock();
        *g = 41;
    }

    // lock again; the previous drop must have unlocked
    let mut g = m.lock();
    *g += 1;
    assert_eq!(*g, 42);
}

#[test]
fn try_lock_fails_while_held() {
    let m = SpinMutex::new(1_u8);

    let g1 = m.try_lock();
    assert!(g1.is_some());

    // while held, a second attempt must fail
    assert!(m.try_lock().is_none());

    drop(g1);
    assert!(m.try_lock().is_some());
}

#[test]
fn acquire_selects_the_locking_mode() {
    let m = SpinMutex::new(());

    // Non-waiting acquisition surfaces contention instead of spinning.
    let held = m.acquire(false).unwrap();
    assert!(m.acquire(false).is_none());
    drop(held);

    // Waiting acquisition on a free lock succeeds immediately.
    assert!(m.acquire(true).is_some());
}

#[test]
fn get_mut_bypasses_the_lock() {
    let mut m = SpinMutex::new(vec![1, 2, 3]);
    // &mut self guarantees no contention; mutate without locking.
    m.get_mut().push(4);
    assert_eq!(m.lock().as_slice(), &[1, 2, 3, 4]);
}

#[test]
fn waiting_workers_serialize_exactly() {
    let workers = 8;
    let rounds = 5_000;

    let lock = Arc::new(SpinMutex::new(0_usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(workers));

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let lock = Arc::clone(&lock);
        let in_cs = Arc::clone(&in_cs);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..rounds {
                // Every worker asks to wait, as a high-priority allocator
                // caller would.
                let mut g = lock.acquire(true).unwrap();
                let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                assert_eq!(prev, 0, "mutual exclusion violated");
                *g += 1;
                in_cs.fetch_sub(1, Ordering::SeqCst);
                drop(g);

                // yield only after releasing to reduce convoy effects
                thread::yield_now();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(*lock.lock(), workers * rounds);
    assert_eq!(in_cs.load(Ordering::SeqCst), 0);
}

/// Task identity and lock ownership share one test so the process-wide task
/// source is never contested across test threads.
#[test]
fn task_identity_flows_into_lock_ownership() {
    // Before registration the fallback identity is reported and lock
    // holders stay anonymous.
    assert_eq!(current_task(), TaskId::none());
    let m = SpinMutex::new(());
    {
        let _g = m.lock();
        assert_eq!(m.holder(), None);
    }

    set_task_source(|| TaskId::new(7));
    assert_eq!(current_task().as_raw(), 7);

    // A held lock names its owner; a released lock names nobody.
    {
        let _g = m.lock();
        assert_eq!(m.holder(), Some(TaskId::new(7)));
    }
    assert_eq!(m.holder(), None);

    // `TaskId::none` itself is a valid source; park it there for any other
    // test in this binary.
    set_task_source(TaskId::none);
    assert_eq!(current_task(), TaskId::none());
}

#[test]
fn mutex_is_sync_for_send_t() {
    // If this compiles, SpinMutex<u8> is Sync.
    fn takes_sync<S: Sync>(_s: &S) {}
    let m = SpinMutex::new(0_u8);
    takes_sync(&m);
}
