use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use filament::error::Error;
use filament::fiber::{self, channel, Cond, Mutex, RwLock, Semaphore};

mod common;
use common::run;

#[test]
fn mutex_protects_and_try_lock_observes() {
    run(|| {
        let m = Mutex::new(1);
        {
            let mut g = m.lock();
            *g += 1;
            assert!(m.try_lock().is_none());
        }
        assert_eq!(*m.lock(), 2);
        assert_eq!(m.into_inner(), 2);
    });
}

#[test]
fn mutex_wakes_waiters_in_fifo_order() {
    run(|| {
        let m = Rc::new(Mutex::new(()));
        let order = Rc::new(RefCell::new(Vec::new()));

        let guard = m.lock();
        let mut handles = Vec::new();
        for i in 0..3 {
            let m = m.clone();
            let order = order.clone();
            handles.push(fiber::defer_proc(move || {
                let _g = m.lock();
                order.borrow_mut().push(i);
            }));
        }
        // Let all three enqueue on the mutex, then release it.
        fiber::sleep_us(1_000);
        drop(guard);
        for h in handles {
            h.join();
        }
        assert_eq!(*order.borrow(), [0, 1, 2]);
    });
}

#[test]
fn mutex_lock_timeout_expires() {
    run(|| {
        let m = Rc::new(Mutex::new(()));
        let g = m.lock();
        let t0 = Instant::now();
        match m.lock_timeout(Duration::from_millis(10)) {
            Err(Error::Timeout) => {}
            other => panic!("expected a timeout, got {:?}", other.map(|_| ())),
        }
        assert!(t0.elapsed() >= Duration::from_millis(10));
        drop(g);
        assert!(m.lock_timeout(Duration::from_millis(10)).is_ok());
    });
}

#[test]
fn cond_signal_wakes_one_in_fifo_order() {
    run(|| {
        let cond = Rc::new(Cond::new());
        let order = Rc::new(RefCell::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..2 {
            let cond = cond.clone();
            let order = order.clone();
            handles.push(fiber::defer_proc(move || {
                assert!(cond.wait());
                order.borrow_mut().push(i);
            }));
        }
        fiber::sleep_us(1_000); // both are waiting now

        cond.signal();
        fiber::sleep_us(1_000);
        assert_eq!(*order.borrow(), [0]);

        cond.signal();
        for h in handles {
            h.join();
        }
        assert_eq!(*order.borrow(), [0, 1]);
    });
}

#[test]
fn cond_broadcast_wakes_everyone() {
    run(|| {
        let cond = Rc::new(Cond::new());
        let woken = Rc::new(RefCell::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cond = cond.clone();
            let woken = woken.clone();
            handles.push(fiber::defer_proc(move || {
                assert!(cond.wait());
                *woken.borrow_mut() += 1;
            }));
        }
        fiber::sleep_us(1_000);
        cond.broadcast();
        for h in handles {
            h.join();
        }
        assert_eq!(*woken.borrow(), 4);
    });
}

#[test]
fn cond_wait_timeout_expires() {
    run(|| {
        let cond = Cond::new();
        let t0 = Instant::now();
        assert!(!cond.wait_timeout(Duration::from_millis(10)));
        assert!(t0.elapsed() >= Duration::from_millis(10));
    });
}

#[test]
fn cond_wait_guarded_releases_the_mutex() {
    run(|| {
        let pair = Rc::new((Mutex::new(false), Cond::new()));
        let p = pair.clone();
        let h = fiber::defer_proc(move || {
            let mut ready = p.0.lock();
            *ready = true;
            drop(ready);
            p.1.signal();
        });

        let mut ready = pair.0.lock();
        while !*ready {
            // If the mutex were not released here, the signaller above
            // could never take it and this would deadlock.
            ready = pair.1.wait_guarded(ready);
        }
        drop(ready);
        h.join();
    });
}

#[test]
fn semaphore_counts_and_zero_wait() {
    run(|| {
        let sem = Semaphore::new(2);
        assert!(sem.try_wait(2));
        assert!(!sem.try_wait(1));
        sem.signal(3);
        assert_eq!(sem.available(), 3);
        // wait(0) returns immediately even with no permits.
        let empty = Semaphore::new(0);
        empty.wait(0).unwrap();
    });
}

#[test]
fn semaphore_timeout() {
    run(|| {
        let sem = Semaphore::new(0);
        let t0 = Instant::now();
        match sem.wait_timeout(1, Duration::from_millis(10)) {
            Err(Error::Timeout) => {}
            other => panic!("expected a timeout, got {:?}", other),
        }
        assert!(t0.elapsed() >= Duration::from_millis(10));
    });
}

#[test]
fn semaphore_head_waiter_blocks_smaller_requests() {
    run(|| {
        let sem = Rc::new(Semaphore::new(1));
        let order = Rc::new(RefCell::new(Vec::new()));

        let s = sem.clone();
        let o = order.clone();
        let big = fiber::defer_proc(move || {
            s.wait(2).unwrap();
            o.borrow_mut().push("big");
        });
        let s = sem.clone();
        let o = order.clone();
        let small = fiber::defer_proc(move || {
            s.wait(1).unwrap();
            o.borrow_mut().push("small");
        });

        fiber::sleep_us(1_000);
        // One permit is available and would satisfy `small`, but `big` is
        // at the head: no overtaking.
        assert!(order.borrow().is_empty());

        sem.signal(1); // big takes both
        fiber::sleep_us(1_000);
        assert_eq!(*order.borrow(), ["big"]);

        sem.signal(1);
        big.join();
        small.join();
        assert_eq!(*order.borrow(), ["big", "small"]);
    });
}

#[test]
fn semaphore_signal_satisfies_several_waiters() {
    run(|| {
        let sem = Rc::new(Semaphore::new(0));
        let served = Rc::new(RefCell::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let sem = sem.clone();
            let served = served.clone();
            handles.push(fiber::defer_proc(move || {
                sem.wait(1).unwrap();
                *served.borrow_mut() += 1;
            }));
        }
        fiber::sleep_us(1_000);
        sem.signal(3);
        for h in handles {
            h.join();
        }
        assert_eq!(*served.borrow(), 3);
    });
}

#[test]
fn rwlock_shares_readers_excludes_writers() {
    run(|| {
        let lock = Rc::new(RwLock::new(0));
        let r1 = lock.read();
        let r2 = lock.read();
        assert!(lock.try_write().is_none());
        drop(r1);
        assert!(lock.try_write().is_none());
        drop(r2);
        *lock.write() = 9;
        assert_eq!(*lock.read(), 9);
    });
}

#[test]
fn rwlock_prefers_writers_over_new_readers() {
    run(|| {
        let lock = Rc::new(RwLock::new(0u32));
        let order = Rc::new(RefCell::new(Vec::new()));

        let first_read = lock.read();

        let l = lock.clone();
        let o = order.clone();
        let writer = fiber::defer_proc(move || {
            let mut v = l.write();
            *v += 1;
            o.borrow_mut().push("writer");
        });
        fiber::sleep_us(1_000); // writer is queued now

        // A new reader must queue behind the waiting writer.
        assert!(lock.try_read().is_none());
        let l = lock.clone();
        let o = order.clone();
        let reader = fiber::defer_proc(move || {
            let v = l.read();
            assert_eq!(*v, 1);
            o.borrow_mut().push("reader");
        });

        fiber::sleep_us(1_000);
        drop(first_read);
        writer.join();
        reader.join();
        assert_eq!(*order.borrow(), ["writer", "reader"]);
    });
}

#[test]
fn channel_roundtrip_and_capacity() {
    run(|| {
        let (tx, rx) = channel::channel(2);
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        assert!(matches!(
            tx.try_send(3),
            Err(channel::TrySendError::Full(3))
        ));

        let h = fiber::defer_proc(move || {
            // Unblocks the sender below by draining the buffer.
            assert_eq!(rx.recv(), Some(1));
            assert_eq!(rx.recv(), Some(2));
            assert_eq!(rx.recv(), Some(3));
            assert_eq!(rx.recv(), None);
        });
        tx.send(3).unwrap();
        drop(tx);
        h.join();
    });
}

#[test]
fn channel_recv_timeout() {
    run(|| {
        let (tx, rx) = channel::channel::<u8>(1);
        let t0 = Instant::now();
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(10)),
            Err(channel::RecvError::Timeout)
        );
        assert!(t0.elapsed() >= Duration::from_millis(10));
        drop(tx);
        assert_eq!(rx.try_recv(), Err(channel::TryRecvError::Disconnected));
    });
}
