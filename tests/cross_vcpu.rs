use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread;
use std::time::Duration;

use filament::fiber::{self, Semaphore};
use filament::pool::WorkPool;
use filament::InitFlags;

mod common;
use common::run;

#[test]
fn semaphore_hand_off_between_vcpus() {
    run(|| {
        let sem = Arc::new(Semaphore::new(0));
        let ran_on = Arc::new(StdMutex::new(None));

        let s = sem.clone();
        let r = ran_on.clone();
        let parked = fiber::defer_proc(move || {
            s.wait(1).unwrap();
            *r.lock().unwrap() = Some(thread::current().id());
        });

        let signaller = {
            let sem = sem.clone();
            thread::spawn(move || {
                filament::init(InitFlags::default()).unwrap();
                fiber::sleep_us(10_000);
                sem.signal(1);
                filament::fini().unwrap();
            })
        };

        parked.join();
        signaller.join().unwrap();

        // The parked fiber must have run on its own vcpu, not on the
        // signaller's.
        assert_eq!(*ran_on.lock().unwrap(), Some(thread::current().id()));
    });
}

#[test]
fn interrupt_from_a_plain_os_thread() {
    run(|| {
        let me = fiber::current();
        // No runtime on this thread at all.
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            fiber::interrupt(&me, 42);
        });
        assert_eq!(fiber::sleep_us(u64::MAX), -1);
        assert_eq!(fiber::last_error(), 42);
        t.join().unwrap();
    });
}

#[test]
fn cross_vcpu_mutex_contention() {
    run(|| {
        let m = Arc::new(fiber::Mutex::new(0u64));
        let mut threads = Vec::new();
        for _ in 0..2 {
            let m = m.clone();
            threads.push(thread::spawn(move || {
                filament::init(InitFlags::default()).unwrap();
                for _ in 0..500 {
                    *m.lock() += 1;
                }
                filament::fini().unwrap();
            }));
        }
        for _ in 0..500 {
            *m.lock() += 1;
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*m.lock(), 1_500);
    });
}

#[test]
fn work_pool_call_returns_the_result() {
    run(|| {
        let pool = WorkPool::new(2).unwrap();
        let here = thread::current().id();
        let (value, there) = pool.call(|| (6 * 7, thread::current().id()));
        assert_eq!(value, 42);
        assert_ne!(there, here, "the task must run on a worker vcpu");
    });
}

#[test]
fn work_pool_do_call_fire_and_forget() {
    run(|| {
        let pool = WorkPool::new(1).unwrap();
        let sem = Arc::new(Semaphore::new(0));
        let s = sem.clone();
        pool.do_call(move || s.signal(1));
        sem.wait(1).unwrap();
    });
}

#[test]
fn work_pool_drains_queue_on_shutdown() {
    run(|| {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkPool::new(1).unwrap();
            for _ in 0..100 {
                let counter = counter.clone();
                pool.do_call(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
            // Dropping the pool must execute everything already queued.
        }
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    });
}

#[test]
fn work_pool_calls_from_many_fibers() {
    run(|| {
        let pool = std::rc::Rc::new(WorkPool::new(2).unwrap());
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let pool = pool.clone();
            handles.push(fiber::defer(move || pool.call(move || i * i)));
        }
        let squares: Vec<u64> = handles.into_iter().map(|h| h.join()).collect();
        assert_eq!(squares, [0, 1, 4, 9, 16, 25, 36, 49]);
    });
}
