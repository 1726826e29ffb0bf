use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use filament::fiber::{self, Semaphore, YieldResult};

mod common;
use common::run;

#[test]
fn ping_pong() {
    run(|| {
        let byte = Rc::new(Cell::new(0u8));
        let sem = Rc::new(Semaphore::new(0));
        let byte_in_b = byte.clone();
        let sem_in_b = sem.clone();
        let b = fiber::defer_proc(move || {
            byte_in_b.set(0x42);
            sem_in_b.signal(1);
        });

        let t0 = Instant::now();
        assert_eq!(fiber::sleep_us(10_000), 0);
        sem.wait(1).unwrap();
        assert_eq!(byte.get(), 0x42);

        let elapsed = t0.elapsed();
        assert!(elapsed >= Duration::from_millis(10), "woke early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(1), "woke late: {:?}", elapsed);
        b.join();
    });
}

#[test]
fn start_hands_control_over_immediately() {
    run(|| {
        let order = Rc::new(RefCell::new(Vec::new()));
        let order_in_child = order.clone();
        let h = fiber::start(move || {
            order_in_child.borrow_mut().push("child");
            7
        });
        order.borrow_mut().push("parent");
        assert_eq!(h.join(), 7);
        assert_eq!(*order.borrow(), ["child", "parent"]);
    });
}

#[test]
fn defer_runs_at_queue_tail() {
    run(|| {
        let order = Rc::new(RefCell::new(Vec::new()));
        let order_in_child = order.clone();
        let h = fiber::defer_proc(move || order_in_child.borrow_mut().push("child"));
        order.borrow_mut().push("parent");
        fiber::yield_now();
        order.borrow_mut().push("parent again");
        h.join();
        assert_eq!(*order.borrow(), ["parent", "child", "parent again"]);
    });
}

#[test]
fn yield_to_skips_queue_order() {
    run(|| {
        let order = Rc::new(RefCell::new(Vec::new()));
        let o = order.clone();
        let a = fiber::defer_proc(move || o.borrow_mut().push("a"));
        let o = order.clone();
        let b = fiber::defer_proc(move || o.borrow_mut().push("b"));

        // b was queued after a, but gets the processor first.
        fiber::yield_to(&b.handle());
        a.join();
        b.join();
        assert_eq!(*order.borrow(), ["b", "a"]);
    });
}

#[test]
fn yield_to_unknown_falls_back_to_yield() {
    run(|| {
        let h = fiber::defer_proc(|| {});
        let target = h.handle();
        h.join();
        // The fiber is done; yield_to must degenerate to a plain yield.
        fiber::yield_to(&target);
    });
}

#[test]
fn sleep_zero_yields_and_returns_zero() {
    run(|| {
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        let h = fiber::defer_proc(move || r.set(true));
        assert_eq!(fiber::sleep_us(0), 0);
        assert!(ran.get(), "the deferred fiber did not get the processor");
        h.join();
    });
}

#[test]
fn interrupt_during_sleep() {
    run(|| {
        let me = fiber::current();
        let h = fiber::defer_proc(move || {
            fiber::sleep_us(10_000);
            fiber::interrupt(&me, 42);
        });

        let t0 = Instant::now();
        // One hour; only the interrupt can end it.
        let rc = fiber::sleep_us(3_600_000_000);
        let elapsed = t0.elapsed();

        assert_eq!(rc, -1);
        assert_eq!(fiber::last_error(), 42);
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_secs(10), "interrupt too slow: {:?}", elapsed);
        h.join();
    });
}

#[test]
fn repeated_interrupts_are_idempotent() {
    run(|| {
        let me = fiber::current();
        let h = fiber::defer_proc(move || {
            fiber::interrupt(&me, 7);
            fiber::interrupt(&me, 8);
        });

        let rc = fiber::sleep_us(u64::MAX);
        assert_eq!(rc, -1);
        assert_eq!(fiber::last_error(), 7, "first interrupt must win");

        // The second interrupt was a no-op, so this sleep expires normally.
        assert_eq!(fiber::sleep_us(1_000), 0);
        h.join();
    });
}

#[test]
fn infinite_sleep_wakes_only_by_interrupt() {
    run(|| {
        let me = fiber::current();
        let h = fiber::defer_proc(move || {
            fiber::sleep_us(5_000);
            fiber::interrupt(&me, 1);
        });
        assert_eq!(fiber::sleep_us(u64::MAX), -1);
        assert_eq!(fiber::last_error(), 1);
        h.join();
    });
}

#[test]
fn sleep_defer_installs_wake_without_a_window() {
    run(|| {
        let me = fiber::current();
        // The callback runs after the fiber is parked, so the wake it
        // delivers cannot be lost.
        let rc = fiber::sleep_us_defer(3_600_000_000, move || fiber::interrupt(&me, 9));
        assert_eq!(rc, -1);
        assert_eq!(fiber::last_error(), 9);
    });
}

#[test]
fn join_returns_the_fiber_result() {
    run(|| {
        let h = fiber::start(|| String::from("done"));
        assert_eq!(h.join(), "done");
    });
}

#[test]
fn join_after_completion_is_immediate() {
    run(|| {
        let h = fiber::defer(|| 5u32);
        fiber::sleep_us(1_000);
        assert!(h.handle().is_done());
        assert_eq!(h.join(), 5);
    });
}

#[test]
fn spawn_does_not_yield() {
    run(|| {
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        fiber::spawn(move || r.set(true), 64 * 1024).unwrap();
        assert!(!ran.get(), "spawn must keep the caller on the processor");
        fiber::yield_now();
        assert!(ran.get());
    });
}

#[test]
fn builder_names_and_sizes() {
    run(|| {
        let h = fiber::Builder::new()
            .name("worker")
            .stack_size(128 * 1024)
            .func(fiber::name)
            .start()
            .unwrap();
        assert_eq!(h.join(), "worker");
    });
}

#[test]
fn check_yield_detects_switches() {
    run(|| {
        assert_eq!(fiber::check_yield(|| 3), YieldResult::DidntYield(3));
        let h = fiber::defer_proc(|| {});
        assert_eq!(
            fiber::check_yield(fiber::yield_now),
            YieldResult::Yielded(())
        );
        h.join();
    });
}

#[test]
fn fiber_local_storage() {
    run(|| {
        let key = fiber::local::Key::new();
        assert!(key.set(41u32));
        assert_eq!(key.get::<u32>(), Some(41));

        // Values are per fiber.
        let k = key;
        let h = fiber::start(move || k.get::<u32>());
        assert_eq!(h.join(), None);

        assert!(key.remove());
        assert_eq!(key.get::<u32>(), None);

        key.delete();
        assert!(!key.set(1u32));
    });
}

#[test]
fn handles_address_fibers() {
    run(|| {
        let h = fiber::defer(fiber::id);
        let handle = h.handle();
        let id = h.join();
        assert_eq!(handle.id(), id);
        assert!(handle.is_done());
    });
}
