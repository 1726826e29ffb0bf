use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use filament::fiber;
use filament::timer::Timer;

mod common;
use common::run;

#[test]
fn oneshot_fires_after_the_delay() {
    run(|| {
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let t0 = Instant::now();
        let _t = Timer::oneshot(Duration::from_millis(10), move || f.set(true));

        while !fired.get() {
            assert!(t0.elapsed() < Duration::from_secs(5), "timer never fired");
            fiber::sleep_us(1_000);
        }
        assert!(t0.elapsed() >= Duration::from_millis(10));
    });
}

#[test]
fn cancelled_before_firing_never_runs() {
    run(|| {
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let t = Timer::oneshot(Duration::from_millis(20), move || f.set(true));
        t.cancel();
        fiber::sleep_us(50_000);
        assert!(!fired.get());
    });
}

#[test]
fn repeating_reschedules_itself() {
    run(|| {
        let ticks = Rc::new(Cell::new(0u32));
        let t = {
            let ticks = ticks.clone();
            Timer::repeating(Duration::from_millis(5), move || {
                ticks.set(ticks.get() + 1);
                None // keep the interval
            })
        };

        let t0 = Instant::now();
        while ticks.get() < 3 {
            assert!(t0.elapsed() < Duration::from_secs(5), "timer stalled");
            fiber::sleep_us(1_000);
        }
        t.cancel();
        let after_cancel = ticks.get();
        fiber::sleep_us(30_000);
        // At most one tick already in flight when cancel landed.
        assert!(ticks.get() <= after_cancel + 1);
    });
}

#[test]
fn repeating_override_steers_the_next_tick() {
    run(|| {
        let stamps = Rc::new(RefCell::new(Vec::new()));
        let t = {
            let stamps = stamps.clone();
            Timer::repeating(Duration::from_millis(5), move || {
                stamps.borrow_mut().push(Instant::now());
                // Stretch only the next gap.
                Some(Duration::from_millis(30))
            })
        };
        let t0 = Instant::now();
        while stamps.borrow().len() < 2 {
            assert!(t0.elapsed() < Duration::from_secs(5));
            fiber::sleep_us(1_000);
        }
        t.cancel();
        let stamps = stamps.borrow();
        assert!(stamps[1] - stamps[0] >= Duration::from_millis(30));
    });
}
