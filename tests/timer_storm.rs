use std::rc::Rc;
use std::time::{Duration, Instant};

use filament::fiber;
use filament::timer::Timer;
use filament::clock;

mod common;
use common::run;

/// Ten thousand one-shot timers with deadlines spread over one second:
/// every callback fires exactly once, and none before its deadline.
#[test]
fn storm_of_oneshot_timers() {
    const N: usize = 10_000;

    run(|| {
        let fire_counts: Rc<Vec<std::cell::Cell<u32>>> =
            Rc::new((0..N).map(|_| std::cell::Cell::new(0)).collect());
        let early: Rc<std::cell::Cell<usize>> = Rc::new(std::cell::Cell::new(0));

        let t0 = Instant::now();
        let mut timers = Vec::with_capacity(N);
        for i in 0..N {
            let delay_us = (i as u64 * 1_000_000 / N as u64) % 1_000_000;
            let expected = clock::now_cached() + delay_us;
            let counts = fire_counts.clone();
            let early = early.clone();
            timers.push(Timer::oneshot_with_stack(
                Duration::from_micros(delay_us),
                16 * 1024,
                move || {
                    if clock::now() < expected {
                        early.set(early.get() + 1);
                    }
                    counts[i].set(counts[i].get() + 1);
                },
            ));
        }

        loop {
            let fired: usize = fire_counts.iter().filter(|c| c.get() > 0).count();
            if fired == N {
                break;
            }
            assert!(
                t0.elapsed() < Duration::from_secs(5),
                "only {} of {} timers fired",
                fired,
                N
            );
            fiber::sleep_us(10_000);
        }

        assert_eq!(early.get(), 0, "{} timers fired before their deadline", early.get());
        let duplicates = fire_counts.iter().filter(|c| c.get() > 1).count();
        assert_eq!(duplicates, 0, "{} timers fired more than once", duplicates);
    });
}
