//! One-shot and repeating timers.
//!
//! A pending timer occupies a scheduler timer-heap entry, not a fiber; the
//! callback gets its own fiber (with a configurable stack size) only when
//! the deadline fires, so huge numbers of pending timers are cheap.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use crate::clock::{self, duration_to_us};
use crate::fiber;
use crate::sched;

/// Default stack size for timer callback fibers. Callbacks are usually
/// tiny; pass an explicit hint when yours is not.
pub const DEFAULT_TIMER_STACK: usize = 64 * 1024;

struct TimerState {
    cancelled: Cell<bool>,
}

/// A scheduled callback. Dropping the handle does *not* cancel the timer;
/// call [`cancel`](Timer::cancel).
pub struct Timer {
    state: Rc<TimerState>,
}

impl Timer {
    /// Run `f` once, `delay` from now, on a fresh fiber.
    pub fn oneshot<F>(delay: Duration, f: F) -> Timer
    where
        F: FnOnce() + 'static,
    {
        Self::oneshot_with_stack(delay, DEFAULT_TIMER_STACK, f)
    }

    /// [`oneshot`](Self::oneshot) with an explicit callback stack size.
    pub fn oneshot_with_stack<F>(delay: Duration, stack_size: usize, f: F) -> Timer
    where
        F: FnOnce() + 'static,
    {
        let state = Rc::new(TimerState {
            cancelled: Cell::new(false),
        });
        arm_oneshot(state.clone(), duration_to_us(delay), stack_size, Box::new(f));
        Timer { state }
    }

    /// Run `f` every `interval`, starting one interval from now.
    ///
    /// The callback's return value steers the next tick: `None` keeps the
    /// interval, `Some(d)` overrides the delay of the next tick only.
    pub fn repeating<F>(interval: Duration, f: F) -> Timer
    where
        F: FnMut() -> Option<Duration> + 'static,
    {
        Self::repeating_with_stack(interval, DEFAULT_TIMER_STACK, f)
    }

    /// [`repeating`](Self::repeating) with an explicit callback stack
    /// size.
    pub fn repeating_with_stack<F>(interval: Duration, stack_size: usize, f: F) -> Timer
    where
        F: FnMut() -> Option<Duration> + 'static,
    {
        let state = Rc::new(TimerState {
            cancelled: Cell::new(false),
        });
        let interval_us = duration_to_us(interval);
        arm_repeating(state.clone(), interval_us, interval_us, stack_size, Box::new(f));
        Timer { state }
    }

    /// Cancel the timer.
    ///
    /// A timer cancelled strictly before firing never runs its callback; a
    /// timer that has already fired (its callback fiber is launched or
    /// running) is delivered regardless.
    pub fn cancel(&self) {
        self.state.cancelled.set(true);
    }
}

fn arm_oneshot(state: Rc<TimerState>, delay_us: u64, stack_size: usize, f: Box<dyn FnOnce()>) {
    let deadline = clock::now_cached().saturating_add(delay_us);
    sched::with_vcpu(move |v| {
        v.call_at(
            deadline,
            Box::new(move || {
                if state.cancelled.get() {
                    return;
                }
                // The callback may block, so it gets a fiber of its own.
                if let Err(e) = fiber::spawn(f, stack_size) {
                    log::error!("failed to spawn timer callback fiber: {}", e);
                }
            }),
        )
    });
}

fn arm_repeating(
    state: Rc<TimerState>,
    delay_us: u64,
    interval_us: u64,
    stack_size: usize,
    mut f: Box<dyn FnMut() -> Option<Duration>>,
) {
    let deadline = clock::now_cached().saturating_add(delay_us);
    sched::with_vcpu(move |v| {
        v.call_at(
            deadline,
            Box::new(move || {
                if state.cancelled.get() {
                    return;
                }
                let spawned = fiber::spawn(
                    move || {
                        let next = f().map(duration_to_us).unwrap_or(interval_us);
                        if !state.cancelled.get() {
                            arm_repeating(state, next, interval_us, stack_size, f);
                        }
                    },
                    stack_size,
                );
                if let Err(e) = spawned {
                    log::error!("failed to spawn timer callback fiber: {}", e);
                }
            }),
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_entry_costs_no_fiber() {
        // Construction of the state block alone must not need a runtime.
        let state = Rc::new(TimerState {
            cancelled: Cell::new(false),
        });
        assert!(!state.cancelled.get());
        state.cancelled.set(true);
        assert!(state.cancelled.get());
    }
}
