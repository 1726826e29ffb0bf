//! Wait-queue plumbing shared by the fiber-aware sync primitives.
//!
//! Every blocked fiber is represented by a [`WaitNode`] pushed onto the
//! primitive's queue. The node's state is the single removal point for all
//! wake paths: a signaller moves it `Waiting -> Woken` and interrupts the
//! fiber; a timed-out or interrupted waiter moves it `Waiting -> Cancelled`
//! and the queue skips it lazily. Whichever transition wins the CAS owns
//! the outcome, so a fiber can neither be woken twice nor lost.
//!
//! Queues are guarded by a [`TicketSpinLock`](super::spin::TicketSpinLock)
//! because signallers may live on other vcpus or plain OS threads; the
//! guarded sections never suspend.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::sched::{self, FiberShared};

const WAITING: u8 = 0;
const WOKEN: u8 = 1;
const CANCELLED: u8 = 2;

pub(crate) struct WaitNode {
    fiber: Arc<FiberShared>,
    /// Requested amount, used by the semaphore; 0 elsewhere.
    pub n: u64,
    state: AtomicU8,
}

impl WaitNode {
    pub fn new(fiber: Arc<FiberShared>, n: u64) -> Arc<Self> {
        Arc::new(WaitNode {
            fiber,
            n,
            state: AtomicU8::new(WAITING),
        })
    }

    /// Claim the node for a wake and interrupt its fiber with code 0.
    /// Returns `false` if the waiter already cancelled (or was woken).
    pub fn try_wake(&self) -> bool {
        if self
            .state
            .compare_exchange(WAITING, WOKEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            sched::interrupt_shared(&self.fiber, 0);
            true
        } else {
            false
        }
    }

    /// Claim the node for cancellation (timeout or interrupt). Returns
    /// `false` if a wake won the race, in which case the wake's effect
    /// (lock ownership, permits) belongs to this fiber after all.
    pub fn try_cancel(&self) -> bool {
        self.state
            .compare_exchange(WAITING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_woken(&self) -> bool {
        self.state.load(Ordering::Acquire) == WOKEN
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}
