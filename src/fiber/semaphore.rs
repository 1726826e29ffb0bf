//! A fiber-aware counting semaphore.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Deadline;
use crate::error::{Error, Result};
use crate::fiber::spin::TicketSpinLock;
use crate::fiber::waitq::WaitNode;
use crate::sched::{self, Park};

/// A counting semaphore whose waiters each request an amount of permits.
///
/// `wait(n)` suspends until at least `n` permits are available, then takes
/// them. Waiters are satisfied in strict FIFO order with **no
/// overtaking**: while the head waiter's request cannot be met, later
/// waiters are not satisfied even if their smaller requests would fit.
///
/// Both ends work across vcpus, so a semaphore is also the hand-off point
/// between runtimes (the work pool signals task availability through one).
pub struct Semaphore {
    lock: TicketSpinLock,
    inner: UnsafeCell<SemInner>,
}

struct SemInner {
    count: u64,
    q: VecDeque<Arc<WaitNode>>,
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Create a semaphore holding `count` permits.
    pub fn new(count: u64) -> Self {
        Semaphore {
            lock: TicketSpinLock::new(),
            inner: UnsafeCell::new(SemInner {
                count,
                q: VecDeque::new(),
            }),
        }
    }

    /// Permits currently available (racy outside of external
    /// serialization; useful for diagnostics).
    pub fn available(&self) -> u64 {
        let _guard = self.lock.lock();
        unsafe { &*self.inner.get() }.count
    }

    /// Add `k` permits and satisfy as many head waiters as they cover, in
    /// FIFO order. Never yields. Signalling with no waiters just grows the
    /// count.
    pub fn signal(&self, k: u64) {
        {
            let _guard = self.lock.lock();
            let inner = unsafe { &mut *self.inner.get() };
            inner.count = inner.count.saturating_add(k);
        }
        self.drain();
    }

    /// Take `n` permits, suspending until they are available.
    /// `wait(0)` returns immediately.
    pub fn wait(&self, n: u64) -> Result<()> {
        self.wait_deadline(n, Deadline::INFINITE)
    }

    /// [`wait`](Self::wait) with a timeout.
    pub fn wait_timeout(&self, n: u64, timeout: Duration) -> Result<()> {
        self.wait_deadline(n, Deadline::after(Some(timeout)))
    }

    /// Take `n` permits without suspending, if immediately possible and no
    /// earlier waiter is queued.
    pub fn try_wait(&self, n: u64) -> bool {
        let _guard = self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        Self::prune_cancelled(inner);
        if inner.q.is_empty() && inner.count >= n {
            inner.count -= n;
            true
        } else {
            false
        }
    }

    pub fn wait_deadline(&self, n: u64, deadline: Deadline) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        loop {
            let node = WaitNode::new(sched::current_shared(), n);
            let code = sched::park(
                Park::Wait {
                    deadline: deadline.expire_us(),
                },
                Some(&mut || {
                    let _guard = self.lock.lock();
                    let inner = unsafe { &mut *self.inner.get() };
                    Self::prune_cancelled(inner);
                    if inner.q.is_empty() && inner.count >= n {
                        // Grant on the spot and wake ourselves.
                        inner.count -= n;
                        node.try_wake();
                    } else {
                        inner.q.push_back(node.clone());
                    }
                }),
            );

            if node.is_woken() {
                // Permits were assigned to us. An interrupt that raced the
                // grant returns them and still reports the interrupt.
                if code != 0 && code != libc::ETIMEDOUT {
                    self.signal(n);
                    return Err(Error::Interrupted(code));
                }
                return Ok(());
            }
            if node.try_cancel() {
                // Our node may have been the head blocking smaller
                // requests behind it.
                self.drain();
                match code {
                    0 => continue, // stray wake, park again
                    c if c == libc::ETIMEDOUT => return Err(Error::Timeout),
                    c => return Err(Error::Interrupted(c)),
                }
            }
            // Grant raced the cancellation: same as the woken case.
            if code != 0 && code != libc::ETIMEDOUT {
                self.signal(n);
                return Err(Error::Interrupted(code));
            }
            return Ok(());
        }
    }

    fn prune_cancelled(inner: &mut SemInner) {
        while matches!(inner.q.front(), Some(n) if n.is_cancelled()) {
            inner.q.pop_front();
        }
    }

    /// Satisfy head waiters while the count covers them.
    fn drain(&self) {
        loop {
            let node = {
                let _guard = self.lock.lock();
                let inner = unsafe { &mut *self.inner.get() };
                Self::prune_cancelled(inner);
                match inner.q.front() {
                    Some(head) if head.n <= inner.count => {
                        let node = inner.q.pop_front().unwrap();
                        inner.count -= node.n;
                        node
                    }
                    // No overtaking: an unsatisfiable head blocks the rest.
                    _ => return,
                }
            };
            if !node.try_wake() {
                // Cancelled after we deducted its permits: refund and keep
                // draining.
                let _guard = self.lock.lock();
                let inner = unsafe { &mut *self.inner.get() };
                inner.count = inner.count.saturating_add(node.n);
            }
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}
