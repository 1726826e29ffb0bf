//! A fiber-aware mutual exclusion lock.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Deadline;
use crate::error::{Error, Result};
use crate::fiber::spin::TicketSpinLock;
use crate::fiber::waitq::WaitNode;
use crate::sched::{self, Park};

////////////////////////////////////////////////////////////////////////////////
// RawMutex
////////////////////////////////////////////////////////////////////////////////

/// The lock mechanism without the data: a locked flag plus a strict-FIFO
/// wait queue, both guarded by a ticket spinlock so contenders on other
/// vcpus are admitted fairly.
///
/// Ownership is handed over directly: `unlock` picks the head waiter,
/// leaves the flag set and wakes the waiter, which resumes already holding
/// the lock. Recursive locking deadlocks.
pub(crate) struct RawMutex {
    lock: TicketSpinLock,
    inner: UnsafeCell<RawInner>,
}

struct RawInner {
    locked: bool,
    q: VecDeque<Arc<WaitNode>>,
}

unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    pub fn new() -> Self {
        RawMutex {
            lock: TicketSpinLock::new(),
            inner: UnsafeCell::new(RawInner {
                locked: false,
                q: VecDeque::new(),
            }),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let _guard = self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        if inner.locked {
            false
        } else {
            inner.locked = true;
            true
        }
    }

    /// Block until the lock is held, retrying through interrupts.
    pub fn acquire(&self) {
        loop {
            match self.acquire_deadline(Deadline::INFINITE) {
                Ok(()) => return,
                Err(_) => continue,
            }
        }
    }

    pub fn acquire_deadline(&self, deadline: Deadline) -> Result<()> {
        if self.try_acquire() {
            return Ok(());
        }
        loop {
            let node = WaitNode::new(sched::current_shared(), 0);
            let code = sched::park(
                Park::Wait {
                    deadline: deadline.expire_us(),
                },
                Some(&mut || {
                    let _guard = self.lock.lock();
                    let inner = unsafe { &mut *self.inner.get() };
                    if inner.locked {
                        inner.q.push_back(node.clone());
                    } else {
                        // Freed between the fast path and parking: take it
                        // and wake ourselves.
                        inner.locked = true;
                        node.try_wake();
                    }
                }),
            );

            if node.is_woken() {
                // The lock was handed to us. If we were simultaneously
                // interrupted, pass it on and report the interrupt.
                if code != 0 && code != libc::ETIMEDOUT {
                    self.release();
                    return Err(Error::Interrupted(code));
                }
                return Ok(());
            }
            if node.try_cancel() {
                match code {
                    0 => continue, // stray wake, park again
                    c if c == libc::ETIMEDOUT => return Err(Error::Timeout),
                    c => return Err(Error::Interrupted(c)),
                }
            }
            // A hand-off raced with the cancellation: the lock is ours.
            if code != 0 && code != libc::ETIMEDOUT {
                self.release();
                return Err(Error::Interrupted(code));
            }
            return Ok(());
        }
    }

    pub fn release(&self) {
        loop {
            let node = {
                let _guard = self.lock.lock();
                let inner = unsafe { &mut *self.inner.get() };
                debug_assert!(inner.locked, "release of an unlocked mutex");
                loop {
                    match inner.q.pop_front() {
                        None => {
                            inner.locked = false;
                            return;
                        }
                        Some(n) if n.is_cancelled() => continue,
                        Some(n) => break n,
                    }
                }
            };
            // Hand-off: the flag stays set for the woken waiter.
            if node.try_wake() {
                return;
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Mutex
////////////////////////////////////////////////////////////////////////////////

/// A mutual exclusion primitive useful for protecting shared data between
/// fibers.
///
/// Waiters are served in strict FIFO order; the lock may be contended from
/// other vcpus. Locking a mutex in the fiber which already holds it
/// deadlocks: recursive locking is not supported.
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use filament::fiber::mutex::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// ```
    pub fn new(t: T) -> Mutex<T> {
        Mutex {
            raw: RawMutex::new(),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex, suspending the current fiber until it is able
    /// to do so.
    ///
    /// Upon returning, the fiber is the only fiber with the lock held. An
    /// RAII guard is returned; the mutex unlocks when the guard goes out
    /// of scope.
    ///
    /// # Examples
    /// ```no_run
    /// use std::rc::Rc;
    /// use filament::fiber::{start_proc, mutex::Mutex};
    ///
    /// let mutex = Rc::new(Mutex::new(0));
    /// let c_mutex = Rc::clone(&mutex);
    ///
    /// start_proc(move || {
    ///     *c_mutex.lock() = 10;
    /// }).join();
    /// assert_eq!(*mutex.lock(), 10);
    /// ```
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.acquire();
        MutexGuard { lock: self }
    }

    /// [`lock`](Self::lock) with a deadline. Unlike `lock` this propagates
    /// interrupts instead of retrying.
    pub fn lock_timeout(&self, timeout: Duration) -> Result<MutexGuard<'_, T>> {
        self.raw
            .acquire_deadline(Deadline::after(Some(timeout)))?;
        Ok(MutexGuard { lock: self })
    }

    /// Attempts to acquire this lock without suspending.
    ///
    /// If the lock could not be acquired at this time, `None` is returned.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_acquire() {
            Some(MutexGuard { lock: self })
        } else {
            None
        }
    }

    /// Immediately drops the guard, and consequently unlocks the mutex.
    ///
    /// This is equivalent to calling [`drop`] on the guard but is more
    /// self-documenting.
    pub fn unlock(guard: MutexGuard<'_, T>) {
        drop(guard);
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Mutex` mutably, no actual locking
    /// needs to take place.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Release the lock without a guard; used by
    /// [`Cond::wait_guarded`](crate::fiber::Cond::wait_guarded) which
    /// consumes the guard before parking.
    pub(crate) fn raw_unlock(&self) {
        self.raw.release();
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(t: T) -> Self {
        Mutex::new(t)
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => {
                d.field("data", &&*guard);
            }
            None => {
                struct LockedPlaceholder;
                impl fmt::Debug for LockedPlaceholder {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("<locked>")
                    }
                }
                d.field("data", &LockedPlaceholder);
            }
        }
        d.finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// MutexGuard
////////////////////////////////////////////////////////////////////////////////

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a Mutex<T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub(crate) fn source(&self) -> &'a Mutex<T> {
        self.lock
    }
}

impl<'a, T: ?Sized + 'a> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}
