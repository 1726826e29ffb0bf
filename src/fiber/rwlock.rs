//! A fiber-aware reader-writer lock.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::clock::Deadline;
use crate::error::{Error, Result};
use crate::fiber::spin::TicketSpinLock;
use crate::fiber::waitq::WaitNode;
use crate::sched::{self, Park};

////////////////////////////////////////////////////////////////////////////////
// RwLock
////////////////////////////////////////////////////////////////////////////////

/// A reader-writer lock with separate reader and writer queues.
///
/// Writer-preferring: new readers are held back while any writer is
/// queued, and a releasing writer hands the lock to the next writer before
/// readmitting readers. Lock upgrades are not supported.
pub struct RwLock<T: ?Sized> {
    lock: TicketSpinLock,
    inner: UnsafeCell<RwInner>,
    data: UnsafeCell<T>,
}

struct RwInner {
    readers: u32,
    writer: bool,
    rq: VecDeque<Arc<WaitNode>>,
    wq: VecDeque<Arc<WaitNode>>,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

fn prune(q: &mut VecDeque<Arc<WaitNode>>) {
    while matches!(q.front(), Some(n) if n.is_cancelled()) {
        q.pop_front();
    }
}

impl<T> RwLock<T> {
    pub fn new(t: T) -> Self {
        RwLock {
            lock: TicketSpinLock::new(),
            inner: UnsafeCell::new(RwInner {
                readers: 0,
                writer: false,
                rq: VecDeque::new(),
                wq: VecDeque::new(),
            }),
            data: UnsafeCell::new(t),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Acquire shared read access, suspending while a writer holds the
    /// lock or is queued for it.
    pub fn read(&self) -> ReadGuard<'_, T> {
        loop {
            if self.acquire_read(Deadline::INFINITE).is_ok() {
                return ReadGuard { lock: self };
            }
        }
    }

    /// Acquire exclusive write access.
    pub fn write(&self) -> WriteGuard<'_, T> {
        loop {
            if self.acquire_write(Deadline::INFINITE).is_ok() {
                return WriteGuard { lock: self };
            }
        }
    }

    /// Try to acquire read access without suspending.
    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        let _guard = self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        prune(&mut inner.wq);
        if !inner.writer && inner.wq.is_empty() {
            inner.readers += 1;
            Some(ReadGuard { lock: self })
        } else {
            None
        }
    }

    /// Try to acquire write access without suspending.
    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        let _guard = self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        if !inner.writer && inner.readers == 0 {
            inner.writer = true;
            Some(WriteGuard { lock: self })
        } else {
            None
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn acquire_read(&self, deadline: Deadline) -> Result<()> {
        if self.try_read_raw() {
            return Ok(());
        }
        let node = WaitNode::new(sched::current_shared(), 0);
        let code = sched::park(
            Park::Wait {
                deadline: deadline.expire_us(),
            },
            Some(&mut || {
                let _guard = self.lock.lock();
                let inner = unsafe { &mut *self.inner.get() };
                prune(&mut inner.wq);
                if !inner.writer && inner.wq.is_empty() {
                    inner.readers += 1;
                    node.try_wake();
                } else {
                    inner.rq.push_back(node.clone());
                }
            }),
        );
        self.finish_acquire(node, code, true)
    }

    fn acquire_write(&self, deadline: Deadline) -> Result<()> {
        if self.try_write_raw() {
            return Ok(());
        }
        let node = WaitNode::new(sched::current_shared(), 0);
        let code = sched::park(
            Park::Wait {
                deadline: deadline.expire_us(),
            },
            Some(&mut || {
                let _guard = self.lock.lock();
                let inner = unsafe { &mut *self.inner.get() };
                if !inner.writer && inner.readers == 0 {
                    inner.writer = true;
                    node.try_wake();
                } else {
                    inner.wq.push_back(node.clone());
                }
            }),
        );
        self.finish_acquire(node, code, false)
    }

    fn finish_acquire(&self, node: Arc<WaitNode>, code: i32, shared: bool) -> Result<()> {
        if node.is_woken() {
            if code != 0 && code != libc::ETIMEDOUT {
                // Interrupt raced the grant: give it back.
                if shared {
                    self.release_read();
                } else {
                    self.release_write();
                }
                return Err(Error::Interrupted(code));
            }
            return Ok(());
        }
        if node.try_cancel() {
            // A cancelled head writer may unblock queued readers.
            self.wake_followers();
            match code {
                c if c == libc::ETIMEDOUT => Err(Error::Timeout),
                c => Err(Error::Interrupted(c)),
            }
        } else if code != 0 && code != libc::ETIMEDOUT {
            if shared {
                self.release_read();
            } else {
                self.release_write();
            }
            Err(Error::Interrupted(code))
        } else {
            Ok(())
        }
    }

    fn try_read_raw(&self) -> bool {
        let _guard = self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        prune(&mut inner.wq);
        if !inner.writer && inner.wq.is_empty() {
            inner.readers += 1;
            true
        } else {
            false
        }
    }

    fn try_write_raw(&self) -> bool {
        let _guard = self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        if !inner.writer && inner.readers == 0 {
            inner.writer = true;
            true
        } else {
            false
        }
    }

    fn release_read(&self) {
        let _guard = self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        debug_assert!(inner.readers > 0);
        inner.readers -= 1;
        if inner.readers == 0 && !inner.writer {
            Self::admit(inner);
        }
    }

    fn release_write(&self) {
        let _guard = self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        debug_assert!(inner.writer);
        inner.writer = false;
        Self::admit(inner);
    }

    fn wake_followers(&self) {
        let _guard = self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        if !inner.writer && inner.readers == 0 {
            Self::admit(inner);
        } else if !inner.writer {
            // Readers may proceed if no live writer remains queued.
            prune(&mut inner.wq);
            if inner.wq.is_empty() {
                Self::admit_readers(inner);
            }
        }
    }

    /// Pick who runs next: the next queued writer, otherwise every queued
    /// reader.
    fn admit(inner: &mut RwInner) {
        loop {
            prune(&mut inner.wq);
            match inner.wq.pop_front() {
                Some(writer) => {
                    if inner.readers == 0 {
                        if writer.try_wake() {
                            inner.writer = true;
                            return;
                        }
                        // cancelled under us, try the next one
                    } else {
                        // Readers still inside; put the writer back and
                        // wait for the last reader to leave.
                        inner.wq.push_front(writer);
                        return;
                    }
                }
                None => {
                    Self::admit_readers(inner);
                    return;
                }
            }
        }
    }

    fn admit_readers(inner: &mut RwInner) {
        for node in inner.rq.drain(..) {
            if node.try_wake() {
                inner.readers += 1;
            }
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_read() {
            Some(guard) => f.debug_struct("RwLock").field("data", &&*guard).finish(),
            None => f.write_str("RwLock { <locked> }"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// guards
////////////////////////////////////////////////////////////////////////////////

pub struct ReadGuard<'a, T: ?Sized + 'a> {
    lock: &'a RwLock<T>,
}

impl<'a, T: ?Sized> Drop for ReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

impl<T: ?Sized> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

pub struct WriteGuard<'a, T: ?Sized + 'a> {
    lock: &'a RwLock<T>,
}

impl<'a, T: ?Sized> Drop for WriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

impl<T: ?Sized> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}
