//! Out-of-order execution engine.
//!
//! Coordinates many in-flight operations on one transport when responses
//! may come back in any order. Each operation goes through three phases:
//!
//! 1. **issue** - serialized across all submissions on the engine, which
//!    fixes the order requests hit the wire;
//! 2. **completion** - driven by whichever waiting fiber currently holds
//!    the *reader* role: it runs the caller-supplied header read, and the
//!    resulting tag picks the operation the completion belongs to;
//! 3. **collect** - runs on the issuing fiber, inside the engine's
//!    critical section (the reader role stays taken), before the tag is
//!    released.
//!
//! There is no dedicated reader fiber: the first waiter reads; a
//! completion for somebody else is parked in that waiter's slot and the
//! owner is signalled, while the reader blocks until the owner has
//! collected its body and released the stream.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::clock::Deadline;
use crate::error::{Error, Result};
use crate::fiber::mutex::RawMutex;
use crate::fiber::Cond;
use crate::rpc::Header;

struct Slot {
    cond: Cond,
    header: Cell<Option<Header>>,
}

struct Inner {
    waiters: HashMap<u64, Rc<Slot>>,
    /// A fiber is currently reading from the transport, or a routed
    /// completion is being collected.
    reading: bool,
    /// The transport failed; every current and future operation reports
    /// `ConnectionReset`.
    broken: bool,
}

/// The completion coordinator. One per transport; local to its vcpu.
pub struct Engine {
    issue_lock: RawMutex,
    inner: RefCell<Inner>,
    /// Signalled when the reader role frees up.
    read_done: Cond,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            issue_lock: RawMutex::new(),
            inner: RefCell::new(Inner {
                waiters: HashMap::new(),
                reading: false,
                broken: false,
            }),
            read_done: Cond::new(),
        }
    }

    /// In-flight operation count.
    pub fn queue_count(&self) -> usize {
        self.inner.borrow().waiters.len()
    }

    /// Register `tag` and run `issue` under the engine's issue order.
    ///
    /// Two in-flight operations with one tag are a caller bug: the second
    /// submission is rejected. An `issue` failure marks the transport
    /// broken and fails every waiter.
    pub fn submit(&self, tag: u64, issue: impl FnOnce() -> Result<()>) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.broken {
                return Err(Error::ConnectionReset);
            }
            if inner.waiters.contains_key(&tag) {
                return Err(Error::BadState("tag already has an operation in flight"));
            }
            inner.waiters.insert(
                tag,
                Rc::new(Slot {
                    cond: Cond::new(),
                    header: Cell::new(None),
                }),
            );
        }
        self.issue_lock.acquire();
        let result = issue();
        self.issue_lock.release();
        if let Err(e) = &result {
            self.inner.borrow_mut().waiters.remove(&tag);
            // A clean pre-send timeout leaves the transport intact; any
            // real send failure poisons it.
            if !matches!(e, Error::Timeout) {
                self.fail_all();
            }
        }
        result
    }

    /// Wait for the completion matching `tag`.
    ///
    /// `read_completion` reads the next frame header off the transport;
    /// `discard` consumes the body of a frame whose tag matches no waiter
    /// (e.g. one abandoned by a timed-out caller). Both run on whichever
    /// fiber holds the reader role.
    pub fn wait_completion(
        &self,
        tag: u64,
        deadline: Deadline,
        read_completion: &mut dyn FnMut() -> Result<Header>,
        discard: &mut dyn FnMut(&Header) -> Result<()>,
    ) -> Result<Header> {
        loop {
            enum Role {
                Collect(Header),
                Reader,
                Sleeper(Rc<Slot>),
            }

            let role = {
                let mut inner = self.inner.borrow_mut();
                if inner.broken {
                    inner.waiters.remove(&tag);
                    return Err(Error::ConnectionReset);
                }
                let slot = inner
                    .waiters
                    .get(&tag)
                    .expect("wait_completion for a tag that was not submitted")
                    .clone();
                if let Some(header) = slot.header.take() {
                    // Keep `reading` set: the stream now carries our body.
                    Role::Collect(header)
                } else if !inner.reading {
                    inner.reading = true;
                    Role::Reader
                } else {
                    Role::Sleeper(slot)
                }
            };

            match role {
                Role::Collect(header) => return Ok(header),
                Role::Sleeper(slot) => match slot.cond.wait_deadline(deadline) {
                    Ok(()) => continue,
                    Err(e) => {
                        let mut inner = self.inner.borrow_mut();
                        if let Some(header) = slot.header.take() {
                            // The completion landed while we were timing
                            // out; it wins.
                            return Ok(header);
                        }
                        inner.waiters.remove(&tag);
                        return Err(e);
                    }
                },
                Role::Reader => {
                    if let Some(header) = self.read_as_reader(tag, read_completion, discard)? {
                        return Ok(header);
                    }
                    // Routed to somebody else; re-decide after the
                    // collector is finished.
                }
            }
        }
    }

    /// Run the collect phase on the issuing fiber and release the tag.
    pub fn collect<R>(&self, tag: u64, collect: impl FnOnce() -> Result<R>) -> Result<R> {
        let result = collect();
        self.inner.borrow_mut().waiters.remove(&tag);
        if result.is_err() {
            self.fail_all();
        } else {
            self.release_reader();
        }
        result
    }

    /// Read frames until one is ours (return `Some`) or one was routed to
    /// another waiter (return `None`, reader role handed over).
    fn read_as_reader(
        &self,
        tag: u64,
        read_completion: &mut dyn FnMut() -> Result<Header>,
        discard: &mut dyn FnMut(&Header) -> Result<()>,
    ) -> Result<Option<Header>> {
        loop {
            let header = match read_completion() {
                Ok(header) => header,
                Err(Error::Timeout) => {
                    // Our deadline ran out while the stream sat idle at a
                    // frame boundary: abandon the wait, keep the engine
                    // healthy.
                    self.inner.borrow_mut().waiters.remove(&tag);
                    self.release_reader();
                    return Err(Error::Timeout);
                }
                Err(e) => {
                    self.inner.borrow_mut().waiters.remove(&tag);
                    self.fail_all();
                    return Err(e);
                }
            };
            if header.tag == tag {
                // Ours; `reading` stays set until `collect`.
                return Ok(Some(header));
            }
            let routed = {
                let inner = self.inner.borrow();
                match inner.waiters.get(&header.tag) {
                    Some(slot) => {
                        slot.header.set(Some(header));
                        slot.cond.signal();
                        true
                    }
                    None => false,
                }
            };
            if routed {
                // Hand the stream to the owner; wake up when it has
                // collected.
                self.read_done.wait();
                return Ok(None);
            }
            // No waiter for this tag (abandoned by a timeout): drop the
            // body and keep reading.
            if let Err(e) = discard(&header) {
                self.inner.borrow_mut().waiters.remove(&tag);
                self.fail_all();
                return Err(e);
            }
        }
    }

    fn release_reader(&self) {
        self.inner.borrow_mut().reading = false;
        self.read_done.signal();
        // No reader-in-waiting is guaranteed to exist; promote an
        // arbitrary sleeper so the engine never sits readerless.
        let slot = {
            let inner = self.inner.borrow();
            inner.waiters.values().next().cloned()
        };
        if let Some(slot) = slot {
            slot.cond.signal();
        }
    }

    fn fail_all(&self) {
        let slots: Vec<Rc<Slot>> = {
            let mut inner = self.inner.borrow_mut();
            inner.broken = true;
            inner.reading = false;
            inner.waiters.values().cloned().collect()
        };
        for slot in slots {
            slot.cond.broadcast();
        }
        self.read_done.broadcast();
    }
}
