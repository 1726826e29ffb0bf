//! The cascading event engine: a user-visible readiness aggregator.
//!
//! Unlike the master engine, interests registered here are persistent and
//! readiness is harvested in batches by a single waiter. The engine nests
//! its own multiplexer descriptor under the master engine, so the waiting
//! fiber parks exactly like any fd waiter; meanwhile other fibers keep
//! running.
//!
//! Typical use is a connection pool watching many idle sockets for peer
//! close without dedicating a fiber to each.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{Backend, Events};
use crate::coio;
use crate::error::{Error, Result};

/// An fd + event-mask + user-data registration.
#[derive(Debug, Clone, Copy)]
pub struct Interest {
    pub fd: RawFd,
    pub events: Events,
    pub data: u64,
}

#[derive(Default)]
struct FdInterest {
    read: Option<Slot>,
    write: Option<Slot>,
    error: Option<Slot>,
}

#[derive(Clone, Copy)]
struct Slot {
    data: u64,
    one_shot: bool,
}

impl FdInterest {
    fn mask(&self) -> Events {
        let mut mask = Events::empty();
        if self.read.is_some() {
            mask |= Events::READ;
        }
        if self.write.is_some() {
            mask |= Events::WRITE;
        }
        if self.error.is_some() {
            mask |= Events::ERROR;
        }
        mask
    }

    fn is_empty(&self) -> bool {
        self.mask().is_empty()
    }
}

/// A persistent-interest event aggregator.
///
/// The reference design permits a single waiter: concurrent
/// [`wait_for_events`](Self::wait_for_events) calls from two fibers are
/// rejected as a programming error.
pub struct CascadingEngine {
    backend: Backend,
    interests: RefCell<HashMap<RawFd, FdInterest>>,
    waiting: Cell<bool>,
}

impl CascadingEngine {
    pub fn new() -> Result<Self> {
        Ok(CascadingEngine {
            backend: Backend::new()?,
            interests: RefCell::new(HashMap::new()),
            waiting: Cell::new(false),
        })
    }

    /// Register (or extend) an interest. `ONE_SHOT` in `events` makes the
    /// registered directions auto-remove after firing once.
    pub fn add_interest(&self, interest: Interest) -> Result<()> {
        let one_shot = interest.events.contains(Events::ONE_SHOT);
        let slot = Slot {
            data: interest.data,
            one_shot,
        };
        let mut interests = self.interests.borrow_mut();
        let entry = interests.entry(interest.fd).or_default();
        if interest.events.contains(Events::READ) {
            entry.read = Some(slot);
        }
        if interest.events.contains(Events::WRITE) {
            entry.write = Some(slot);
        }
        if interest.events.contains(Events::ERROR) {
            entry.error = Some(slot);
        }
        let mask = entry.mask();
        if mask.is_empty() {
            return Err(Error::BadState("interest without any event bits"));
        }
        self.backend
            .add(interest.fd, mask, interest.fd as u64, false)?;
        Ok(())
    }

    /// Drop the given directions of an interest.
    pub fn rm_interest(&self, interest: Interest) -> Result<()> {
        let mut interests = self.interests.borrow_mut();
        let entry = match interests.get_mut(&interest.fd) {
            Some(e) => e,
            None => return Err(Error::BadState("no such interest")),
        };
        if interest.events.contains(Events::READ) {
            entry.read = None;
        }
        if interest.events.contains(Events::WRITE) {
            entry.write = None;
        }
        if interest.events.contains(Events::ERROR) {
            entry.error = None;
        }
        let mask = entry.mask();
        if mask.is_empty() {
            interests.remove(&interest.fd);
            self.backend.del(interest.fd)?;
        } else {
            self.backend
                .add(interest.fd, mask, interest.fd as u64, false)?;
        }
        Ok(())
    }

    /// Suspend until at least one registered interest fires, then deliver
    /// up to `out.len()` user-data values. Returns the number delivered.
    ///
    /// Events that do not fit in `out` are not lost: interests are level
    /// triggered and re-reported on the next call.
    pub fn wait_for_events(&self, out: &mut [u64], timeout: Option<Duration>) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.waiting.replace(true) {
            return Err(Error::BadState(
                "cascading engine supports a single waiter",
            ));
        }
        let result = self.wait_inner(out, timeout);
        self.waiting.set(false);
        result
    }

    fn wait_inner(&self, out: &mut [u64], timeout: Option<Duration>) -> Result<usize> {
        coio::wait_for_fd(self.backend.fd(), Events::READ, timeout)?;

        let mut n = 0;
        let mut fired_one_shots: Vec<(RawFd, Events)> = Vec::new();
        {
            let interests = self.interests.borrow();
            self.backend.poll(0, &mut |data, fired| {
                let fd = data as RawFd;
                let Some(entry) = interests.get(&fd) else {
                    return;
                };
                for (bit, slot) in [
                    (Events::READ, &entry.read),
                    (Events::WRITE, &entry.write),
                    (Events::ERROR, &entry.error),
                ] {
                    if !fired.contains(bit) {
                        continue;
                    }
                    let Some(slot) = slot else { continue };
                    if n < out.len() {
                        out[n] = slot.data;
                        n += 1;
                        if slot.one_shot {
                            fired_one_shots.push((fd, bit));
                        }
                    }
                }
            })?;
        }
        for (fd, bit) in fired_one_shots {
            let _ = self.rm_interest(Interest {
                fd,
                events: bit,
                data: 0,
            });
        }
        Ok(n)
    }
}

impl std::fmt::Debug for CascadingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CascadingEngine")
            .field("interests", &self.interests.borrow().len())
            .finish_non_exhaustive()
    }
}
