//! Bounded channels between fibers of one vcpu.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use crate::clock::Deadline;
use crate::fiber::Cond;

////////////////////////////////////////////////////////////////////////////////
// Channel
////////////////////////////////////////////////////////////////////////////////

struct Chan<T> {
    buffer: RefCell<VecDeque<T>>,
    capacity: usize,
    tx_count: Cell<usize>,
    rx_count: Cell<usize>,
    not_empty: Cond,
    not_full: Cond,
}

impl<T> Chan<T> {
    fn send(&self, t: T, deadline: Deadline) -> Result<(), SendError<T>> {
        if self.rx_count.get() == 0 {
            // There's no way to create new receivers once their count gets
            // to 0.
            return Err(SendError::Disconnected(t));
        }
        loop {
            if self.rx_count.get() == 0 {
                return Err(SendError::Disconnected(t));
            }
            {
                let mut buffer = self.buffer.borrow_mut();
                if buffer.len() < self.capacity {
                    buffer.push_back(t);
                    drop(buffer);
                    self.not_empty.signal();
                    return Ok(());
                }
            }
            if self.not_full.wait_deadline(deadline).is_err() {
                return Err(SendError::Timeout(t));
            }
        }
    }

    fn recv(&self, deadline: Deadline) -> Result<T, RecvError> {
        loop {
            if let Some(t) = self.buffer.borrow_mut().pop_front() {
                self.not_full.signal();
                return Ok(t);
            }
            if self.tx_count.get() == 0 {
                // There's no way to create new senders once their count
                // gets to 0.
                return Err(RecvError::Disconnected);
            }
            if self.not_empty.wait_deadline(deadline).is_err() {
                return Err(RecvError::Timeout);
            }
        }
    }
}

/// Creates a new bounded channel for fibers of the current vcpu, returning
/// the sender/receiver halves.
///
/// `send` suspends the calling fiber while the buffer is full, `recv`
/// while it is empty. Values arrive in the order they were sent.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    assert!(capacity > 0, "channel capacity must be positive");
    let chan = Rc::new(Chan {
        buffer: RefCell::new(VecDeque::with_capacity(capacity)),
        capacity,
        tx_count: Cell::new(1),
        rx_count: Cell::new(1),
        not_empty: Cond::new(),
        not_full: Cond::new(),
    });
    (Sender(chan.clone()), Receiver(chan))
}

////////////////////////////////////////////////////////////////////////////////
// Sender
////////////////////////////////////////////////////////////////////////////////

/// The sending half of a channel. Can be cloned.
pub struct Sender<T>(Rc<Chan<T>>);

impl<T> Sender<T> {
    /// Send a message over the channel, suspending while the buffer is
    /// full.
    ///
    /// In case all receivers are gone the value is handed back in the
    /// error so the caller has an option to reuse it.
    pub fn send(&self, t: T) -> Result<(), T> {
        self.0.send(t, Deadline::INFINITE).map_err(|e| match e {
            SendError::Timeout(_) => unreachable!("infinite deadline timed out"),
            SendError::Disconnected(t) => t,
        })
    }

    pub fn send_timeout(&self, t: T, timeout: Duration) -> Result<(), SendError<T>> {
        self.0.send(t, Deadline::after(Some(timeout)))
    }

    pub fn try_send(&self, t: T) -> Result<(), TrySendError<T>> {
        if self.0.rx_count.get() == 0 {
            return Err(TrySendError::Disconnected(t));
        }
        let mut buffer = self.0.buffer.borrow_mut();
        if buffer.len() >= self.0.capacity {
            return Err(TrySendError::Full(t));
        }
        buffer.push_back(t);
        drop(buffer);
        self.0.not_empty.signal();
        Ok(())
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.0.tx_count.set(self.0.tx_count.get() + 1);
        Sender(self.0.clone())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let left = self.0.tx_count.get() - 1;
        self.0.tx_count.set(left);
        if left == 0 {
            self.0.not_empty.broadcast();
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError<T> {
    Timeout(T),
    Disconnected(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Timeout(t) | Self::Disconnected(t) => t,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TrySendError<T> {
    Full(T),
    Disconnected(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(t) | Self::Disconnected(t) => t,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Receiver
////////////////////////////////////////////////////////////////////////////////

/// The receiving half of a channel. Can be cloned.
pub struct Receiver<T>(Rc<Chan<T>>);

impl<T> Receiver<T> {
    /// Wait for a value, returning `None` when all senders are gone and
    /// the buffer has drained.
    pub fn recv(&self) -> Option<T> {
        match self.0.recv(Deadline::INFINITE) {
            Ok(t) => Some(t),
            Err(RecvError::Timeout) => unreachable!("infinite deadline timed out"),
            Err(RecvError::Disconnected) => None,
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvError> {
        self.0.recv(Deadline::after(Some(timeout)))
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        if let Some(t) = self.0.buffer.borrow_mut().pop_front() {
            self.0.not_full.signal();
            return Ok(t);
        }
        if self.0.tx_count.get() == 0 {
            Err(TryRecvError::Disconnected)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter { rx: self }
    }

    pub fn try_iter(&self) -> TryIter<'_, T> {
        TryIter { rx: self }
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.0.rx_count.set(self.0.rx_count.get() + 1);
        Receiver(self.0.clone())
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let left = self.0.rx_count.get() - 1;
        self.0.rx_count.set(left);
        if left == 0 {
            self.0.not_full.broadcast();
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecvError {
    Timeout,
    Disconnected,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

pub struct Iter<'a, T: 'a> {
    rx: &'a Receiver<T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.recv()
    }
}

impl<'a, T> IntoIterator for &'a Receiver<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

pub struct TryIter<'a, T: 'a> {
    rx: &'a Receiver<T>,
}

impl<'a, T> Iterator for TryIter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

pub struct IntoIter<T> {
    rx: Receiver<T>,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.recv()
    }
}

impl<T> IntoIterator for Receiver<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter { rx: self }
    }
}
