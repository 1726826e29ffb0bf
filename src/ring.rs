//! Bounded lock-free ring buffers.
//!
//! Three variants share one power-of-two geometry: head and tail are
//! free-running counters, the cell index is `counter & mask` and the
//! generation is `counter >> shift`.
//!
//! - [`MpmcRing`] - multi-producer multi-consumer, turn-based slots;
//! - [`SpscRing`] - single producer, single consumer, no per-slot state;
//! - [`MpscRing`] - multi-producer single-consumer: an [`SpscRing`] with
//!   the producer side serialized by a ticket lock. Used for cross-vcpu
//!   wake delivery.
//!
//! Busy-waits are bounded loops parameterized by a [`Pause`] strategy, so
//! the same ring works from a raw OS thread (CPU pause), between runtimes
//! (OS yield) and inside a vcpu (cooperative fiber yield).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::fiber::spin::TicketSpinLock;

////////////////////////////////////////////////////////////////////////////////
// Pause
////////////////////////////////////////////////////////////////////////////////

/// Strategy for the bounded busy-waits of [`send`](MpmcRing::send) /
/// [`recv`](MpmcRing::recv).
pub trait Pause {
    fn pause();
}

/// Emit the CPU pause instruction. For waits shorter than a context switch.
pub struct CpuPause;

impl Pause for CpuPause {
    #[inline(always)]
    fn pause() {
        std::hint::spin_loop();
    }
}

/// Yield the OS thread. For callers outside any runtime.
pub struct ThreadPause;

impl Pause for ThreadPause {
    #[inline(always)]
    fn pause() {
        std::thread::yield_now();
    }
}

/// Yield the current fiber. For callers inside a vcpu; keeps the rest of
/// the run queue making progress while the ring is contended.
pub struct FiberPause;

impl Pause for FiberPause {
    #[inline(always)]
    fn pause() {
        crate::fiber::yield_now();
    }
}

////////////////////////////////////////////////////////////////////////////////
// geometry
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy)]
struct Geometry {
    mask: u64,
    shift: u32,
}

impl Geometry {
    fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity >= 2,
            "ring capacity must be a power of two >= 2"
        );
        Geometry {
            mask: capacity as u64 - 1,
            shift: capacity.trailing_zeros(),
        }
    }

    #[inline(always)]
    fn capacity(&self) -> u64 {
        self.mask + 1
    }

    #[inline(always)]
    fn idx(&self, c: u64) -> usize {
        (c & self.mask) as usize
    }

    #[inline(always)]
    fn turn(&self, c: u64) -> u64 {
        c >> self.shift
    }
}

////////////////////////////////////////////////////////////////////////////////
// MpmcRing
////////////////////////////////////////////////////////////////////////////////

#[repr(align(64))]
struct Slot<T> {
    turn: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

#[repr(align(64))]
struct CachePadded<T>(T);

/// Bounded multi-producer multi-consumer ring.
///
/// Each slot carries a `turn` counter. A producer at counter `c` claims the
/// slot once its turn equals `2·gen(c)` and publishes `2·gen(c) + 1`; a
/// consumer waits for `2·gen(c) + 1` and publishes `2·gen(c) + 2`. The turn
/// of a slot is therefore non-decreasing for the lifetime of the ring.
pub struct MpmcRing<T> {
    geo: Geometry,
    tail: CachePadded<AtomicU64>,
    head: CachePadded<AtomicU64>,
    slots: Box<[Slot<T>]>,
}

unsafe impl<T: Send> Send for MpmcRing<T> {}
unsafe impl<T: Send> Sync for MpmcRing<T> {}

impl<T> MpmcRing<T> {
    /// Create a ring with `capacity` slots. `capacity` must be a power of
    /// two, at least 2.
    pub fn new(capacity: usize) -> Self {
        let geo = Geometry::new(capacity);
        let slots = (0..capacity)
            .map(|_| Slot {
                turn: AtomicU64::new(0),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        MpmcRing {
            geo,
            tail: CachePadded(AtomicU64::new(0)),
            head: CachePadded(AtomicU64::new(0)),
            slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.geo.capacity() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head.0.load(Ordering::Acquire) >= self.tail.0.load(Ordering::Acquire)
    }

    /// Try to push; returns the value back if the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut t = self.tail.0.load(Ordering::Acquire);
        loop {
            let slot = &self.slots[self.geo.idx(t)];
            if slot.turn.load(Ordering::Acquire) == self.geo.turn(t) * 2 {
                match self
                    .tail
                    .0
                    .compare_exchange_weak(t, t + 1, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.turn
                            .store(self.geo.turn(t) * 2 + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(cur) => t = cur,
                }
            } else {
                let prev = t;
                t = self.tail.0.load(Ordering::Acquire);
                if t == prev {
                    return Err(value);
                }
            }
        }
    }

    /// Try to pop; `None` if the ring is empty.
    pub fn pop(&self) -> Option<T> {
        let mut h = self.head.0.load(Ordering::Acquire);
        loop {
            let slot = &self.slots[self.geo.idx(h)];
            if slot.turn.load(Ordering::Acquire) == self.geo.turn(h) * 2 + 1 {
                match self
                    .head
                    .0
                    .compare_exchange_weak(h, h + 1, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.turn
                            .store(self.geo.turn(h) * 2 + 2, Ordering::Release);
                        return Some(value);
                    }
                    Err(cur) => h = cur,
                }
            } else {
                let prev = h;
                h = self.head.0.load(Ordering::Acquire);
                if h == prev {
                    return None;
                }
            }
        }
    }

    /// Push, spinning with `P` while the ring is full.
    pub fn send<P: Pause>(&self, mut value: T) {
        loop {
            match self.push(value) {
                Ok(()) => return,
                Err(v) => {
                    value = v;
                    P::pause();
                }
            }
        }
    }

    /// Pop, spinning with `P` while the ring is empty.
    pub fn recv<P: Pause>(&self) -> T {
        loop {
            match self.pop() {
                Some(v) => return v,
                None => P::pause(),
            }
        }
    }
}

impl<T> Drop for MpmcRing<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

////////////////////////////////////////////////////////////////////////////////
// SpscRing
////////////////////////////////////////////////////////////////////////////////

/// Bounded single-producer single-consumer ring. No per-slot state; the
/// head/tail counters alone provide the acquire/release hand-off.
pub struct SpscRing<T> {
    geo: Geometry,
    tail: CachePadded<AtomicU64>,
    head: CachePadded<AtomicU64>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    pub fn new(capacity: usize) -> Self {
        let geo = Geometry::new(capacity);
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        SpscRing {
            geo,
            tail: CachePadded(AtomicU64::new(0)),
            head: CachePadded(AtomicU64::new(0)),
            slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.geo.capacity() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head.0.load(Ordering::Acquire) >= self.tail.0.load(Ordering::Acquire)
    }

    /// Try to push; returns the value back if the ring is full.
    ///
    /// Must only be called from one producer at a time.
    pub fn push(&self, value: T) -> Result<(), T> {
        let t = self.tail.0.load(Ordering::Relaxed);
        let h = self.head.0.load(Ordering::Acquire);
        if t - h >= self.geo.capacity() {
            return Err(value);
        }
        unsafe { (*self.slots[self.geo.idx(t)].get()).write(value) };
        self.tail.0.store(t + 1, Ordering::Release);
        Ok(())
    }

    /// Try to pop; `None` if the ring is empty.
    ///
    /// Must only be called from one consumer at a time.
    pub fn pop(&self) -> Option<T> {
        let h = self.head.0.load(Ordering::Relaxed);
        let t = self.tail.0.load(Ordering::Acquire);
        if h >= t {
            return None;
        }
        let value = unsafe { (*self.slots[self.geo.idx(h)].get()).assume_init_read() };
        self.head.0.store(h + 1, Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

////////////////////////////////////////////////////////////////////////////////
// MpscRing
////////////////////////////////////////////////////////////////////////////////

/// Bounded multi-producer single-consumer ring: an [`SpscRing`] whose
/// producer side is serialized by a ticket lock. The consumer side is
/// wait-free.
pub struct MpscRing<T> {
    inner: SpscRing<T>,
    producer_lock: TicketSpinLock,
}

unsafe impl<T: Send> Send for MpscRing<T> {}
unsafe impl<T: Send> Sync for MpscRing<T> {}

impl<T> MpscRing<T> {
    pub fn new(capacity: usize) -> Self {
        MpscRing {
            inner: SpscRing::new(capacity),
            producer_lock: TicketSpinLock::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Try to push from any thread; returns the value back if full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let _lock = self.producer_lock.lock();
        self.inner.push(value)
    }

    /// Push, spinning with `P` while the ring is full. Under sustained
    /// overload this degrades in latency, not correctness.
    pub fn send<P: Pause>(&self, mut value: T) {
        loop {
            match self.push(value) {
                Ok(()) => return,
                Err(v) => {
                    value = v;
                    P::pause();
                }
            }
        }
    }

    /// Try to pop; single consumer only.
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    #[should_panic]
    fn capacity_must_be_power_of_two() {
        let _ = MpmcRing::<u32>::new(3);
    }

    #[test]
    fn fifo_order_single_thread() {
        let ring = MpmcRing::new(4);
        for i in 0..4 {
            ring.push(i).unwrap();
        }
        assert!(ring.push(99).is_err());
        for i in 0..4 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn turn_survives_wraparound() {
        let ring = MpmcRing::new(2);
        for round in 0..100 {
            ring.push(round).unwrap();
            ring.push(round + 1).unwrap();
            assert_eq!(ring.pop(), Some(round));
            assert_eq!(ring.pop(), Some(round + 1));
        }
    }

    #[test]
    fn spsc_counts() {
        let ring = SpscRing::new(8);
        assert!(ring.is_empty());
        for i in 0..8 {
            ring.push(i).unwrap();
        }
        assert!(ring.push(8).is_err());
        for i in 0..8 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn mpmc_threads_drain_everything() {
        const PER_PRODUCER: u64 = 10_000;
        let ring = Arc::new(MpmcRing::new(64));
        let mut handles = Vec::new();
        for p in 0..4u64 {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    ring.send::<ThreadPause>(p * PER_PRODUCER + i);
                }
            }));
        }
        let consumer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut seen = vec![false; 4 * PER_PRODUCER as usize];
                for _ in 0..4 * PER_PRODUCER {
                    let v = ring.recv::<ThreadPause>() as usize;
                    assert!(!seen[v], "duplicate item {}", v);
                    seen[v] = true;
                }
                assert!(seen.iter().all(|&s| s));
            })
        };
        for h in handles {
            h.join().unwrap();
        }
        consumer.join().unwrap();
    }

    #[test]
    fn mpsc_multi_producers() {
        let ring = Arc::new(MpscRing::new(16));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1_000u64 {
                    ring.send::<ThreadPause>(i);
                }
            }));
        }
        let mut popped = 0;
        while popped < 3_000 {
            if ring.pop().is_some() {
                popped += 1;
            } else {
                std::thread::yield_now();
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(ring.pop().is_none());
    }

    #[test]
    fn drop_releases_remaining_items() {
        let ring = MpmcRing::new(4);
        ring.push(Arc::new(1u8)).unwrap();
        ring.push(Arc::new(2u8)).unwrap();
        drop(ring);
    }
}
