//! Cooperative multitasking.
//!
//! With the fiber module you can:
//! - create, run and manage [fibers](Builder): stackful tasks multiplexed
//!   cooperatively on the current vcpu,
//! - put a fiber to [sleep](sleep), [yield](yield_now) the processor, hand
//!   it [to a specific fiber](yield_to),
//! - [interrupt](interrupt) a blocked fiber from another fiber, vcpu or a
//!   plain OS thread,
//! - synchronize fibers with [`Cond`], [`Mutex`](mutex::Mutex),
//!   [`RwLock`](rwlock::RwLock), [`Semaphore`](semaphore::Semaphore) and
//!   [channels](channel).
//!
//! A fiber suspends **only** at the explicit blocking points (`sleep`,
//! `yield`, sync-primitive waits, fd waits and the I/O wrappers built on
//! them); arbitrary function calls never suspend. Handlers therefore run
//! to completion unless they block on purpose.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{self, Deadline, TIMEOUT_INFINITY};
use crate::error::{Error, Result};
use crate::sched::{self, FiberShared, Park};
use crate::stack::DEFAULT_STACK_SIZE;

pub mod channel;
pub mod local;
pub mod mutex;
pub mod rwlock;
pub mod semaphore;
pub mod spin;
pub(crate) mod waitq;

pub use channel::{Receiver, RecvError, SendError, Sender, TryRecvError, TrySendError};
pub use mutex::Mutex;
pub use rwlock::RwLock;
pub use semaphore::Semaphore;

use waitq::WaitNode;

////////////////////////////////////////////////////////////////////////////////
// FiberHandle
////////////////////////////////////////////////////////////////////////////////

/// An address of a fiber, valid from any vcpu or OS thread.
///
/// The handle does not keep the fiber running and says nothing about its
/// lifetime beyond [`is_done`](Self::is_done); it is the thing you pass to
/// [`interrupt`] and [`yield_to`].
#[derive(Clone)]
pub struct FiberHandle {
    pub(crate) shared: Arc<FiberShared>,
}

impl FiberHandle {
    /// Process-unique fiber id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Has the fiber function finished?
    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }
}

impl fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberHandle")
            .field("id", &self.id())
            .finish()
    }
}

impl PartialEq for FiberHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for FiberHandle {}

impl std::hash::Hash for FiberHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state)
    }
}

/// Handle of the currently running fiber.
pub fn current() -> FiberHandle {
    FiberHandle {
        shared: sched::current_shared(),
    }
}

/// Id of the currently running fiber.
pub fn id() -> u64 {
    sched::current_shared().id
}

/// Name of the currently running fiber.
pub fn name() -> String {
    sched::with_vcpu(|v| v.current_fiber().name.borrow().clone())
}

/// The error slot of the current fiber: the code of the last wake it
/// observed. `0` after an explicit wake, `libc::ETIMEDOUT` after a
/// deadline, otherwise whatever the interrupter supplied.
pub fn last_error() -> i32 {
    sched::with_vcpu(|v| v.current_fiber().last_err.get())
}

////////////////////////////////////////////////////////////////////////////////
// suspension points
////////////////////////////////////////////////////////////////////////////////

/// Yield the processor to the next ready fiber; the current fiber goes to
/// the tail of the run queue and resumes within the same scheduling round.
pub fn yield_now() {
    sched::yield_current();
}

/// Yield, preferring to hand control directly to `target`.
///
/// This is a hint, not a hard constraint: when `target` is not ready on
/// this vcpu the call degenerates to a plain [`yield_now`].
pub fn yield_to(target: &FiberHandle) {
    let vcpu = sched::with_vcpu(Rc::clone);
    match vcpu.find(target.id()) {
        Some(fiber) => vcpu.schedule(Park::YieldTo(fiber), None),
        None => vcpu.schedule(Park::Yield, None),
    }
}

/// Put the current fiber to sleep for at least `time`.
///
/// Wakes early only if the fiber is [interrupted](interrupt); inspect
/// [`last_error`] to tell the difference when it matters.
pub fn sleep(time: Duration) {
    sleep_us(clock::duration_to_us(time));
}

/// Sleep for at least `time_us` microseconds (`u64::MAX` sleeps forever).
///
/// Returns `0` when the deadline elapsed, `-1` when the sleep was cut
/// short by an interrupt whose code is then readable via [`last_error`].
/// `sleep_us(0)` performs a plain yield and returns `0`.
pub fn sleep_us(time_us: u64) -> i32 {
    if time_us == 0 {
        yield_now();
        return 0;
    }
    let deadline = Deadline::after_us(time_us);
    finish_sleep(sched::park(
        Park::Sleep {
            deadline: deadline.expire_us(),
        },
        None,
    ))
}

/// Like [`sleep_us`], but invokes `before_wait` after the fiber is parked
/// and before control is surrendered.
///
/// This is the TOCTOU-free way to install a "wake me" callback: by the
/// time `before_wait` runs, any wake it arranges is guaranteed to find the
/// fiber already parked. The callback must not suspend.
pub fn sleep_us_defer(time_us: u64, before_wait: impl FnOnce()) -> i32 {
    if time_us == 0 {
        before_wait();
        yield_now();
        return 0;
    }
    let deadline = Deadline::after_us(time_us);
    let mut cb = Some(before_wait);
    finish_sleep(sched::park(
        Park::Sleep {
            deadline: deadline.expire_us(),
        },
        Some(&mut || {
            if let Some(cb) = cb.take() {
                cb()
            }
        }),
    ))
}

fn finish_sleep(code: i32) -> i32 {
    if code == libc::ETIMEDOUT {
        0
    } else {
        -1
    }
}

/// Make `target` runnable with `err` set in its error slot.
///
/// May be called from any vcpu or from an OS thread outside the runtime;
/// delivery is asynchronous but guaranteed. Any blocking call `target` is
/// inside returns `-1`/an error with `err` readable via [`last_error`].
/// Repeated interrupts on an already-readied fiber are no-ops, and
/// interrupting a finished fiber is silently dropped.
pub fn interrupt(target: &FiberHandle, err: i32) {
    sched::interrupt_shared(&target.shared, err);
}

/// Wake `target` without an error code (the error slot reads `0`).
pub fn wake(target: &FiberHandle) {
    sched::interrupt_shared(&target.shared, 0);
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber.
///
/// Methods can be chained on it in order to configure it. The currently
/// supported configurations are:
///
/// * `name`:       specifies an associated name for the fiber
/// * `stack_size`: specifies the desired stack size for the fiber
/// * `func`/`proc`: specifies the fiber function (or procedure)
///
/// The [`start`](Builder::start) and [`defer`](Builder::defer) methods
/// take ownership of the builder and return a [`Result`] to the fiber's
/// [`JoinHandle`].
pub struct Builder<F> {
    name: Option<String>,
    stack_size: Option<usize>,
    f: F,
}

/// A *typestate* helper representing a [`Builder`] that has not been
/// assigned a fiber function yet.
pub struct NoFunc;

impl Builder<NoFunc> {
    /// Generates the base configuration for spawning a fiber, from which
    /// configuration methods can be chained.
    pub fn new() -> Self {
        Builder {
            name: None,
            stack_size: None,
            f: NoFunc,
        }
    }

    /// Sets the callee function for the new fiber.
    pub fn func<'f, F, T>(self, f: F) -> Builder<FiberFunc<'f, F, T>>
    where
        F: FnOnce() -> T,
        F: 'f,
    {
        Builder {
            name: self.name,
            stack_size: self.stack_size,
            f: FiberFunc {
                f,
                marker: PhantomData,
            },
        }
    }

    /// Sets the callee procedure (a function without a return value) for
    /// the new fiber.
    pub fn proc<'f, F>(self, f: F) -> Builder<FiberFunc<'f, F, ()>>
    where
        F: FnOnce(),
        F: 'f,
    {
        self.func(f)
    }
}

impl Default for Builder<NoFunc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> Builder<F> {
    /// Names the fiber-to-be.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the size of the stack (in bytes) for the new fiber.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }
}

/// Holds the fiber function between [`Builder::func`] and
/// [`Builder::start`].
pub struct FiberFunc<'f, F, T>
where
    F: FnOnce() -> T,
    F: 'f,
{
    f: F,
    marker: PhantomData<&'f ()>,
}

impl<'f, F, T> Builder<FiberFunc<'f, F, T>>
where
    F: FnOnce() -> T,
    F: 'f,
    T: 'f,
{
    /// Spawns a new fiber by taking ownership of the `Builder`, and
    /// returns a [`Result`] to its [`JoinHandle`].
    ///
    /// The current fiber performs a **yield** and execution is transferred
    /// to the new fiber immediately.
    pub fn start(self) -> Result<JoinHandle<'f, T>> {
        self.spawn_inner(true)
    }

    /// Spawns a new deferred fiber: it is appended to the tail of the run
    /// queue and the caller keeps the processor.
    pub fn defer(self) -> Result<JoinHandle<'f, T>> {
        self.spawn_inner(false)
    }

    fn spawn_inner(self, immediate: bool) -> Result<JoinHandle<'f, T>> {
        let Builder {
            name,
            stack_size,
            f: FiberFunc { f, .. },
        } = self;
        let name = name.unwrap_or_else(|| "<fiber>".into());
        let stack_size = stack_size.unwrap_or(DEFAULT_STACK_SIZE);

        let result: Rc<UnsafeCell<Option<T>>> = Rc::new(UnsafeCell::new(None));
        let result_in_fiber = result.clone();
        let entry = move || {
            let value = f();
            unsafe { *result_in_fiber.get() = Some(value) };
        };
        // The 'f lifetime is erased here. This is sound because the join
        // handle panics when dropped unjoined, so the borrowed data cannot
        // go away before the fiber is finished.
        let entry: Box<dyn FnOnce() + 'f> = Box::new(entry);
        let entry: Box<dyn FnOnce()> = unsafe { std::mem::transmute(entry) };

        let vcpu = sched::with_vcpu(Rc::clone);
        let fiber = vcpu.spawn(name, stack_size, entry)?;
        let handle = JoinHandle {
            fiber: Some(FiberHandle {
                shared: fiber.shared.clone(),
            }),
            result,
            marker: PhantomData,
        };
        if immediate {
            vcpu.schedule(Park::YieldTo(fiber), None);
        }
        Ok(handle)
    }
}

////////////////////////////////////////////////////////////////////////////////
// JoinHandle
////////////////////////////////////////////////////////////////////////////////

/// An owned permission to join on a fiber (block until its termination).
pub struct JoinHandle<'f, T> {
    fiber: Option<FiberHandle>,
    result: Rc<UnsafeCell<Option<T>>>,
    marker: PhantomData<&'f ()>,
}

/// A join handle of a fiber procedure.
pub type UnitJoinHandle<'f> = JoinHandle<'f, ()>;

impl<'f, T> JoinHandle<'f, T> {
    /// Address of the fiber, e.g. for [`interrupt`].
    pub fn handle(&self) -> FiberHandle {
        self.fiber.clone().expect("join handle already consumed")
    }

    /// Block until the fiber's termination and return its result value.
    pub fn join(mut self) -> T {
        let fiber = self.fiber.take().expect("join handle already consumed");
        join_shared(&fiber.shared);
        unsafe { (*self.result.get()).take() }.expect("the fiber did not produce a result")
    }
}

impl<'f, T> fmt::Debug for JoinHandle<'f, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle").finish_non_exhaustive()
    }
}

impl<'f, T> Drop for JoinHandle<'f, T> {
    fn drop(&mut self) {
        if self.fiber.is_some() {
            panic!("JoinHandle dropped before being joined")
        }
    }
}

/// Suspend until `target` is done. Joiners are woken in registration
/// order, and the target's stack is not recycled until every joiner
/// counted here has been released again.
fn join_shared(target: &Arc<FiberShared>) {
    {
        // Decided under the lock the exit path drains under: either the
        // fiber is already done (nothing to wait for), or our count is
        // visible to its exit and to the reap that recycles the stack.
        let _joiners = target.joiners.lock().unwrap();
        if target.done.load(Ordering::Acquire) {
            return;
        }
        target.join_waiters.fetch_add(1, Ordering::AcqRel);
    }
    while !target.done.load(Ordering::Acquire) {
        let me = sched::current_shared();
        sched::park(
            Park::Wait {
                deadline: TIMEOUT_INFINITY,
            },
            Some(&mut || {
                target.joiners.lock().unwrap().push(me.clone());
                // The fiber may have finished and drained its joiners
                // between the check above and our registration.
                if target.done.load(Ordering::Acquire) {
                    sched::interrupt_shared(&me, 0);
                }
            }),
        );
    }
    target.join_waiters.fetch_sub(1, Ordering::AcqRel);
}

////////////////////////////////////////////////////////////////////////////////
// free spawning functions
////////////////////////////////////////////////////////////////////////////////

/// Creates a new fiber and **yields** execution to it immediately,
/// returning a [`JoinHandle`] for the new fiber.
///
/// Uses the default parameters of [`Builder`]; to configure the stack size
/// or the name of the fiber use the builder API instead.
pub fn start<'f, F, T>(f: F) -> JoinHandle<'f, T>
where
    F: FnOnce() -> T,
    F: 'f,
    T: 'f,
{
    Builder::new().func(f).start().unwrap()
}

/// Creates a new proc fiber and **yields** execution to it immediately,
/// returning a [`UnitJoinHandle`] for the new fiber.
pub fn start_proc<'f, F>(f: F) -> UnitJoinHandle<'f>
where
    F: FnOnce(),
    F: 'f,
{
    Builder::new().proc(f).start().unwrap()
}

/// Creates a new fiber and schedules it for execution at the tail of the
/// run queue, returning a [`JoinHandle`] for it. The caller keeps the
/// processor.
pub fn defer<'f, F, T>(f: F) -> JoinHandle<'f, T>
where
    F: FnOnce() -> T,
    F: 'f,
    T: 'f,
{
    Builder::new().func(f).defer().unwrap()
}

/// Creates a new proc fiber and schedules it for execution, returning a
/// [`UnitJoinHandle`] for it.
pub fn defer_proc<'f, F>(f: F) -> UnitJoinHandle<'f>
where
    F: FnOnce(),
    F: 'f,
{
    Builder::new().proc(f).defer().unwrap()
}

/// Low-level detached spawn: create a fiber with an explicit stack size
/// and append it to the run-queue tail without yielding.
///
/// Returns the new fiber's address. Stack allocation failure maps to
/// [`Error::OutOfMemory`].
pub fn spawn<F>(f: F, stack_size: usize) -> Result<FiberHandle>
where
    F: FnOnce() + 'static,
{
    let fiber = sched::with_vcpu(|v| v.spawn("<fiber>".into(), stack_size, Box::new(f)))?;
    Ok(FiberHandle {
        shared: fiber.shared.clone(),
    })
}

////////////////////////////////////////////////////////////////////////////////
// yield detection
////////////////////////////////////////////////////////////////////////////////

/// Result of [`check_yield`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldResult<T> {
    Yielded(T),
    DidntYield(T),
}

/// Number of context switches performed by this vcpu so far.
pub fn csw() -> u64 {
    sched::with_vcpu(|v| v.switch_count())
}

/// Run `f` and report whether it caused at least one context switch.
pub fn check_yield<F, T>(f: F) -> YieldResult<T>
where
    F: FnOnce() -> T,
{
    let before = csw();
    let value = f();
    if csw() == before {
        YieldResult::DidntYield(value)
    } else {
        YieldResult::Yielded(value)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Cond
////////////////////////////////////////////////////////////////////////////////

/// Conditional variable for cooperative multitasking.
///
/// A cond has two basic operations: [`wait()`](Cond::wait) suspends the
/// calling fiber until [`signal()`](Cond::signal) wakes it. Waiters are
/// admitted strictly FIFO. Signalling with no waiters is a no-op.
///
/// Spurious wakeups are possible (an explicit [`wake`] or [`interrupt`]
/// lands here too), so wrap waits in a loop re-checking the actual
/// predicate.
///
/// `wait` does not take a mutex: call sites that guard their predicate
/// with a [`Mutex`](mutex::Mutex) should use
/// [`wait_guarded`](Cond::wait_guarded), which releases the lock for the
/// duration of the wait and reacquires it before returning; call sites
/// with their own serialization just use `wait`.
pub struct Cond {
    lock: spin::TicketSpinLock,
    q: UnsafeCell<VecDeque<Arc<WaitNode>>>,
}

unsafe impl Send for Cond {}
unsafe impl Sync for Cond {}

impl Cond {
    /// Instantiate a new fiber cond object.
    pub fn new() -> Self {
        Cond {
            lock: spin::TicketSpinLock::new(),
            q: UnsafeCell::new(VecDeque::new()),
        }
    }

    /// Wake one fiber waiting for the cond. Does nothing if no one is
    /// waiting. Does not yield.
    pub fn signal(&self) {
        loop {
            let node = {
                let _guard = self.lock.lock();
                let q = unsafe { &mut *self.q.get() };
                loop {
                    match q.pop_front() {
                        None => return,
                        Some(n) if n.is_cancelled() => continue,
                        Some(n) => break n,
                    }
                }
            };
            if node.try_wake() {
                return;
            }
        }
    }

    /// Wake up all fibers waiting for the cond. Does not yield.
    pub fn broadcast(&self) {
        let _guard = self.lock.lock();
        let q = unsafe { &mut *self.q.get() };
        for node in q.drain(..) {
            node.try_wake();
        }
    }

    /// Suspend the execution of the current fiber until [`signal`] is
    /// called. Returns `false` if the wait was interrupted.
    pub fn wait(&self) -> bool {
        self.wait_deadline(Deadline::INFINITE).is_ok()
    }

    /// [`wait`](Self::wait) with a timeout. Returns `false` on timeout or
    /// interrupt.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_deadline(Deadline::after(Some(timeout))).is_ok()
    }

    /// Core wait: park FIFO until signalled, the deadline passes or an
    /// interrupt arrives.
    pub fn wait_deadline(&self, deadline: Deadline) -> Result<()> {
        let node = WaitNode::new(sched::current_shared(), 0);
        let code = sched::park(
            Park::Wait {
                deadline: deadline.expire_us(),
            },
            Some(&mut || {
                let _guard = self.lock.lock();
                unsafe { &mut *self.q.get() }.push_back(node.clone());
            }),
        );
        if node.is_woken() {
            return Ok(());
        }
        if node.try_cancel() {
            match code {
                0 => Ok(()), // stray wake; report as spurious success
                c if c == libc::ETIMEDOUT => Err(Error::Timeout),
                c => Err(Error::Interrupted(c)),
            }
        } else {
            // A signal raced with our cancellation: consume it.
            Ok(())
        }
    }

    /// Release `guard`'s mutex, wait for a signal, reacquire the mutex.
    ///
    /// The release happens after the fiber is parked, so a signaller that
    /// observes the predicate under the same mutex cannot slip its signal
    /// into the gap.
    pub fn wait_guarded<'a, T>(&self, guard: mutex::MutexGuard<'a, T>) -> mutex::MutexGuard<'a, T> {
        let mutex = guard.source();
        let node = WaitNode::new(sched::current_shared(), 0);
        std::mem::forget(guard); // released manually in the defer below
        sched::park(
            Park::Wait {
                deadline: TIMEOUT_INFINITY,
            },
            Some(&mut || {
                {
                    let _guard = self.lock.lock();
                    unsafe { &mut *self.q.get() }.push_back(node.clone());
                }
                mutex.raw_unlock();
            }),
        );
        if !node.is_woken() {
            node.try_cancel();
        }
        mutex.lock()
    }
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cond").finish_non_exhaustive()
    }
}
