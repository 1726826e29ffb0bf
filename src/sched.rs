//! The per-vcpu cooperative scheduler.
//!
//! A vcpu is an OS thread that called [`init`](crate::init): the calling
//! context becomes the *main fiber* and a thread-local [`Vcpu`] carries the
//! run queue (strict FIFO), the timer heap, the master event engine and the
//! cross-vcpu message ring.
//!
//! Every suspension funnels into [`Vcpu::schedule`], which performs the
//! scheduling decision: refresh the clock cache, drain remote interrupts,
//! expire timers, then either switch to the head of the run queue or poll
//! the event engine with a timeout clamped to the nearest timer deadline.
//!
//! State machine per fiber: `Running`, `Ready` (in the run queue),
//! `Sleeping` (timer heap only), `Waiting` (parked on a wait queue, timer
//! heap membership optional), `Done`. A fiber is in at most one scheduler
//! structure at a time, and [`Vcpu::make_ready`] is the single place that
//! transitions a parked fiber into the run queue, which is what makes
//! double wakes (timer vs. interrupt) naturally idempotent.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use once_cell::sync::Lazy;

use crate::clock;
use crate::clock::TIMEOUT_INFINITY;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::io::{MasterEngine, PollWaker};
use crate::ring::{CpuPause, MpscRing, ThreadPause};
use crate::stack;
use crate::InitFlags;

/// Owner value of a fiber that is not attached to any vcpu (done, or being
/// torn down).
pub(crate) const NO_VCPU: usize = usize::MAX;

/// Capacity of the per-vcpu cross-vcpu message ring.
const REMOTE_RING_CAPACITY: usize = 1024;

////////////////////////////////////////////////////////////////////////////////
// FiberShared
////////////////////////////////////////////////////////////////////////////////

/// The part of a fiber visible from other vcpus and OS threads.
///
/// The owner field is the only cross-vcpu-mutable state; everything else a
/// remote party may do goes through the owner's message ring.
pub(crate) struct FiberShared {
    pub id: u64,
    pub owner: AtomicUsize,
    pub done: AtomicBool,
    /// Fibers blocked in `join` on this one; woken (with code 0) at exit.
    pub joiners: StdMutex<Vec<Arc<FiberShared>>>,
    /// Joins in progress. The fiber's stack goes back to the pool only
    /// once it is DONE *and* this has drained back to zero.
    pub join_waiters: AtomicUsize,
}

impl FiberShared {
    fn new(owner: usize) -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Arc::new(FiberShared {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            owner: AtomicUsize::new(owner),
            done: AtomicBool::new(false),
            joiners: StdMutex::new(Vec::new()),
            join_waiters: AtomicUsize::new(0),
        })
    }
}

////////////////////////////////////////////////////////////////////////////////
// FiberCell
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Running,
    Ready,
    Sleeping,
    Waiting,
    Done,
}

pub(crate) struct FiberCell {
    pub shared: Arc<FiberShared>,
    pub name: RefCell<String>,
    pub state: Cell<State>,
    pub ctx: Context,
    /// `None` for the main fiber, which runs on the OS-provided stack.
    _stack: RefCell<Option<stack::Stack>>,
    entry: RefCell<Option<Box<dyn FnOnce()>>>,
    /// Wake code latched by the first wake; taken by the fiber on resume.
    wake_err: Cell<Option<i32>>,
    /// The error slot: code of the last wake observed by this fiber.
    pub last_err: Cell<i32>,
    pub in_runq: Cell<bool>,
    /// Invalidates timer-heap entries armed for an earlier park.
    timer_gen: Cell<u64>,
    /// A finite-deadline timer entry may still sit in the heap.
    timer_armed: Cell<bool>,
    /// Fiber-local storage, keyed by the process-wide key space.
    pub locals: RefCell<HashMap<u32, Box<dyn Any>>>,
}

pub(crate) type FiberRef = Rc<FiberCell>;

impl FiberCell {
    fn new_main(shared: Arc<FiberShared>) -> FiberRef {
        Rc::new(FiberCell {
            shared,
            name: RefCell::new("main".into()),
            state: Cell::new(State::Running),
            ctx: Context::empty(),
            _stack: RefCell::new(None),
            entry: RefCell::new(None),
            wake_err: Cell::new(None),
            last_err: Cell::new(0),
            in_runq: Cell::new(false),
            timer_gen: Cell::new(0),
            timer_armed: Cell::new(false),
            locals: RefCell::new(HashMap::new()),
        })
    }
}

////////////////////////////////////////////////////////////////////////////////
// timer heap
////////////////////////////////////////////////////////////////////////////////

enum Expiry {
    /// Wake a parked fiber with TIMEOUT, if it is still parked for the same
    /// generation.
    Wake { fiber: FiberRef, gen: u64 },
    /// Run a scheduled closure on the scheduler stack (used by the timer
    /// service to launch callback fibers).
    Call(Box<dyn FnOnce()>),
}

struct TimerEntry {
    deadline: u64,
    seq: u64,
    expiry: Expiry,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // ties broken by insertion order
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

////////////////////////////////////////////////////////////////////////////////
// VcpuShared & registry
////////////////////////////////////////////////////////////////////////////////

struct Remote {
    target: Arc<FiberShared>,
    err: i32,
}

/// The part of a vcpu other vcpus and OS threads may touch.
pub(crate) struct VcpuShared {
    pub id: usize,
    ring: MpscRing<Remote>,
    pub waker: PollWaker,
}

static VCPUS: Lazy<StdMutex<Vec<Option<Arc<VcpuShared>>>>> =
    Lazy::new(|| StdMutex::new(Vec::new()));

fn register_vcpu(waker: PollWaker) -> Arc<VcpuShared> {
    let mut vcpus = VCPUS.lock().unwrap();
    let id = vcpus
        .iter()
        .position(|slot| slot.is_none())
        .unwrap_or_else(|| {
            vcpus.push(None);
            vcpus.len() - 1
        });
    let shared = Arc::new(VcpuShared {
        id,
        ring: MpscRing::new(REMOTE_RING_CAPACITY),
        waker,
    });
    vcpus[id] = Some(shared.clone());
    shared
}

fn unregister_vcpu(id: usize) {
    let mut vcpus = VCPUS.lock().unwrap();
    if let Some(slot) = vcpus.get_mut(id) {
        *slot = None;
    }
}

fn vcpu_shared(id: usize) -> Option<Arc<VcpuShared>> {
    VCPUS.lock().unwrap().get(id).and_then(|s| s.clone())
}

////////////////////////////////////////////////////////////////////////////////
// Vcpu
////////////////////////////////////////////////////////////////////////////////

pub(crate) enum Park {
    /// Requeue at the tail of the run queue and switch to the head.
    Yield,
    /// Requeue at the tail and hand control to the given fiber if it is
    /// ready on this vcpu; plain yield otherwise.
    YieldTo(FiberRef),
    /// Park in the timer heap (finite deadline) or off all queues
    /// (infinite); woken by timeout or interrupt.
    Sleep { deadline: u64 },
    /// Park off the run queue on behalf of a wait queue the caller has
    /// already joined; timer heap is armed when the deadline is finite.
    Wait { deadline: u64 },
    /// The current fiber is finished; never resumed.
    Done,
}

pub(crate) struct Vcpu {
    shared: Arc<VcpuShared>,
    run_q: RefCell<VecDeque<FiberRef>>,
    timers: RefCell<BinaryHeap<Reverse<TimerEntry>>>,
    timer_seq: Cell<u64>,
    /// Every live fiber owned by this vcpu, the main fiber included.
    fibers: RefCell<HashMap<u64, FiberRef>>,
    current: RefCell<FiberRef>,
    main: FiberRef,
    pub engine: MasterEngine,
    /// Finished fibers whose stacks cannot be freed until we have switched
    /// off of them; reaped right after the next context switch.
    graveyard: RefCell<Vec<FiberRef>>,
    /// Context switches performed so far; exposed for yield detection in
    /// tests.
    switches: Cell<u64>,
}

thread_local! {
    static VCPU: RefCell<Option<Rc<Vcpu>>> = RefCell::new(None);
}

/// Is the calling OS thread attached to a runtime?
pub(crate) fn in_runtime() -> bool {
    VCPU.with(|v| v.borrow().is_some())
}

/// Run `f` with the calling thread's vcpu.
///
/// Panics when called from a thread that has not called
/// [`init`](crate::init); every public blocking entry point checks this.
pub(crate) fn with_vcpu<T>(f: impl FnOnce(&Rc<Vcpu>) -> T) -> T {
    VCPU.with(|v| {
        let v = v.borrow();
        let vcpu = v
            .as_ref()
            .expect("not inside a filament runtime (missing filament::init?)");
        f(vcpu)
    })
}

impl Vcpu {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn current_fiber(&self) -> FiberRef {
        self.current.borrow().clone()
    }

    pub fn live_fibers(&self) -> usize {
        self.fibers.borrow().len()
    }

    /// Look up a locally owned fiber by id.
    pub fn find(&self, id: u64) -> Option<FiberRef> {
        self.fibers.borrow().get(&id).cloned()
    }

    pub fn switch_count(&self) -> u64 {
        self.switches.get()
    }

    ////////////////////////////////////////////////////////////////////////
    // spawning
    ////////////////////////////////////////////////////////////////////////

    /// Create a fiber and append it to the tail of the run queue. The
    /// caller keeps the CPU (follow up with a yield to hand over control).
    pub fn spawn(
        &self,
        name: String,
        stack_size: usize,
        entry: Box<dyn FnOnce()>,
    ) -> Result<FiberRef> {
        let stk = stack::alloc(stack_size)?;
        let shared = FiberShared::new(self.id());
        let fiber = Rc::new(FiberCell {
            shared,
            name: RefCell::new(name),
            state: Cell::new(State::Ready),
            ctx: Context::fresh(&stk, fiber_main),
            _stack: RefCell::new(Some(stk)),
            entry: RefCell::new(Some(entry)),
            wake_err: Cell::new(None),
            last_err: Cell::new(0),
            in_runq: Cell::new(true),
            timer_gen: Cell::new(0),
            timer_armed: Cell::new(false),
            locals: RefCell::new(HashMap::new()),
        });
        self.fibers
            .borrow_mut()
            .insert(fiber.shared.id, fiber.clone());
        self.run_q.borrow_mut().push_back(fiber.clone());
        Ok(fiber)
    }

    ////////////////////////////////////////////////////////////////////////
    // wakes
    ////////////////////////////////////////////////////////////////////////

    /// The single point where a parked fiber becomes runnable.
    ///
    /// The first wake latches its code into the fiber's slot and appends
    /// the fiber to the run-queue tail; any later wake observes a
    /// non-parked state and is a no-op, so a fiber lands on the run queue
    /// exactly once no matter how many wakes race.
    pub fn make_ready(&self, fiber: &FiberRef, err: i32) {
        match fiber.state.get() {
            State::Sleeping | State::Waiting => {
                fiber.timer_gen.set(fiber.timer_gen.get() + 1);
                if fiber.wake_err.get().is_none() {
                    fiber.wake_err.set(Some(err));
                }
                fiber.state.set(State::Ready);
                debug_assert!(!fiber.in_runq.get());
                fiber.in_runq.set(true);
                self.run_q.borrow_mut().push_back(fiber.clone());
            }
            State::Ready | State::Running | State::Done => {}
        }
    }

    fn deliver(&self, target: Arc<FiberShared>, err: i32) {
        if target.done.load(Ordering::Acquire) {
            return;
        }
        let owner = target.owner.load(Ordering::Acquire);
        if owner == self.id() {
            if let Some(fiber) = self.find(target.id) {
                self.make_ready(&fiber, err);
            }
        } else if owner != NO_VCPU {
            // The fiber lives elsewhere: forward to its owner.
            interrupt_shared(&target, err);
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // timers
    ////////////////////////////////////////////////////////////////////////

    fn arm_timer(&self, deadline: u64, expiry: Expiry) {
        let seq = self.timer_seq.get();
        self.timer_seq.set(seq + 1);
        self.timers.borrow_mut().push(Reverse(TimerEntry {
            deadline,
            seq,
            expiry,
        }));
    }

    /// Schedule `f` to run on the scheduler stack at `deadline` (cached
    /// clock). Used by the timer service.
    pub fn call_at(&self, deadline: u64, f: Box<dyn FnOnce()>) {
        self.arm_timer(deadline, Expiry::Call(f));
    }

    /// Expiration time of the nearest live timer, if any. Discards stale
    /// wake entries on the way.
    fn next_deadline(&self) -> Option<u64> {
        loop {
            {
                let timers = self.timers.borrow();
                let Some(Reverse(top)) = timers.peek() else {
                    return None;
                };
                match &top.expiry {
                    Expiry::Wake { fiber, gen } if fiber.timer_gen.get() != *gen => {}
                    _ => return Some(top.deadline),
                }
            }
            self.timers.borrow_mut().pop();
        }
    }

    fn expire_timers(&self, now: u64) {
        loop {
            let entry = {
                let mut timers = self.timers.borrow_mut();
                match timers.peek() {
                    Some(Reverse(top)) if top.deadline <= now => timers.pop().unwrap().0,
                    _ => break,
                }
            };
            match entry.expiry {
                Expiry::Wake { fiber, gen } => {
                    fiber.timer_armed.set(false);
                    if fiber.timer_gen.get() == gen {
                        self.make_ready(&fiber, libc::ETIMEDOUT);
                    }
                }
                Expiry::Call(f) => f(),
            }
        }
    }

    /// Drop timer entries still referencing an exiting fiber, so its stack
    /// is not pinned until a long-gone deadline.
    fn purge_timers_for(&self, fiber: &FiberRef) {
        let mut timers = self.timers.borrow_mut();
        let entries = std::mem::take(&mut *timers).into_vec();
        *timers = entries
            .into_iter()
            .filter(|Reverse(e)| match &e.expiry {
                Expiry::Wake { fiber: f, .. } => !Rc::ptr_eq(f, fiber),
                Expiry::Call(_) => true,
            })
            .collect();
    }

    ////////////////////////////////////////////////////////////////////////
    // the scheduling decision
    ////////////////////////////////////////////////////////////////////////

    /// One pass of the bookkeeping every scheduling decision performs:
    /// clock refresh, remote-interrupt drain, timer expiry.
    fn tick(&self) {
        let now = clock::refresh();
        while let Some(Remote { target, err }) = self.shared.ring.pop() {
            self.deliver(target, err);
        }
        self.expire_timers(now);
    }

    fn pop_runnable(&self) -> Option<FiberRef> {
        let fiber = self.run_q.borrow_mut().pop_front()?;
        fiber.in_runq.set(false);
        Some(fiber)
    }

    /// Suspend the current fiber according to `how` and run the next one.
    ///
    /// `defer` (if any) runs after the current fiber is fully parked but
    /// before control is surrendered; wait queues use it to release their
    /// internal guard without opening a wake-before-park window. It must
    /// not suspend.
    pub fn schedule(&self, how: Park, defer: Option<&mut dyn FnMut()>) {
        let cur = self.current_fiber();
        let mut handoff = None;
        let dying = matches!(how, Park::Done);

        match how {
            Park::Yield => {
                cur.state.set(State::Ready);
                cur.in_runq.set(true);
                self.run_q.borrow_mut().push_back(cur.clone());
            }
            Park::YieldTo(target) => {
                cur.state.set(State::Ready);
                cur.in_runq.set(true);
                self.run_q.borrow_mut().push_back(cur.clone());
                handoff = self.steal_from_runq(&target);
            }
            Park::Sleep { deadline } => {
                cur.state.set(State::Sleeping);
                self.park_with_deadline(&cur, deadline);
            }
            Park::Wait { deadline } => {
                cur.state.set(State::Waiting);
                self.park_with_deadline(&cur, deadline);
            }
            Park::Done => {
                cur.state.set(State::Done);
                if cur.timer_armed.get() {
                    self.purge_timers_for(&cur);
                }
                self.graveyard.borrow_mut().push(cur.clone());
            }
        }

        if let Some(defer) = defer {
            defer();
        }

        let next = match handoff {
            Some(next) => {
                self.tick();
                next
            }
            None => loop {
                self.tick();
                if let Some(next) = self.pop_runnable() {
                    break next;
                }
                let timeout = match self.next_deadline() {
                    Some(deadline) => deadline.saturating_sub(clock::now_cached()),
                    None => TIMEOUT_INFINITY,
                };
                let mut readied = Vec::new();
                if let Err(e) = self.engine.poll(timeout, &mut readied) {
                    log::error!("master engine poll failed: {}", e);
                }
                // Readiness wakeups, in the order the events were reported.
                for id in readied {
                    if let Some(fiber) = self.find(id) {
                        self.make_ready(&fiber, 0);
                    }
                }
            },
        };

        if Rc::ptr_eq(&next, &cur) {
            debug_assert!(!dying);
            next.state.set(State::Running);
            return;
        }

        next.state.set(State::Running);
        self.switches.set(self.switches.get() + 1);
        // Keep the switch itself free of `Rc` locals: on the exit path the
        // old stack is never resumed and would leak every count it holds.
        let cur_ctx: *const Context = &cur.ctx;
        let next_ctx: *const Context = &next.ctx;
        *self.current.borrow_mut() = next;
        if dying {
            drop(cur);
        }
        unsafe { Context::swap(&*cur_ctx, &*next_ctx) };
        // Resumed: free whatever finished fiber we last switched away from.
        self.reap();
    }

    fn park_with_deadline(&self, cur: &FiberRef, deadline: u64) {
        cur.wake_err.set(None);
        let gen = cur.timer_gen.get() + 1;
        cur.timer_gen.set(gen);
        if deadline != TIMEOUT_INFINITY {
            cur.timer_armed.set(true);
            self.arm_timer(
                deadline,
                Expiry::Wake {
                    fiber: cur.clone(),
                    gen,
                },
            );
        }
    }

    /// Remove `target` from the run queue if it is eligible for a direct
    /// hand-off (`READY`, owned by this vcpu, queued).
    fn steal_from_runq(&self, target: &FiberRef) -> Option<FiberRef> {
        if target.state.get() != State::Ready || !target.in_runq.get() {
            return None;
        }
        let mut run_q = self.run_q.borrow_mut();
        let pos = run_q.iter().position(|f| Rc::ptr_eq(f, target))?;
        let fiber = run_q.remove(pos).unwrap();
        fiber.in_runq.set(false);
        Some(fiber)
    }

    fn reap(&self) {
        let mut graveyard = self.graveyard.borrow_mut();
        graveyard.retain(|fiber| {
            debug_assert_eq!(fiber.state.get(), State::Done);
            // The stack is returned to the pool only after every joiner
            // has been released; a fiber with joins still in progress
            // stays parked here until a later reap.
            fiber.shared.join_waiters.load(Ordering::Acquire) > 0
        });
    }
}

////////////////////////////////////////////////////////////////////////////////
// fiber entry & exit
////////////////////////////////////////////////////////////////////////////////

extern "C" fn fiber_main() -> ! {
    // A raw reference: the Vcpu outlives every non-main fiber, and an `Rc`
    // clone held here would be leaked with the stack at exit.
    let vcpu: *const Vcpu = with_vcpu(Rc::as_ptr);
    let vcpu = unsafe { &*vcpu };
    vcpu.reap();
    let cur = vcpu.current_fiber();
    let entry = cur
        .entry
        .borrow_mut()
        .take()
        .expect("fiber started without an entry point");
    entry();
    finish_current(vcpu)
}

fn finish_current(vcpu: &Vcpu) -> ! {
    {
        let cur = vcpu.current_fiber();
        cur.shared.done.store(true, Ordering::Release);
        cur.shared.owner.store(NO_VCPU, Ordering::Release);
        // Joiners are woken in registration order.
        let joiners = std::mem::take(&mut *cur.shared.joiners.lock().unwrap());
        for joiner in joiners {
            interrupt_shared(&joiner, 0);
        }
        vcpu.fibers.borrow_mut().remove(&cur.shared.id);
    }
    vcpu.schedule(Park::Done, None);
    unreachable!("a finished fiber was rescheduled")
}

////////////////////////////////////////////////////////////////////////////////
// cross-vcpu interrupt
////////////////////////////////////////////////////////////////////////////////

/// Make `target` runnable with `err` readable in its error slot. Callable
/// from any vcpu or from a plain OS thread; delivery is asynchronous but
/// guaranteed as long as the owning vcpu keeps scheduling. Interrupting a
/// DONE fiber is silently dropped.
pub(crate) fn interrupt_shared(target: &Arc<FiberShared>, err: i32) {
    if target.done.load(Ordering::Acquire) {
        return;
    }
    let owner = target.owner.load(Ordering::Acquire);
    if owner == NO_VCPU {
        return;
    }

    let delivered_locally = VCPU.with(|v| {
        v.borrow().as_ref().map_or(false, |vcpu| {
            if vcpu.id() == owner {
                if let Some(fiber) = vcpu.find(target.id) {
                    vcpu.make_ready(&fiber, err);
                }
                true
            } else {
                false
            }
        })
    });
    if delivered_locally {
        return;
    }

    let Some(shared) = vcpu_shared(owner) else {
        return;
    };
    let msg = Remote {
        target: target.clone(),
        err,
    };
    // A full ring degrades the sender's latency, never correctness.
    if in_runtime() {
        shared.ring.send::<CpuPause>(msg);
    } else {
        shared.ring.send::<ThreadPause>(msg);
    }
    shared.waker.wake();
}

////////////////////////////////////////////////////////////////////////////////
// runtime lifecycle
////////////////////////////////////////////////////////////////////////////////

pub(crate) fn init_runtime(flags: InitFlags) -> Result<()> {
    if in_runtime() {
        return Err(Error::BadState(
            "runtime already initialized on this thread",
        ));
    }
    clock::refresh();
    let waker = PollWaker::new()?;
    let engine = MasterEngine::new(flags, waker.read_fd())?;
    let shared = register_vcpu(waker);
    let id = shared.id;

    let main = FiberCell::new_main(FiberShared::new(id));
    let mut fibers = HashMap::new();
    fibers.insert(main.shared.id, main.clone());

    let vcpu = Rc::new(Vcpu {
        shared,
        run_q: RefCell::new(VecDeque::new()),
        timers: RefCell::new(BinaryHeap::new()),
        timer_seq: Cell::new(0),
        fibers: RefCell::new(fibers),
        current: RefCell::new(main.clone()),
        main,
        engine,
        graveyard: RefCell::new(Vec::new()),
        switches: Cell::new(0),
    });
    vcpu.engine.register_fork_hook();
    VCPU.with(|v| *v.borrow_mut() = Some(vcpu));
    log::debug!("vcpu {} up", id);
    Ok(())
}

pub(crate) fn fini_runtime() -> Result<()> {
    let vcpu = VCPU.with(|v| v.borrow_mut().take());
    let Some(vcpu) = vcpu else {
        return Err(Error::BadState("runtime not initialized on this thread"));
    };
    let live = vcpu.live_fibers();
    if live > 1 {
        log::warn!("fini with {} fibers still alive", live - 1);
    }
    vcpu.main.shared.done.store(true, Ordering::Release);
    vcpu.main.shared.owner.store(NO_VCPU, Ordering::Release);
    unregister_vcpu(vcpu.id());
    log::debug!("vcpu {} down", vcpu.id());
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// parking entry points used by the public API & the sync primitives
////////////////////////////////////////////////////////////////////////////////

/// Park the current fiber as `Sleeping`/`Waiting` and return the wake code:
/// `libc::ETIMEDOUT` for a deadline expiry, `0` for an explicit wake, any
/// other value for an interrupt. Also records the code in the fiber's
/// error slot.
pub(crate) fn park(how: Park, defer: Option<&mut dyn FnMut()>) -> i32 {
    let vcpu = with_vcpu(Rc::clone);
    vcpu.schedule(how, defer);
    let cur = vcpu.current_fiber();
    let code = cur
        .wake_err
        .take()
        .expect("parked fiber resumed without a wake");
    cur.last_err.set(code);
    code
}

/// Plain cooperative yield.
pub(crate) fn yield_current() {
    let vcpu = with_vcpu(Rc::clone);
    vcpu.schedule(Park::Yield, None);
}

/// The shared part of the current fiber, for wait-queue registration and
/// cross-vcpu addressing.
pub(crate) fn current_shared() -> Arc<FiberShared> {
    with_vcpu(|v| v.current_fiber().shared.clone())
}
