//! A stackful cooperative fiber runtime.
//!
//! This library multiplexes lightweight tasks ([fibers](fiber)) onto a
//! small pool of kernel threads (*vcpus*), with:
//!
//! - [Fibers: spawning, yielding, sleeping, interrupts, join handles](fiber)
//! - [Fiber-aware synchronization: mutex, rwlock, semaphore, cond, channels](fiber)
//! - [Cooperative I/O](coio) on non-blocking fds
//! - [Event engines](io): a per-vcpu master engine and user-level
//!   cascading engines
//! - [Timers](timer)
//! - [Work pools](pool) fanning callables out to worker vcpus
//! - [Length-prefixed tagged RPC framing](rpc) with out-of-order response
//!   completion
//! - [Fiber-run signal handlers](signal) (Linux)
//! - [Error handling](error)
//!
//! Scheduling is cooperative: fibers of one vcpu never run in parallel
//! and suspend only at explicit blocking points. Every blocking call
//! takes a timeout, and any blocked fiber can be made runnable from
//! another vcpu or a plain OS thread with [`fiber::interrupt`].
//!
//! A thread becomes a vcpu by calling [`init`]; the calling context turns
//! into the *main fiber* of that vcpu. [`fini`] tears the runtime down
//! again:
//!
//! ```no_run
//! filament::init(filament::InitFlags::default()).unwrap();
//!
//! let h = filament::fiber::start(|| 40 + 2);
//! assert_eq!(h.join(), 42);
//!
//! filament::fini().unwrap();
//! ```

use bitflags::bitflags;

pub mod clock;
pub mod coio;
mod context;
pub mod error;
pub mod fiber;
pub mod io;
pub mod pool;
pub mod ring;
pub mod rpc;
mod sched;
#[cfg(target_os = "linux")]
pub mod signal;
mod stack;
pub mod timer;

pub use error::{Error, Result};
pub use stack::DEFAULT_STACK_SIZE;

bitflags! {
    /// Engine selection for [`init`]. The numbering matches the classic
    /// layout: bits 0..4 pick the readiness multiplexer, bit 10 enables
    /// the signal engine.
    pub struct InitFlags: u64 {
        const EVENT_EPOLL = 1 << 0;
        const EVENT_IOURING = 1 << 1;
        const EVENT_SELECT = 1 << 2;
        const EVENT_KQUEUE = 1 << 3;
        const EVENT_SIGNALFD = 1 << 10;
    }
}

impl Default for InitFlags {
    /// The native readiness multiplexer of the platform, no signal
    /// engine.
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            InitFlags::EVENT_EPOLL
        } else {
            InitFlags::EVENT_KQUEUE
        }
    }
}

/// Turn the calling OS thread into a vcpu.
///
/// Selects and creates the master event engine, registers the vcpu for
/// cross-vcpu addressing and makes the calling context the main fiber.
/// With [`InitFlags::EVENT_SIGNALFD`] also starts the signal multiplexer
/// fiber (Linux only).
///
/// Returns [`Error::BadState`] when the thread already runs a runtime or
/// the requested engine is unavailable on this platform.
pub fn init(flags: InitFlags) -> Result<()> {
    sched::init_runtime(flags)?;
    #[cfg(target_os = "linux")]
    if flags.contains(InitFlags::EVENT_SIGNALFD) {
        if let Err(e) = signal::start() {
            let _ = sched::fini_runtime();
            return Err(e);
        }
    }
    Ok(())
}

/// Tear down the calling thread's runtime.
///
/// Expects cooperating fibers to be finished; leftovers are reported and
/// leaked rather than unwound.
pub fn fini() -> Result<()> {
    #[cfg(target_os = "linux")]
    signal::stop();
    sched::fini_runtime()
}
