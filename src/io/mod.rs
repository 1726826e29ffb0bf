//! Event engines.
//!
//! Each vcpu owns exactly one [`MasterEngine`]: a readiness multiplexer
//! (epoll on Linux, kqueue on macOS / the BSDs) that translates fd events
//! into fiber wakeups, plus a self-wake channel the cross-vcpu interrupt
//! path uses to break blocking polls. Interests armed through the master
//! engine are one-shot.
//!
//! [`CascadingEngine`] is the user-facing aggregator with persistent
//! interests and batch delivery; it nests its own multiplexer fd under the
//! master engine.
//!
//! On `fork`, multiplexer descriptors are rebuilt in the child: every
//! engine registers itself in a per-thread list walked by a
//! `pthread_atfork` child handler.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;

use crate::clock::TIMEOUT_INFINITY;
use crate::error::{Error, Result};
use crate::InitFlags;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;

mod cascade;
pub use cascade::{CascadingEngine, Interest};

#[cfg(target_os = "linux")]
pub(crate) use epoll::Epoll as Backend;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub(crate) use kqueue::Kqueue as Backend;

bitflags! {
    /// Readiness interests.
    pub struct Events: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const ERROR = 0x4;
        /// Cascading engines only: remove the interest after it fires
        /// once.
        const ONE_SHOT = 0x8;
    }
}

/// Event data value reserved for the self-wake channel.
const WAKER_DATA: u64 = u64::MAX;

////////////////////////////////////////////////////////////////////////////////
// PollWaker
////////////////////////////////////////////////////////////////////////////////

/// The self-wake channel of a vcpu: any thread may `wake()` it to force an
/// in-progress master-engine poll to return.
#[derive(Debug)]
pub(crate) struct PollWaker {
    read_fd: RawFd,
    write_fd: RawFd,
}

unsafe impl Send for PollWaker {}
unsafe impl Sync for PollWaker {}

impl PollWaker {
    #[cfg(target_os = "linux")]
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(PollWaker {
            read_fd: fd,
            write_fd: fd,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(PollWaker {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Post one wake. Failure (a full pipe) only means a wake is already
    /// pending.
    pub fn wake(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(
                self.write_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

}

impl Drop for PollWaker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            if self.write_fd != self.read_fd {
                libc::close(self.write_fd);
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// MasterEngine
////////////////////////////////////////////////////////////////////////////////

/// One direction of an armed fd: the parked fiber and the exact interests
/// it asked for.
#[derive(Clone, Copy)]
struct Waiter {
    fiber: u64,
    events: Events,
}

#[derive(Default)]
struct FdWaiters {
    read: Option<Waiter>,
    write: Option<Waiter>,
}

impl FdWaiters {
    fn mask(&self) -> Events {
        let mut mask = Events::empty();
        if let Some(w) = &self.read {
            mask |= w.events;
        }
        if let Some(w) = &self.write {
            mask |= w.events;
        }
        mask
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

/// The per-vcpu event source: one-shot fd interests resolved into fiber
/// wakeups, plus the self-wake channel.
///
/// An fd may carry at most one read-side and one write-side waiter at a
/// time (a stream can be driven full-duplex by two fibers); arming a
/// direction that is already armed is a programming error.
pub(crate) struct MasterEngine {
    backend: Backend,
    waiters: RefCell<HashMap<RawFd, FdWaiters>>,
    waker_fd: RawFd,
    hooked: Cell<bool>,
    closed: Cell<bool>,
}

impl MasterEngine {
    pub fn new(flags: InitFlags, waker_fd: RawFd) -> Result<Self> {
        validate_flags(flags)?;
        let backend = Backend::new()?;
        backend.add(waker_fd, Events::READ, WAKER_DATA, false)?;
        Ok(MasterEngine {
            backend,
            waiters: RefCell::new(HashMap::new()),
            waker_fd,
            hooked: Cell::new(false),
            closed: Cell::new(false),
        })
    }

    /// Arm a one-shot interest for `fiber_id` on `fd`.
    pub fn arm_oneshot(&self, fd: RawFd, interests: Events, fiber_id: u64) -> Result<()> {
        let mask = {
            let mut waiters = self.waiters.borrow_mut();
            let entry = waiters.entry(fd).or_default();
            let slot = if interests.contains(Events::WRITE) && !interests.contains(Events::READ) {
                &mut entry.write
            } else {
                &mut entry.read
            };
            if slot.is_some() {
                return Err(Error::BadState(
                    "a second fiber is already parked on this fd direction",
                ));
            }
            *slot = Some(Waiter {
                fiber: fiber_id,
                events: interests,
            });
            entry.mask()
        };
        // One-shot semantics are enforced at delivery (a kernel-level
        // one-shot would disable the other direction's waiter too).
        self.backend.add(fd, mask, fd as u64, false)?;
        Ok(())
    }

    /// Tear down whatever interests `fiber_id` still holds on `fd`.
    /// Idempotent.
    pub fn disarm(&self, fd: RawFd, fiber_id: u64) {
        let mask = {
            let mut waiters = self.waiters.borrow_mut();
            let Some(entry) = waiters.get_mut(&fd) else {
                return;
            };
            if matches!(entry.read, Some(w) if w.fiber == fiber_id) {
                entry.read = None;
            }
            if matches!(entry.write, Some(w) if w.fiber == fiber_id) {
                entry.write = None;
            }
            if entry.is_empty() {
                waiters.remove(&fd);
                None
            } else {
                Some(entry.mask())
            }
        };
        match mask {
            None => {
                let _ = self.backend.del(fd);
            }
            Some(mask) => {
                let _ = self.backend.add(fd, mask, fd as u64, false);
            }
        }
    }

    /// Block until at least one event fires or `timeout_us` elapses;
    /// deliver readied fiber ids into `readied` in the order the
    /// multiplexer reported them. Interests fire once and are cleared.
    pub fn poll(&self, timeout_us: u64, readied: &mut Vec<u64>) -> Result<()> {
        let mut woken = false;
        let mut fired: Vec<(RawFd, Events)> = Vec::new();
        self.backend.poll(timeout_us, &mut |data, events| {
            if data == WAKER_DATA {
                woken = true;
            } else {
                fired.push((data as RawFd, events));
            }
        })?;
        if woken {
            self.drain_waker();
        }
        for (fd, events) in fired {
            let mask = {
                let mut waiters = self.waiters.borrow_mut();
                let Some(entry) = waiters.get_mut(&fd) else {
                    continue;
                };
                if matches!(&entry.read, Some(w) if w.events.intersects(events)) {
                    readied.push(entry.read.take().unwrap().fiber);
                }
                if matches!(&entry.write, Some(w) if w.events.intersects(events)) {
                    readied.push(entry.write.take().unwrap().fiber);
                }
                if entry.is_empty() {
                    waiters.remove(&fd);
                    None
                } else {
                    Some(entry.mask())
                }
            };
            match mask {
                None => {
                    let _ = self.backend.del(fd);
                }
                Some(mask) => {
                    let _ = self.backend.add(fd, mask, fd as u64, false);
                }
            }
        }
        Ok(())
    }

    fn drain_waker(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.waker_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Rebuild the multiplexer after `fork`: descriptors of the parent's
    /// engine are useless in the child.
    pub fn reset(&self) {
        log::info!("resetting event engine after fork");
        self.waiters.borrow_mut().clear();
        let rebuilt = self
            .backend
            .rebuild()
            .and_then(|()| self.backend.add(self.waker_fd, Events::READ, WAKER_DATA, false));
        if let Err(e) = rebuilt {
            log::error!("failed to rebuild event engine after fork: {}", e);
        }
    }

    /// Register this engine in the per-thread fork-hook list. Must be
    /// called once the engine has reached its final address.
    pub fn register_fork_hook(&self) {
        install_fork_hook();
        LIVE_ENGINES.with(|list| list.borrow_mut().push(self as *const MasterEngine));
        self.hooked.set(true);
    }

    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        if self.hooked.replace(false) {
            let me = self as *const MasterEngine;
            LIVE_ENGINES.with(|list| list.borrow_mut().retain(|&p| p != me));
        }
        self.backend.close();
    }
}

impl Drop for MasterEngine {
    fn drop(&mut self) {
        self.close();
    }
}

fn validate_flags(flags: InitFlags) -> Result<()> {
    let engines = flags
        & (InitFlags::EVENT_EPOLL
            | InitFlags::EVENT_KQUEUE
            | InitFlags::EVENT_IOURING
            | InitFlags::EVENT_SELECT);
    let native = if cfg!(target_os = "linux") {
        InitFlags::EVENT_EPOLL
    } else {
        InitFlags::EVENT_KQUEUE
    };
    if engines.is_empty() || engines == native {
        Ok(())
    } else {
        Err(Error::BadState(
            "the requested event engine is not supported on this platform",
        ))
    }
}

////////////////////////////////////////////////////////////////////////////////
// fork hooks
////////////////////////////////////////////////////////////////////////////////

thread_local! {
    static LIVE_ENGINES: RefCell<Vec<*const MasterEngine>> = RefCell::new(Vec::new());
}

static FORK_HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);

fn install_fork_hook() {
    if FORK_HOOK_INSTALLED.swap(true, Ordering::AcqRel) {
        return;
    }
    unsafe {
        libc::pthread_atfork(None, None, Some(fork_child_hook));
    }
}

extern "C" fn fork_child_hook() {
    LIVE_ENGINES.with(|list| {
        for &engine in list.borrow().iter() {
            unsafe { (*engine).reset() };
        }
    });
}

////////////////////////////////////////////////////////////////////////////////
// timeout conversion helpers shared by the backends
////////////////////////////////////////////////////////////////////////////////

/// Round a microsecond timeout up to whole milliseconds for interfaces
/// with millisecond resolution; `-1` means infinite.
#[allow(dead_code)]
pub(crate) fn timeout_ms(timeout_us: u64) -> i32 {
    if timeout_us == TIMEOUT_INFINITY {
        -1
    } else {
        timeout_us
            .saturating_add(999)
            .checked_div(1000)
            .unwrap_or(0)
            .min(i32::MAX as u64) as i32
    }
}
