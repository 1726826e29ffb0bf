//! Process signal handling on fibers (Linux).
//!
//! When the runtime starts with [`InitFlags::EVENT_SIGNALFD`]
//! (see [`init`](crate::init)), handled signals are blocked and routed
//! into a `signalfd` read by a dedicated multiplexer fiber. Registered
//! handlers run as normal fibers and may block; invocations are
//! serialized.

use std::cell::RefCell;
use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use once_cell::sync::Lazy;

use crate::coio;
use crate::error::{Error, Result};
use crate::fiber::{self, FiberHandle};
use crate::io::Events;

type Handler = Arc<StdMutex<Box<dyn FnMut(i32) + Send>>>;

static HANDLERS: Lazy<StdMutex<HashMap<i32, Handler>>> =
    Lazy::new(|| StdMutex::new(HashMap::new()));

/// fd of the live signalfd, or -1.
static SIGNAL_FD: AtomicI32 = AtomicI32::new(-1);

thread_local! {
    static MUX_FIBER: RefCell<Option<FiberHandle>> = RefCell::new(None);
}

fn empty_sigset() -> libc::sigset_t {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::zeroed();
        libc::sigemptyset(set.as_mut_ptr());
        set.assume_init()
    }
}

fn current_mask() -> libc::sigset_t {
    let mut set = empty_sigset();
    for &signum in HANDLERS.lock().unwrap().keys() {
        unsafe { libc::sigaddset(&mut set, signum) };
    }
    set
}

/// Register (or replace) a fiber-run handler for `signum`.
///
/// The signal gets blocked for normal delivery and dispatched through the
/// signal multiplexer instead. Requires a runtime started with
/// [`InitFlags::EVENT_SIGNALFD`](crate::InitFlags::EVENT_SIGNALFD).
pub fn sync_signal<F>(signum: i32, handler: F) -> Result<()>
where
    F: FnMut(i32) + Send + 'static,
{
    let sfd = SIGNAL_FD.load(Ordering::Acquire);
    if sfd < 0 {
        return Err(Error::BadState(
            "signal handling was not enabled at init (EVENT_SIGNALFD)",
        ));
    }
    HANDLERS
        .lock()
        .unwrap()
        .insert(signum, Arc::new(StdMutex::new(Box::new(handler))));
    let mask = current_mask();
    unsafe {
        if libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if libc::signalfd(sfd, &mask, 0) < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Start the signalfd and its multiplexer fiber on the current vcpu.
pub(crate) fn start() -> Result<()> {
    if SIGNAL_FD.load(Ordering::Acquire) >= 0 {
        return Err(Error::BadState("signal engine already running"));
    }
    let mask = empty_sigset();
    let sfd = unsafe { libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
    if sfd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    SIGNAL_FD.store(sfd, Ordering::Release);

    let handle = fiber::spawn(move || mux_main(sfd), 64 * 1024)?;
    MUX_FIBER.with(|m| *m.borrow_mut() = Some(handle));
    log::debug!("signal multiplexer up");
    Ok(())
}

/// Stop the multiplexer fiber and close the signalfd.
pub(crate) fn stop() {
    let handle = MUX_FIBER.with(|m| m.borrow_mut().take());
    let Some(handle) = handle else { return };
    fiber::interrupt(&handle, libc::ECANCELED);
    while !handle.is_done() {
        fiber::sleep_us(1_000);
    }
    let sfd = SIGNAL_FD.swap(-1, Ordering::AcqRel);
    if sfd >= 0 {
        unsafe { libc::close(sfd) };
    }
    log::debug!("signal multiplexer down");
}

fn mux_main(sfd: RawFd) {
    const SIGINFO_SIZE: usize = std::mem::size_of::<libc::signalfd_siginfo>();
    loop {
        match coio::wait_for_fd(sfd, Events::READ, None) {
            Ok(()) => {}
            Err(Error::Interrupted(code)) if code == libc::ECANCELED => return,
            Err(e) => {
                log::error!("signal multiplexer wait failed: {}", e);
                return;
            }
        }
        loop {
            let mut info = MaybeUninit::<libc::signalfd_siginfo>::uninit();
            let n = unsafe {
                libc::read(sfd, info.as_mut_ptr() as *mut libc::c_void, SIGINFO_SIZE)
            };
            if n != SIGINFO_SIZE as isize {
                break;
            }
            let info = unsafe { info.assume_init() };
            dispatch(info.ssi_signo as i32);
        }
    }
}

/// Run the handler for `signum` on a fiber of its own and wait for it, so
/// handler invocations never overlap.
fn dispatch(signum: i32) {
    let handler = HANDLERS.lock().unwrap().get(&signum).cloned();
    let Some(handler) = handler else {
        log::warn!("signal {} arrived without a registered handler", signum);
        return;
    };
    fiber::start_proc(move || {
        let mut handler = handler.lock().unwrap();
        handler(signum);
    })
    .join();
}
