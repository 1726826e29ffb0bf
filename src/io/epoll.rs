//! epoll-backed readiness multiplexer (Linux).

use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;

use super::{timeout_ms, Events};

const BATCH: usize = 64;

pub(crate) struct Epoll {
    epfd: Cell<RawFd>,
}

fn events_to_epoll(events: Events) -> u32 {
    let mut mask = 0;
    if events.contains(Events::READ) {
        mask |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if events.contains(Events::WRITE) {
        mask |= libc::EPOLLOUT as u32;
    }
    if events.contains(Events::ERROR) {
        mask |= libc::EPOLLERR as u32;
    }
    mask
}

fn epoll_to_events(mask: u32) -> Events {
    let mut events = Events::empty();
    // The kernel reports errors and hangups regardless of the requested
    // mask; they must wake waiters of either direction, or a fiber parked
    // for readability on a dead socket would sleep until its timeout.
    if mask & (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLPRI | libc::EPOLLERR)
        as u32
        != 0
    {
        events |= Events::READ;
    }
    if mask & (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
        events |= Events::WRITE;
    }
    if mask & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
        events |= Events::ERROR;
    }
    events
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Epoll {
            epfd: Cell::new(epfd),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.epfd.get()
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32, data: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: mask,
            u64: data,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd.get(), op, fd, &mut ev) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Upsert an interest. `oneshot` disables the registration after the
    /// first delivery.
    pub fn add(&self, fd: RawFd, events: Events, data: u64, oneshot: bool) -> io::Result<()> {
        let mut mask = events_to_epoll(events);
        if oneshot {
            mask |= libc::EPOLLONESHOT as u32;
        }
        match self.ctl(libc::EPOLL_CTL_ADD, fd, mask, data) {
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, mask, data)
            }
            other => other,
        }
    }

    /// Remove every interest of `fd`. Unknown fds are not an error.
    pub fn del(&self, fd: RawFd) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    /// Wait for events up to `timeout_us`, feeding `(data, events)` pairs
    /// to `sink` in report order. A full batch is re-polled with a zero
    /// timeout so a burst cannot starve the caller.
    pub fn poll(
        &self,
        timeout_us: u64,
        sink: &mut dyn FnMut(u64, Events),
    ) -> io::Result<()> {
        let mut events: [libc::epoll_event; BATCH] =
            unsafe { std::mem::zeroed() };
        let mut timeout = timeout_ms(timeout_us);
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd.get(),
                    events.as_mut_ptr(),
                    BATCH as libc::c_int,
                    timeout,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            for ev in &events[..n as usize] {
                sink(ev.u64, epoll_to_events(ev.events));
            }
            if n as usize == BATCH {
                // there may be more events
                timeout = 0;
                continue;
            }
            return Ok(());
        }
    }

    /// Close and recreate the epoll descriptor (post-fork).
    pub fn rebuild(&self) -> io::Result<()> {
        unsafe { libc::close(self.epfd.get()) };
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        self.epfd.set(epfd);
        Ok(())
    }

    pub fn close(&self) {
        let fd = self.epfd.replace(-1);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        self.close();
    }
}
