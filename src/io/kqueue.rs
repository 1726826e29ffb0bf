//! kqueue-backed readiness multiplexer (macOS and the BSDs).

use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use super::Events;
use crate::clock::TIMEOUT_INFINITY;

const BATCH: usize = 64;

pub(crate) struct Kqueue {
    kq: Cell<RawFd>,
}

impl Kqueue {
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Kqueue { kq: Cell::new(kq) })
    }

    pub fn fd(&self) -> RawFd {
        self.kq.get()
    }

    fn change(&self, fd: RawFd, filter: i16, flags: u16, data: u64) -> io::Result<()> {
        let ev = libc::kevent {
            ident: fd as libc::uintptr_t,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: data as *mut libc::c_void,
        };
        let rc = unsafe {
            libc::kevent(self.kq.get(), &ev, 1, ptr::null_mut(), 0, ptr::null())
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Upsert interests for `fd`; one kevent per direction.
    pub fn add(&self, fd: RawFd, events: Events, data: u64, oneshot: bool) -> io::Result<()> {
        let mut flags = libc::EV_ADD;
        if oneshot {
            flags |= libc::EV_ONESHOT;
        }
        if events.contains(Events::READ) {
            self.change(fd, libc::EVFILT_READ, flags, data)?;
        }
        if events.contains(Events::WRITE) {
            self.change(fd, libc::EVFILT_WRITE, flags, data)?;
        }
        Ok(())
    }

    /// Remove every interest of `fd`. Unknown fds are not an error.
    pub fn del(&self, fd: RawFd) -> io::Result<()> {
        for filter in [libc::EVFILT_READ, libc::EVFILT_WRITE] {
            if let Err(e) = self.change(fd, filter, libc::EV_DELETE, 0) {
                if e.raw_os_error() != Some(libc::ENOENT) {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub fn poll(
        &self,
        timeout_us: u64,
        sink: &mut dyn FnMut(u64, Events),
    ) -> io::Result<()> {
        let mut events: [libc::kevent; BATCH] = unsafe { std::mem::zeroed() };
        let mut ts = libc::timespec {
            tv_sec: (timeout_us / 1_000_000) as _,
            tv_nsec: ((timeout_us % 1_000_000) * 1_000) as _,
        };
        let mut ts_ptr: *const libc::timespec = if timeout_us == TIMEOUT_INFINITY {
            ptr::null()
        } else {
            &ts
        };
        loop {
            let n = unsafe {
                libc::kevent(
                    self.kq.get(),
                    ptr::null(),
                    0,
                    events.as_mut_ptr(),
                    BATCH as libc::c_int,
                    ts_ptr,
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
                let fired = match ev.filter {
                    libc::EVFILT_READ => Events::READ,
                    libc::EVFILT_WRITE => Events::WRITE,
                    _ => Events::ERROR,
                };
                let fired = if ev.flags & libc::EV_ERROR != 0 {
                    fired | Events::ERROR
                } else {
                    fired
                };
                sink(ev.udata as u64, fired);
            }
            if n as usize == BATCH {
                // there may be more events
                ts = libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 0,
                };
                ts_ptr = &ts;
                continue;
            }
            return Ok(());
        }
    }

    /// Close and recreate the kqueue descriptor (post-fork).
    pub fn rebuild(&self) -> io::Result<()> {
        unsafe { libc::close(self.kq.get()) };
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        self.kq.set(kq);
        Ok(())
    }

    pub fn close(&self) {
        let fd = self.kq.replace(-1);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        self.close();
    }
}
