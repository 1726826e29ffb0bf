//! Cooperative input/output.
//!
//! Thin wrappers that turn non-blocking fds into fiber-blocking ones: a
//! syscall that would block parks the calling fiber on the master event
//! engine until the fd is ready, then retries. `WouldBlock` never escapes
//! to the caller.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use crate::clock::Deadline;
use crate::error::{Error, Result};
use crate::io::Events;
use crate::sched::{self, Park};

/// Wait until one of `events` fires on `fd` (one-shot), the timeout
/// passes, or the fiber is interrupted. Yields.
///
/// `fd` must not already carry an armed interest on this vcpu's engine;
/// that is a programming error reported as [`Error::BadState`].
pub fn wait_for_fd(fd: RawFd, events: Events, timeout: Option<Duration>) -> Result<()> {
    let vcpu = sched::with_vcpu(Rc::clone);
    let fiber_id = vcpu.current_fiber().shared.id;
    vcpu.engine.arm_oneshot(fd, events, fiber_id)?;
    let deadline = Deadline::after(timeout);
    let code = sched::park(
        Park::Sleep {
            deadline: deadline.expire_us(),
        },
        None,
    );
    vcpu.engine.disarm(fd, fiber_id);
    match code {
        0 => Ok(()),
        c if c == libc::ETIMEDOUT => Err(Error::Timeout),
        c => Err(Error::Interrupted(c)),
    }
}

/// Wait until `fd` is readable. Yields.
pub fn wait_for_fd_readable(fd: RawFd, timeout: Option<Duration>) -> Result<()> {
    wait_for_fd(fd, Events::READ, timeout)
}

/// Wait until `fd` is writable. Yields.
pub fn wait_for_fd_writable(fd: RawFd, timeout: Option<Duration>) -> Result<()> {
    wait_for_fd(fd, Events::WRITE, timeout)
}

fn crate_to_io(e: Error) -> io::Error {
    match e {
        Error::Timeout => io::ErrorKind::TimedOut.into(),
        Error::Interrupted(_) => io::ErrorKind::Interrupted.into(),
        Error::IO(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// CoStream
////////////////////////////////////////////////////////////////////////////////

/// A non-blocking byte stream driven by the master event engine.
///
/// Wraps any fd-like object; reads and writes suspend the calling fiber
/// instead of the vcpu.
pub struct CoStream {
    fd: RawFd,
}

impl CoStream {
    /// Take ownership of an fd-like object, switching it to non-blocking
    /// mode.
    pub fn new<T>(inner: T) -> io::Result<CoStream>
    where
        T: IntoRawFd,
    {
        let fd = inner.into_raw_fd();
        set_nonblocking(fd)?;
        Ok(CoStream { fd })
    }

    /// Connect to a remote TCP socket.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<CoStream> {
        let inner = TcpStream::connect(addr)?;
        inner.set_nonblocking(true)?;
        Ok(CoStream {
            fd: inner.into_raw_fd(),
        })
    }

    /// Opens a TCP connection to a remote host with a timeout.
    pub fn connect_timeout(addr: &SocketAddr, timeout: Duration) -> io::Result<CoStream> {
        let inner = TcpStream::connect_timeout(addr, timeout)?;
        inner.set_nonblocking(true)?;
        Ok(CoStream {
            fd: inner.into_raw_fd(),
        })
    }

    /// Pull some bytes from the stream. Suspends while nothing is
    /// readable; times out with `ErrorKind::TimedOut`.
    pub fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        read(self.fd, buf, timeout)
    }

    /// Write a buffer into the stream. Suspends while the socket buffer is
    /// full.
    pub fn write_with_timeout(&mut self, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
        write(self.fd, buf, timeout)
    }

    /// Shut down both directions of the underlying socket.
    pub fn shutdown(&self) {
        unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) };
    }
}

impl AsRawFd for CoStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for CoStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Read for CoStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_with_timeout(buf, None)
    }
}

impl Write for CoStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_with_timeout(buf, None)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for CoStream {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoListener
////////////////////////////////////////////////////////////////////////////////

/// A TCP listener whose `accept` suspends the calling fiber.
pub struct CoListener {
    inner: TcpListener,
}

impl CoListener {
    /// Bind and listen on `addr`.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<CoListener> {
        TcpListener::bind(addr)?.try_into()
    }

    /// Accept a new incoming connection from this listener.
    pub fn accept(&self) -> io::Result<CoStream> {
        loop {
            match self.inner.accept() {
                Ok((stream, _)) => return CoStream::new(stream),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_for_fd_readable(self.inner.as_raw_fd(), None).map_err(crate_to_io)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn inner_listener(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

impl TryFrom<TcpListener> for CoListener {
    type Error = io::Error;

    fn try_from(value: TcpListener) -> io::Result<Self> {
        value.set_nonblocking(true)?;
        Ok(Self { inner: value })
    }
}

////////////////////////////////////////////////////////////////////////////////
// raw helpers
////////////////////////////////////////////////////////////////////////////////

pub(crate) fn read(fd: RawFd, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
    let deadline = Deadline::after(timeout);
    loop {
        let result = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if result >= 0 {
            return Ok(result as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(err);
        }
        wait_deadline(fd, Events::READ, deadline)?;
    }
}

pub(crate) fn write(fd: RawFd, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
    let deadline = Deadline::after(timeout);
    loop {
        let result = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if result >= 0 {
            return Ok(result as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(err);
        }
        wait_deadline(fd, Events::WRITE, deadline)?;
    }
}

fn wait_deadline(fd: RawFd, events: Events, deadline: Deadline) -> io::Result<()> {
    let remaining = deadline.remaining_us();
    if remaining == 0 {
        return Err(io::ErrorKind::TimedOut.into());
    }
    let timeout = if deadline == Deadline::INFINITE {
        None
    } else {
        Some(Duration::from_micros(remaining))
    };
    wait_for_fd(fd, events, timeout).map_err(crate_to_io)
}
