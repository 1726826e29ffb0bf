//! RPC client endpoint.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::clock::Deadline;
use crate::coio::{self, CoStream};
use crate::error::{Error, Result};
use crate::fiber::RwLock;
use crate::rpc::{ooo, FunctionId, Header, HEADER_SIZE};

/// A client endpoint multiplexing concurrent calls over one stream.
///
/// Requests are issued in submission order under the engine's issue lock;
/// responses are matched back by tag, so slow calls do not block fast
/// ones. A timeout that catches the stream at a frame boundary abandons
/// the wait but leaves the stream open (the late response is discarded
/// when it eventually arrives); a timeout mid-frame, short reads/writes
/// and protocol violations shut the stream down and fail every in-flight
/// call with [`Error::ConnectionReset`].
pub struct Stub {
    stream: RefCell<CoStream>,
    engine: ooo::Engine,
    next_tag: Cell<u64>,
    /// Calls take this shared; [`set_stream`](Self::set_stream) takes it
    /// exclusive.
    stream_lock: RwLock<()>,
}

impl Stub {
    pub fn new(stream: CoStream) -> Stub {
        Stub {
            stream: RefCell::new(stream),
            engine: ooo::Engine::new(),
            next_tag: Cell::new(1),
            stream_lock: RwLock::new(()),
        }
    }

    /// Number of calls currently in flight.
    pub fn queue_count(&self) -> usize {
        self.engine.queue_count()
    }

    /// Replace the underlying stream (e.g. after a reconnect). Waits for
    /// in-flight calls to drain.
    pub fn set_stream(&self, stream: CoStream) {
        let _excl = self.stream_lock.write();
        *self.stream.borrow_mut() = stream;
    }

    /// Perform one remote call: send `request` to `function`, wait for the
    /// matching response and place its payload into `response`. Returns
    /// the payload length.
    pub fn call(
        &self,
        function: FunctionId,
        request: &[u8],
        response: &mut Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let _shared = self.stream_lock.read();
        let deadline = Deadline::after(timeout);
        let fd = self.stream.borrow().as_raw_fd();
        let tag = self.next_tag.get();
        self.next_tag.set(tag + 1);

        if request.len() > u32::MAX as usize {
            return Err(Error::BadState("request payload exceeds frame size limit"));
        }

        self.engine.submit(tag, || {
            if deadline.has_expired() {
                log::error!("request timed out before send");
                return Err(Error::Timeout);
            }
            let header = Header {
                size: request.len() as u32,
                function,
                tag,
            };
            self.write_frame(fd, &header.encode(), request, deadline)
        })?;

        let header = self.engine.wait_completion(
            tag,
            deadline,
            &mut || self.read_header(fd, deadline),
            &mut |header| self.discard_body(fd, header.size as usize, deadline),
        )?;

        self.engine.collect(tag, || {
            response.clear();
            response.resize(header.size as usize, 0);
            self.read_exact(fd, response, deadline)?;
            Ok(header.size as usize)
        })
    }

    /// Write one frame. A send-buffer timeout before the first byte is a
    /// clean [`Error::Timeout`]; once any byte is out, a timeout would
    /// leave a torn frame on the wire and resets the stream instead.
    fn write_frame(
        &self,
        fd: RawFd,
        header: &[u8; HEADER_SIZE],
        payload: &[u8],
        deadline: Deadline,
    ) -> Result<()> {
        let mut wrote_any = false;
        for part in [&header[..], payload] {
            let mut buf = part;
            while !buf.is_empty() {
                match coio::write(fd, buf, remaining(deadline)) {
                    Ok(0) => return Err(self.broken("zero-length write")),
                    Ok(n) => {
                        wrote_any = true;
                        buf = &buf[n..];
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut && !wrote_any => {
                        return Err(Error::Timeout)
                    }
                    Err(e) => return Err(self.io_failed("write", e)),
                }
            }
        }
        Ok(())
    }

    /// Read one response header. A timeout before the first byte leaves
    /// the stream intact (the wait is simply abandoned); a timeout in the
    /// middle of a header is a torn frame.
    fn read_header(&self, fd: RawFd, deadline: Deadline) -> Result<Header> {
        let mut buf = [0u8; HEADER_SIZE];
        let mut off = 0;
        while off < buf.len() {
            match coio::read(fd, &mut buf[off..], remaining(deadline)) {
                Ok(0) => return Err(self.broken("peer closed the stream")),
                Ok(n) => off += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut && off == 0 => {
                    return Err(Error::Timeout)
                }
                Err(e) => return Err(self.io_failed("read", e)),
            }
        }
        match Header::decode(&buf) {
            Ok(header) => Ok(header),
            Err(e) => {
                self.shutdown();
                Err(e)
            }
        }
    }

    fn read_exact(&self, fd: RawFd, buf: &mut [u8], deadline: Deadline) -> Result<()> {
        let mut off = 0;
        while off < buf.len() {
            match coio::read(fd, &mut buf[off..], remaining(deadline)) {
                Ok(0) => return Err(self.broken("peer closed mid-frame")),
                Ok(n) => off += n,
                Err(e) => return Err(self.io_failed("read", e)),
            }
        }
        Ok(())
    }

    fn discard_body(&self, fd: RawFd, mut len: usize, deadline: Deadline) -> Result<()> {
        let mut sink = [0u8; 4096];
        while len > 0 {
            let chunk = len.min(sink.len());
            match coio::read(fd, &mut sink[..chunk], remaining(deadline)) {
                Ok(0) => return Err(self.broken("peer closed mid-frame")),
                Ok(n) => len -= n,
                Err(e) => return Err(self.io_failed("read", e)),
            }
        }
        Ok(())
    }

    fn io_failed(&self, op: &str, e: io::Error) -> Error {
        log::error!("rpc stream {} failed: {}", op, e);
        self.shutdown();
        Error::ConnectionReset
    }

    fn broken(&self, what: &str) -> Error {
        log::error!("rpc stream broken: {}", what);
        self.shutdown();
        Error::ConnectionReset
    }

    fn shutdown(&self) {
        self.stream.borrow().shutdown();
    }
}

fn remaining(deadline: Deadline) -> Option<Duration> {
    if deadline == Deadline::INFINITE {
        None
    } else {
        Some(Duration::from_micros(deadline.remaining_us()))
    }
}
