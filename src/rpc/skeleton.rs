//! RPC server dispatcher.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use crate::coio::{self, CoStream};
use crate::error::{Error, Result};
use crate::fiber::{self, Cond, FiberHandle, Mutex};
use crate::rpc::{FunctionId, Header, HEADER_SIZE};

/// A service handler: gets the request header and payload, returns the
/// response payload. Runs on a fiber and may block.
pub type Handler = Rc<dyn Fn(&Header, &[u8]) -> Vec<u8>>;

////////////////////////////////////////////////////////////////////////////////
// allocator injection
////////////////////////////////////////////////////////////////////////////////

/// Supplier of request payload buffers, injected into the skeleton so
/// embedders can pool or align them.
pub trait BufAllocator {
    fn alloc(&self, size: usize) -> Vec<u8>;
}

/// The default allocator: plain heap vectors.
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl BufAllocator for HeapAllocator {
    fn alloc(&self, size: usize) -> Vec<u8> {
        vec![0u8; size]
    }
}

////////////////////////////////////////////////////////////////////////////////
// Skeleton
////////////////////////////////////////////////////////////////////////////////

/// The server side of the framing: reads frames off streams, dispatches
/// to registered functions and writes tagged responses back.
///
/// With `concurrent` set, each request is served on a fiber of its own so
/// a slow handler does not starve the stream; responses still go out one
/// at a time under a per-stream write lock, in completion order.
pub struct Skeleton {
    services: RefCell<HashMap<FunctionId, Handler>>,
    allocator: RefCell<Rc<dyn BufAllocator>>,
    concurrent: bool,
    running: Cell<bool>,
    serving: Cell<u64>,
    served_cond: Cond,
    /// Fibers currently blocked reading a header; interrupted on shutdown.
    readers: RefCell<Vec<FiberHandle>>,
}

struct StreamState {
    stream: CoStream,
    write_lock: Mutex<()>,
    /// Requests in flight on this stream; `serve` cannot return (and drop
    /// the stream) before they finish.
    serv_count: Cell<u64>,
    serv_cond: Cond,
}

impl Skeleton {
    pub fn new(concurrent: bool) -> Rc<Skeleton> {
        Rc::new(Skeleton {
            services: RefCell::new(HashMap::new()),
            allocator: RefCell::new(Rc::new(HeapAllocator)),
            concurrent,
            running: Cell::new(true),
            serving: Cell::new(0),
            served_cond: Cond::new(),
            readers: RefCell::new(Vec::new()),
        })
    }

    /// Register a function. Re-registering an id is a caller bug.
    pub fn add_function(
        &self,
        id: FunctionId,
        f: impl Fn(&Header, &[u8]) -> Vec<u8> + 'static,
    ) -> Result<()> {
        let mut services = self.services.borrow_mut();
        if services.contains_key(&id) {
            return Err(Error::BadState("function id already registered"));
        }
        services.insert(id, Rc::new(f));
        Ok(())
    }

    /// Unregister a function. Returns whether it existed.
    pub fn remove_function(&self, id: FunctionId) -> bool {
        self.services.borrow_mut().remove(&id).is_some()
    }

    /// Inject the request buffer allocator.
    pub fn set_allocator(&self, allocator: Rc<dyn BufAllocator>) {
        *self.allocator.borrow_mut() = allocator;
    }

    /// Serve `stream` until the peer closes, a protocol violation occurs
    /// or the skeleton shuts down. Call it on a fiber per connection.
    pub fn serve(self: &Rc<Self>, stream: CoStream) -> Result<()> {
        if !self.running.get() {
            return Err(Error::BadState("the skeleton has been shut down"));
        }
        let state = Rc::new(StreamState {
            stream,
            write_lock: Mutex::new(()),
            serv_count: Cell::new(0),
            serv_cond: Cond::new(),
        });

        let result = self.serve_loop(&state);

        // The stream may not be dropped while handler fibers still
        // reference it.
        while state.serv_count.get() > 0 {
            state.serv_cond.wait();
        }
        result
    }

    fn serve_loop(self: &Rc<Self>, state: &Rc<StreamState>) -> Result<()> {
        let fd = state.stream.as_raw_fd();
        while self.running.get() {
            let header = {
                let me = fiber::current();
                self.readers.borrow_mut().push(me.clone());
                let read = self.read_request_header(fd);
                self.readers.borrow_mut().retain(|h| h != &me);
                match read {
                    Ok(Some(header)) => header,
                    Ok(None) => return Ok(()), // peer closed cleanly
                    Err(e) => {
                        state.stream.shutdown();
                        return Err(e);
                    }
                }
            };

            let Some(function) = self.services.borrow().get(&header.function).cloned() else {
                log::error!(
                    "no service for function {{iid: {}, fid: {}}}",
                    header.function.iid,
                    header.function.fid
                );
                state.stream.shutdown();
                return Err(Error::ConnectionReset);
            };

            let mut body = self.allocator.borrow().alloc(header.size as usize);
            if let Err(e) = read_exact(fd, &mut body) {
                state.stream.shutdown();
                return Err(e);
            }

            if self.concurrent {
                let this = self.clone();
                let handler_state = state.clone();
                state.serv_count.set(state.serv_count.get() + 1);
                let spawned = fiber::spawn(
                    move || {
                        this.serve_one(&handler_state, &function, &header, &body);
                        handler_state
                            .serv_count
                            .set(handler_state.serv_count.get() - 1);
                        handler_state.serv_cond.broadcast();
                    },
                    crate::stack::DEFAULT_STACK_SIZE,
                );
                if let Err(e) = spawned {
                    log::error!("failed to spawn a request handler fiber: {}", e);
                    state.serv_count.set(state.serv_count.get() - 1);
                }
            } else {
                self.serve_one(state, &function, &header, &body);
            }
        }
        Ok(())
    }

    fn serve_one(&self, state: &StreamState, function: &Handler, header: &Header, body: &[u8]) {
        self.serving.set(self.serving.get() + 1);
        let response = function(header, body);
        self.serving.set(self.serving.get() - 1);
        self.served_cond.broadcast();

        let reply = Header {
            size: response.len() as u32,
            function: header.function,
            tag: header.tag,
        };
        let _wl = state.write_lock.lock();
        let fd = state.stream.as_raw_fd();
        if write_all(fd, &reply.encode())
            .and_then(|()| write_all(fd, &response))
            .is_err()
        {
            log::error!("failed to send rpc response, shutting stream down");
            state.stream.shutdown();
        }
    }

    /// `Ok(None)` means the peer closed at a frame boundary.
    fn read_request_header(&self, fd: RawFd) -> Result<Option<Header>> {
        let mut buf = [0u8; HEADER_SIZE];
        let mut off = 0;
        while off < buf.len() {
            match coio::read(fd, &mut buf[off..], None) {
                Ok(0) if off == 0 => return Ok(None),
                Ok(0) => return Err(Error::ConnectionReset),
                Ok(n) => off += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    if !self.running.get() {
                        return Ok(None);
                    }
                    return Err(Error::Interrupted(fiber::last_error()));
                }
                Err(_) => return Err(Error::ConnectionReset),
            }
        }
        Header::decode(&buf).map(Some)
    }

    /// Stop serving: wake up every reader and wait until in-progress
    /// handlers have finished.
    pub fn shutdown(&self) {
        self.running.set(false);
        for reader in self.readers.borrow_mut().drain(..) {
            fiber::interrupt(&reader, libc::ECANCELED);
        }
        while self.serving.get() > 0 {
            self.served_cond.wait();
        }
    }
}

impl Drop for Skeleton {
    fn drop(&mut self) {
        self.running.set(false);
    }
}

fn write_all(fd: RawFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match coio::write(fd, buf, None) {
            Ok(0) => return Err(Error::ConnectionReset),
            Ok(n) => buf = &buf[n..],
            Err(_) => return Err(Error::ConnectionReset),
        }
    }
    Ok(())
}

fn read_exact(fd: RawFd, buf: &mut [u8]) -> Result<()> {
    let mut off = 0;
    while off < buf.len() {
        match coio::read(fd, &mut buf[off..], None) {
            Ok(0) => return Err(Error::ConnectionReset),
            Ok(n) => off += n,
            Err(_) => return Err(Error::ConnectionReset),
        }
    }
    Ok(())
}
