//! A pool of worker vcpus executing submitted callables.
//!
//! Each worker is an OS thread running its own runtime (scheduler + master
//! engine). Tasks travel through a shared [`MpmcRing`]; availability is
//! signalled by a cross-vcpu [`Semaphore`]. On shutdown the queue is
//! drained: every task already submitted still executes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::thread;

use crate::error::{Error, Result};
use crate::fiber::Semaphore;
use crate::ring::{FiberPause, MpmcRing, ThreadPause};
use crate::{sched, InitFlags};

type Task = Box<dyn FnOnce() + Send + 'static>;

const QUEUE_CAPACITY: usize = 4096;

struct PoolShared {
    ring: MpmcRing<Task>,
    tasks: Semaphore,
    stop: AtomicBool,
}

/// A fixed set of worker vcpus consuming a shared task queue.
pub struct WorkPool {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkPool {
    /// Spawn `n` workers, each with an independent runtime.
    pub fn new(n: usize) -> Result<WorkPool> {
        if n == 0 {
            return Err(Error::BadState("a work pool needs at least one worker"));
        }
        let shared = Arc::new(PoolShared {
            ring: MpmcRing::new(QUEUE_CAPACITY),
            tasks: Semaphore::new(0),
            stop: AtomicBool::new(false),
        });
        let mut workers = Vec::with_capacity(n);
        for i in 0..n {
            let shared = shared.clone();
            let worker = thread::Builder::new()
                .name(format!("filament-worker-{}", i))
                .spawn(move || worker_main(shared))
                .map_err(Error::IO)?;
            workers.push(worker);
        }
        Ok(WorkPool { shared, workers })
    }

    /// Run `f` on some worker and block the calling fiber until it
    /// returns, handing back its result.
    ///
    /// Must be called from a fiber (any vcpu).
    pub fn call<'a, F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'a,
        R: Send + 'a,
    {
        let cell: Arc<(StdMutex<Option<R>>, Semaphore)> =
            Arc::new((StdMutex::new(None), Semaphore::new(0)));
        let cell_in_task = cell.clone();
        let task = move || {
            let value = f();
            *cell_in_task.0.lock().unwrap() = Some(value);
            cell_in_task.1.signal(1);
        };
        // The task cannot outlive this call: we block on the result cell
        // until the worker has finished, so erasing the lifetime of `f`'s
        // captures is sound.
        let task: Box<dyn FnOnce() + Send + 'a> = Box::new(task);
        let task: Task = unsafe { std::mem::transmute(task) };
        self.submit(task);
        while cell.1.wait(1).is_err() {}
        let value = cell.0.lock().unwrap().take();
        value.expect("worker finished without storing a result")
    }

    /// Fire-and-forget variant of [`call`](Self::call). May be invoked
    /// from any thread.
    pub fn do_call<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(f));
    }

    fn submit(&self, task: Task) {
        if sched::in_runtime() {
            self.shared.ring.send::<FiberPause>(task);
        } else {
            self.shared.ring.send::<ThreadPause>(task);
        }
        self.shared.tasks.signal(1);
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.tasks.signal(self.workers.len() as u64);
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.join() {
                log::error!("work pool worker panicked: {:?}", e);
            }
        }
    }
}

fn worker_main(shared: Arc<PoolShared>) {
    if let Err(e) = crate::init(InitFlags::default()) {
        log::error!("work pool worker failed to start a runtime: {}", e);
        return;
    }
    loop {
        let _ = shared.tasks.wait(1);
        // Remaining queued tasks are executed even after stop.
        if shared.stop.load(Ordering::Acquire) && shared.ring.is_empty() {
            break;
        }
        if let Some(task) = shared.ring.pop() {
            task();
        }
    }
    if let Err(e) = crate::fini() {
        log::error!("work pool worker failed to stop its runtime: {}", e);
    }
}
