//! Fiber-local storage with a process-wide key space.
//!
//! Keys are allocated once per process (any vcpu); values live per fiber
//! and are dropped with it. This mirrors the classic
//! `key_create`/`get`/`set`/`delete` surface, expressed over `Any` instead
//! of raw pointers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;

use once_cell::sync::Lazy;

use crate::sched;

static NEXT_KEY: AtomicU32 = AtomicU32::new(1);
static LIVE_KEYS: Lazy<StdMutex<HashSet<u32>>> = Lazy::new(|| StdMutex::new(HashSet::new()));

/// A handle into every fiber's local-storage table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(u32);

impl Key {
    /// Allocate a fresh key, distinct from every key in the process.
    pub fn new() -> Self {
        let id = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
        LIVE_KEYS.lock().unwrap().insert(id);
        Key(id)
    }

    /// Retire the key process-wide. Values stored under it become
    /// unreachable and are dropped lazily with their fibers.
    pub fn delete(self) {
        LIVE_KEYS.lock().unwrap().remove(&self.0);
    }

    fn is_live(&self) -> bool {
        LIVE_KEYS.lock().unwrap().contains(&self.0)
    }

    /// Store `value` under this key for the current fiber. Returns `false`
    /// if the key has been deleted.
    pub fn set<T: 'static>(&self, value: T) -> bool {
        if !self.is_live() {
            return false;
        }
        sched::with_vcpu(|v| {
            v.current_fiber()
                .locals
                .borrow_mut()
                .insert(self.0, Box::new(value));
        });
        true
    }

    /// Clone the current fiber's value under this key.
    pub fn get<T: 'static + Clone>(&self) -> Option<T> {
        self.with(|v: &T| v.clone())
    }

    /// Run `f` over a reference to the current fiber's value, if present
    /// and of the requested type.
    pub fn with<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        if !self.is_live() {
            return None;
        }
        sched::with_vcpu(|v| {
            let fiber = v.current_fiber();
            let locals = fiber.locals.borrow();
            locals.get(&self.0).and_then(|b| b.downcast_ref()).map(f)
        })
    }

    /// Remove the current fiber's value under this key. Returns whether a
    /// value was present.
    pub fn remove(&self) -> bool {
        sched::with_vcpu(|v| {
            v.current_fiber()
                .locals
                .borrow_mut()
                .remove(&self.0)
                .is_some()
        })
    }
}

impl Default for Key {
    fn default() -> Self {
        Self::new()
    }
}
