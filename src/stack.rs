//! Pooled allocator for fiber stacks.
//!
//! Stacks are mmap-ed regions with a guard page at the low end. Freed
//! stacks go back into a per-thread pool of power-of-two size classes, so
//! the spawn/exit hot path almost never reaches the kernel. Transparent
//! huge pages are explicitly declined for stack memory: a THP-backed stack
//! inflates RSS by the huge-page size for every fiber.

use std::cell::RefCell;
use std::ptr::{self, NonNull};

use crate::error::{Error, Result};

/// Stack size used when the caller does not specify one.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest pooled class.
const MIN_CLASS_SIZE: usize = 4 * 1024;
/// Largest pooled class; bigger requests bypass the pool.
const MAX_CLASS_SIZE: usize = 64 * 1024 * 1024;

const N_CLASSES: usize = (MAX_CLASS_SIZE / MIN_CLASS_SIZE).trailing_zeros() as usize + 1;

#[inline]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[inline]
fn class_of(size: usize) -> Option<usize> {
    if size > MAX_CLASS_SIZE {
        return None;
    }
    let rounded = size.max(MIN_CLASS_SIZE).next_power_of_two();
    Some((rounded / MIN_CLASS_SIZE).trailing_zeros() as usize)
}

#[inline]
fn class_size(class: usize) -> usize {
    MIN_CLASS_SIZE << class
}

////////////////////////////////////////////////////////////////////////////////
// Stack
////////////////////////////////////////////////////////////////////////////////

/// An owned fiber stack. Returns itself to the per-thread pool on drop.
pub(crate) struct Stack {
    base: NonNull<u8>,
    map_len: usize,
    usable: usize,
}

impl Stack {
    /// Highest address of the usable region, suitable as an initial stack
    /// pointer (page aligned, grows down).
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.map_len) }
    }

    #[inline]
    pub fn usable_size(&self) -> usize {
        self.usable
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let region = Region {
            base: self.base,
            map_len: self.map_len,
            usable: self.usable,
        };
        let pooled = POOL
            .try_with(|pool| pool.borrow_mut().put(region))
            .unwrap_or(false);
        if !pooled {
            unsafe { unmap(self.base, self.map_len) };
        }
    }
}

struct Region {
    base: NonNull<u8>,
    map_len: usize,
    usable: usize,
}

unsafe fn unmap(base: NonNull<u8>, map_len: usize) {
    let rc = libc::munmap(base.as_ptr().cast(), map_len);
    debug_assert_eq!(rc, 0, "munmap of a fiber stack failed");
}

fn map_region(usable: usize) -> Result<Region> {
    let page = page_size();
    let usable = (usable + page - 1) & !(page - 1);
    let map_len = usable + page; // one guard page below
    unsafe {
        let base = libc::mmap(
            ptr::null_mut(),
            map_len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if base == libc::MAP_FAILED {
            return Err(Error::OutOfMemory("fiber stack mmap failed"));
        }
        let rw = (base as *mut u8).add(page);
        if libc::mprotect(rw.cast(), usable, libc::PROT_READ | libc::PROT_WRITE) != 0 {
            libc::munmap(base, map_len);
            return Err(Error::OutOfMemory("fiber stack mprotect failed"));
        }
        #[cfg(target_os = "linux")]
        libc::madvise(rw.cast(), usable, libc::MADV_NOHUGEPAGE);

        Ok(Region {
            base: NonNull::new_unchecked(base.cast()),
            map_len,
            usable,
        })
    }
}

////////////////////////////////////////////////////////////////////////////////
// Pool
////////////////////////////////////////////////////////////////////////////////

struct Pool {
    classes: [Vec<Region>; N_CLASSES],
}

impl Pool {
    fn new() -> Self {
        Pool {
            classes: std::array::from_fn(|_| Vec::new()),
        }
    }

    fn get(&mut self, size: usize) -> Option<Region> {
        let class = class_of(size)?;
        self.classes[class].pop()
    }

    /// Returns `false` if the region does not belong in the pool.
    fn put(&mut self, region: Region) -> bool {
        match class_of(region.usable) {
            Some(class) if class_size(class) == region.usable => {
                self.classes[class].push(region);
                true
            }
            _ => false,
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        for class in &mut self.classes {
            for region in class.drain(..) {
                unsafe { unmap(region.base, region.map_len) };
            }
        }
    }
}

thread_local! {
    static POOL: RefCell<Pool> = RefCell::new(Pool::new());
}

/// Allocate a stack of at least `size` usable bytes, preferring the pool.
pub(crate) fn alloc(size: usize) -> Result<Stack> {
    let region = match POOL.with(|pool| pool.borrow_mut().get(size)) {
        Some(region) => region,
        None => {
            let usable = match class_of(size) {
                Some(class) => class_size(class),
                None => size,
            };
            map_region(usable)?
        }
    };
    Ok(Stack {
        base: region.base,
        map_len: region.map_len,
        usable: region.usable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_round_up() {
        assert_eq!(class_of(1), Some(0));
        assert_eq!(class_of(MIN_CLASS_SIZE), Some(0));
        assert_eq!(class_of(MIN_CLASS_SIZE + 1), Some(1));
        assert_eq!(class_of(64 * 1024), Some(4));
        assert_eq!(class_of(MAX_CLASS_SIZE), Some((N_CLASSES - 1) as usize));
        assert_eq!(class_of(MAX_CLASS_SIZE + 1), None);
    }

    #[test]
    fn stack_is_writable_to_the_top() {
        let stack = alloc(64 * 1024).unwrap();
        assert!(stack.usable_size() >= 64 * 1024);
        unsafe {
            let top = stack.top();
            top.sub(1).write(0xAB);
            top.sub(stack.usable_size()).write(0xCD);
        }
    }

    #[test]
    fn pool_recycles_same_region() {
        let first = alloc(16 * 1024).unwrap();
        let base = first.base.as_ptr() as usize;
        drop(first);
        let second = alloc(16 * 1024).unwrap();
        assert_eq!(second.base.as_ptr() as usize, base);
    }

    #[test]
    fn oversize_bypasses_pool() {
        let stack = alloc(MAX_CLASS_SIZE + MIN_CLASS_SIZE).unwrap();
        assert!(stack.usable_size() > MAX_CLASS_SIZE);
    }
}
