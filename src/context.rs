//! Low-level stackful context switch.
//!
//! A context is nothing but a saved stack pointer: the switch routine
//! pushes the callee-saved register set onto the current stack, stores the
//! resulting `sp` into the old context, loads `sp` from the new one, pops
//! the register set back and returns. A freshly created fiber's stack is
//! seeded so that the first switch "returns" into an entry trampoline.
//!
//! Supported: x86_64 and aarch64, System V / AAPCS64 calling conventions.

use std::cell::Cell;

use crate::stack::Stack;

extern "C" {
    fn filament_context_swap(save: *mut *mut u8, load: *mut *mut u8);
}

/// The entry point seeded into a fresh stack. Must never return.
pub(crate) type Entry = extern "C" fn() -> !;

/// A suspended execution context (a stack pointer into a stack that holds
/// the callee-saved register set at its head).
pub(crate) struct Context {
    sp: Cell<*mut u8>,
}

impl Context {
    /// An empty context. Used for the currently running side of a switch:
    /// `swap` fills it in as it suspends.
    pub fn empty() -> Self {
        Context {
            sp: Cell::new(std::ptr::null_mut()),
        }
    }

    /// Seed `stack` so the first switch into the returned context enters
    /// `entry` with a well-formed, ABI-aligned stack.
    pub fn fresh(stack: &Stack, entry: Entry) -> Self {
        unsafe {
            let top = stack.top();
            debug_assert_eq!(top as usize % 16, 0);
            let sp = seed(top, entry as usize);
            Context { sp: Cell::new(sp) }
        }
    }

    /// Suspend the current execution into `save` and resume `load`.
    ///
    /// # Safety
    /// `load` must hold a valid suspended context (seeded by [`fresh`] or
    /// filled by a previous `swap`), and must not be resumed twice.
    pub unsafe fn swap(save: &Context, load: &Context) {
        filament_context_swap(save.sp.as_ptr(), load.sp.as_ptr());
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn seed(top: *mut u8, entry: usize) -> *mut u8 {
    // Layout (downwards from `top`, 16-byte aligned):
    //   top - 8   padding
    //   top - 16  return address -> entry (rsp % 16 == 8 at entry)
    //   top - 64  six zeroed callee-saved slots popped by the swap
    let slots = top.cast::<usize>();
    slots.sub(1).write(0);
    slots.sub(2).write(entry);
    for i in 3..=8 {
        slots.sub(i).write(0);
    }
    top.sub(64)
}

#[cfg(target_arch = "aarch64")]
unsafe fn seed(top: *mut u8, entry: usize) -> *mut u8 {
    // 160-byte save area: x19..x28, x29, x30, d8..d15; only the x30 (lr)
    // slot matters, the rest starts zeroed.
    let sp = top.sub(160);
    std::ptr::write_bytes(sp, 0, 160);
    sp.cast::<usize>().add(11).write(entry);
    sp
}

// The swap routine itself. Mach-O prepends an underscore to C symbols and
// rejects the ELF .type/.size annotations, so the symbol header differs
// per platform while the body is shared.

#[cfg(target_arch = "x86_64")]
macro_rules! emit_context_swap {
    ($name:literal) => {
        core::arch::global_asm!(
            ".text",
            concat!(".globl ", $name),
            ".p2align 4",
            concat!($name, ":"),
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "mov [rdi], rsp",
            "mov rsp, [rsi]",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "ret",
            options(raw)
        );
    };
}

#[cfg(target_arch = "aarch64")]
macro_rules! emit_context_swap {
    ($name:literal) => {
        core::arch::global_asm!(
            ".text",
            concat!(".globl ", $name),
            ".p2align 2",
            concat!($name, ":"),
            "sub sp, sp, #160",
            "stp x19, x20, [sp, #0]",
            "stp x21, x22, [sp, #16]",
            "stp x23, x24, [sp, #32]",
            "stp x25, x26, [sp, #48]",
            "stp x27, x28, [sp, #64]",
            "stp x29, x30, [sp, #80]",
            "stp d8, d9, [sp, #96]",
            "stp d10, d11, [sp, #112]",
            "stp d12, d13, [sp, #128]",
            "stp d14, d15, [sp, #144]",
            "mov x9, sp",
            "str x9, [x0]",
            "ldr x9, [x1]",
            "mov sp, x9",
            "ldp x19, x20, [sp, #0]",
            "ldp x21, x22, [sp, #16]",
            "ldp x23, x24, [sp, #32]",
            "ldp x25, x26, [sp, #48]",
            "ldp x27, x28, [sp, #64]",
            "ldp x29, x30, [sp, #80]",
            "ldp d8, d9, [sp, #96]",
            "ldp d10, d11, [sp, #112]",
            "ldp d12, d13, [sp, #128]",
            "ldp d14, d15, [sp, #144]",
            "add sp, sp, #160",
            "ret",
            options(raw)
        );
    };
}

#[cfg(not(target_vendor = "apple"))]
emit_context_swap!("filament_context_swap");

#[cfg(target_vendor = "apple")]
emit_context_swap!("_filament_context_swap");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack;
    use std::cell::RefCell;

    thread_local! {
        static SWAP_TEST: RefCell<Option<(Context, Context)>> = RefCell::new(None);
        static TRACE: RefCell<Vec<&'static str>> = RefCell::new(Vec::new());
    }

    fn contexts() -> (*const Context, *const Context) {
        SWAP_TEST.with(|cell| {
            let cell = cell.borrow();
            let (main_ctx, fiber_ctx) = cell.as_ref().unwrap();
            (main_ctx as *const Context, fiber_ctx as *const Context)
        })
    }

    extern "C" fn bouncer() -> ! {
        TRACE.with(|t| t.borrow_mut().push("fiber"));
        let (main_ctx, fiber_ctx) = contexts();
        unsafe { Context::swap(&*fiber_ctx, &*main_ctx) };
        unreachable!("resumed an abandoned test context");
    }

    #[test]
    fn switch_roundtrip() {
        let stk = stack::alloc(64 * 1024).unwrap();
        let fiber_ctx = Context::fresh(&stk, bouncer);
        let main_ctx = Context::empty();
        SWAP_TEST.with(|cell| *cell.borrow_mut() = Some((main_ctx, fiber_ctx)));

        TRACE.with(|t| t.borrow_mut().push("before"));
        let (main_ctx, fiber_ctx) = contexts();
        unsafe { Context::swap(&*main_ctx, &*fiber_ctx) };
        TRACE.with(|t| t.borrow_mut().push("after"));

        TRACE.with(|t| assert_eq!(*t.borrow(), ["before", "fiber", "after"]));
        SWAP_TEST.with(|cell| *cell.borrow_mut() = None);
    }
}
