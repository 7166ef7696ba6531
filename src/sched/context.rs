//! Saved CPU state for a kernel thread's stack.
//!
//! Threads only ever switch at an explicit [`switch`](Context::switch) call,
//! so it is enough to save the stack pointer and let the System V AMD64
//! calling convention's callee-saved registers spill onto the stack the same
//! way an ordinary `call` would. [`switch_asm`] is the only hand-written
//! assembly in the scheduler.

use core::mem;

use shared::memory::addr::VirtAddress;

/// Layout `switch_asm` expects at the bottom of a suspended thread's stack:
/// the registers it pushes, in push order, followed by the return address
/// its final `ret` pops.
#[repr(C)]
struct InitialFrame {
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    return_address: u64,
}

pub struct Context {
    rsp: u64,
}

impl Context {
    /// Builds a context that, when first switched to, starts running
    /// `entry(arg)` on `stack_top`.
    ///
    /// # Safety
    /// `stack_top` must be 16-byte aligned and point one past the end of a
    /// stack that stays mapped and exclusively owned by this context for as
    /// long as it exists.
    pub unsafe fn new(
        stack_top: VirtAddress,
        entry: extern "C" fn(usize) -> !,
        arg: usize,
    ) -> Context {
        let frame_addr = stack_top.as_raw() as usize - mem::size_of::<InitialFrame>();
        debug_assert_eq!(frame_addr % 8, 0);

        // SAFETY: `frame_addr` lies within `stack_top`'s stack by
        // construction, and nothing else has written to it yet.
        unsafe {
            (frame_addr as *mut InitialFrame).write(InitialFrame {
                rbp: 0,
                // Preserved across the first switch, read back by
                // `thread_trampoline`.
                rbx: arg as u64,
                r12: entry as usize as u64,
                r13: 0,
                r14: 0,
                r15: 0,
                return_address: thread_trampoline as usize as u64,
            });
        }

        Context {
            rsp: frame_addr as u64,
        }
    }

    /// A context with no saved state. Used for the thread the kernel is
    /// already running on when the scheduler starts; it is never built by
    /// [`Context::new`], only switched away from and back into.
    pub const fn new_empty() -> Context {
        Context { rsp: 0 }
    }

    /// Switches from the context currently running on this CPU (`self`) to
    /// `next`, saving `self`'s callee-saved registers and stack pointer and
    /// restoring `next`'s. Returns once some other thread switches back to
    /// `self`.
    ///
    /// # Safety
    /// `self` must describe the context actually executing on this CPU.
    pub unsafe fn switch(&mut self, next: &mut Context) {
        // SAFETY: `self.rsp` is this CPU's own stack pointer storage, and
        // `next.rsp` is a previously saved or freshly built context.
        unsafe {
            switch_asm(&mut self.rsp, next.rsp);
        }
    }

    /// Switches into `self` without saving the caller's context anywhere.
    /// For threads that are exiting for good and will never be resumed.
    ///
    /// # Safety
    /// Same as [`Context::switch`], except the caller's own context is
    /// discarded; it must never be switched back into.
    pub unsafe fn switch_to_nosave(&mut self) {
        let mut discard: u64 = 0;
        // SAFETY: `discard` is a throwaway save slot; nothing ever reads it.
        unsafe {
            switch_asm(&mut discard, self.rsp);
        }
    }
}

// SAFETY: a `Context` is just a saved stack pointer; the stack it points to
// is exclusively owned by whichever thread holds this `Context`.
unsafe impl Send for Context {}

extern "C" {
    /// Saves the caller's callee-saved registers and stack pointer to
    /// `*save_rsp`, then loads `load_rsp` as the new stack pointer, pops the
    /// callee-saved registers that stack's owner last saved (or that
    /// [`Context::new`] seeded), and returns into whatever is now on top of
    /// that stack.
    fn switch_asm(save_rsp: *mut u64, load_rsp: u64);

    /// Entry point seeded by [`Context::new`]. Never called directly from
    /// Rust; reached only via `switch_asm`'s final `ret`.
    fn thread_trampoline();
}

core::arch::global_asm!(
    ".global switch_asm",
    "switch_asm:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

core::arch::global_asm!(
    ".global thread_trampoline",
    "thread_trampoline:",
    // `r12`/`rbx` were just restored by `switch_asm`'s pops, carrying the
    // entry point and argument `Context::new` seeded them with.
    "mov rdi, rbx",
    "call r12",
    // `entry` is `-> !` and must not return.
    "ud2",
);
