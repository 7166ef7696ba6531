//! Cooperative kernel thread scheduler.
//!
//! Threads live behind a lock; the ready queue is a plain FIFO. [`switch_to`]
//! extracts raw pointers to the two `ThreadInfo`s involved and drops the
//! scheduler lock before actually switching stacks, so nothing ever switches
//! while the lock is held.

mod context;

use core::mem;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use spin::Mutex;

use crate::mm;
use crate::mm::layout::VirtualMap;
use crate::mm::paging::PageTableFlags;
use crate::mm::virtmem;
use shared::memory::addr::Length;
use shared::memory::page::{Page, PAGE_SIZE};

use self::context::Context;

/// Identifies a kernel thread. IDs are never reused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl ThreadId {
    /// The raw numeric value, for handing to code outside this module that
    /// just wants an opaque thread identifier (the ACPICA OSL's
    /// `AcpiOsGetThreadId`, for instance).
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ThreadStatus {
    Running,
    Blocked,
    /// Exited via [`quit_current`]; its stack is reclaimed the next time
    /// some other thread switches away from it.
    Zombie,
}

struct ThreadInfo {
    status: ThreadStatus,
    context: Context,
    /// Stack backing this thread, reclaimed when it's reaped.
    stack: Stack,
}

/// Owns a kernel thread's stack: the physical frames backing it and the
/// [`VirtualMap::kernel_stacks`] slot they're mapped into. Unmaps and frees
/// both on drop.
struct Stack {
    base: Page,
    frames: mm::OwnedFrameRange,
}

impl Drop for Stack {
    fn drop(&mut self) {
        for i in 0..STACK_PAGES {
            let page = self.base.next(i).unwrap();
            // SAFETY: this stack's thread is a reaped zombie; nothing is
            // executing on it and no other mapping aliases these pages.
            unsafe {
                let _ = virtmem::unmap(page);
            }
        }
        // `self.frames` drops next, returning the physical frames.
    }
}

struct ThreadList {
    map: BTreeMap<ThreadId, Box<ThreadInfo>>,
    next_id: u64,
}

impl ThreadList {
    const fn new() -> ThreadList {
        ThreadList {
            map: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn insert(&mut self, info: ThreadInfo) -> ThreadId {
        let id = ThreadId(self.next_id);
        self.next_id += 1;
        assert!(self.map.insert(id, Box::new(info)).is_none());
        id
    }

    fn get_mut(&mut self, id: ThreadId) -> &mut ThreadInfo {
        self.map.get_mut(&id).expect("unknown thread id")
    }

    fn remove(&mut self, id: ThreadId) -> Box<ThreadInfo> {
        self.map.remove(&id).expect("unknown thread id")
    }
}

static THREADS: Mutex<ThreadList> = Mutex::new(ThreadList::new());
static READY_QUEUE: Mutex<VecDeque<ThreadId>> = Mutex::new(VecDeque::new());
static ZOMBIES: Mutex<VecDeque<ThreadId>> = Mutex::new(VecDeque::new());

static CURRENT_THREAD: AtomicU64 = AtomicU64::new(0);
static NEXT_STACK_SLOT: AtomicU64 = AtomicU64::new(0);
static IRQ_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Power-of-two order passed to [`mm::allocate_owned_frames`] for a kernel
/// thread's stack: 2^4 = 16 frames, 64 KiB.
const STACK_ORDER: usize = 4;
const STACK_PAGES: u64 = 1 << STACK_ORDER;
const STACK_LEN: u64 = STACK_PAGES * PAGE_SIZE.as_raw();

/// The thread this CPU is currently running.
pub fn current_thread() -> ThreadId {
    ThreadId(CURRENT_THREAD.load(Ordering::SeqCst))
}

/// Whether we're currently servicing a hardware interrupt. Sleeping sync
/// primitives (mutex, semaphore `wait`, condition variable) are forbidden
/// from IRQ context and assert this is `false`.
pub fn in_irq_context() -> bool {
    IRQ_DEPTH.load(Ordering::SeqCst) > 0
}

/// Marks entry into interrupt context. Called by the PIC dispatch before
/// running a registered handler.
pub fn enter_irq() {
    IRQ_DEPTH.fetch_add(1, Ordering::SeqCst);
}

/// Marks the end of interrupt handling. Must be paired with [`enter_irq`].
pub fn leave_irq() {
    IRQ_DEPTH.fetch_sub(1, Ordering::SeqCst);
}

/// Whether the current thread has a signal pending. This kernel has no
/// signal delivery mechanism of its own; sync primitives that consult this
/// (for interrupt-refund semantics) will simply never see one until a
/// signal source is wired in.
pub fn signal_pending() -> bool {
    false
}

fn allocate_stack() -> Stack {
    let slot = NEXT_STACK_SLOT.fetch_add(1, Ordering::Relaxed);
    let region = VirtualMap::kernel_stacks();
    let base_addr = region.address() + Length::from_raw(slot * STACK_LEN);
    assert!(
        base_addr
            .offset_by_checked(Length::from_raw(STACK_LEN))
            .map_or(false, |end| end <= region.end_address()),
        "kernel thread stack slots exhausted"
    );
    let base = Page::new(base_addr);

    let frames =
        mm::allocate_owned_frames(STACK_ORDER).expect("out of physical memory for kernel stack");
    for i in 0..STACK_PAGES {
        let page = base.next(i).unwrap();
        let frame = frames.range().first().next(i).unwrap();
        // SAFETY: `page` lies in this stack's exclusive slot of
        // `VirtualMap::kernel_stacks`, and `frame` is owned by `frames`,
        // which this `Stack` takes ownership of below.
        unsafe {
            virtmem::map(
                page,
                frame,
                PageTableFlags::WRITABLE | PageTableFlags::EXECUTE_DISABLE,
                mm::allocate_frame,
            )
            .expect("failed to map kernel thread stack");
        }
    }

    Stack { base, frames }
}

fn create_task(entry: extern "C" fn(usize) -> !, arg: usize) -> ThreadId {
    let stack = allocate_stack();
    let stack_top = stack
        .base
        .start()
        .offset_by_checked(Length::from_raw(STACK_LEN))
        .expect("stack slot address overflowed");

    // SAFETY: `stack_top` is page- (hence 16-byte-) aligned, and `stack`
    // outlives the `Context` built from it: both end up in the same
    // `ThreadInfo`.
    let context = unsafe { Context::new(stack_top, entry, arg) };

    THREADS.lock().insert(ThreadInfo {
        status: ThreadStatus::Blocked,
        context,
        stack,
    })
}

/// Spawns a new kernel thread running `entry(arg)`, ready to run.
pub fn spawn_kthread(entry: extern "C" fn(usize) -> !, arg: usize) -> ThreadId {
    let id = create_task(entry, arg);
    THREADS.lock().get_mut(id).status = ThreadStatus::Running;
    READY_QUEUE.lock().push_back(id);
    id
}

extern "C" fn kernel_main_trampoline(kernel_main: usize) -> ! {
    // SAFETY: `kernel_main` was cast from an `extern "C" fn() -> !` in
    // `init_kernel_main_thread` and is called back as the same type here.
    let kernel_main: extern "C" fn() -> ! = unsafe { mem::transmute(kernel_main) };
    kernel_main()
}

/// Leaves the loader-provided boot stack for good and begins cooperative
/// scheduling on `kernel_main`, running on a freshly allocated kernel
/// thread stack.
///
/// # Safety
/// Must be called exactly once, before any other `sched` function, with
/// interrupts disabled and the boot stack not needed again.
pub unsafe fn init_kernel_main_thread(kernel_main: extern "C" fn() -> !) -> ! {
    let main_id = create_task(kernel_main_trampoline, kernel_main as usize);
    THREADS.lock().get_mut(main_id).status = ThreadStatus::Running;
    CURRENT_THREAD.store(main_id.0, Ordering::SeqCst);

    let main_ctx: *mut Context = {
        let mut threads = THREADS.lock();
        &mut threads.get_mut(main_id).context as *mut Context
    };

    // SAFETY: `main_ctx` points into `main_id`'s `ThreadInfo`, which lives
    // in `THREADS` for the rest of the kernel's life. The boot stack this
    // call runs on is abandoned for good; nothing will ever switch back to
    // it.
    unsafe {
        (*main_ctx).switch_to_nosave();
    }

    unreachable!("thread_trampoline never returns")
}

fn reap_zombies() {
    loop {
        let id = match ZOMBIES.lock().pop_front() {
            Some(id) => id,
            None => break,
        };
        // Dropping the removed `ThreadInfo` drops its `Stack`, unmapping
        // and freeing it. Neither this thread nor any other is running on
        // it: `quit_current` switched away before enqueueing it here.
        drop(THREADS.lock().remove(id));
    }
}

fn switch_to(next: ThreadId) {
    let cur = current_thread();
    if cur == next {
        return;
    }

    let (cur_ptr, next_ptr): (*mut ThreadInfo, *mut ThreadInfo) = {
        let mut threads = THREADS.lock();
        let cur_ptr = threads.get_mut(cur) as *mut ThreadInfo;
        let next_ptr = threads.get_mut(next) as *mut ThreadInfo;
        (cur_ptr, next_ptr)
    };

    CURRENT_THREAD.store(next.0, Ordering::SeqCst);

    // SAFETY: both pointers were read from live `THREADS` entries under its
    // lock, which is dropped before we touch them. Neither thread can be
    // removed from `THREADS` while it might still be switched to or from:
    // `reap_zombies` only removes threads already switched away from for
    // good.
    unsafe {
        debug_assert_eq!((*next_ptr).status, ThreadStatus::Running);
        (*cur_ptr).context.switch(&mut (*next_ptr).context);
    }
}

/// Gives up the remainder of the current thread's time slice.
pub fn yield_current() {
    reap_zombies();
    let cur = current_thread();

    let next = {
        let cur_status = THREADS.lock().get_mut(cur).status;
        let mut ready = READY_QUEUE.lock();
        if cur_status == ThreadStatus::Running {
            ready.push_back(cur);
        }
        ready.pop_front()
    };

    if let Some(next) = next {
        switch_to(next);
    }
}

/// Marks the current thread blocked without switching away from it yet.
///
/// Split out from [`sleep_current`] so callers that enqueue themselves onto
/// some other wait list under a spinlock (mutex, semaphore, condvar) can mark
/// themselves blocked *before* dropping that lock. Since a spinlock disables
/// interrupts, that ordering closes the window where an interrupt handler's
/// [`wake`] could otherwise run against a thread still marked `Running`.
pub fn mark_blocked() {
    let cur = current_thread();
    THREADS.lock().get_mut(cur).status = ThreadStatus::Blocked;
}

/// Completes a sleep begun with [`mark_blocked`].
///
/// If a [`wake`] already ran in the gap between `mark_blocked` and this call
/// (always from an interrupt handler; nothing else preempts a cooperative
/// thread), the current thread is already `Running` and sitting in the ready
/// queue. Rather than switch away and rely on picking itself back up, this
/// notices that, pulls itself back out of the ready queue, and returns
/// immediately.
///
/// # Panics
/// Panics if called from interrupt context, while holding a spinlock
/// (debug builds only), or if no other thread is ready to run.
pub fn commit_sleep() {
    assert!(
        !in_irq_context(),
        "commit_sleep called from interrupt context"
    );
    debug_assert_eq!(
        crate::sync::spinlock::held_count(),
        0,
        "commit_sleep called while holding a spinlock"
    );

    reap_zombies();
    let cur = current_thread();

    if THREADS.lock().get_mut(cur).status == ThreadStatus::Running {
        let mut ready = READY_QUEUE.lock();
        if let Some(pos) = ready.iter().position(|&id| id == cur) {
            ready.remove(pos);
        }
        return;
    }

    let next = READY_QUEUE
        .lock()
        .pop_front()
        .expect("commit_sleep: no runnable thread to switch to");
    switch_to(next);
}

/// Blocks the current thread and switches to the next ready thread. The
/// caller is responsible for arranging a later [`wake`].
///
/// # Panics
/// Panics if called from interrupt context, while holding a spinlock
/// (debug builds only), or if no other thread is ready to run.
pub fn sleep_current() {
    mark_blocked();
    commit_sleep();
}

/// Marks `thread` runnable again and enqueues it. Safe to call from IRQ
/// context.
///
/// # Panics
/// Panics if `thread` was not blocked.
pub fn wake(thread: ThreadId) {
    {
        let mut threads = THREADS.lock();
        let info = threads.get_mut(thread);
        assert_eq!(
            info.status,
            ThreadStatus::Blocked,
            "sched::wake on a thread that wasn't blocked"
        );
        info.status = ThreadStatus::Running;
    }
    READY_QUEUE.lock().push_back(thread);
}

/// Ends the current thread. Its stack is reclaimed once some other thread
/// switches away from whichever thread runs next.
pub fn quit_current() -> ! {
    reap_zombies();
    let cur = current_thread();
    THREADS.lock().get_mut(cur).status = ThreadStatus::Zombie;

    let next = READY_QUEUE
        .lock()
        .pop_front()
        .expect("quit_current: no runnable thread left");
    CURRENT_THREAD.store(next.0, Ordering::SeqCst);
    ZOMBIES.lock().push_back(cur);

    let next_ctx: *mut Context = {
        let mut threads = THREADS.lock();
        &mut threads.get_mut(next).context as *mut Context
    };

    // SAFETY: `cur` is marked `Zombie` and queued in `ZOMBIES`; it will be
    // reaped only after some other thread has switched away from `next`,
    // by which point this stack is no longer in use. `next_ctx` points into
    // a live `THREADS` entry.
    unsafe {
        (*next_ctx).switch_to_nosave();
    }

    unreachable!("thread_trampoline never returns")
}
