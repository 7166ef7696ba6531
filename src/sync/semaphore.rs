//! Counting semaphore with partial-grant, timeout, non-block, and terminate
//! semantics — the centerpiece synchronization primitive.
//!
//! [`Semaphore::wait_generic`] is the only primitive that actually blocks;
//! [`Semaphore::wait`], [`Semaphore::wait_timeout`], and
//! [`Semaphore::wait_nonblock`] are thin wrappers choosing flags and a
//! deadline. Grounded on the old kernel's intrusive-wait-list semaphore
//! (`kernel/src/sync/semaphore.rs`) for the general count-plus-FIFO shape,
//! generalized to the multi-unit grant this kernel's ACPI OSL needs.
//!
//! A waiter is a [`WaitNode`] living on the blocked thread's own stack frame
//! for the duration of the call, referenced from the semaphore's queue by
//! raw pointer. Whichever side finalizes a wait — [`Semaphore::signal`],
//! [`Semaphore::terminate`], or a timeout firing — writes the final
//! `got`/outcome directly into that node and pops it out of the queue before
//! waking the thread, so the woken thread never needs to re-acquire the
//! inner lock or search the queue: its own stack-local `node` already holds
//! the answer.

use core::cell::Cell;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use bitflags::bitflags;
use log::debug;

use crate::sched::{self, ThreadId};
use crate::sync::spinlock::SpinLock;
use crate::time;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct WaitFlags: u32 {
        /// Never sleep; grant whatever's immediately available and return.
        const NONBLOCK = 1 << 0;
        /// A pending signal may interrupt this wait. This kernel has no
        /// signal delivery source yet ([`sched::signal_pending`] always
        /// returns `false`), so this is currently inert; it's checked at the
        /// one point a delivery mechanism would need to hook in.
        const INTERRUPTIBLE = 1 << 1;
        /// Accept fewer units than requested rather than blocking or
        /// failing until the full amount is available.
        const ALLOW_PARTIAL = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Interrupted,
    Terminated,
    WouldBlock,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Pending,
    Terminated,
    TimedOut,
}

struct WaitNode {
    thread: ThreadId,
    requested: u64,
    got: Cell<u64>,
    flags: WaitFlags,
    outcome: Cell<Outcome>,
}

impl WaitNode {
    fn is_satisfied(&self) -> bool {
        self.got.get() == self.requested
            || (self.got.get() > 0 && self.flags.contains(WaitFlags::ALLOW_PARTIAL))
    }
}

struct State {
    count: i64,
    waiters: VecDeque<*const WaitNode>,
    terminated: bool,
}

// SAFETY: every pointer in `waiters` points at a `WaitNode` owned by a
// blocked thread's stack frame. It's dereferenced only while that thread is
// parked, under the same `inner` lock the thread held when it pushed the
// pointer, and is always popped out before that thread resumes.
unsafe impl Send for State {}

pub struct Semaphore {
    inner: SpinLock<State>,
}

impl Semaphore {
    pub const fn new(initial: i64) -> Semaphore {
        Semaphore {
            inner: SpinLock::new(State {
                count: initial,
                waiters: VecDeque::new(),
                terminated: false,
            }),
        }
    }

    /// The sole blocking primitive. `deadline_ns` is an absolute deadline
    /// against [`time::now_ns`]; `0` means never time out.
    ///
    /// # Panics
    /// Panics if called from interrupt context or while holding a spinlock
    /// (debug builds only).
    pub fn wait_generic(
        &self,
        requested: u64,
        flags: WaitFlags,
        deadline_ns: u64,
    ) -> Result<u64, WaitError> {
        if requested == 0 {
            return Ok(0);
        }
        assert!(
            !sched::in_irq_context(),
            "semaphore wait_generic called from interrupt context"
        );
        debug_assert_eq!(
            crate::sync::spinlock::held_count(),
            0,
            "semaphore wait_generic called while holding a spinlock"
        );

        if deadline_ns != 0 && time::now_ns() >= deadline_ns {
            return Err(WaitError::Timeout);
        }

        let mut state = self.inner.acquire();
        if state.terminated {
            return Err(WaitError::Terminated);
        }

        // Ordering guarantee: a newcomer never takes from `count` ahead of
        // anyone already queued, even if `count` would cover it — otherwise
        // a small late request could jump an earlier, larger one.
        let grant = if state.waiters.is_empty() {
            let g = state.count.max(0).min(requested as i64) as u64;
            state.count -= g as i64;
            g
        } else {
            0
        };

        if grant == requested {
            return Ok(grant);
        }

        if flags.contains(WaitFlags::NONBLOCK) {
            if flags.contains(WaitFlags::ALLOW_PARTIAL) {
                return Ok(grant);
            }
            state.count += grant as i64;
            return Err(WaitError::WouldBlock);
        }

        if grant > 0 && flags.contains(WaitFlags::ALLOW_PARTIAL) {
            return Ok(grant);
        }

        if flags.contains(WaitFlags::INTERRUPTIBLE) && sched::signal_pending() {
            state.count += grant as i64;
            return Err(WaitError::Interrupted);
        }

        let node = WaitNode {
            thread: sched::current_thread(),
            requested,
            got: Cell::new(grant),
            flags,
            outcome: Cell::new(Outcome::Pending),
        };
        state.waiters.push_back(&node as *const WaitNode);

        if deadline_ns != 0 {
            schedule_timeout(&self.inner, node.thread, deadline_ns);
        }

        // Mark ourselves blocked while still holding `inner` (hence with
        // interrupts disabled): a `signal`/`terminate`/timeout that reaches
        // us in the queue can only run after we're marked, so its `wake`
        // never fires against a thread still marked running.
        sched::mark_blocked();
        drop(state);
        sched::commit_sleep();

        // By the time we're resumed, whoever popped us out of the queue has
        // already written our final `got`/`outcome` and is done touching
        // `node`; no need to touch `inner` again.
        match node.outcome.get() {
            Outcome::Pending => Ok(node.got.get()),
            Outcome::Terminated => Err(WaitError::Terminated),
            Outcome::TimedOut => Err(WaitError::Timeout),
        }
    }

    /// Blocks until `requested` units are available.
    pub fn wait(&self, requested: u64) -> Result<u64, WaitError> {
        self.wait_generic(requested, WaitFlags::empty(), 0)
    }

    /// Blocks until `requested` units are available or `timeout_ns` elapses.
    /// Per the boundary convention, a zero timeout behaves like
    /// [`Semaphore::wait_nonblock`].
    pub fn wait_timeout(&self, requested: u64, timeout_ns: u64) -> Result<u64, WaitError> {
        if timeout_ns == 0 {
            return self.wait_nonblock(requested);
        }
        let deadline = time::now_ns().saturating_add(timeout_ns).max(1);
        self.wait_generic(requested, WaitFlags::empty(), deadline)
    }

    /// Grants whatever's immediately available, up to `requested`, without
    /// blocking. Returns [`WaitError::WouldBlock`] if the full amount isn't
    /// available right away.
    pub fn wait_nonblock(&self, requested: u64) -> Result<u64, WaitError> {
        self.wait_generic(requested, WaitFlags::NONBLOCK, 0)
    }

    /// Adds `n` units, waking any waiters it satisfies (fully, or partially
    /// for partial-acceptable waiters) in FIFO order. A no-op (logged) if
    /// the semaphore has been [`terminate`](Semaphore::terminate)d — the
    /// source this is ported from accepts the call but leaves new waits
    /// failing, so we do too rather than guess further.
    pub fn signal(&self, n: u64) {
        let mut state = self.inner.acquire();
        if state.terminated {
            debug!("semaphore signal() after terminate(); ignoring");
            return;
        }
        state.count += n as i64;

        let mut woken = Vec::new();
        while state.count > 0 {
            let node_ptr = match state.waiters.front() {
                Some(&p) => p,
                None => break,
            };
            // SAFETY: `node_ptr` was pushed by a thread still blocked in
            // `wait_generic`, still at the front of the queue.
            let node = unsafe { &*node_ptr };
            let need = node.requested - node.got.get();
            let grant = state.count.min(need as i64) as u64;
            state.count -= grant as i64;
            node.got.set(node.got.get() + grant);

            if node.is_satisfied() {
                state.waiters.pop_front();
                woken.push(node.thread);
            } else {
                // `grant < need` only happens when `count` just ran out;
                // the loop condition ends on the next check regardless.
                break;
            }
        }
        drop(state);
        for thread in woken {
            sched::wake(thread);
        }
    }

    /// Permanently terminates the semaphore: every present waiter wakes
    /// with [`WaitError::Terminated`], and every future wait fails the same
    /// way immediately. Used to unblock indefinite recv/accept-style waits
    /// during socket, pipe, and initrd teardown.
    pub fn terminate(&self) {
        let mut state = self.inner.acquire();
        if state.terminated {
            return;
        }
        state.terminated = true;

        let mut woken = Vec::new();
        while let Some(node_ptr) = state.waiters.pop_front() {
            // SAFETY: see `wait_generic`.
            let node = unsafe { &*node_ptr };
            state.count += node.got.get() as i64;
            node.outcome.set(Outcome::Terminated);
            woken.push(node.thread);
        }
        drop(state);
        for thread in woken {
            sched::wake(thread);
        }
    }
}

struct TimeoutCtx {
    inner: *const SpinLock<State>,
    thread: ThreadId,
}

fn schedule_timeout(inner: &SpinLock<State>, thread: ThreadId, deadline_ns: u64) {
    let ctx = Box::new(TimeoutCtx {
        inner: inner as *const SpinLock<State>,
        thread,
    });
    time::schedule(deadline_ns, timeout_fire, Box::into_raw(ctx) as usize);
}

fn timeout_fire(arg: usize) {
    // SAFETY: `arg` was produced by `Box::into_raw` in `schedule_timeout`
    // and the timer queue calls this exactly once for it.
    let ctx = unsafe { Box::from_raw(arg as *mut TimeoutCtx) };
    // SAFETY: `ctx.inner` points at the `Semaphore` that scheduled this
    // timeout. That semaphore outlives it: the wait it belongs to is either
    // still blocked on its own stack frame, or already finalized, in which
    // case this lookup simply finds nothing.
    let inner = unsafe { &*ctx.inner };
    let mut state = inner.acquire();
    let pos = state
        .waiters
        .iter()
        .position(|&p| unsafe { (*p).thread } == ctx.thread);
    let Some(pos) = pos else {
        // Already finalized by `signal` or `terminate`.
        return;
    };
    let node_ptr = state.waiters.remove(pos).unwrap();
    // SAFETY: see above.
    let node = unsafe { &*node_ptr };
    state.count += node.got.get() as i64;
    node.outcome.set(Outcome::TimedOut);
    drop(state);
    sched::wake(ctx.thread);
}
