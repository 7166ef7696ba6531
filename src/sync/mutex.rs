//! A sleeping mutual-exclusion lock.
//!
//! Unlike [`SpinLock`](super::SpinLock), blocked waiters give up the CPU
//! instead of spinning, so this is the lock to reach for around anything
//! that does nontrivial work while held (the kernel heap's sector growth,
//! for instance, which can call down into the frame allocator). Internally
//! it's a FIFO wait queue gated by a [`SpinLock`](super::SpinLock), grounded
//! on the shape of the old kernel's intrusive-list semaphore wait queue.
//!
//! Recursive locking is not checked and not supported: a thread that calls
//! [`Mutex::lock`] while already holding the same mutex deadlocks against
//! itself.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use alloc::collections::VecDeque;

use crate::sched::{self, ThreadId};
use crate::sync::spinlock::SpinLock;

struct State {
    locked: bool,
    waiters: VecDeque<ThreadId>,
}

pub struct Mutex<T: ?Sized> {
    inner: SpinLock<State>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only granted through a held `MutexGuard`, which
// requires synchronizing on `inner`.
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Mutex<T> {
        Mutex {
            inner: SpinLock::new(State {
                locked: false,
                waiters: VecDeque::new(),
            }),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Blocks until the lock is acquired. Must not be called from interrupt
    /// context or while holding a spinlock.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            let mut state = self.inner.acquire();
            if !state.locked {
                state.locked = true;
                return MutexGuard { mutex: self };
            }

            state.waiters.push_back(sched::current_thread());
            // Mark ourselves blocked while still holding `inner` (hence with
            // interrupts disabled): an `unlock` that reaches us in the
            // waiters list can only run after we're marked, so its `wake`
            // never fires against a thread still marked running.
            sched::mark_blocked();
            drop(state);
            sched::commit_sleep();
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut state = self.inner.acquire();
        if state.locked {
            return None;
        }
        state.locked = true;
        Some(MutexGuard { mutex: self })
    }

    fn unlock(&self) {
        let mut state = self.inner.acquire();
        state.locked = false;
        let next = state.waiters.pop_front();
        drop(state);
        if let Some(next) = next {
            sched::wake(next);
        }
    }

    /// Releases the lock without going through a held [`MutexGuard`].
    ///
    /// For adapters (the ACPICA OSL) whose caller hands back an opaque lock
    /// handle rather than a guard value: the guard is leaked with
    /// [`core::mem::forget`] at lock time and the release reconstructed
    /// from here instead.
    ///
    /// # Safety
    /// The calling code must hold this lock from a leaked guard, with no
    /// other release for that acquisition still pending.
    pub unsafe fn force_unlock(&self) {
        self.unlock();
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means we hold the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means we hold the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
