//! A spinning mutual-exclusion lock that also gates interrupts.
//!
//! Grounded on `gdt.rs`'s one-shot `SpinMutexGuard::leak` pattern (guard
//! ownership separate from the lock) and `pic.rs`'s `without_interrupts`
//! closure (disable-before-touch, restore-after). [`SpinLock`] generalizes
//! both into a single guard-based API: the interrupt flag at acquire time is
//! saved in the lock itself, not the guard, so a guard dropped on whatever
//! thread happens to be running still restores the flag the *acquirer* saw.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use x86_64::instructions::interrupts;

/// This kernel runs on a single BSP; a simple global counter is enough to
/// track how many spinlocks the currently-running code holds. Debug builds
/// only.
static HELD_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Number of spinlocks currently held on this CPU. [`crate::sched::sleep_current`]
/// asserts this is zero: nothing that can sleep may run with a spinlock held.
pub fn held_count() -> usize {
    HELD_COUNT.load(Ordering::SeqCst)
}

pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    /// Interrupt-enabled state observed by whichever acquire last succeeded.
    saved_if: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only ever granted through a held `SpinLockGuard`,
// which requires synchronizing on `locked`.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            saved_if: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Disables interrupts, then spins until the lock is acquired.
    pub fn acquire(&self) -> SpinLockGuard<'_, T> {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        self.saved_if.store(was_enabled, Ordering::Relaxed);
        if cfg!(debug_assertions) {
            HELD_COUNT.fetch_add(1, Ordering::SeqCst);
        }

        SpinLockGuard { lock: self }
    }

    /// Single attempt; disables interrupts only on success.
    pub fn try_acquire(&self) -> Option<SpinLockGuard<'_, T>> {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if was_enabled {
                interrupts::enable();
            }
            return None;
        }

        self.saved_if.store(was_enabled, Ordering::Relaxed);
        if cfg!(debug_assertions) {
            HELD_COUNT.fetch_add(1, Ordering::SeqCst);
        }

        Some(SpinLockGuard { lock: self })
    }

    /// Releases the lock without going through a held [`SpinLockGuard`].
    ///
    /// For adapters (the ACPICA OSL) whose caller hands back an opaque lock
    /// handle rather than a guard value: the guard is leaked with
    /// [`core::mem::forget`] at acquire time and the release reconstructed
    /// from here instead.
    ///
    /// # Safety
    /// The calling code must have acquired this lock and leaked the guard,
    /// with no other release for that acquisition still pending.
    pub unsafe fn force_unlock(&self) {
        self.release();
    }

    fn release(&self) {
        let was_enabled = self.saved_if.load(Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        if cfg!(debug_assertions) {
            HELD_COUNT.fetch_sub(1, Ordering::SeqCst);
        }
        if was_enabled {
            interrupts::enable();
        }
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        debug_assert!(
            !crate::sched::in_irq_context() || !interrupts::are_enabled(),
            "spinlock dropped with interrupts enabled while servicing an interrupt"
        );
        self.lock.release();
    }
}
