//! Condition variable: signal/broadcast with timed wait, built on
//! [`Semaphore`](super::Semaphore).
//!
//! `wait` atomically releases the caller's mutex and blocks on an internal
//! semaphore, then reacquires the mutex before returning — the standard
//! monitor pattern, with the semaphore's own inner spinlock (held across its
//! whole check-then-enqueue decision) doing the work of making the
//! release-then-block transition race-free against a `signal` that lands in
//! the gap.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::sync::mutex::{Mutex, MutexGuard};
use crate::sync::semaphore::{Semaphore, WaitError};

pub struct CondVar {
    sem: Semaphore,
    waiters: AtomicUsize,
    /// Bumped on every `signal`/`broadcast`. Lets a DAD-style polling caller
    /// observe "has anyone succeeded yet" by comparing a previously read
    /// value, without reacquiring the associated mutex.
    value: AtomicU64,
}

impl CondVar {
    pub const fn new() -> CondVar {
        CondVar {
            sem: Semaphore::new(0),
            waiters: AtomicUsize::new(0),
            value: AtomicU64::new(0),
        }
    }

    /// Releases `guard`, blocks until [`signal`](CondVar::signal) or
    /// [`broadcast`](CondVar::broadcast) posts to this condition variable (or
    /// `timeout_ns` elapses, if nonzero), then reacquires `mutex` before
    /// returning.
    pub fn wait<'a, T>(
        &self,
        mutex: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
        timeout_ns: u64,
    ) -> (MutexGuard<'a, T>, Result<(), WaitError>) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        drop(guard);

        let result = if timeout_ns == 0 {
            self.sem.wait(1)
        } else {
            self.sem.wait_timeout(1, timeout_ns)
        };
        self.waiters.fetch_sub(1, Ordering::SeqCst);

        (mutex.lock(), result.map(|_| ()))
    }

    /// Wakes one waiter, if any.
    pub fn signal(&self) {
        self.value.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            self.sem.signal(1);
        }
    }

    /// Wakes every current waiter.
    pub fn broadcast(&self) {
        let n = self.waiters.load(Ordering::SeqCst) as u64;
        self.value.fetch_add(1, Ordering::SeqCst);
        if n > 0 {
            self.sem.signal(n);
        }
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}
