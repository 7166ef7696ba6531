//! Sleeping and spinning synchronization primitives.
//!
//! [`spinlock`] is the only primitive safe to hold across an interrupt or
//! while the scheduler itself is touched; everything else in this module may
//! put the calling thread to sleep and must never be acquired with a
//! spinlock held.

pub mod condvar;
pub mod mutex;
pub mod semaphore;
pub mod spinlock;

pub use condvar::CondVar;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::{Semaphore, WaitError, WaitFlags};
pub use spinlock::{SpinLock, SpinLockGuard};
