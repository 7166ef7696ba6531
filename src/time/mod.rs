//! Monotonic time source for the kernel.
//!
//! Ported from the legacy PIT/RTC pair onto the current PIC/IDT stack: the
//! RTC wall-clock reader is out of scope for this core (nothing here needs
//! calendar time), but the PIT tick counter survives as the monotonic clock
//! [`sync::semaphore`](crate::sync::semaphore) deadlines and the ACPI OSL's
//! `get_timer`/`sleep`/`stall` are built on.

mod pit;

use alloc::collections::VecDeque;

use crate::sync::spinlock::SpinLock;

pub use pit::now_ns;

/// Must be called after [`crate::pic::init`], with interrupts still disabled.
pub fn init() {
    pit::init();
}

struct Timer {
    deadline_ns: u64,
    fire: fn(usize),
    arg: usize,
}

static TIMERS: SpinLock<VecDeque<Timer>> = SpinLock::new(VecDeque::new());

/// Arranges for `fire(arg)` to run from interrupt context once
/// [`now_ns`] reaches `deadline_ns`. Used by [`crate::sync::semaphore`] to
/// back `wait_timeout`; there's no cancellation API; callers that finalize a
/// wait before the deadline arrives just let their timer fire into a no-op.
pub fn schedule(deadline_ns: u64, fire: fn(usize), arg: usize) {
    TIMERS.acquire().push_back(Timer {
        deadline_ns,
        fire,
        arg,
    });
}

/// Runs any timers whose deadline has passed. Called once per tick from the
/// PIT handler, in interrupt context.
fn check_timers() {
    let now = now_ns();
    loop {
        let due = {
            let mut timers = TIMERS.acquire();
            let pos = timers.iter().position(|t| t.deadline_ns <= now);
            pos.map(|i| timers.remove(i).unwrap())
        };
        match due {
            Some(timer) => (timer.fire)(timer.arg),
            None => break,
        }
    }
}

/// Busy-waits for approximately `us` microseconds using the tick counter.
/// For short, uninterruptible waits (ACPI `stall`); anything long enough to
/// want rescheduling should use a semaphore timeout instead.
pub fn stall_us(us: u64) {
    let start = now_ns();
    let target = us.saturating_mul(1_000);
    while now_ns().saturating_sub(start) < target {
        core::hint::spin_loop();
    }
}
