//! Programmable interval timer driving the monotonic tick counter.
//!
//! Ground truth for the reload value and access-mode byte is the legacy
//! `time::pit` driver; the handler itself is rewritten against the current
//! `pic`/`idt` stack (an `extern "x86-interrupt"`-dispatched [`IrqHandlerFunc`]
//! rather than a hand-rolled `cli`/`sti` pair).

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::port::Port;
use x86_64::structures::idt::InterruptStackFrame;

use crate::pic;

/// Counter reload value for channel 0, rate generator mode. The PIT's input
/// frequency is 1,193,182 Hz, so this yields an interrupt a little faster
/// than 1 kHz.
const PIT_RELOAD_VALUE: u16 = 1193;

/// Approximate nanoseconds per tick at [`PIT_RELOAD_VALUE`].
const NS_PER_TICK: u64 = 1_000_000_000 * PIT_RELOAD_VALUE as u64 / 1_193_182;

static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn init() {
    unsafe {
        let mut command: Port<u8> = Port::new(0x43);
        let mut channel_0: Port<u8> = Port::new(0x40);

        // Channel 0, lobyte/hibyte access, mode 2 (rate generator).
        command.write(0b00_11_010_0u8);
        channel_0.write(PIT_RELOAD_VALUE as u8);
        channel_0.write((PIT_RELOAD_VALUE >> 8) as u8);
    }

    pic::install_irq_handler(0, Some(tick_handler));
}

/// Nanoseconds elapsed since [`init`]. Wraps after roughly 584 years; not a
/// concern for this kernel.
pub fn now_ns() -> u64 {
    TICKS.load(Ordering::SeqCst) * NS_PER_TICK
}

fn tick_handler(_: InterruptStackFrame) {
    TICKS.fetch_add(1, Ordering::SeqCst);
    super::check_timers();
}
