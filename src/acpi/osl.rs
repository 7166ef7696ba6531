//! ACPICA OS Services Layer: the extern-"C" surface ACPICA links against,
//! implemented on top of this kernel's own primitives.
//!
//! Each `AcpiOs*` function is a thin adapter over one piece of the kernel:
//! allocation goes straight to the global heap, locks and semaphores wrap
//! [`crate::sync`], memory mapping wraps [`virtmem::ACPI_WINDOW`], and
//! threading wraps [`crate::sched`]. ACPICA treats all of these as opaque
//! handles, so each wrapper is boxed and handed back as a raw pointer.

use core::alloc::Layout;
use core::ffi::c_void;
use core::ptr;

use alloc::boxed::Box;

use log::{debug, trace};

use crate::mm::virtmem;
use crate::sched;
use crate::sync::semaphore::{Semaphore, WaitError, WaitFlags};
use crate::sync::spinlock::SpinLock;
use crate::time;
use shared::memory::addr::{PhysAddress, VirtAddress};

use super::AcpiStatus;

const AE_OK: AcpiStatus = 0;
const AE_BAD_PARAMETER: AcpiStatus = 0x0002;
const AE_TIME: AcpiStatus = 0x0011;

/// Timeout value meaning "never time out", per the ACPICA OSL contract.
const ACPI_WAIT_FOREVER: u16 = 0xFFFF;

#[no_mangle]
extern "C" fn AcpiOsAllocate(size: usize) -> *mut c_void {
    if size == 0 {
        return ptr::null_mut();
    }
    // ACPICA never tells us the alignment it wants back; word alignment is
    // what every other OSL implementation assumes.
    let layout = match Layout::from_size_align(size + core::mem::size_of::<usize>(), 8) {
        Ok(l) => l,
        Err(_) => return ptr::null_mut(),
    };
    // SAFETY: `layout` has nonzero size.
    let raw = unsafe { alloc::alloc::alloc(layout) };
    if raw.is_null() {
        return ptr::null_mut();
    }
    // Stash the size ahead of the returned pointer so `AcpiOsFree` can
    // reconstruct the same `Layout` without ACPICA passing it back.
    unsafe {
        (raw as *mut usize).write(size);
        raw.add(core::mem::size_of::<usize>()) as *mut c_void
    }
}

#[no_mangle]
extern "C" fn AcpiOsFree(memory: *mut c_void) {
    if memory.is_null() {
        return;
    }
    unsafe {
        let raw = (memory as *mut u8).sub(core::mem::size_of::<usize>());
        let size = (raw as *mut usize).read();
        let layout = Layout::from_size_align_unchecked(size + core::mem::size_of::<usize>(), 8);
        alloc::alloc::dealloc(raw, layout);
    }
}

#[no_mangle]
extern "C" fn AcpiOsCreateLock(out_handle: *mut *mut c_void) -> AcpiStatus {
    let lock = Box::new(SpinLock::new(()));
    unsafe {
        *out_handle = Box::into_raw(lock) as *mut c_void;
    }
    AE_OK
}

#[no_mangle]
extern "C" fn AcpiOsDeleteLock(handle: *mut c_void) {
    unsafe {
        drop(Box::from_raw(handle as *mut SpinLock<()>));
    }
}

/// Returns an opaque "flags" value ACPICA round-trips back into
/// `AcpiOsReleaseLock`. A raw spinlock guard can't be handed across the FFI
/// boundary, so the guard is leaked here and reconstructed from the raw
/// lock pointer on release; the lock itself guarantees no other caller can
/// observe the gap.
#[no_mangle]
extern "C" fn AcpiOsAcquireLock(handle: *mut c_void) -> usize {
    let lock = unsafe { &*(handle as *const SpinLock<()>) };
    core::mem::forget(lock.acquire());
    0
}

#[no_mangle]
extern "C" fn AcpiOsReleaseLock(handle: *mut c_void, _flags: usize) {
    let lock = unsafe { &*(handle as *const SpinLock<()>) };
    // SAFETY: the guard leaked in `AcpiOsAcquireLock` is reconstructed here;
    // ACPICA's acquire/release calls for a given lock nest exactly like the
    // guard they stand in for.
    unsafe {
        lock.force_unlock();
    }
}

#[no_mangle]
extern "C" fn AcpiOsCreateSemaphore(
    _max_units: u32,
    initial_units: u32,
    out_handle: *mut *mut c_void,
) -> AcpiStatus {
    let sem = Box::new(Semaphore::new(initial_units as i64));
    unsafe {
        *out_handle = Box::into_raw(sem) as *mut c_void;
    }
    AE_OK
}

#[no_mangle]
extern "C" fn AcpiOsDeleteSemaphore(handle: *mut c_void) {
    unsafe {
        drop(Box::from_raw(handle as *mut Semaphore));
    }
}

/// `timeout` is in milliseconds; `0` means don't block, [`ACPI_WAIT_FOREVER`]
/// means block indefinitely. Firmware always wants the full `units` granted,
/// so a timed wait that comes back with a partial grant loops for the rest
/// with whatever deadline remains.
#[no_mangle]
extern "C" fn AcpiOsWaitSemaphore(handle: *mut c_void, units: u32, timeout: u16) -> AcpiStatus {
    let sem = unsafe { &*(handle as *const Semaphore) };
    let requested = units as u64;

    let result = if timeout == 0 {
        sem.wait_nonblock(requested)
    } else if timeout == ACPI_WAIT_FOREVER {
        sem.wait(requested)
    } else {
        let deadline = time::now_ns().saturating_add(timeout as u64 * 1_000_000).max(1);
        let mut got = 0u64;
        loop {
            match sem.wait_generic(requested - got, WaitFlags::ALLOW_PARTIAL, deadline) {
                Ok(g) => {
                    got += g;
                    if got >= requested {
                        break Ok(requested);
                    }
                }
                Err(e) => break Err(e),
            }
        }
    };

    match result {
        Ok(_) => AE_OK,
        Err(WaitError::Timeout) => AE_TIME,
        Err(WaitError::WouldBlock) => AE_TIME,
        Err(WaitError::Interrupted) => AE_TIME,
        Err(WaitError::Terminated) => AE_BAD_PARAMETER,
    }
}

#[no_mangle]
extern "C" fn AcpiOsSignalSemaphore(handle: *mut c_void, units: u32) -> AcpiStatus {
    let sem = unsafe { &*(handle as *const Semaphore) };
    sem.signal(units as u64);
    AE_OK
}

/// The general-purpose [`crate::sync::Mutex`] has no timeout on its blocking
/// wait, so rather than poll for one, the handle here is a one-unit
/// [`Semaphore`] instead: acquire is a one-unit wait with whatever deadline
/// ACPICA asked for, release is a one-unit signal.
#[no_mangle]
extern "C" fn AcpiOsCreateMutex(out_handle: *mut *mut c_void) -> AcpiStatus {
    let sem = Box::new(Semaphore::new(1));
    unsafe {
        *out_handle = Box::into_raw(sem) as *mut c_void;
    }
    AE_OK
}

#[no_mangle]
extern "C" fn AcpiOsDeleteMutex(handle: *mut c_void) {
    unsafe {
        drop(Box::from_raw(handle as *mut Semaphore));
    }
}

#[no_mangle]
extern "C" fn AcpiOsAcquireMutex(handle: *mut c_void, timeout: u16) -> AcpiStatus {
    let sem = unsafe { &*(handle as *const Semaphore) };

    let result = if timeout == 0 {
        sem.wait_nonblock(1)
    } else if timeout == ACPI_WAIT_FOREVER {
        sem.wait(1)
    } else {
        sem.wait_timeout(1, timeout as u64 * 1_000_000)
    };

    match result {
        Ok(_) => AE_OK,
        Err(_) => AE_TIME,
    }
}

#[no_mangle]
extern "C" fn AcpiOsReleaseMutex(handle: *mut c_void) {
    let sem = unsafe { &*(handle as *const Semaphore) };
    sem.signal(1);
}

#[no_mangle]
extern "C" fn AcpiOsMapMemory(phys: u64, len: usize) -> *mut c_void {
    match virtmem::ACPI_WINDOW.lock().map(PhysAddress::from_raw(phys), len as u64) {
        Ok(virt) => virt.as_mut_ptr::<c_void>(),
        Err(_) => ptr::null_mut(),
    }
}

#[no_mangle]
extern "C" fn AcpiOsUnmapMemory(virt: *mut c_void, len: usize) {
    // SAFETY: ACPICA passes back exactly the pointer and length returned by
    // a prior `AcpiOsMapMemory` call.
    unsafe {
        virtmem::ACPI_WINDOW
            .lock()
            .unmap(VirtAddress::from_ptr(virt), len as u64);
    }
}

type InterruptHandler = extern "C" fn(context: *mut c_void) -> u32;

struct InstalledHandler {
    handler: InterruptHandler,
    context: *mut c_void,
}

// SAFETY: `context` is whatever opaque pointer ACPICA registered; it's never
// dereferenced here, only forwarded.
unsafe impl Send for InstalledHandler {}
unsafe impl Sync for InstalledHandler {}

static GSI_HANDLERS: SpinLock<[Option<InstalledHandler>; 16]> =
    SpinLock::new([const { None }; 16]);

fn dispatch_gsi(gsi: u8) {
    let handler = {
        let handlers = GSI_HANDLERS.acquire();
        handlers[gsi as usize].as_ref().map(|h| (h.handler, h.context))
    };
    if let Some((handler, context)) = handler {
        handler(context);
    }
}

/// The SCI lands on GSI 9 on every chipset this kernel targets.
fn dispatch_gsi_9(_stack: x86_64::structures::idt::InterruptStackFrame) {
    dispatch_gsi(9);
}

#[no_mangle]
extern "C" fn AcpiOsInstallInterruptHandler(
    gsi: u32,
    handler: InterruptHandler,
    context: *mut c_void,
) -> AcpiStatus {
    if gsi >= 16 {
        return AE_BAD_PARAMETER;
    }
    GSI_HANDLERS.acquire()[gsi as usize] = Some(InstalledHandler { handler, context });
    // SCI is wired to GSI 9 on every chipset this kernel targets; other
    // GSIs route through ACPICA's own table-driven handler but aren't
    // registered from here since this kernel only wires up the SCI.
    if gsi == 9 {
        crate::pic::install_irq_handler(9, Some(dispatch_gsi_9));
    }
    AE_OK
}

#[no_mangle]
extern "C" fn AcpiOsGetTimer() -> u64 {
    // ACPICA wants 100ns ticks.
    time::now_ns() / 100
}

#[no_mangle]
extern "C" fn AcpiOsSleep(milliseconds: u64) {
    let gate = Semaphore::new(0);
    let _ = gate.wait_timeout(1, milliseconds.saturating_mul(1_000_000));
}

#[no_mangle]
extern "C" fn AcpiOsStall(microseconds: u32) {
    time::stall_us(microseconds as u64);
}

extern "C" fn execute_trampoline(arg: usize) -> ! {
    let ctx = unsafe { Box::from_raw(arg as *mut (InterruptHandler, *mut c_void)) };
    let (callback, context): (InterruptHandler, *mut c_void) = *ctx;
    callback(context);
    sched::quit_current();
}

#[no_mangle]
extern "C" fn AcpiOsExecute(
    _kind: u32,
    callback: InterruptHandler,
    context: *mut c_void,
) -> AcpiStatus {
    let ctx = Box::new((callback, context));
    sched::spawn_kthread(execute_trampoline, Box::into_raw(ctx) as usize);
    AE_OK
}

#[no_mangle]
extern "C" fn AcpiOsGetRootPointer() -> u64 {
    super::find_rsdp().map(|a| a.as_raw()).unwrap_or(0)
}

#[no_mangle]
extern "C" fn AcpiOsPrintf(_format: *const core::ffi::c_char) {
    trace!("AcpiOsPrintf call ignored; ACPICA debug output is not wired to the kernel logger");
}

#[no_mangle]
extern "C" fn AcpiOsGetThreadId() -> u64 {
    sched::current_thread().as_raw()
}

#[no_mangle]
extern "C" fn AcpiOsTerminate() {
    debug!("ACPICA subsystem terminating");
}
