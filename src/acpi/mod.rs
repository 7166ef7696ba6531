//! ACPI table discovery and ACPICA bring-up.
//!
//! Ported from the legacy `acpi` module's `find_rsdp`/`AcpiTableHeader`
//! shapes, adapted to this kernel's lack of a direct physical map: the BIOS
//! regions the RSDP can live in are scanned through a temporary mapping via
//! [`crate::mm::virtmem::ACPI_WINDOW`] rather than dereferenced as raw
//! physical pointers.

pub mod osl;

use core::slice;

use log::info;

use crate::mm::virtmem;
use shared::memory::addr::{Length, PhysAddress};

type AcpiStatus = u32;

#[repr(C, packed)]
struct AcpiTableHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

#[repr(C, packed)]
struct AcpiTableDesc {
    physical_address: u64,
    header: *mut AcpiTableHeader,
    length: u32,
    signature: u32,
    owner_id: u8,
    flags: u8,
    validation_count: u16,
}

extern "C" {
    fn AcpiInitializeTables(
        initial_table_array: *mut AcpiTableDesc,
        initial_table_count: u32,
        allow_resize: bool,
    ) -> AcpiStatus;
}

#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8],
    checksum: u8,
    oemid: [u8; 6],
    revision: u8,
    rsdt_addr: u32,
    length: u32,
    xsdt_addr: u64,
    extended_checksum: u8,
    reserved: [u8; 3],
}

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";

/// BIOS regions the RSDP is guaranteed to live in if present: the first KiB
/// of the extended BIOS data area, and the main BIOS read-only memory range.
const SCAN_RANGES: [(u64, u64); 2] = [(0x0008_0000, 0x0008_0400), (0x000E_0000, 0x0010_0000)];

/// Sums the bytes of the ACPI 1.0 portion of an RSDP (everything up through
/// `length`, i.e. the first 20 bytes): valid tables sum to zero mod 256.
fn rsdp_checksum_ok(rsdp: &Rsdp) -> bool {
    let bytes = unsafe {
        slice::from_raw_parts((rsdp as *const Rsdp) as *const u8, 20)
    };
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b)) == 0
}

/// Scans the BIOS regions for the RSDP signature, returning its physical
/// address if found and its checksum is valid.
pub fn find_rsdp() -> Option<PhysAddress> {
    for (start, end) in SCAN_RANGES {
        let len = end - start;
        let virt = virtmem::ACPI_WINDOW
            .lock()
            .map(PhysAddress::from_raw(start), len)
            .expect("failed to map BIOS region for RSDP scan");

        let scan_end = len.saturating_sub(core::mem::size_of::<Rsdp>() as u64);
        let mut found = None;
        for offset in (0..scan_end).step_by(16) {
            // SAFETY: `virt + offset` lies within the `len`-byte mapping
            // just established, with at least `size_of::<Rsdp>()` bytes
            // remaining after it thanks to the `scan_end` bound above.
            let rsdp = unsafe { &*(virt + Length::from_raw(offset)).as_ptr::<Rsdp>() };
            if rsdp.signature == *RSDP_SIGNATURE && rsdp_checksum_ok(rsdp) {
                found = Some(start + offset);
                break;
            }
        }

        // SAFETY: `virt`/`len` exactly match the `map` call above, and the
        // reference borrowed from it is no longer referenced past this point.
        unsafe {
            virtmem::ACPI_WINDOW.lock().unmap(virt, len);
        }

        if let Some(addr) = found {
            return Some(PhysAddress::from_raw(addr));
        }
    }

    None
}

pub fn init() {
    match find_rsdp() {
        Some(addr) => info!("RSDP found at {:#x}", addr.as_raw()),
        None => info!("RSDP not found; ACPICA will attempt its own discovery"),
    }

    // SAFETY: called once, after the heap and scheduler are up, before any
    // ACPICA call that would depend on tables being loaded.
    let status = unsafe { AcpiInitializeTables(core::ptr::null_mut(), 0, false) };
    if status != 0 {
        panic!("AcpiInitializeTables failed with status {status}");
    }
}
