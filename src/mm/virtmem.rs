//! Page-table walker driven by the recursive self-map.
//!
//! The PML4's [`RECURSIVE_INDEX`](super::layout::RECURSIVE_INDEX) entry
//! points back at the PML4's own frame. That one fact makes every table at
//! every level reachable at a fixed virtual address computed purely from the
//! indices that lead to it, with no bootstrap translator needed once the
//! recursive slot is installed:
//!
//! ```text
//! L4 table                  -> virt [R, R, R, R, 0]
//! L3 table for index a      -> virt [R, R, R, a, 0]
//! L2 table for (a, b)       -> virt [R, R, a, b, 0]
//! L1 table for (a, b, c)    -> virt [R, a, b, c, 0]
//! ```
//!
//! Everything in this module assumes the recursive slot of the *currently
//! active* page table is already installed at [`RECURSIVE_INDEX`].

use super::layout::{RECURSIVE_INDEX, VirtualMap};
use super::paging::{MapError, PageTable, PageTableFlags};
use shared::memory::addr::{Length, PhysAddress, VirtAddress};
use shared::memory::page::{Frame, Page, PAGE_SIZE};

use crate::sync::Mutex;
use x86_64::VirtAddr;

const fn canonicalize(raw: u64) -> u64 {
    if raw & (1 << 47) != 0 {
        raw | 0xffff_0000_0000_0000
    } else {
        raw
    }
}

const fn recursive_virt(a: usize, b: usize, c: usize, d: usize) -> VirtAddress {
    let raw = ((a as u64) << 39) | ((b as u64) << 30) | ((c as u64) << 21) | ((d as u64) << 12);
    VirtAddress::from_raw(canonicalize(raw))
}

fn l4_table() -> *mut PageTable {
    recursive_virt(RECURSIVE_INDEX, RECURSIVE_INDEX, RECURSIVE_INDEX, RECURSIVE_INDEX).as_mut_ptr()
}

fn l3_table(l4i: usize) -> *mut PageTable {
    recursive_virt(RECURSIVE_INDEX, RECURSIVE_INDEX, RECURSIVE_INDEX, l4i).as_mut_ptr()
}

fn l2_table(l4i: usize, l3i: usize) -> *mut PageTable {
    recursive_virt(RECURSIVE_INDEX, RECURSIVE_INDEX, l4i, l3i).as_mut_ptr()
}

fn l1_table(l4i: usize, l3i: usize, l2i: usize) -> *mut PageTable {
    recursive_virt(RECURSIVE_INDEX, l4i, l3i, l2i).as_mut_ptr()
}

/// Installs the recursive slot in a freshly zeroed PML4. Must be called
/// before any other function in this module is used against `table`.
///
/// # Safety
/// `table`'s physical frame must be known and passed in `table_frame`.
pub unsafe fn install_recursive_slot(table: &mut PageTable, table_frame: Frame) {
    let entry = table.entry_mut(RECURSIVE_INDEX);
    entry.set_addr(table_frame.start());
    entry.set_flags(PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::EXECUTE_DISABLE);
}

/// Maps `page` to `frame` with `flags` in the currently active address space,
/// allocating intermediate page tables from `alloc_frame` as needed.
///
/// # Safety
/// * The active page table's recursive slot must already be installed.
/// * `page` must not already be mapped to a different frame in a way that
///   would violate an existing alias's invariants.
pub unsafe fn map(
    page: Page,
    frame: Frame,
    flags: PageTableFlags,
    alloc_frame: impl FnMut() -> Option<Frame>,
) -> Result<(), MapError> {
    let mut alloc_frame = alloc_frame;
    unsafe {
        let l4i = page.l4_index();
        let l3i = page.l3_index();
        let l2i = page.l2_index();
        let l1i = page.l1_index();

        let l4 = &mut *l4_table();
        next_level(l4.entry_mut(l4i), l3_table(l4i), &mut alloc_frame)?;

        let l3 = &mut *l3_table(l4i);
        next_level(l3.entry_mut(l3i), l2_table(l4i, l3i), &mut alloc_frame)?;

        let l2 = &mut *l2_table(l4i, l3i);
        next_level(l2.entry_mut(l2i), l1_table(l4i, l3i, l2i), &mut alloc_frame)?;

        let l1 = &mut *l1_table(l4i, l3i, l2i);
        let entry = l1.entry_mut(l1i);
        entry.set_addr(frame.start());
        entry.set_flags(flags | PageTableFlags::PRESENT);

        tlb::flush(VirtAddr::new(page.start().as_raw()));
    }
    Ok(())
}

/// Ensures the table at `next_table_virt` exists under `entry`, allocating
/// and zeroing a frame for it if `entry` isn't present yet.
unsafe fn next_level(
    entry: &mut super::paging::PageTableEntry,
    next_table_virt: *mut PageTable,
    alloc_frame: &mut impl FnMut() -> Option<Frame>,
) -> Result<(), MapError> {
    unsafe {
        if !entry.get_flags().contains(PageTableFlags::PRESENT) {
            let frame = alloc_frame().ok_or(MapError::FrameAllocationFailed)?;
            entry.set_addr(frame.start());
            entry.set_flags(PageTableFlags::DEFAULT_PARENT_TABLE_FLAGS);
            // The recursive mapping for the new table is only valid once
            // `entry` is installed; zero it through that same mapping.
            core::ptr::write_bytes(next_table_virt as *mut u8, 0, PAGE_SIZE.as_raw() as usize);
        }
    }
    Ok(())
}

/// Removes `page`'s mapping, invalidating it locally and broadcasting a
/// shootdown request to other online CPUs (a documented no-op on this
/// kernel's current single-BSP boot path — see module docs).
///
/// # Safety
/// No other code may dereference pointers into `page` after this returns.
pub unsafe fn unmap(page: Page) -> Result<Frame, MapError> {
    unsafe {
        let l4i = page.l4_index();
        let l3i = page.l3_index();
        let l2i = page.l2_index();
        let l1i = page.l1_index();

        let l4 = &mut *l4_table();
        if !l4.entry_mut(l4i).get_flags().contains(PageTableFlags::PRESENT) {
            return Err(MapError::TranslationFailed);
        }
        let l3 = &mut *l3_table(l4i);
        if !l3.entry_mut(l3i).get_flags().contains(PageTableFlags::PRESENT) {
            return Err(MapError::TranslationFailed);
        }
        let l2 = &mut *l2_table(l4i, l3i);
        if !l2.entry_mut(l2i).get_flags().contains(PageTableFlags::PRESENT) {
            return Err(MapError::TranslationFailed);
        }
        let l1 = &mut *l1_table(l4i, l3i, l2i);
        let entry = l1.entry_mut(l1i);
        if !entry.get_flags().contains(PageTableFlags::PRESENT) {
            return Err(MapError::TranslationFailed);
        }

        let frame = Frame::new(entry.get_addr());
        *entry = super::paging::PageTableEntry::zero();

        tlb::shootdown(page);

        Ok(frame)
    }
}

/// Looks up the frame `page` currently maps to, if any.
pub fn lookup(page: Page) -> Option<Frame> {
    unsafe {
        let l4i = page.l4_index();
        let l3i = page.l3_index();
        let l2i = page.l2_index();
        let l1i = page.l1_index();

        let l4 = &*l4_table();
        if !l4.entry(l4i).get_flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        let l3 = &*l3_table(l4i);
        if !l3.entry(l3i).get_flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        let l2 = &*l2_table(l4i, l3i);
        if !l2.entry(l2i).get_flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        let l1 = &*l1_table(l4i, l3i, l2i);
        let entry = l1.entry(l1i);
        if !entry.get_flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        Some(Frame::new(entry.get_addr()))
    }
}

/// TLB shootdown. Always invalidates locally. Broadcasting to other CPUs and
/// waiting for their acknowledgment is where real inter-processor-interrupt
/// dispatch would be issued once this kernel brings up application
/// processors; today there are none booted, so the broadcast step is a
/// documented no-op rather than a real IPI send.
mod tlb {
    use super::*;

    pub fn flush(addr: VirtAddr) {
        x86_64::instructions::tlb::flush(addr);
    }

    pub fn shootdown(page: Page) {
        flush(VirtAddr::new(page.start().as_raw()));
        // No APs are booted on this kernel's current boot path, so there is
        // nothing to broadcast to. If/when AP bring-up lands, the IPI send
        // and acknowledgment wait belong here.
    }
}

/// A scratch window for mapping arbitrary physical memory (ACPI tables,
/// MMIO) a handful of pages at a time. Backed by a bump cursor over
/// [`VirtualMap::acpi_window`]; unmapping never returns space to the cursor,
/// matching the window's intended use for long-lived firmware mappings.
pub struct AcpiWindow {
    cursor: VirtAddress,
}

impl AcpiWindow {
    const fn new() -> Self {
        AcpiWindow {
            cursor: VirtualMap::acpi_window().address(),
        }
    }

    /// Maps `len` bytes starting at physical address `phys`, returning a
    /// pointer preserving `phys`'s low 12 bits. Consumes `ceil(len / 4096) +
    /// 1` pages of window space (the extra page keeps adjacent mappings from
    /// ever appearing contiguous by accident).
    pub fn map(&mut self, phys: PhysAddress, len: u64) -> Result<VirtAddress, MapError> {
        let offset = phys.as_raw() & 0xfff;
        let aligned_phys = PhysAddress::from_raw(phys.as_raw() & !0xfff);
        let num_pages = (offset + len).div_ceil(PAGE_SIZE.as_raw()) + 1;

        let window_end = VirtualMap::acpi_window().end_address();
        let needed = Length::from_raw(num_pages * PAGE_SIZE.as_raw());
        if self.cursor.offset_by_checked(needed).map_or(true, |end| end > window_end) {
            return Err(MapError::FrameAllocationFailed);
        }

        let base = self.cursor;
        for i in 0..num_pages {
            let page = Page::new(base + Length::from_raw(i * PAGE_SIZE.as_raw()));
            let frame = Frame::new(aligned_phys + Length::from_raw(i * PAGE_SIZE.as_raw()));
            unsafe {
                map(
                    page,
                    frame,
                    PageTableFlags::WRITABLE | PageTableFlags::EXECUTE_DISABLE,
                    super::allocate_frame,
                )?;
            }
        }

        self.cursor = self.cursor + needed;
        Ok(base + Length::from_raw(offset))
    }

    /// Unmaps the `len`-byte mapping previously returned by `map` at `virt`.
    ///
    /// # Safety
    /// `virt` and `len` must exactly match a prior `map` call's return value
    /// and length; no other code may still reference this range.
    pub unsafe fn unmap(&mut self, virt: VirtAddress, len: u64) {
        let offset = virt.as_raw() & 0xfff;
        let aligned = VirtAddress::from_raw(virt.as_raw() & !0xfff);
        let num_pages = (offset + len).div_ceil(PAGE_SIZE.as_raw()) + 1;
        for i in 0..num_pages {
            let page = Page::new(aligned + Length::from_raw(i * PAGE_SIZE.as_raw()));
            // The window owns no frame here; only drop the translation.
            unsafe {
                let _ = unmap(page);
            }
        }
    }
}

pub static ACPI_WINDOW: Mutex<AcpiWindow> = Mutex::new(AcpiWindow::new());
