//! Compile-time layout of the kernel's virtual address space.

use shared::memory::addr::{Length, VirtAddress, VirtExtent};

/// The top-most PML4 slot points back at the PML4 itself, making every page
/// table at every level reachable through a fixed virtual address computed
/// from this index (see [`crate::mm::virtmem`]).
pub const RECURSIVE_INDEX: usize = 511;

/// The map of virtual address space. Assigns different ranges to various
/// purposes.
pub struct VirtualMap;

#[allow(unused)]
impl VirtualMap {
    /// The first MiB is identity mapped and not available for other mappings.
    pub const fn first_mib() -> VirtExtent {
        VirtExtent::from_raw(0, 1024 * 1024)
    }

    /// Range of all user virtual address space. This is almost all of the
    /// lower-half.
    pub const fn user() -> VirtExtent {
        VirtExtent::from_raw_range_exclusive(
            Self::first_mib().address().as_raw(),
            0x0000_8000_0000_0000,
        )
    }

    /// Kernel heap: grows sector by sector (2 MiB) up to a 1 GiB cap.
    pub const fn heap() -> VirtExtent {
        VirtExtent::from_raw(0xffff_9000_0000_0000, HEAP_MAX_SIZE)
    }

    /// Scratch window used to map arbitrary physical memory (ACPI tables,
    /// MMIO) a page at a time.
    pub const fn acpi_window() -> VirtExtent {
        VirtExtent::from_raw(0xffff_9040_0000_0000, ACPI_WINDOW_SIZE)
    }

    /// Kernel thread stacks.
    pub const fn kernel_stacks() -> VirtExtent {
        VirtExtent::from_raw(0xffff_9080_0000_0000, KERNEL_STACKS_SIZE)
    }

    /// Kernel image's address. This is the last 2GiB of memory.
    pub const fn kernel_image() -> VirtExtent {
        VirtExtent::from_raw_range_exclusive(0xffff_ffff_8000_0000, 0xffff_ffff_ffff_ffff)
    }
}

/// Size of one heap sector: the unit the heap grows and shrinks by.
pub const HEAP_SECTOR_SIZE: u64 = 2 * 1024 * 1024;
/// Hard cap on kernel heap size.
pub const HEAP_MAX_SIZE: u64 = 1024 * 1024 * 1024;

pub const ACPI_WINDOW_SIZE: u64 = 16 * 1024 * 1024;
pub const KERNEL_STACKS_SIZE: u64 = 64 * 1024 * 1024;

pub const PAGE_SIZE: Length = shared::memory::page::PAGE_SIZE;

/// The maximum amount of memory the physical memory allocator supports.
/// Exactly 128 GiB. TODO: remove this limit.
pub const MAX_MEMORY_BYTES: usize = 137438953472;
pub const MAX_MEMORY: Length = Length::from_raw(MAX_MEMORY_BYTES as u64);
pub const MAX_MEMORY_FRAMES: usize = MAX_MEMORY_BYTES / PAGE_SIZE.as_raw() as usize;

pub const fn heap_base() -> VirtAddress {
    VirtualMap::heap().address()
}
