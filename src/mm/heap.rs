//! The kernel heap's [`ChunkProvider`]: grows the heap one sector at a time
//! by allocating frames and mapping them into [`VirtualMap::heap`].

use super::layout::{self, VirtualMap};
use super::paging::PageTableFlags;
use super::virtmem;
use crate::sync::Mutex;
use shared::memory::addr::{Length, VirtAddress};
use shared::memory::alloc::heap::{ChunkProvider, RawLock};
use shared::memory::page::{Page, PAGE_SIZE};

use core::mem::MaybeUninit;

pub const HEAP_CHUNK_SIZE: usize = layout::HEAP_SECTOR_SIZE as usize;

/// Lets [`CheckedHeap`](shared::memory::alloc::CheckedHeap) guard the heap
/// with this kernel's own sleeping mutex instead of a spinlock: growing a
/// sector can map page tables and, per the concurrency model, nothing that
/// can sleep may run with a spinlock held, so the lock around the whole
/// heap can't be one either.
impl<T> RawLock<T> for Mutex<T> {
    type Guard<'a> = crate::sync::MutexGuard<'a, T> where T: 'a;

    fn lock(&self) -> Self::Guard<'_> {
        Mutex::lock(self)
    }
}

/// Feeds the kernel heap one 2 MiB sector at a time, up to
/// [`layout::HEAP_MAX_SIZE`]. Each sector is backed by freshly allocated
/// frames mapped at the next unused address in [`VirtualMap::heap`]; sectors
/// are never returned once claimed, matching the heap's own policy of never
/// shrinking below its watermark.
pub struct HeapSectorProvider {
    next: VirtAddress,
}

impl HeapSectorProvider {
    pub const fn new() -> Self {
        HeapSectorProvider {
            next: VirtualMap::heap().address(),
        }
    }
}

// SAFETY: `allocate` only ever hands out memory carved from
// `VirtualMap::heap`, a range this type owns exclusively by construction
// (there is exactly one `HeapSectorProvider`, wrapped in the heap's mutex).
unsafe impl ChunkProvider<{ HEAP_CHUNK_SIZE }> for HeapSectorProvider {
    fn allocate(&mut self, num_chunks: usize) -> *mut [MaybeUninit<u8>] {
        let sector_len = Length::from_raw(HEAP_CHUNK_SIZE as u64);
        let total_len = Length::from_raw(HEAP_CHUNK_SIZE as u64 * num_chunks as u64);

        let heap_end = VirtualMap::heap().end_address();
        let Some(alloc_end) = self.next.offset_by_checked(total_len) else {
            return core::ptr::slice_from_raw_parts_mut(core::ptr::null_mut(), 0);
        };
        if alloc_end > heap_end {
            log::error!("kernel heap exhausted its virtual range at {heap_end:?}");
            return core::ptr::slice_from_raw_parts_mut(core::ptr::null_mut(), 0);
        }

        let base = self.next;
        for chunk in 0..num_chunks {
            let chunk_base = base + Length::from_raw(chunk as u64) * sector_len.as_raw();
            for page_idx in 0..(HEAP_CHUNK_SIZE as u64 / PAGE_SIZE.as_raw()) {
                let page = Page::new(chunk_base + Length::from_raw(page_idx * PAGE_SIZE.as_raw()));
                let Some(frame) = super::allocate_frame() else {
                    log::error!("out of physical memory growing kernel heap");
                    return core::ptr::slice_from_raw_parts_mut(core::ptr::null_mut(), 0);
                };
                // SAFETY: `page` lies in `VirtualMap::heap`, which only this
                // provider ever maps into, and `frame` was just allocated.
                let result = unsafe {
                    virtmem::map(
                        page,
                        frame,
                        PageTableFlags::WRITABLE | PageTableFlags::EXECUTE_DISABLE,
                        super::allocate_frame,
                    )
                };
                if result.is_err() {
                    log::error!("failed to map kernel heap sector at {page:?}");
                    return core::ptr::slice_from_raw_parts_mut(core::ptr::null_mut(), 0);
                }
            }
        }

        self.next = alloc_end;
        core::ptr::slice_from_raw_parts_mut(base.as_mut_ptr(), total_len.as_raw() as usize)
    }
}

unsafe impl Send for HeapSectorProvider {}
