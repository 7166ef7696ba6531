//! Physical frame allocation, page-table bootstrap, and the kernel heap.
//!
//! Booting leaves the kernel running on the bootloader's page tables with an
//! unknown, possibly-absent recursive slot. [`init`] builds a fresh set of
//! tables with the recursive slot installed at [`layout::RECURSIVE_INDEX`],
//! switches to them, and only then brings up the real frame allocator and
//! global heap. Everything after that point goes through [`virtmem`] instead
//! of a direct physical map: this kernel does not map all of physical memory
//! anywhere.

pub mod heap;
pub mod layout;
pub mod paging;
pub mod virtmem;

use layout::{MAX_MEMORY_FRAMES, RECURSIVE_INDEX, VirtualMap};
use paging::{Mapper, PageTable, PageTableFlags};

use shared::memory::addr::{Length, PhysAddress, VirtAddress};
use shared::memory::alloc::{BitmapFrameAllocator, CheckedHeap, FrameAllocator as _};
use shared::memory::alloc::phys::{BumpFrameAllocator, fill_bitmap_from_map};
use shared::memory::page::{Frame, FrameRange, Page, PAGE_SIZE};
use shared::memory::{BumpAllocator, Map as MemoryMap, MapEntry, MemoryType};

pub use shared::memory::addr::{PhysExtent, VirtExtent};

use multiboot2 as mb2;
use spin::Mutex;

extern "C" {
    static KERNEL_PHYS_BEGIN_SYM: u8;
    static KERNEL_PHYS_END_SYM: u8;
    static KERNEL_VIRT_BASE: u8;
}

/// The frame allocator backing [`allocate_frame`] and friends. `None` before
/// [`init`] runs.
static FRAME_ALLOCATOR: Mutex<Option<BitmapFrameAllocator<'static>>> = Mutex::new(None);

/// Backing storage for `FRAME_ALLOCATOR`'s bitmap, sized for
/// [`layout::MAX_MEMORY_FRAMES`]. Lives in `.bss`; `init` carves it down to
/// the bytes actually needed for the machine's installed memory.
static mut FRAME_BITMAP: [u8; MAX_MEMORY_FRAMES / 8] = [0; MAX_MEMORY_FRAMES / 8];

#[global_allocator]
static GLOBAL_ALLOCATOR: CheckedHeap<
    heap::HeapSectorProvider,
    { heap::HEAP_CHUNK_SIZE },
    crate::sync::Mutex<shared::memory::alloc::Heap<heap::HeapSectorProvider, { heap::HEAP_CHUNK_SIZE }>>,
> = CheckedHeap::with_lock(crate::sync::Mutex::new(shared::memory::alloc::Heap::new(
    heap::HeapSectorProvider::new(),
)));

/// Physical extent of the kernel image, from linker symbols.
pub fn get_kernel_phys_extent() -> PhysExtent {
    unsafe {
        let begin = &KERNEL_PHYS_BEGIN_SYM as *const u8 as u64;
        let end = &KERNEL_PHYS_END_SYM as *const u8 as u64;
        PhysExtent::from_raw_range_exclusive(begin, end)
    }
}

/// Virtual base address the kernel image is linked to run at.
pub fn get_kernel_virt_base() -> VirtAddress {
    unsafe { VirtAddress::from_raw(&KERNEL_VIRT_BASE as *const u8 as u64) }
}

fn translate_memory_map(mbinfo: &mb2::BootInformation) -> MemoryMap {
    let tag = mbinfo
        .memory_map_tag()
        .expect("no memory map tag in multiboot info");

    let entries = tag.memory_areas().iter().map(|area| {
        let mem_type = if area.typ() == mb2::MemoryAreaType::Available {
            MemoryType::Available
        } else {
            MemoryType::Reserved
        };
        MapEntry {
            extent: PhysExtent::from_raw_range_exclusive(area.start_address(), area.end_address()),
            mem_type,
        }
    });

    MemoryMap::from_entries(entries)
}

/// Identity-maps `extent` at L1 granularity using `mapper`.
fn identity_map_extent(
    mapper: &mut Mapper<impl FnMut(PhysAddress) -> Option<VirtAddress>, impl FnMut() -> Option<Frame>>,
    extent: PhysExtent,
    flags: PageTableFlags,
) {
    let aligned = extent.expand_to_alignment(PAGE_SIZE.as_raw());
    let frame_count = aligned.length().as_raw() / PAGE_SIZE.as_raw();
    let first_frame = Frame::containing(aligned.address());
    for i in 0..frame_count {
        let frame = first_frame.next(i).unwrap();
        let page = Page::new(VirtAddress::from_raw(frame.start().as_raw()));
        unsafe {
            mapper.map(page, frame, flags).expect("bootstrap identity map failed");
        }
    }
}

/// Maps `extent`'s frames at their corresponding address in
/// [`VirtualMap::kernel_image`] (offset by `virt_base`).
fn map_kernel_image(
    mapper: &mut Mapper<impl FnMut(PhysAddress) -> Option<VirtAddress>, impl FnMut() -> Option<Frame>>,
    phys_extent: PhysExtent,
    virt_base: VirtAddress,
) {
    let frame_count = phys_extent
        .expand_to_alignment(PAGE_SIZE.as_raw())
        .length()
        .as_raw()
        / PAGE_SIZE.as_raw();
    let first_frame = Frame::containing(phys_extent.address());
    let flags = PageTableFlags::WRITABLE | PageTableFlags::GLOBAL;
    for i in 0..frame_count {
        let frame = first_frame.next(i).unwrap();
        let page = Page::new(virt_base + Length::from_raw(i * PAGE_SIZE.as_raw()));
        unsafe {
            mapper.map(page, frame, flags).expect("bootstrap kernel image map failed");
        }
    }
}

/// Builds a fresh page table hierarchy, switches to it, and brings up the
/// real frame allocator and kernel heap.
///
/// `reserved` lists additional physical extents (e.g. the init program image)
/// that must not be handed out by the frame allocator.
pub fn init(mbinfo: &mb2::BootInformation, reserved: impl Iterator<Item = PhysExtent> + Clone) {
    let memory_map = translate_memory_map(mbinfo);

    let kernel_phys = get_kernel_phys_extent();
    let kernel_virt_base = get_kernel_virt_base();

    let mbinfo_extent = PhysExtent::from_raw_range_exclusive(
        mbinfo.start_address() as u64,
        mbinfo.end_address() as u64,
    );

    let first_mib = {
        let m = VirtualMap::first_mib();
        PhysExtent::from_raw(m.address().as_raw(), m.length().as_raw())
    };

    // Bootstrap allocator: hands out frames to build the new page tables.
    // Sourced from a small window above the first MiB (which stays identity
    // mapped and is never handed out) and below the kernel image, large
    // enough to hold the handful of page-table frames bootstrap needs.
    let bootstrap_window = PhysExtent::from_raw(first_mib.end_address().as_raw(), 15 * 1024 * 1024);
    let mut bootstrap_holes: arrayvec::ArrayVec<PhysExtent, 16> = arrayvec::ArrayVec::new();
    bootstrap_holes.push(kernel_phys);
    bootstrap_holes.push(mbinfo_extent);
    for extent in reserved.clone() {
        bootstrap_holes.push(extent);
    }
    bootstrap_holes.sort_by_key(|e| e.address().as_raw());

    let bootstrap_free =
        shared::memory::remove_reserved(core::iter::once(bootstrap_window), bootstrap_holes);
    let bootstrap_frames: arrayvec::ArrayVec<Frame, 4096> =
        shared::memory::iter_map_frames(bootstrap_free)
            .flat_map(|range| range.iter())
            .collect();
    let first_bootstrap_frame = *bootstrap_frames
        .first()
        .expect("no bootstrap frames available for page table setup");
    let mut bootstrap_alloc = BumpFrameAllocator::new(
        FrameRange::new(first_bootstrap_frame, bootstrap_frames.len() as u64)
            .expect("bootstrap frames are not contiguous"),
    );

    let l4_frame = bootstrap_alloc.allocate().expect("out of bootstrap frames");
    let l4_table: &mut PageTable = unsafe { &mut *(l4_frame.start().as_raw() as *mut PageTable) };
    *l4_table = PageTable::zero();

    // SAFETY: identity mapping, so physical == virtual for every address
    // touched by the bootstrap mapper.
    let translator = |phys: PhysAddress| Some(VirtAddress::from_raw(phys.as_raw()));
    let mut frame_allocator = || bootstrap_alloc.allocate();

    {
        let mut mapper = unsafe { Mapper::new(l4_table, translator, &mut frame_allocator) };

        // Identity-map the first MiB: BIOS data area, legacy VGA text buffer,
        // and other fixed-address firmware structures the kernel still
        // reaches directly.
        identity_map_extent(
            &mut mapper,
            first_mib,
            PageTableFlags::WRITABLE | PageTableFlags::EXECUTE_DISABLE,
        );

        // Identity-map the bootstrap window itself so the tables we're
        // building remain reachable at their physical addresses until the
        // recursive map takes over.
        identity_map_extent(
            &mut mapper,
            bootstrap_window,
            PageTableFlags::WRITABLE | PageTableFlags::EXECUTE_DISABLE,
        );

        map_kernel_image(&mut mapper, kernel_phys, kernel_virt_base);
    }

    unsafe {
        virtmem::install_recursive_slot(l4_table, l4_frame);
    }

    unsafe {
        install_page_table(l4_frame);
    }

    let remaining = bootstrap_alloc.unwrap();

    // Now that we're running on the new tables, bring up the real allocator
    // over all of physical memory, reserving what's already spoken for.
    let bitmap_len_bytes = {
        let highest = memory_map
            .entries()
            .iter()
            .map(|e| e.extent.end_address().as_raw())
            .max()
            .unwrap_or(0);
        ((highest / PAGE_SIZE.as_raw() / 8) + 1) as usize
    };
    let bitmap: &mut [u8] = unsafe { &mut FRAME_BITMAP[..bitmap_len_bytes] };
    fill_bitmap_from_map(bitmap, &memory_map);

    // SAFETY: `bitmap` was just filled to reflect `memory_map`, which is
    // authoritative for what's available.
    let mut allocator = unsafe { BitmapFrameAllocator::new(bitmap) };

    for frame in shared::memory::iter_map_frames([
        first_mib,
        bootstrap_window,
        kernel_phys,
        mbinfo_extent,
    ])
    .flat_map(|r| r.iter())
    {
        let _ = allocator.reserve(frame);
    }
    for frame in shared::memory::iter_map_frames(reserved).flat_map(|r| r.iter()) {
        let _ = allocator.reserve(frame);
    }
    if let Some(remaining) = remaining {
        for frame in remaining.iter() {
            unsafe { allocator.add_new_frame(frame) };
        }
    }

    *FRAME_ALLOCATOR.lock() = Some(allocator);
}

/// Installs `l4_frame` as the active page table via `CR3`.
///
/// # Safety
/// `l4_frame` must hold a fully-populated, valid L4 page table with a
/// recursive slot installed, including mappings for the code currently
/// executing and its stack.
unsafe fn install_page_table(l4_frame: Frame) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;

    let frame = PhysFrame::from_start_address(PhysAddr::new(l4_frame.start().as_raw()))
        .expect("kernel page table frame misaligned");
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
    }
}

/// Allocates a single physical frame, or `None` if memory is exhausted.
///
/// # Panics
/// Panics if called before [`init`].
pub fn allocate_frame() -> Option<Frame> {
    FRAME_ALLOCATOR
        .lock()
        .as_mut()
        .expect("mm::allocate_frame called before mm::init")
        .allocate()
}

/// Allocates `count` physical frames. Not guaranteed contiguous; callers
/// needing contiguity should use [`allocate_owned_frames`] with a
/// power-of-two count instead.
pub fn allocate_frames(count: u64) -> Option<FrameRange> {
    let order = (64 - (count.max(1) - 1).leading_zeros()) as usize;
    FRAME_ALLOCATOR
        .lock()
        .as_mut()
        .expect("mm::allocate_frames called before mm::init")
        .allocate_range(order)
}

pub fn deallocate_frames(range: FrameRange) {
    FRAME_ALLOCATOR
        .lock()
        .as_mut()
        .expect("mm::deallocate_frames called before mm::init")
        .deallocate_range(range);
}

/// A contiguous range of physical frames, freed automatically on drop.
pub struct OwnedFrameRange {
    range: Option<FrameRange>,
}

impl OwnedFrameRange {
    pub fn range(&self) -> &FrameRange {
        self.range.as_ref().unwrap()
    }
}

impl Drop for OwnedFrameRange {
    fn drop(&mut self) {
        if let Some(range) = self.range.take() {
            deallocate_frames(range);
        }
    }
}

/// Allocates `2^order` contiguous frames, owned and freed on drop.
pub fn allocate_owned_frames(order: usize) -> Option<OwnedFrameRange> {
    let range = FRAME_ALLOCATOR
        .lock()
        .as_mut()
        .expect("mm::allocate_owned_frames called before mm::init")
        .allocate_range(order)?;
    Some(OwnedFrameRange { range: Some(range) })
}
