//! A growable heap over boundary-tagged blocks, coalesced eagerly on free.
//!
//! The heap is an implicit list: every live block, free or taken, is preceded
//! by a [`BlockHeader`] and followed by a [`BlockFooter`] carrying the same
//! size, so a block's left neighbor can be found by reading the footer just
//! before it and its right neighbor by skipping `size` bytes forward. No
//! separate free list is kept; allocation walks the implicit list starting
//! from a cached pointer to the lowest-addressed known-free block.

use core::alloc::{AllocError, Allocator, GlobalAlloc, Layout};
use core::marker::PhantomData;
use core::mem::{size_of, MaybeUninit};
use core::ops::DerefMut;
use core::ptr::NonNull;

use bitflags::bitflags;
use spin::Mutex;
use static_assertions::const_assert;

pub const DEFAULT_CHUNK_SIZE: usize = crate::memory::page::PAGE_SIZE.as_raw() as usize;

const MAGIC: u32 = 0x4B48_4450; // "KHDP"

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct BlockFlags: u8 {
        const TAKEN = 1 << 0;
        const HAS_LEFT = 1 << 1;
        const HAS_RIGHT = 1 << 2;
    }
}

/// Site that requested an allocation, recorded only when compiled with
/// `heap_debug_tags` so release kernels pay nothing for it.
#[cfg(feature = "heap_debug_tags")]
#[derive(Clone, Copy, Debug)]
struct AllocSite {
    file: &'static str,
    line: u32,
}

#[repr(C)]
struct BlockHeader {
    magic: u32,
    /// Total size of the block, header and footer included.
    size: u32,
    flags: BlockFlags,
    #[cfg(feature = "heap_debug_tags")]
    site: Option<AllocSite>,
}

#[repr(C)]
struct BlockFooter {
    size: u32,
    magic: u32,
}

const_assert!(size_of::<BlockHeader>() <= 16);
const_assert!(size_of::<BlockFooter>() == 8);

/// Smallest block we'll ever create: header + footer + 16 bytes of payload,
/// rounded up to a 16-byte alignment.
const MIN_BLOCK_SIZE: usize = {
    let raw = size_of::<BlockHeader>() + size_of::<BlockFooter>() + 16;
    (raw + 15) & !15
};

/// Heap corruption, detected via a mismatched magic number or size between a
/// block's header and footer. Fatal: the heap's invariants can no longer be
/// trusted once this fires.
#[derive(Debug)]
pub struct CorruptionDetected {
    pub block_addr: usize,
    #[cfg(feature = "heap_debug_tags")]
    pub last_known_good_site: Option<(&'static str, u32)>,
}

/// Provides backing memory to `Heap`. `CHUNK_SIZE` must be a power of 2.
///
/// # Safety
///
/// The implementation must return a valid slice sized and aligned to
/// `CHUNK_SIZE * num_chunks`. The client of `ChunkProvider` has exclusive
/// access to this slice thereafter, and the slice must remain valid and
/// contiguous with previously returned chunks (the heap treats growth as
/// extending a single address range).
pub unsafe trait ChunkProvider<const CHUNK_SIZE: usize = DEFAULT_CHUNK_SIZE> {
    fn allocate(&mut self, num_chunks: usize) -> *mut [MaybeUninit<u8>];
}

pub struct Heap<Provider, const CHUNK_SIZE: usize = DEFAULT_CHUNK_SIZE> {
    provider: Provider,
    /// Pointer to the lowest-addressed block known to be free, or null if
    /// none is known (forcing a scan from `region_start` on next allocation).
    lowest_free: *mut BlockHeader,
    /// Start of the region handed out by `provider` so far. Null until the
    /// first chunk is fetched.
    region_start: *mut u8,
    /// One past the last byte of the region handed out by `provider`.
    region_end: *mut u8,
    /// Site of the most recent allocation `check_magic` walked past without
    /// finding corruption, so a later panic can report where the corrupted
    /// block's predecessor came from even though the corrupted header's own
    /// bookkeeping can no longer be trusted.
    #[cfg(feature = "heap_debug_tags")]
    last_known_good_site: Option<(&'static str, u32)>,
}

// SAFETY: `Heap` owns its region exclusively; it contains raw pointers only
// because intrusive implicit-list blocks can't be expressed with references.
unsafe impl<Provider: Send, const CHUNK_SIZE: usize> Send for Heap<Provider, CHUNK_SIZE> {}

impl<Provider: ChunkProvider<CHUNK_SIZE>, const CHUNK_SIZE: usize> Heap<Provider, CHUNK_SIZE> {
    pub const fn new(provider: Provider) -> Self {
        assert!(CHUNK_SIZE.is_power_of_two());
        Heap {
            provider,
            lowest_free: core::ptr::null_mut(),
            region_start: core::ptr::null_mut(),
            region_end: core::ptr::null_mut(),
            #[cfg(feature = "heap_debug_tags")]
            last_known_good_site: None,
        }
    }

    fn allocate(&mut self, layout: Layout) -> *mut [u8] {
        if layout.size() == 0 {
            return core::ptr::slice_from_raw_parts_mut(layout.align() as *mut u8, 0);
        }

        let want = round_up_block_size(core::cmp::max(layout.size(), layout.align()));

        loop {
            if self.region_start.is_null() {
                self.grow();
            }

            if let Some(header) = self.find_free_block(want) {
                self.split_and_take(header, want);
                let payload = unsafe { (header as *mut u8).add(size_of::<BlockHeader>()) };
                let size = unsafe { (*header).size as usize
                    - size_of::<BlockHeader>()
                    - size_of::<BlockFooter>() };
                return core::ptr::slice_from_raw_parts_mut(payload, size);
            }

            self.grow();
        }
    }

    /// Walk the implicit list from `self.lowest_free`, looking for the first
    /// free block at least `want` bytes. Advances `lowest_free` past blocks
    /// it finds are taken.
    fn find_free_block(&mut self, want: usize) -> Option<*mut BlockHeader> {
        let mut cursor = if self.lowest_free.is_null() {
            self.region_start as *mut BlockHeader
        } else {
            self.lowest_free
        };

        let mut advanced_lowest = true;

        while (cursor as *mut u8) < self.region_end {
            let header = unsafe { &*cursor };
            self.check_magic(cursor);

            if header.flags.contains(BlockFlags::TAKEN) {
                if advanced_lowest {
                    // This block used to be (or might be) the lowest free
                    // block; it no longer is. Keep scanning forward but don't
                    // move `lowest_free` past it until we know of a later
                    // free block.
                    advanced_lowest = false;
                }
                cursor = unsafe { (cursor as *mut u8).add(header.size as usize) } as *mut _;
                continue;
            }

            if advanced_lowest {
                self.lowest_free = cursor;
            }

            if header.size as usize >= want {
                return Some(cursor);
            }

            cursor = unsafe { (cursor as *mut u8).add(header.size as usize) } as *mut _;
        }

        None
    }

    /// Mark `header`'s block taken, splitting off a trailing free remainder
    /// if it's large enough to be worth keeping as its own block.
    fn split_and_take(&mut self, header: *mut BlockHeader, want: usize) {
        unsafe {
            let block_size = (*header).size as usize;
            let remainder = block_size - want;

            if remainder >= MIN_BLOCK_SIZE {
                (*header).size = want as u32;
                write_footer(header);

                let new_header = (header as *mut u8).add(want) as *mut BlockHeader;
                *new_header = BlockHeader {
                    magic: MAGIC,
                    size: remainder as u32,
                    flags: BlockFlags::HAS_LEFT
                        | if has_right(header, self.region_end) {
                            BlockFlags::HAS_RIGHT
                        } else {
                            BlockFlags::empty()
                        },
                    #[cfg(feature = "heap_debug_tags")]
                    site: None,
                };
                write_footer(new_header);
                fix_right_has_left(new_header, self.region_end, true);

                if self.lowest_free == header {
                    self.lowest_free = new_header;
                }
            } else if self.lowest_free == header {
                self.lowest_free = core::ptr::null_mut();
            }

            (*header).flags.insert(BlockFlags::TAKEN);
            write_footer(header);
        }
    }

    /// Check a header's and its footer's magic/size agreement. Panics with
    /// [`CorruptionDetected`] diagnostics on mismatch.
    fn check_magic(&mut self, header: *mut BlockHeader) {
        unsafe {
            let h = &*header;
            if h.magic != MAGIC {
                self.panic_corrupted(header);
            }
            let footer = footer_of(header);
            let f = &*footer;
            if f.magic != MAGIC || f.size != h.size {
                self.panic_corrupted(header);
            }

            #[cfg(feature = "heap_debug_tags")]
            if let Some(site) = h.site {
                self.last_known_good_site = Some((site.file, site.line));
            }
        }
    }

    #[cfg_attr(not(feature = "heap_debug_tags"), allow(unused_variables))]
    fn panic_corrupted(&self, header: *mut BlockHeader) -> ! {
        let err = CorruptionDetected {
            block_addr: header as usize,
            #[cfg(feature = "heap_debug_tags")]
            last_known_good_site: self.last_known_good_site,
        };
        panic!("heap corruption detected: {:?}", err);
    }

    /// Record the call site that produced `ptr`, for corruption diagnostics.
    /// A no-op unless built with `heap_debug_tags`.
    #[cfg(feature = "heap_debug_tags")]
    pub unsafe fn tag_allocation(ptr: *mut u8, file: &'static str, line: u32) {
        unsafe {
            let header = ptr.sub(size_of::<BlockHeader>()) as *mut BlockHeader;
            (*header).site = Some(AllocSite { file, line });
        }
    }

    /// Grow the region by one chunk (or more, if `CHUNK_SIZE` doesn't cover a
    /// minimal block — it always does in practice), linking the new memory in
    /// as a free block.
    fn grow(&mut self) {
        let ptr = self.provider.allocate(1) as *mut u8;
        assert!(!ptr.is_null());

        let had_left = !self.region_start.is_null() && ptr == self.region_end;

        unsafe {
            let header = ptr as *mut BlockHeader;
            *header = BlockHeader {
                magic: MAGIC,
                size: CHUNK_SIZE as u32,
                flags: if had_left {
                    BlockFlags::HAS_LEFT
                } else {
                    BlockFlags::empty()
                },
                #[cfg(feature = "heap_debug_tags")]
                site: None,
            };
            write_footer(header);
        }

        if self.region_start.is_null() {
            self.region_start = ptr;
        }
        self.region_end = unsafe { ptr.add(CHUNK_SIZE) };

        if self.lowest_free.is_null() || (ptr as *mut BlockHeader) < self.lowest_free {
            self.lowest_free = ptr as *mut BlockHeader;
        }

        // Try to coalesce with an immediately preceding free block (the
        // provider may hand back a chunk contiguous with the last one).
        if had_left {
            let new_block = ptr as *mut BlockHeader;
            self.coalesce(new_block);
        }
    }

    /// Free a previously allocated pointer, coalescing with free neighbors.
    ///
    /// # Safety
    /// `ptr` must have been returned by this heap's `allocate` and not freed
    /// since.
    unsafe fn free(&mut self, ptr: *mut u8) {
        let header = unsafe { ptr.sub(size_of::<BlockHeader>()) } as *mut BlockHeader;
        self.check_magic(header);
        unsafe {
            assert!((*header).flags.contains(BlockFlags::TAKEN), "double free at {:p}", header);
            (*header).flags.remove(BlockFlags::TAKEN);
            #[cfg(feature = "heap_debug_tags")]
            {
                (*header).site = None;
            }
        }
        write_footer(header);

        let header = self.coalesce(header);
        if self.lowest_free.is_null() || header < self.lowest_free {
            self.lowest_free = header;
        }
    }

    /// Coalesce the free block at `header` with its free neighbors (left,
    /// right, or both). Returns the header of the resulting merged block.
    fn coalesce(&mut self, mut header: *mut BlockHeader) -> *mut BlockHeader {
        unsafe {
            // Merge right first so `header`'s own HAS_RIGHT flag stays valid
            // while we still need to read it for the left merge check.
            if (*header).flags.contains(BlockFlags::HAS_RIGHT) {
                let right = (header as *mut u8).add((*header).size as usize) as *mut BlockHeader;
                if !(*right).flags.contains(BlockFlags::TAKEN) {
                    let merged_size = (*header).size + (*right).size;
                    (*header).size = merged_size;
                    (*header).flags.set(
                        BlockFlags::HAS_RIGHT,
                        (*right).flags.contains(BlockFlags::HAS_RIGHT),
                    );
                    write_footer(header);
                    fix_right_has_left(header, self.region_end, true);
                    if self.lowest_free == right {
                        self.lowest_free = header;
                    }
                }
            }

            if (*header).flags.contains(BlockFlags::HAS_LEFT) {
                let left = footer_of_left_neighbor(header);
                if !(*left).flags.contains(BlockFlags::TAKEN) {
                    let merged_size = (*left).size + (*header).size;
                    (*left).size = merged_size;
                    (*left)
                        .flags
                        .set(BlockFlags::HAS_RIGHT, (*header).flags.contains(BlockFlags::HAS_RIGHT));
                    write_footer(left);
                    fix_right_has_left(left, self.region_end, true);
                    if self.lowest_free == header {
                        self.lowest_free = left;
                    }
                    header = left;
                }
            }

            header
        }
    }
}

fn round_up_block_size(payload: usize) -> usize {
    let raw = size_of::<BlockHeader>() + size_of::<BlockFooter>() + payload;
    let rounded = (raw + 15) & !15;
    core::cmp::max(rounded, MIN_BLOCK_SIZE)
}

fn has_right(header: *mut BlockHeader, region_end: *mut u8) -> bool {
    unsafe { (header as *mut u8).add((*header).size as usize) < region_end }
}

unsafe fn footer_of(header: *mut BlockHeader) -> *mut BlockFooter {
    unsafe { (header as *mut u8).add((*header).size as usize - size_of::<BlockFooter>()) as *mut BlockFooter }
}

unsafe fn write_footer(header: *mut BlockHeader) {
    unsafe {
        let footer = footer_of(header);
        *footer = BlockFooter {
            size: (*header).size,
            magic: MAGIC,
        };
    }
}

/// The footer immediately preceding `header` belongs to the left neighbor;
/// its `size` field lets us step back to that neighbor's header.
unsafe fn footer_of_left_neighbor(header: *mut BlockHeader) -> *mut BlockHeader {
    unsafe {
        let left_footer = (header as *mut u8).sub(size_of::<BlockFooter>()) as *mut BlockFooter;
        (header as *mut u8).sub((*left_footer).size as usize) as *mut BlockHeader
    }
}

/// After growing or shrinking the block at `header`, its right neighbor's
/// `HAS_LEFT` flag may need updating to reflect whether it still has one.
fn fix_right_has_left(header: *mut BlockHeader, region_end: *mut u8, has_left: bool) {
    unsafe {
        if (*header).flags.contains(BlockFlags::HAS_RIGHT) {
            let right = (header as *mut u8).add((*header).size as usize) as *mut BlockHeader;
            if (right as *mut u8) < region_end {
                (*right).flags.set(BlockFlags::HAS_LEFT, has_left);
                write_footer(right);
            }
        }
    }
}

/// A lock capable of guarding the heap's mutable state.
///
/// `shared` has no business knowing about the kernel's own sleeping mutex
/// type — or, for a host build's tests, anything beyond `spin` — so
/// [`CheckedHeap`] is generic over whichever lock its caller
/// hands it, rather than hardcoding one. `spin::Mutex` is implemented below
/// for tests and any other non-blocking consumer; the kernel binary
/// implements this for its own sleeping mutex, under which two threads
/// genuinely racing to allocate is an expected, everyday occurrence (not a
/// bug to fail fast on), so `lock` blocks rather than fails.
pub trait RawLock<T> {
    type Guard<'a>: DerefMut<Target = T>
    where
        Self: 'a,
        T: 'a;

    fn lock(&self) -> Self::Guard<'_>;
}

impl<T> RawLock<T> for Mutex<T> {
    type Guard<'a> = spin::MutexGuard<'a, T> where T: 'a;

    fn lock(&self) -> Self::Guard<'_> {
        Mutex::lock(self)
    }
}

pub struct CheckedHeap<
    Provider,
    const CHUNK_SIZE: usize = DEFAULT_CHUNK_SIZE,
    Lock = Mutex<Heap<Provider, CHUNK_SIZE>>,
>(pub Lock, PhantomData<fn() -> Heap<Provider, CHUNK_SIZE>>);

impl<Provider, const CHUNK_SIZE: usize> CheckedHeap<Provider, CHUNK_SIZE> {
    pub const fn new(heap: Heap<Provider, CHUNK_SIZE>) -> Self {
        CheckedHeap(Mutex::new(heap), PhantomData)
    }
}

impl<Provider, const CHUNK_SIZE: usize, Lock> CheckedHeap<Provider, CHUNK_SIZE, Lock> {
    /// Builds a `CheckedHeap` around an already-constructed lock, for a
    /// `Lock` other than the default `spin::Mutex` (the kernel binary's
    /// sleeping mutex, for instance).
    pub const fn with_lock(lock: Lock) -> Self {
        CheckedHeap(lock, PhantomData)
    }
}

impl<Provider, const CHUNK_SIZE: usize, Lock> CheckedHeap<Provider, CHUNK_SIZE, Lock>
where
    Lock: RawLock<Heap<Provider, CHUNK_SIZE>>,
{
    pub fn get(&self) -> Lock::Guard<'_> {
        self.0.lock()
    }
}

unsafe impl<Provider: ChunkProvider<CHUNK_SIZE>, const CHUNK_SIZE: usize, Lock> GlobalAlloc
    for CheckedHeap<Provider, CHUNK_SIZE, Lock>
where
    Lock: RawLock<Heap<Provider, CHUNK_SIZE>>,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.get().allocate(layout) as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe {
            self.get().free(ptr);
        }
    }
}

unsafe impl<Provider: ChunkProvider<CHUNK_SIZE>, const CHUNK_SIZE: usize, Lock> Allocator
    for CheckedHeap<Provider, CHUNK_SIZE, Lock>
where
    Lock: RawLock<Heap<Provider, CHUNK_SIZE>>,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        NonNull::new(self.0.lock().allocate(layout)).ok_or(AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        unsafe {
            self.0.lock().free(ptr.as_ptr());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_log::test;

    const PAGE_SIZE: usize = crate::memory::page::PAGE_SIZE.as_raw() as usize;

    struct TestProvider {
        allocations: Vec<(*mut u8, std::alloc::Layout)>,
        /// Forces consecutive `allocate` calls to hand back contiguous
        /// memory so the heap's coalesce-across-chunks path gets exercised.
        arena: Vec<u8>,
        arena_used: usize,
    }

    impl TestProvider {
        fn new(chunks: usize) -> Self {
            TestProvider {
                allocations: Vec::new(),
                arena: vec![0u8; chunks * PAGE_SIZE + PAGE_SIZE],
                arena_used: 0,
            }
        }
    }

    unsafe impl ChunkProvider for TestProvider {
        fn allocate(&mut self, num_chunks: usize) -> *mut [MaybeUninit<u8>] {
            let len = num_chunks * PAGE_SIZE;
            let base = self.arena.as_mut_ptr() as usize;
            let aligned_base = (base + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            let start = aligned_base + self.arena_used;
            self.arena_used += len;
            assert!(start + len <= base + self.arena.len());
            core::ptr::slice_from_raw_parts_mut(start as *mut MaybeUninit<u8>, len)
        }
    }

    #[test]
    fn allocate_and_free_roundtrip() {
        let mut heap = Heap::new(TestProvider::new(4));
        let layout = Layout::from_size_align(64, 8).unwrap();
        let ptr = heap.allocate(layout) as *mut u8;
        assert!(!ptr.is_null());
        unsafe {
            heap.free(ptr);
        }
    }

    #[test]
    fn split_produces_independently_freeable_blocks() {
        let mut heap = Heap::new(TestProvider::new(4));
        let layout = Layout::from_size_align(32, 8).unwrap();

        let a = heap.allocate(layout) as *mut u8;
        let b = heap.allocate(layout) as *mut u8;
        assert_ne!(a, b);

        unsafe {
            heap.free(a);
            heap.free(b);
        }
    }

    #[test]
    fn coalesces_adjacent_free_blocks() {
        let mut heap = Heap::new(TestProvider::new(4));
        let layout = Layout::from_size_align(32, 8).unwrap();

        let a = heap.allocate(layout) as *mut u8;
        let b = heap.allocate(layout) as *mut u8;
        let c = heap.allocate(layout) as *mut u8;

        unsafe {
            heap.free(a);
            heap.free(c);
            heap.free(b);
        }

        // After freeing all three in non-address order, a large allocation
        // spanning their combined size should succeed without growing.
        let region_before = heap.region_end;
        let big = Layout::from_size_align(64, 8).unwrap();
        let merged = heap.allocate(big) as *mut u8;
        assert!(!merged.is_null());
        assert_eq!(heap.region_end, region_before, "should not have grown");
    }

    #[test]
    fn grows_when_out_of_free_space() {
        let mut heap = Heap::new(TestProvider::new(8));
        let layout = Layout::from_size_align(PAGE_SIZE - 64, 8).unwrap();

        let mut ptrs = Vec::new();
        for _ in 0..4 {
            let p = heap.allocate(layout) as *mut u8;
            assert!(!p.is_null());
            ptrs.push(p);
        }

        for p in ptrs {
            unsafe {
                heap.free(p);
            }
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut heap = Heap::new(TestProvider::new(2));
        let layout = Layout::from_size_align(32, 8).unwrap();
        let ptr = heap.allocate(layout) as *mut u8;
        unsafe {
            heap.free(ptr);
            heap.free(ptr);
        }
    }

    #[test]
    fn zero_size_allocation_is_a_no_op() {
        let mut heap = Heap::new(TestProvider::new(2));
        let layout = Layout::from_size_align(0, 1).unwrap();
        let slice = heap.allocate(layout);
        assert_eq!(slice.len(), 0);
    }

    #[test]
    fn test_heap_with_collections() {
        let provider = TestProvider::new(16);
        let allocator = CheckedHeap::new(Heap::new(provider));
        let mut vec = Vec::new_in(&allocator);
        for i in 0..1000 {
            vec.push(i);
        }

        let mut set = std::collections::HashSet::new();
        for i in 0..1000 {
            set.insert(i);
        }
        for i in (0..1000).rev() {
            set.remove(&i);
        }
    }

    /// Walks every block between `region_start` and `region_end`, checking
    /// header/footer agreement, that no two adjacent blocks are both free,
    /// and that the blocks' sizes exactly cover the region.
    fn assert_heap_invariants<P, const C: usize>(heap: &Heap<P, C>) {
        if heap.region_start.is_null() {
            return;
        }

        let mut cursor = heap.region_start as *mut BlockHeader;
        let mut covered = 0usize;
        let mut prev_free = false;

        unsafe {
            while (cursor as *mut u8) < heap.region_end {
                let header = &*cursor;
                assert_eq!(header.magic, MAGIC, "header magic corrupted at {cursor:p}");
                let footer = &*footer_of(cursor);
                assert_eq!(footer.magic, MAGIC, "footer magic corrupted at {cursor:p}");
                assert_eq!(
                    footer.size, header.size,
                    "header/footer size mismatch at {cursor:p}"
                );

                let is_free = !header.flags.contains(BlockFlags::TAKEN);
                assert!(!(is_free && prev_free), "adjacent free blocks at {cursor:p}");
                prev_free = is_free;

                covered += header.size as usize;
                cursor = (cursor as *mut u8).add(header.size as usize) as *mut BlockHeader;
            }
        }

        assert_eq!(
            covered,
            heap.region_end as usize - heap.region_start as usize,
            "block sizes do not conserve the region's bytes"
        );
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]
        #[test]
        fn invariants_hold_across_random_alloc_free_sequences(
            ops in proptest::collection::vec(
                (0usize..3, 8usize..200, 0usize..4),
                1..80,
            )
        ) {
            let mut heap = Heap::new(TestProvider::new(64));
            let mut live: Vec<*mut u8> = Vec::new();

            for (op, size, align_pick) in ops {
                let align = [1, 2, 8, 16][align_pick];
                if op == 0 && !live.is_empty() {
                    let ptr = live.swap_remove(size % live.len());
                    unsafe {
                        heap.free(ptr);
                    }
                } else {
                    let layout = Layout::from_size_align(size, align).unwrap();
                    let ptr = heap.allocate(layout) as *mut u8;
                    prop_assert!(!ptr.is_null());
                    live.push(ptr);
                }
                assert_heap_invariants(&heap);
            }

            for ptr in live {
                unsafe {
                    heap.free(ptr);
                }
            }
            assert_heap_invariants(&heap);
        }
    }
}
