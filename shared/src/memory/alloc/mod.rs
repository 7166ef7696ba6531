//! Allocators built on top of the physical frame layer: the frame
//! allocator itself and the growable boundary-tag kernel heap.

pub mod heap;
pub mod phys;

pub use heap::{ChunkProvider, CheckedHeap, Heap, RawLock};
pub use phys::{BitmapFrameAllocator, FrameAllocator, FrameReserveError};
