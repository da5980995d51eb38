use std::alloc::{Layout, alloc, dealloc};
use std::mem;
use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicUsize, Ordering};

use static_assertions::const_assert_eq;
use tracing::debug;

use crate::CACHE_LINE_SIZE;

// The shared state word of a block packs two flags and the outstanding slot count:
//
// bit N-1   FULL      - the owner will not carve more slots until every slot has come back
// bit N-2   DETACHED  - the owning allocator is gone; the last release frees the block
// rest      number of slots carved from the block and not yet released
const FULL: usize = 1 << (usize::BITS - 1);
const DETACHED: usize = 1 << (usize::BITS - 2);
const OUTSTANDING_MASK: usize = DETACHED - 1;

/// The part of a memory block that is shared with every thread holding a slot from it.
///
/// It sits at the very start of the block allocation, so a slot can find it by subtracting
/// the byte offset recorded in the slot header from the slot's own address.
#[derive(Debug)]
#[repr(C, align(64))]
pub(crate) struct BlockHeader {
    state: AtomicUsize,

    /// Size of the whole allocation, so that whichever thread frees the block can
    /// reconstruct the layout without access to the owning allocator.
    allocation_size: usize,
}

/// Distance from the start of a block to its first chunk.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

const_assert_eq!(BLOCK_HEADER_SIZE, CACHE_LINE_SIZE);
const_assert_eq!(mem::align_of::<BlockHeader>(), CACHE_LINE_SIZE);

impl BlockHeader {
    /// Returns one slot to the block that owns `header`.
    ///
    /// If the block has been detached from its allocator and this was its last outstanding
    /// slot, the block memory is freed.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that:
    ///
    /// * `header` points to the header of a live block.
    /// * The caller is returning a slot that was carved from this block and that has not
    ///   been returned before.
    /// * The caller does not access the block through `header` after this call.
    pub(crate) unsafe fn release(header: NonNull<Self>) {
        // SAFETY: The block cannot be freed while the slot we are returning is outstanding.
        let block = unsafe { header.as_ref() };

        // Release ordering: whatever was done with the slot memory must be visible before
        // the owner rewinds the block and hands the same memory out again.
        let previous = block.state.fetch_sub(1, Ordering::Release);

        debug_assert_ne!(
            previous & OUTSTANDING_MASK,
            0,
            "released a slot to a memory block that had no outstanding slots"
        );

        if previous & OUTSTANDING_MASK == 1 && previous & DETACHED != 0 {
            // Synchronize with the releases of every other slot before the memory goes away.
            atomic::fence(Ordering::Acquire);

            // SAFETY: The allocator is gone and this was the last slot, so nothing else can
            // reach the block anymore.
            unsafe {
                Self::free(header);
            }
        }
    }

    /// # Safety
    ///
    /// The caller must guarantee that the block is no longer reachable by anyone.
    unsafe fn free(header: NonNull<Self>) {
        // SAFETY: Forwarding the liveness guarantee from the caller.
        let size = unsafe { header.as_ref() }.allocation_size;

        // SAFETY: This is the same size and alignment the block was allocated with.
        let layout = unsafe { Layout::from_size_align_unchecked(size, CACHE_LINE_SIZE) };

        // SAFETY: The pointer came from `alloc()` with this layout and is freed exactly once,
        // as guaranteed by the caller.
        unsafe {
            dealloc(header.as_ptr().cast::<u8>(), layout);
        }
    }
}

/// The alignment guaranteed for the start of every chunk in a block with the given chunk
/// size: block memory starts on a cache line and chunks follow each other back to back.
#[must_use]
pub(crate) fn chunk_alignment(chunk_size: NonZero<usize>) -> usize {
    let chunk_size = chunk_size.get();

    // The largest power of two that divides the chunk size.
    let stride_alignment = chunk_size & chunk_size.wrapping_neg();

    stride_alignment.min(CACHE_LINE_SIZE)
}

/// A run of chunks carved out of a [`MemoryBlock`].
#[derive(Debug)]
pub(crate) struct BlockSlot {
    /// Start of the first chunk of the run.
    ptr: NonNull<u8>,

    /// Byte distance from the block header to `ptr`.
    block_offset: usize,
}

impl BlockSlot {
    #[must_use]
    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[must_use]
    pub(crate) fn block_offset(&self) -> usize {
        self.block_offset
    }
}

/// A fixed-capacity, chunk-granular bump allocator.
///
/// The owner carves runs of chunks from the front of the block. Slots are never returned
/// individually: the block counts outstanding slots and only once it is both full and
/// drained does the owner rewind it to the start on its next acquisition attempt. This
/// keeps release O(1) with no free list, at the cost of some memory slack.
///
/// # Thread safety
///
/// Acquisition requires `&mut self`, so only the owning thread ever advances or rewinds
/// the offset. Releasing goes through [`BlockHeader::release()`] and may happen on any
/// thread.
#[derive(Debug)]
pub(crate) struct MemoryBlock {
    header: NonNull<BlockHeader>,

    chunk_count: NonZero<usize>,
    chunk_size: NonZero<usize>,

    /// Index of the next free chunk. Owner-private, which is what allows the block to be
    /// rewound without racing against threads that release slots.
    offset: usize,
}

// SAFETY: The owner-side fields are only accessed via `&mut self` or immutably. The shared
// header only contains an atomic and a value that never changes after construction.
unsafe impl Send for MemoryBlock {}

impl MemoryBlock {
    /// Calculates the allocation layout of a block, or `None` if the geometry overflows.
    #[must_use]
    pub(crate) fn layout_for(
        chunk_count: NonZero<usize>,
        chunk_size: NonZero<usize>,
    ) -> Option<Layout> {
        let data_size = chunk_count.get().checked_mul(chunk_size.get())?;
        let total_size = data_size.checked_add(BLOCK_HEADER_SIZE)?;

        Layout::from_size_align(total_size, CACHE_LINE_SIZE).ok()
    }

    /// Allocates a new empty block from the system allocator.
    ///
    /// Returns `None` if the geometry overflows or if the system allocator is out of memory.
    #[must_use]
    pub(crate) fn new(chunk_count: NonZero<usize>, chunk_size: NonZero<usize>) -> Option<Self> {
        let layout = Self::layout_for(chunk_count, chunk_size)?;

        // SAFETY: The layout always includes the block header, so it is not zero-sized.
        let header = NonNull::new(unsafe { alloc(layout) })?.cast::<BlockHeader>();

        // SAFETY: The memory was just allocated with an alignment that satisfies the header.
        unsafe {
            header.write(BlockHeader {
                state: AtomicUsize::new(0),
                allocation_size: layout.size(),
            });
        }

        Some(Self {
            header,
            chunk_count,
            chunk_size,
            offset: 0,
        })
    }

    fn shared(&self) -> &BlockHeader {
        // SAFETY: The header lives until the block is dropped and detached; while we exist,
        // we have not detached yet.
        unsafe { self.header.as_ref() }
    }

    /// Carves a run of `chunks` consecutive chunks from the block.
    ///
    /// Returns `None` if the block is full and still has outstanding slots, or if the run
    /// does not fit into the remaining chunks. In the latter case the block is marked full,
    /// so it gets rewound once every slot carved from it has been released.
    #[must_use]
    pub(crate) fn acquire(&mut self, chunks: NonZero<usize>) -> Option<BlockSlot> {
        // Acquire ordering: if the block turns out to be drained, every use of the memory
        // by the releasing threads must happen before we hand it out again.
        let state = self.shared().state.load(Ordering::Acquire);

        if state & FULL != 0 {
            if state & OUTSTANDING_MASK != 0 {
                return None;
            }

            // Full and drained. Nobody else can modify the state word now: there are no
            // outstanding slots to release and only the owner sets flags.
            self.shared().state.store(0, Ordering::Relaxed);
            self.offset = 0;
        }

        // Cannot underflow because the offset never advances past the chunk count.
        let remaining = self.chunk_count.get().wrapping_sub(self.offset);

        if chunks.get() > remaining {
            self.shared().state.fetch_or(FULL, Ordering::Relaxed);
            return None;
        }

        // Cannot overflow because the product is bounded by the block size,
        // which was validated in `layout_for()`.
        let block_offset =
            BLOCK_HEADER_SIZE.wrapping_add(self.offset.wrapping_mul(self.chunk_size.get()));

        // SAFETY: The run lies within the allocation because it fits in the remaining chunks.
        let ptr = unsafe { self.header.cast::<u8>().byte_add(block_offset) };

        // Cannot overflow because it fits in the remaining chunks.
        self.offset = self.offset.wrapping_add(chunks.get());

        // One more outstanding slot, and if this run used up the last chunk, the FULL flag
        // too. The flag is known to be clear here, so adding it is the same as setting it.
        let increment = if self.offset == self.chunk_count.get() {
            FULL | 1
        } else {
            1
        };

        self.shared().state.fetch_add(increment, Ordering::Relaxed);

        Some(BlockSlot { ptr, block_offset })
    }

    /// Index of the next free chunk.
    #[cfg(test)]
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    #[cfg(test)]
    pub(crate) fn chunk_count(&self) -> NonZero<usize> {
        self.chunk_count
    }

    /// Number of slots carved from this block that have not been released yet.
    ///
    /// Other threads may release slots concurrently, so the value may be stale by the time
    /// the caller looks at it.
    #[must_use]
    pub(crate) fn outstanding(&self) -> usize {
        self.shared().state.load(Ordering::Relaxed) & OUTSTANDING_MASK
    }

    /// Whether the block is marked full. A full block may still be drained and will be
    /// rewound on the next acquisition attempt.
    #[cfg(test)]
    pub(crate) fn is_full(&self) -> bool {
        self.shared().state.load(Ordering::Relaxed) & FULL != 0
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        // Acquire ordering in case we end up freeing the block: the releases of all
        // slots must happen before the memory goes away.
        let previous = self.shared().state.fetch_or(DETACHED, Ordering::AcqRel);

        let outstanding = previous & OUTSTANDING_MASK;

        if outstanding == 0 {
            // SAFETY: No slots are outstanding and we are the owner, so nothing else can
            // reach the block.
            unsafe {
                BlockHeader::free(self.header);
            }
        } else {
            debug!(
                outstanding,
                "memory block detached with outstanding slots, last release will free it"
            );
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::thread;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(MemoryBlock: Send);
    assert_not_impl_any!(MemoryBlock: Sync);

    fn header_of(slot: &BlockSlot) -> NonNull<BlockHeader> {
        unsafe { slot.ptr().byte_sub(slot.block_offset()) }.cast::<BlockHeader>()
    }

    #[test]
    fn acquire_advances_offset_by_chunks() {
        let mut block = MemoryBlock::new(nz!(8), nz!(64)).unwrap();

        let first = block.acquire(nz!(1)).unwrap();
        assert_eq!(first.block_offset(), BLOCK_HEADER_SIZE);
        assert_eq!(block.offset(), 1);

        let second = block.acquire(nz!(3)).unwrap();
        assert_eq!(second.block_offset(), BLOCK_HEADER_SIZE + 64);
        assert_eq!(block.offset(), 4);

        assert_eq!(block.outstanding(), 2);
        assert!(!block.is_full());

        assert_eq!(header_of(&first), header_of(&second));

        unsafe {
            BlockHeader::release(header_of(&first));
            BlockHeader::release(header_of(&second));
        }

        assert_eq!(block.outstanding(), 0);
    }

    #[test]
    fn exact_fill_marks_full() {
        let mut block = MemoryBlock::new(nz!(4), nz!(64)).unwrap();

        let slot = block.acquire(nz!(4)).unwrap();
        assert!(block.is_full());

        // Still outstanding, so no rewind.
        assert!(block.acquire(nz!(1)).is_none());
        assert_eq!(block.offset(), 4);

        unsafe {
            BlockHeader::release(header_of(&slot));
        }
    }

    #[test]
    fn run_that_does_not_fit_marks_full() {
        let mut block = MemoryBlock::new(nz!(4), nz!(64)).unwrap();

        let slot = block.acquire(nz!(3)).unwrap();
        assert!(!block.is_full());

        assert!(block.acquire(nz!(2)).is_none());
        assert!(block.is_full());

        // Even a run that would fit is refused once the block is marked full.
        assert!(block.acquire(nz!(1)).is_none());

        unsafe {
            BlockHeader::release(header_of(&slot));
        }
    }

    #[test]
    fn drained_full_block_is_rewound() {
        let mut block = MemoryBlock::new(nz!(4), nz!(64)).unwrap();

        let slots = (0..4)
            .map(|_| block.acquire(nz!(1)).unwrap())
            .collect::<Vec<_>>();
        assert!(block.is_full());

        let first_ptr = slots.first().unwrap().ptr();

        for slot in &slots {
            unsafe {
                BlockHeader::release(header_of(slot));
            }
        }

        assert_eq!(block.outstanding(), 0);

        let reused = block.acquire(nz!(1)).unwrap();
        assert_eq!(reused.ptr(), first_ptr);
        assert_eq!(block.offset(), 1);
        assert!(!block.is_full());

        unsafe {
            BlockHeader::release(header_of(&reused));
        }
    }

    #[test]
    fn partially_drained_block_is_not_rewound() {
        let mut block = MemoryBlock::new(nz!(2), nz!(64)).unwrap();

        let a = block.acquire(nz!(1)).unwrap();
        let b = block.acquire(nz!(1)).unwrap();

        unsafe {
            BlockHeader::release(header_of(&a));
        }

        assert!(block.acquire(nz!(1)).is_none());

        unsafe {
            BlockHeader::release(header_of(&b));
        }

        let slot = block.acquire(nz!(1)).unwrap();

        unsafe {
            BlockHeader::release(header_of(&slot));
        }
    }

    /// Carries a block header pointer to a releasing thread, as a slot handle would.
    struct SendHeader(NonNull<BlockHeader>);

    // SAFETY: The block header is designed to be released from any thread.
    unsafe impl Send for SendHeader {}

    #[test]
    fn release_on_other_thread() {
        let mut block = MemoryBlock::new(nz!(16), nz!(64)).unwrap();

        let headers = (0..16)
            .map(|_| SendHeader(header_of(&block.acquire(nz!(1)).unwrap())))
            .collect::<Vec<_>>();

        assert!(block.is_full());

        thread::spawn(move || {
            for header in headers {
                unsafe {
                    BlockHeader::release(header.0);
                }
            }
        })
        .join()
        .unwrap();

        assert_eq!(block.outstanding(), 0);

        let reused = block.acquire(nz!(1)).unwrap();
        assert_eq!(reused.block_offset(), BLOCK_HEADER_SIZE);

        unsafe {
            BlockHeader::release(header_of(&reused));
        }
    }

    #[test]
    fn dropped_block_with_outstanding_slot_is_freed_by_last_release() {
        let mut block = MemoryBlock::new(nz!(4), nz!(64)).unwrap();

        let slot = block.acquire(nz!(2)).unwrap();
        let header = header_of(&slot);

        drop(block);

        // The block memory must still be valid here.
        unsafe {
            slot.ptr().as_ptr().write_bytes(0xAB, 128);
            BlockHeader::release(header);
        }
    }

    #[test]
    fn chunk_alignment_follows_chunk_size() {
        assert_eq!(chunk_alignment(nz!(24)), 8);
        assert_eq!(chunk_alignment(nz!(48)), 16);
        assert_eq!(chunk_alignment(nz!(64)), CACHE_LINE_SIZE);
        assert_eq!(chunk_alignment(nz!(256)), CACHE_LINE_SIZE);
    }

    #[test]
    fn overflowing_geometry_has_no_layout() {
        assert!(MemoryBlock::layout_for(NonZero::new(usize::MAX).unwrap(), nz!(2)).is_none());
        assert!(MemoryBlock::new(NonZero::new(usize::MAX).unwrap(), nz!(2)).is_none());
    }
}
