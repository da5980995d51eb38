use std::alloc::Layout;
use std::num::NonZero;

use nm::Event;
use tracing::{debug, warn};

use crate::metrics::{BLOCKS_GROWN, POOL_EXHAUSTED};
use crate::{
    AllocatorBuilder, BlockList, Error, MemoryBlock, SlotHeader, SlotOrigin, UniqueSlot,
    chunk_alignment,
};

/// A pool of memory blocks that hands out [`UniqueSlot`]s for queue payloads.
///
/// Each block is a fixed number of equally sized chunks. A slot occupies as many whole chunks
/// as its header and payload need, carved from the front of the current block. Blocks are
/// reused wholesale: once a block is full and every slot carved from it has been released, it
/// is rewound and serves new slots from the start again.
///
/// Exhaustion is never an error. Every acquisition returns `None` when it cannot be served and
/// the caller decides whether to retry, grow, fall back to the heap or drop the item.
///
/// # Thread safety
///
/// The allocator is [`Send`] but not [`Sync`] and every acquisition takes `&mut self`, so only
/// one thread at a time ever carves slots from its blocks. The intended arrangement is that
/// each producer owns its own allocator. The slots themselves may be released on any thread,
/// including after the allocator has been dropped: blocks that still have outstanding slots
/// are freed when their last slot is released.
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use slab_mpsc::{AllocKind, Allocator};
///
/// let mut allocator = Allocator::new(nz!(1), nz!(2)).unwrap();
///
/// let first = allocator.try_acquire::<u64>().unwrap();
/// let second = allocator.try_acquire::<u64>().unwrap();
/// assert_eq!(first.alloc_kind(), Some(AllocKind::Pool));
///
/// // The only block is full, so only growing the pool can help.
/// assert!(allocator.try_acquire::<u64>().is_none());
/// assert!(allocator.acquire::<u64>().is_some());
/// assert_eq!(allocator.block_count(), 2);
/// # drop((first, second));
/// ```
#[derive(Debug)]
pub struct Allocator {
    blocks: BlockList,

    chunks_per_block: NonZero<usize>,
    chunk_size: NonZero<usize>,
}

impl Allocator {
    /// Creates a builder for configuring an allocator beyond the defaults.
    #[inline]
    pub fn builder() -> AllocatorBuilder {
        AllocatorBuilder::new()
    }

    /// Creates an allocator with `block_count` blocks of `chunks_per_block` chunks each,
    /// using the default chunk size of [`CACHE_LINE_SIZE`][crate::CACHE_LINE_SIZE] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if a block would be too large to allocate and
    /// [`Error::BlockAllocationFailed`] if the system allocator cannot provide one of the
    /// initial blocks. Blocks allocated before a failure are released again.
    pub fn new(
        block_count: NonZero<usize>,
        chunks_per_block: NonZero<usize>,
    ) -> Result<Self, Error> {
        Self::builder()
            .block_count(block_count)
            .chunks_per_block(chunks_per_block)
            .build()
    }

    pub(crate) fn new_inner(
        block_count: NonZero<usize>,
        chunks_per_block: NonZero<usize>,
        chunk_size: NonZero<usize>,
    ) -> crate::Result<Self> {
        let header_align = align_of::<SlotHeader>();

        if !chunk_size.get().is_multiple_of(header_align) {
            return Err(Error::InvalidConfiguration {
                problem: format!(
                    "chunk size {chunk_size} is not a multiple of the slot header alignment {header_align}"
                ),
            });
        }

        let Some(block_layout) = MemoryBlock::layout_for(chunks_per_block, chunk_size) else {
            return Err(Error::InvalidConfiguration {
                problem: format!(
                    "a block of {chunks_per_block} chunks of {chunk_size} bytes is too large to allocate"
                ),
            });
        };

        let mut blocks = BlockList::with_capacity(block_count.get());

        for index in 0..block_count.get() {
            // If this fails, the blocks allocated so far are released when `blocks` is dropped.
            let block = MemoryBlock::new(chunks_per_block, chunk_size).ok_or(
                Error::BlockAllocationFailed {
                    index,
                    count: block_count.get(),
                    bytes: block_layout.size(),
                },
            )?;

            blocks.push(block);
        }

        debug!(
            block_count = block_count.get(),
            chunks_per_block = chunks_per_block.get(),
            chunk_size = chunk_size.get(),
            "allocator created"
        );

        Ok(Self {
            blocks,
            chunks_per_block,
            chunk_size,
        })
    }

    /// Acquires a slot for a `T` from the blocks the allocator already has.
    ///
    /// See [`try_acquire_layout()`][Self::try_acquire_layout].
    #[must_use]
    #[inline]
    pub fn try_acquire<T>(&mut self) -> Option<UniqueSlot> {
        self.try_acquire_layout(Layout::new::<T>())
    }

    /// Acquires a slot for a payload of the given layout from the blocks the allocator
    /// already has.
    ///
    /// Probes the current block and, if that cannot serve the request, the next one. Never
    /// probes more than two blocks, no matter how many the allocator has.
    ///
    /// Returns `None` if neither probed block has room, or if the payload can never be served
    /// by a block of this allocator because it needs more chunks than a block holds or is
    /// more strictly aligned than a chunk. Such payloads can still be served by
    /// [`acquire_from_heap_layout()`][Self::acquire_from_heap_layout].
    #[must_use]
    pub fn try_acquire_layout(&mut self, payload_layout: Layout) -> Option<UniqueSlot> {
        let request = self.chunk_request(payload_layout)?;

        if let Some(slot) = self.probe_current(&request) {
            return Some(slot);
        }

        self.blocks.advance();

        if let Some(slot) = self.probe_current(&request) {
            return Some(slot);
        }

        POOL_EXHAUSTED.with(Event::observe_once);

        None
    }

    /// Acquires a slot for a `T`, growing the pool by one block if necessary.
    ///
    /// See [`acquire_layout()`][Self::acquire_layout].
    #[must_use]
    #[inline]
    pub fn acquire<T>(&mut self) -> Option<UniqueSlot> {
        self.acquire_layout(Layout::new::<T>())
    }

    /// Acquires a slot for a payload of the given layout, growing the pool by one block if
    /// the existing blocks cannot serve it.
    ///
    /// The new block is sized like the initial ones and becomes the current block.
    ///
    /// Returns `None` if the payload can never be served by a block of this allocator (see
    /// [`try_acquire_layout()`][Self::try_acquire_layout]) or if the system allocator cannot
    /// provide a new block.
    #[must_use]
    pub fn acquire_layout(&mut self, payload_layout: Layout) -> Option<UniqueSlot> {
        if let Some(slot) = self.try_acquire_layout(payload_layout) {
            return Some(slot);
        }

        let request = self.chunk_request(payload_layout)?;

        self.grow()?;

        self.probe_current(&request)
    }

    /// Allocates a slot for a `T` directly from the global allocator.
    ///
    /// See [`UniqueSlot::from_heap()`].
    #[must_use]
    #[inline]
    pub fn acquire_from_heap<T>(&self) -> Option<UniqueSlot> {
        UniqueSlot::from_heap(Layout::new::<T>())
    }

    /// Allocates a slot for a payload of the given layout directly from the global allocator.
    ///
    /// See [`UniqueSlot::from_heap()`].
    #[must_use]
    #[inline]
    pub fn acquire_from_heap_layout(&self, payload_layout: Layout) -> Option<UniqueSlot> {
        UniqueSlot::from_heap(payload_layout)
    }

    /// How many chunks a slot for a payload of the given layout occupies in this allocator's
    /// blocks, or `None` if such a slot can never be carved from them.
    #[must_use]
    pub fn chunks_for(&self, payload_layout: Layout) -> Option<NonZero<usize>> {
        self.chunk_request(payload_layout)
            .map(|request| request.chunks)
    }

    /// The number of memory blocks the allocator owns, including any it has grown.
    #[must_use]
    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// The number of chunks in each memory block.
    #[must_use]
    #[inline]
    pub fn chunks_per_block(&self) -> NonZero<usize> {
        self.chunks_per_block
    }

    /// The size of one chunk in bytes.
    #[must_use]
    #[inline]
    pub fn chunk_size(&self) -> NonZero<usize> {
        self.chunk_size
    }

    /// The number of pooled slots acquired from this allocator and not yet released.
    ///
    /// Slots may be released concurrently on other threads, so the value may already be
    /// stale when the caller looks at it.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.blocks.iter().map(MemoryBlock::outstanding).sum()
    }

    fn chunk_request(&self, payload_layout: Layout) -> Option<ChunkRequest> {
        let slot_layout = SlotHeader::slot_layout(payload_layout)?;

        if slot_layout.align() > chunk_alignment(self.chunk_size) {
            return None;
        }

        // The slot always contains at least the header, so this is never zero.
        let chunks = NonZero::new(slot_layout.size().div_ceil(self.chunk_size.get()))?;

        if chunks > self.chunks_per_block {
            return None;
        }

        Some(ChunkRequest {
            chunks,
            payload_layout,
        })
    }

    fn probe_current(&mut self, request: &ChunkRequest) -> Option<UniqueSlot> {
        let carved = self.blocks.current_mut()?.acquire(request.chunks)?;

        // SAFETY: The run spans at least the slot layout and starts on a chunk boundary, which
        // is aligned at least as strictly as the slot layout (checked in `chunk_request()`).
        let header = unsafe {
            SlotHeader::init(
                carved.ptr(),
                SlotOrigin::Pool {
                    block_offset: carved.block_offset(),
                },
                request.payload_layout,
            )
        };

        // SAFETY: The header was just initialized with one holder, which we hand to the slot.
        Some(unsafe { UniqueSlot::from_header(header) })
    }

    fn grow(&mut self) -> Option<()> {
        let Some(block) = MemoryBlock::new(self.chunks_per_block, self.chunk_size) else {
            warn!(
                block_count = self.blocks.len(),
                chunks_per_block = self.chunks_per_block.get(),
                chunk_size = self.chunk_size.get(),
                "failed to allocate an additional memory block"
            );

            return None;
        };

        self.blocks.insert_after_current(block);

        BLOCKS_GROWN.with(Event::observe_once);
        debug!(block_count = self.blocks.len(), "allocator grew by one block");

        Some(())
    }
}

/// A slot request translated into the geometry of the allocator's blocks.
#[derive(Debug)]
struct ChunkRequest {
    chunks: NonZero<usize>,
    payload_layout: Layout,
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::thread;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::{AllocKind, CACHE_LINE_SIZE};

    assert_impl_all!(Allocator: Send, std::fmt::Debug);
    assert_not_impl_any!(Allocator: Sync, Clone);

    #[test]
    fn new_allocates_initial_blocks() {
        let allocator = Allocator::new(nz!(3), nz!(16)).unwrap();

        assert_eq!(allocator.block_count(), 3);
        assert_eq!(allocator.chunks_per_block().get(), 16);
        assert_eq!(allocator.chunk_size().get(), CACHE_LINE_SIZE);
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn small_payload_takes_one_chunk() {
        let allocator = Allocator::new(nz!(1), nz!(4)).unwrap();

        assert_eq!(allocator.chunks_for(Layout::new::<u8>()), Some(nz!(1)));
        assert_eq!(allocator.chunks_for(Layout::new::<u64>()), Some(nz!(1)));
    }

    #[test]
    fn large_payload_spans_chunks() {
        let allocator = Allocator::new(nz!(1), nz!(4)).unwrap();

        let chunks = allocator.chunks_for(Layout::new::<[u8; 100]>()).unwrap();
        assert!(chunks.get() >= 2);
    }

    #[test]
    fn acquired_slots_are_pooled_and_counted() {
        let mut allocator = Allocator::new(nz!(1), nz!(8)).unwrap();

        let mut a = allocator.try_acquire::<u32>().unwrap();
        let b = allocator.acquire::<u32>().unwrap();

        assert_eq!(a.alloc_kind(), Some(AllocKind::Pool));
        assert_eq!(b.alloc_kind(), Some(AllocKind::Pool));
        assert_eq!(allocator.outstanding(), 2);

        assert!(a.emplace(7_u32).is_ok());
        assert_eq!(unsafe { a.take::<u32>() }, Some(7));

        a.release();
        assert_eq!(allocator.outstanding(), 1);

        // Releasing again does not disturb the count.
        a.release();
        assert_eq!(allocator.outstanding(), 1);

        drop(b);
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn try_acquire_fails_when_pool_is_exhausted() {
        let mut allocator = Allocator::new(nz!(1), nz!(4)).unwrap();

        let slots = (0..4)
            .map(|_| allocator.try_acquire::<u64>().unwrap())
            .collect::<Vec<_>>();

        assert!(allocator.try_acquire::<u64>().is_none());
        assert_eq!(allocator.block_count(), 1);

        // acquire() may grow the pool, so it succeeds.
        let extra = allocator.acquire::<u64>().unwrap();
        assert_eq!(extra.alloc_kind(), Some(AllocKind::Pool));
        assert_eq!(allocator.block_count(), 2);

        drop(slots);
        drop(extra);
    }

    #[test]
    fn drained_block_is_reused_without_growth() {
        let mut allocator = Allocator::new(nz!(1), nz!(4)).unwrap();

        for _ in 0..10 {
            let slots = (0..4)
                .map(|_| allocator.acquire::<u64>().unwrap())
                .collect::<Vec<_>>();

            drop(slots);
        }

        assert_eq!(allocator.block_count(), 1);
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn try_acquire_rotates_to_next_block() {
        let mut allocator = Allocator::new(nz!(2), nz!(2)).unwrap();

        let slots = (0..4)
            .map(|_| allocator.try_acquire::<u64>().unwrap())
            .collect::<Vec<_>>();

        assert!(allocator.try_acquire::<u64>().is_none());
        assert_eq!(allocator.block_count(), 2);

        drop(slots);

        assert!(allocator.try_acquire::<u64>().is_some());
    }

    #[test]
    fn oversized_payload_is_refused_by_pool() {
        let mut allocator = Allocator::new(nz!(1), nz!(2)).unwrap();

        let layout = Layout::new::<[u8; 1024]>();

        assert!(allocator.chunks_for(layout).is_none());
        assert!(allocator.try_acquire_layout(layout).is_none());
        assert!(allocator.acquire_layout(layout).is_none());

        // Refusing did not mark the block full and did not grow the pool.
        assert_eq!(allocator.block_count(), 1);
        assert!(allocator.try_acquire::<u8>().is_some());

        let heap = allocator.acquire_from_heap_layout(layout).unwrap();
        assert_eq!(heap.alloc_kind(), Some(AllocKind::Heap));
    }

    #[test]
    fn over_aligned_payload_is_refused_by_pool() {
        #[repr(align(128))]
        struct Wide {
            _data: u8,
        }

        let mut allocator = Allocator::new(nz!(1), nz!(16)).unwrap();

        assert!(allocator.try_acquire::<Wide>().is_none());
        assert!(allocator.acquire::<Wide>().is_none());

        let heap = allocator.acquire_from_heap::<Wide>().unwrap();
        assert!(heap.get::<Wide>().is_some());
    }

    #[test]
    fn chunk_size_limits_alignment() {
        let mut allocator = Allocator::builder()
            .chunks_per_block(nz!(8))
            .chunk_size(nz!(24))
            .build()
            .unwrap();

        assert!(allocator.try_acquire::<u64>().is_some());
        assert!(allocator.try_acquire::<u128>().is_none());
    }

    #[test]
    fn slots_outlive_allocator() {
        let mut allocator = Allocator::new(nz!(1), nz!(4)).unwrap();

        let mut slot = allocator.acquire::<String>().unwrap();
        assert!(slot.emplace("survivor".to_string()).is_ok());

        drop(allocator);

        let value = unsafe { slot.take::<String>() };
        assert_eq!(value.as_deref(), Some("survivor"));

        // The last release frees the detached block.
        slot.release();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn slots_released_on_other_thread() {
        let mut allocator = Allocator::new(nz!(1), nz!(16)).unwrap();

        let slots = (0..16)
            .map(|i| {
                let mut slot = allocator.try_acquire::<usize>().unwrap();
                assert!(slot.emplace(i).is_ok());
                slot
            })
            .collect::<Vec<_>>();

        let sum = thread::spawn(move || {
            slots
                .into_iter()
                .map(|mut slot| unsafe { slot.take::<usize>() }.unwrap())
                .sum::<usize>()
        })
        .join()
        .unwrap();

        assert_eq!(sum, (0..16).sum());
        assert_eq!(allocator.outstanding(), 0);

        // The block is drained, so it is rewound instead of the pool growing.
        assert!(allocator.try_acquire::<usize>().is_some());
        assert_eq!(allocator.block_count(), 1);
    }

    #[test]
    fn misaligned_chunk_size_is_rejected() {
        let result = Allocator::builder().chunk_size(nz!(4)).build();

        let Err(Error::InvalidConfiguration { problem }) = result else {
            panic!("expected a configuration error, got {result:?}");
        };

        assert!(problem.contains("alignment"));
    }
}
