use std::num::NonZero;

use new_zealand::nz;

use crate::{Allocator, CACHE_LINE_SIZE, Error};

/// Number of chunks in each memory block unless configured otherwise.
pub(crate) const DEFAULT_CHUNKS_PER_BLOCK: NonZero<usize> = nz!(1024);

/// Size of a chunk in bytes unless configured otherwise.
pub(crate) const DEFAULT_CHUNK_SIZE: NonZero<usize> =
    NonZero::new(CACHE_LINE_SIZE).expect("cache line size is non-zero");

/// Builder for creating an instance of [`Allocator`].
///
/// Every setting is optional. By default the allocator starts with one block of
/// 1024 chunks of [`CACHE_LINE_SIZE`] bytes each.
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use slab_mpsc::Allocator;
///
/// let allocator = Allocator::builder()
///     .block_count(nz!(4))
///     .chunks_per_block(nz!(256))
///     .chunk_size(nz!(128))
///     .build()
///     .unwrap();
///
/// assert_eq!(allocator.block_count(), 4);
/// ```
#[derive(Clone, Debug)]
#[must_use]
pub struct AllocatorBuilder {
    block_count: NonZero<usize>,
    chunks_per_block: NonZero<usize>,
    chunk_size: NonZero<usize>,
}

impl AllocatorBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            block_count: nz!(1),
            chunks_per_block: DEFAULT_CHUNKS_PER_BLOCK,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Sets how many memory blocks are allocated up front.
    ///
    /// More blocks may be appended later by [`Allocator::acquire()`].
    #[inline]
    pub fn block_count(mut self, block_count: NonZero<usize>) -> Self {
        self.block_count = block_count;
        self
    }

    /// Sets how many chunks each memory block is divided into.
    #[inline]
    pub fn chunks_per_block(mut self, chunks_per_block: NonZero<usize>) -> Self {
        self.chunks_per_block = chunks_per_block;
        self
    }

    /// Sets the size of a chunk in bytes, the granularity of allocation within a block.
    ///
    /// A slot occupies as many whole chunks as its header and payload need. The chunk size
    /// also bounds the payload alignment the pool can serve: chunks are aligned to the largest
    /// power of two dividing the chunk size, capped at [`CACHE_LINE_SIZE`].
    #[inline]
    pub fn chunk_size(mut self, chunk_size: NonZero<usize>) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Builds the allocator, allocating every initial memory block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the chunk size is not a multiple of the slot
    /// header alignment or a block would be too large to allocate, and
    /// [`Error::BlockAllocationFailed`] if the system allocator cannot provide one of the
    /// initial blocks. Blocks allocated before a failure are released again.
    pub fn build(self) -> Result<Allocator, Error> {
        Allocator::new_inner(self.block_count, self.chunks_per_block, self.chunk_size)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(AllocatorBuilder: Send, Sync, Clone, std::fmt::Debug);

    #[test]
    fn defaults() {
        let builder = AllocatorBuilder::new();

        assert_eq!(builder.block_count.get(), 1);
        assert_eq!(builder.chunks_per_block, DEFAULT_CHUNKS_PER_BLOCK);
        assert_eq!(builder.chunk_size.get(), CACHE_LINE_SIZE);
    }

    #[test]
    fn setters_override_defaults() {
        let builder = AllocatorBuilder::new()
            .block_count(nz!(3))
            .chunks_per_block(nz!(16))
            .chunk_size(nz!(256));

        assert_eq!(builder.block_count.get(), 3);
        assert_eq!(builder.chunks_per_block.get(), 16);
        assert_eq!(builder.chunk_size.get(), 256);
    }

    #[test]
    fn build_uses_configuration() {
        let allocator = AllocatorBuilder::new()
            .block_count(nz!(2))
            .chunks_per_block(nz!(8))
            .chunk_size(nz!(128))
            .build()
            .unwrap();

        assert_eq!(allocator.block_count(), 2);
        assert_eq!(allocator.chunks_per_block().get(), 8);
        assert_eq!(allocator.chunk_size().get(), 128);
    }

    #[test]
    fn misaligned_chunk_size_is_rejected() {
        let result = AllocatorBuilder::new().chunk_size(nz!(12)).build();

        assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));
    }

    #[test]
    fn oversized_block_is_rejected() {
        let result = AllocatorBuilder::new()
            .chunks_per_block(NonZero::new(usize::MAX / 8).unwrap())
            .chunk_size(nz!(64))
            .build();

        assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));
    }
}
