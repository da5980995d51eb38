use std::mem;
use std::ops::Deref;

use static_assertions::const_assert_eq;

/// The cache line size, in bytes, that every component of this crate pads and aligns to.
///
/// Memory block headers, memory block base addresses and the queue's head and tail pointers
/// are all placed on their own cache lines to prevent false sharing between producers,
/// the consumer and threads that release slots.
pub const CACHE_LINE_SIZE: usize = 64;

/// Places the wrapped value at the start of its own cache line.
///
/// The `align` attribute only accepts a literal, so the compile-time check below keeps it
/// in sync with [`CACHE_LINE_SIZE`].
#[derive(Debug, Default)]
#[repr(C, align(64))]
pub(crate) struct CacheAligned<T>(pub(crate) T);

const_assert_eq!(mem::align_of::<CacheAligned<u8>>(), CACHE_LINE_SIZE);

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn occupies_whole_cache_line() {
        assert_eq!(mem::size_of::<CacheAligned<u8>>(), CACHE_LINE_SIZE);
        assert_eq!(mem::size_of::<CacheAligned<AtomicUsize>>(), CACHE_LINE_SIZE);
    }

    #[test]
    fn adjacent_values_do_not_share_a_line() {
        let pair = [CacheAligned(AtomicUsize::new(1)), CacheAligned(AtomicUsize::new(2))];

        let [first, second] = &pair;

        let first_addr = ptr::from_ref(first).addr();
        let second_addr = ptr::from_ref(second).addr();

        assert_eq!(first_addr % CACHE_LINE_SIZE, 0);
        assert_eq!(second_addr.wrapping_sub(first_addr), CACHE_LINE_SIZE);
        assert_eq!(second.load(Ordering::Relaxed), 2);
    }
}
