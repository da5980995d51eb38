use crate::MemoryBlock;

/// The chain of memory blocks owned by an allocator, with a rotating cursor.
///
/// The cursor marks the block that the next acquisition probes first. The allocator
/// advances it round-robin when the current block cannot serve a request, and a newly
/// grown block is inserted right after the current one and becomes current.
///
/// This is private to its owning allocator and not thread-safe. Dropping the list drops
/// every block, which detaches blocks that still have outstanding slots instead of
/// freeing them.
#[derive(Debug, Default)]
pub(crate) struct BlockList {
    blocks: Vec<MemoryBlock>,

    /// Index of the current block. Always in bounds when the list is not empty.
    current: usize,
}

impl BlockList {
    #[must_use]
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            blocks: Vec::with_capacity(capacity),
            current: 0,
        }
    }

    /// Adds a block at the end of the chain without moving the cursor.
    pub(crate) fn push(&mut self, block: MemoryBlock) {
        self.blocks.push(block);
    }

    /// Inserts a block right after the current one and makes it current.
    pub(crate) fn insert_after_current(&mut self, block: MemoryBlock) {
        if self.blocks.is_empty() {
            self.blocks.push(block);
            self.current = 0;
            return;
        }

        // Cannot overflow because that would imply more blocks than fit in memory.
        let index = self.current.wrapping_add(1);
        self.blocks.insert(index, block);
        self.current = index;
    }

    /// Returns the block under the cursor.
    #[must_use]
    pub(crate) fn current_mut(&mut self) -> Option<&mut MemoryBlock> {
        self.blocks.get_mut(self.current)
    }

    /// Moves the cursor to the next block, wrapping around to the first one at the end.
    pub(crate) fn advance(&mut self) {
        // Cannot overflow because that would imply more blocks than fit in memory.
        let next = self.current.wrapping_add(1);

        self.current = if next < self.blocks.len() { next } else { 0 };
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &MemoryBlock> {
        self.blocks.iter()
    }

    #[cfg(test)]
    pub(crate) fn current_index(&self) -> usize {
        self.current
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::num::NonZero;

    use new_zealand::nz;

    use super::*;

    fn block(chunk_count: NonZero<usize>) -> MemoryBlock {
        MemoryBlock::new(chunk_count, nz!(64)).unwrap()
    }

    #[test]
    fn empty_list_has_no_current() {
        let mut list = BlockList::default();

        assert_eq!(list.len(), 0);
        assert!(list.current_mut().is_none());

        // Advancing an empty list is harmless.
        list.advance();
        assert!(list.current_mut().is_none());
    }

    #[test]
    fn advance_rotates_round_robin() {
        let mut list = BlockList::with_capacity(3);
        list.push(block(nz!(1)));
        list.push(block(nz!(2)));
        list.push(block(nz!(3)));

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(list.current_mut().unwrap().chunk_count().get());
            list.advance();
        }

        assert_eq!(seen, [1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn inserted_block_becomes_current() {
        let mut list = BlockList::default();
        list.push(block(nz!(1)));
        list.push(block(nz!(2)));

        list.insert_after_current(block(nz!(9)));

        assert_eq!(list.len(), 3);
        assert_eq!(list.current_index(), 1);
        assert_eq!(list.current_mut().unwrap().chunk_count().get(), 9);

        // The rotation continues with the block that followed the old current one.
        list.advance();
        assert_eq!(list.current_mut().unwrap().chunk_count().get(), 2);
    }

    #[test]
    fn insert_into_empty_list() {
        let mut list = BlockList::default();

        list.insert_after_current(block(nz!(4)));

        assert_eq!(list.len(), 1);
        assert_eq!(list.current_mut().unwrap().chunk_count().get(), 4);
    }

    #[test]
    fn iter_visits_every_block() {
        let mut list = BlockList::default();
        list.push(block(nz!(1)));
        list.insert_after_current(block(nz!(5)));

        let counts = list.iter().map(|b| b.chunk_count().get()).collect::<Vec<_>>();
        assert_eq!(counts, [1, 5]);
    }
}
