use std::marker::PhantomData;
use std::sync::Arc;

use crate::{Allocator, Channel, UniqueSlot};

/// The sending end of a typed multi-producer single-consumer channel.
///
/// Created by [`Consumer::producer()`][crate::Consumer::producer]. Each producer owns the
/// [`Allocator`] its slots come from, so producers never contend with each other for memory,
/// only for the tail of the queue.
///
/// A producer may be moved to another thread but not shared between threads.
#[derive(Debug)]
pub struct Producer<T> {
    channel: Arc<Channel<T>>,
    allocator: Allocator,

    _values: PhantomData<T>,
}

impl<T: Send> Producer<T> {
    pub(crate) fn new(channel: Arc<Channel<T>>, allocator: Allocator) -> Self {
        Self {
            channel,
            allocator,
            _values: PhantomData,
        }
    }

    /// Sends a value using only the memory blocks the allocator already has.
    ///
    /// # Errors
    ///
    /// Returns the value back if the allocator has no room for it without growing.
    pub fn try_send(&mut self, value: T) -> Result<(), T> {
        match self.allocator.try_acquire::<T>() {
            Some(slot) => self.send_in(slot, value),
            None => Err(value),
        }
    }

    /// Sends a value, growing the allocator by one block if it has no room and falling back
    /// to allocating the slot from the heap if that does not help either.
    ///
    /// # Errors
    ///
    /// Returns the value back if the global allocator is out of memory.
    pub fn send(&mut self, value: T) -> Result<(), T> {
        let slot = self
            .allocator
            .acquire::<T>()
            .or_else(|| self.allocator.acquire_from_heap::<T>());

        match slot {
            Some(slot) => self.send_in(slot, value),
            None => Err(value),
        }
    }

    fn send_in(&self, mut slot: UniqueSlot, value: T) -> Result<(), T> {
        slot.emplace(value)?;

        if self.channel.queue().push(slot).is_err() {
            unreachable!("a freshly acquired slot is never linked into a queue");
        }

        Ok(())
    }

    /// The allocator that this producer acquires its slots from.
    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::Consumer;

    assert_impl_all!(Producer<u32>: Send, std::fmt::Debug);
    assert_not_impl_any!(Producer<u32>: Sync, Clone);

    #[test]
    fn try_send_refuses_when_pool_is_full() {
        let mut consumer = Consumer::new();
        let mut producer = consumer.producer(Allocator::new(nz!(1), nz!(2)).unwrap());

        producer.try_send(1_u64).unwrap();
        producer.try_send(2_u64).unwrap();
        assert_eq!(producer.try_send(3_u64), Err(3));
        assert_eq!(producer.allocator().block_count(), 1);

        assert_eq!(consumer.drain().collect::<Vec<_>>(), [1, 2]);
    }

    #[test]
    fn send_grows_pool() {
        let mut consumer = Consumer::new();
        let mut producer = consumer.producer(Allocator::new(nz!(1), nz!(2)).unwrap());

        for value in 0..5_u64 {
            producer.send(value).unwrap();
        }

        assert!(producer.allocator().block_count() > 1);
        assert_eq!(consumer.drain().collect::<Vec<_>>(), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn send_falls_back_to_heap_for_large_values() {
        let mut consumer = Consumer::new();
        let mut producer = consumer.producer(Allocator::new(nz!(1), nz!(2)).unwrap());

        let big = [7_u8; 256];

        producer.send(big).unwrap();
        assert_eq!(producer.try_send(big), Err(big));

        assert_eq!(producer.allocator().outstanding(), 0);
        assert_eq!(consumer.try_recv(), Some(big));
    }

    #[test]
    fn pooled_memory_is_reused_across_messages() {
        let mut consumer = Consumer::new();
        let mut producer = consumer.producer(Allocator::new(nz!(1), nz!(4)).unwrap());

        for round in 0..20_u64 {
            for i in 0..3 {
                producer.send(round * 10 + i).unwrap();
            }

            assert_eq!(consumer.drain().count(), 3);
        }

        // The queue holds on to its last node, so growth may add at most one block.
        assert!(producer.allocator().block_count() <= 2);
    }
}
