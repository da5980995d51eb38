use std::cell::Cell;
use std::iter;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::{Allocator, Channel, Producer};

/// The receiving end of a typed multi-producer single-consumer channel.
///
/// There is exactly one consumer per channel. It is not [`Clone`] and not [`Sync`], which is
/// what makes it sound to pop from the underlying [`Queue`][crate::Queue] through a safe API.
/// Producers are created from the consumer, each with its own [`Allocator`].
///
/// Dropping the consumer drops every value that is still queued.
///
/// # Examples
///
/// ```
/// use std::thread;
///
/// use new_zealand::nz;
/// use slab_mpsc::{Allocator, Consumer};
///
/// let mut consumer = Consumer::<String>::new();
///
/// let mut producer = consumer.producer(Allocator::new(nz!(1), nz!(64)).unwrap());
///
/// thread::spawn(move || {
///     producer.send("hello".to_string()).unwrap();
///     producer.send("world".to_string()).unwrap();
/// })
/// .join()
/// .unwrap();
///
/// let received = consumer.drain().collect::<Vec<_>>();
/// assert_eq!(received, ["hello", "world"]);
/// ```
#[derive(Debug)]
pub struct Consumer<T> {
    channel: Arc<Channel<T>>,

    _values: PhantomData<T>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T: Send> Consumer<T> {
    /// Creates a channel with no producers yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channel: Arc::new(Channel::new()),
            _values: PhantomData,
            _not_sync: PhantomData,
        }
    }

    /// Creates a producer for this channel that acquires its slots from `allocator`.
    #[must_use]
    pub fn producer(&self, allocator: Allocator) -> Producer<T> {
        Producer::new(Arc::clone(&self.channel), allocator)
    }

    /// Receives the oldest value in the channel, or `None` if there is none at the moment.
    #[must_use]
    pub fn try_recv(&mut self) -> Option<T> {
        // SAFETY: The consumer is the only party that pops while the channel is shared, and
        // `&mut self` rules out concurrent calls on the consumer itself.
        let mut slot = unsafe { self.channel.queue().pop() }?;

        // SAFETY: Producers only ever push slots carrying a `T`, and this is the one and only
        // time this value is received. Releasing the slot when it goes out of scope does not
        // touch the payload again.
        unsafe { slot.take::<T>() }
    }

    /// Whether the channel has no value to receive at the moment.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        // SAFETY: The consumer is not `Sync` and popping requires `&mut self`, so nothing
        // pops concurrently.
        unsafe { self.channel.queue().is_empty() }
    }

    /// Receives values until the channel is empty.
    ///
    /// Values that producers send while the iterator is being consumed are received too.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        iter::from_fn(|| self.try_recv())
    }
}

impl<T: Send> Default for Consumer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        // SAFETY: The consumer is the only party that pops while the channel is shared, and
        // we have exclusive access to the consumer.
        unsafe {
            self.channel.drop_queued();
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(Consumer<u32>: Send, std::fmt::Debug);
    assert_not_impl_any!(Consumer<u32>: Sync, Clone);
    assert_not_impl_any!(Consumer<Rc<u32>>: Send, Sync);

    fn allocator() -> Allocator {
        Allocator::new(nz!(1), nz!(16)).unwrap()
    }

    #[test]
    fn new_channel_is_empty() {
        let mut consumer = Consumer::<u32>::new();

        assert!(consumer.is_empty());
        assert_eq!(consumer.try_recv(), None);
    }

    #[test]
    fn values_arrive_in_order() {
        let mut consumer = Consumer::new();
        let mut producer = consumer.producer(allocator());

        for value in 0..10_u32 {
            producer.send(value).unwrap();
        }

        assert!(!consumer.is_empty());
        assert_eq!(consumer.drain().collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
        assert!(consumer.is_empty());
    }

    #[test]
    fn receives_from_multiple_producers() {
        let mut consumer = Consumer::new();
        let mut first = consumer.producer(allocator());
        let mut second = consumer.producer(allocator());

        first.send("a").unwrap();
        second.send("b").unwrap();
        first.send("c").unwrap();

        assert_eq!(consumer.drain().collect::<Vec<_>>(), ["a", "b", "c"]);
    }

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn dropping_consumer_drops_queued_values() {
        let dropped = Arc::new(AtomicUsize::new(0));

        let consumer = Consumer::new();
        let mut producer = consumer.producer(allocator());

        for _ in 0..3 {
            producer.send(Tracked(Arc::clone(&dropped))).ok().unwrap();
        }

        drop(consumer);
        assert_eq!(dropped.load(Ordering::Relaxed), 3);

        // A value sent after the consumer is gone is dropped with the last producer.
        producer.send(Tracked(Arc::clone(&dropped))).ok().unwrap();
        assert_eq!(dropped.load(Ordering::Relaxed), 3);

        drop(producer);
        assert_eq!(dropped.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn received_values_are_not_dropped_twice() {
        let dropped = Arc::new(AtomicUsize::new(0));

        let mut consumer = Consumer::new();
        let mut producer = consumer.producer(allocator());

        producer.send(Tracked(Arc::clone(&dropped))).ok().unwrap();

        let value = consumer.try_recv().unwrap();
        drop(consumer);
        drop(producer);
        assert_eq!(dropped.load(Ordering::Relaxed), 0);

        drop(value);
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn consumer_can_move_to_another_thread() {
        let consumer = Consumer::new();
        let mut producer = consumer.producer(allocator());

        producer.send(5_u64).unwrap();

        let received = thread::spawn(move || {
            let mut consumer = consumer;
            consumer.try_recv()
        })
        .join()
        .unwrap();

        assert_eq!(received, Some(5));
    }
}
