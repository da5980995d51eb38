//! Integration tests for the queue and the typed channel with real producer threads.
//!
//! These tests are ignored under Miri because the amount of cross-thread traffic makes them
//! impractically slow there. The single-threaded behavior is covered by the unit tests.

use std::sync::{Arc, Barrier};
use std::thread;

use new_zealand::nz;
use slab_mpsc::{AllocKind, Allocator, Consumer, Queue, UniqueSlot};
use testing::{DeliveryChecker, Tagged, with_watchdog};

const PRODUCERS: usize = 4;
const PER_PRODUCER: u64 = 5_000;

fn tagged_slot(allocator: &mut Allocator, tag: Tagged) -> UniqueSlot {
    let mut slot = allocator
        .acquire::<Tagged>()
        .or_else(|| allocator.acquire_from_heap::<Tagged>())
        .unwrap();

    slot.emplace(tag).unwrap();
    slot
}

/// Pops from `queue` until every expected message has arrived.
///
/// # Safety
///
/// Must be the only thread popping from `queue`, and every slot must carry a `Tagged`.
unsafe fn consume_all(queue: &Queue, checker: &mut DeliveryChecker) {
    while !checker.is_complete() {
        // SAFETY: Forwarding the single consumer guarantee from the caller.
        let Some(mut slot) = (unsafe { queue.pop() }) else {
            thread::yield_now();
            continue;
        };

        // SAFETY: Forwarding the payload type guarantee from the caller.
        let tag = unsafe { slot.take::<Tagged>() }.unwrap();
        slot.release();

        checker.observe(tag).unwrap();
    }
}

#[cfg_attr(miri, ignore)]
#[test]
fn untyped_queue_delivers_everything_once_in_order() {
    with_watchdog(|| {
        let queue = Arc::new(Queue::new());
        let start = Arc::new(Barrier::new(PRODUCERS + 1));

        let handles = (0..PRODUCERS)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                let start = Arc::clone(&start);

                thread::spawn(move || {
                    let mut allocator = Allocator::new(nz!(1), nz!(256)).unwrap();
                    start.wait();

                    for sequence in 0..PER_PRODUCER {
                        let slot = tagged_slot(&mut allocator, Tagged::new(producer, sequence));
                        queue.push(slot).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        start.wait();

        let mut checker = DeliveryChecker::new(PRODUCERS, PER_PRODUCER);

        // SAFETY: This is the only consumer and every producer pushes `Tagged` slots.
        unsafe {
            consume_all(&queue, &mut checker);
        }

        for handle in handles {
            handle.join().unwrap();
        }

        checker.finish().unwrap();

        // SAFETY: Still the only consumer.
        assert!(unsafe { queue.pop() }.is_none());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn typed_channel_delivers_everything_once_in_order() {
    with_watchdog(|| {
        let mut consumer = Consumer::<Tagged>::new();

        let handles = (0..PRODUCERS)
            .map(|producer_index| {
                let mut producer = consumer.producer(Allocator::new(nz!(2), nz!(64)).unwrap());

                thread::spawn(move || {
                    for sequence in 0..PER_PRODUCER {
                        let tag = Tagged::new(producer_index, sequence);

                        // Spin on the bounded path first, then fall back to growing.
                        if let Err(tag) = producer.try_send(tag) {
                            producer.send(tag).unwrap();
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut checker = DeliveryChecker::new(PRODUCERS, PER_PRODUCER);

        while !checker.is_complete() {
            match consumer.try_recv() {
                Some(tag) => checker.observe(tag).unwrap(),
                None => thread::yield_now(),
            }
        }

        for handle in handles {
            handle.join().unwrap();
        }

        checker.finish().unwrap();
        assert!(consumer.is_empty());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn slots_are_released_on_consumer_thread() {
    with_watchdog(|| {
        let queue = Arc::new(Queue::new());
        let mut allocator = Allocator::new(nz!(1), nz!(8)).unwrap();

        let consumer = {
            let queue = Arc::clone(&queue);

            thread::spawn(move || {
                let mut checker = DeliveryChecker::new(1, 8);

                // SAFETY: This is the only consumer and the producer pushes `Tagged` slots.
                unsafe {
                    consume_all(&queue, &mut checker);
                }
            })
        };

        for sequence in 0..8 {
            let slot = allocator.try_acquire::<Tagged>().unwrap();
            assert_eq!(slot.alloc_kind(), Some(AllocKind::Pool));

            let mut slot = slot;
            slot.emplace(Tagged::new(0, sequence)).unwrap();
            queue.push(slot).unwrap();
        }

        consumer.join().unwrap();

        // Consumed nodes are let go once no push is in progress, which the consumer thread
        // could not rely on while this thread was still pushing.
        // SAFETY: The consumer thread has finished, so this is the only consumer now.
        assert!(unsafe { queue.pop() }.is_none());

        // Everything except the node the queue is still parked on has come back.
        assert_eq!(allocator.outstanding(), 1);

        drop(queue);
        assert_eq!(allocator.outstanding(), 0);

        // The block is drained, so it is reused instead of growing the pool.
        let reused = allocator.try_acquire::<Tagged>();
        assert!(reused.is_some());
        assert_eq!(allocator.block_count(), 1);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn producers_outlive_their_allocators_blocks() {
    with_watchdog(|| {
        let queue = Arc::new(Queue::new());

        // Each producer drops its allocator while its slots are still queued.
        let handles = (0..PRODUCERS)
            .map(|producer| {
                let queue = Arc::clone(&queue);

                thread::spawn(move || {
                    let mut allocator = Allocator::new(nz!(1), nz!(16)).unwrap();

                    for sequence in 0..100 {
                        let slot = tagged_slot(&mut allocator, Tagged::new(producer, sequence));
                        queue.push(slot).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut checker = DeliveryChecker::new(PRODUCERS, 100);

        // SAFETY: This is the only consumer and every producer pushes `Tagged` slots.
        unsafe {
            consume_all(&queue, &mut checker);
        }

        checker.finish().unwrap();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn dropping_consumer_with_pending_values_drops_them() {
    with_watchdog(|| {
        let tracker = Arc::new(());

        let consumer = Consumer::<Arc<()>>::new();

        let handles = (0..PRODUCERS)
            .map(|_| {
                let mut producer = consumer.producer(Allocator::new(nz!(1), nz!(32)).unwrap());
                let tracker = Arc::clone(&tracker);

                thread::spawn(move || {
                    for _ in 0..50 {
                        producer.send(Arc::clone(&tracker)).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(Arc::strong_count(&tracker), 1 + PRODUCERS * 50);

        drop(consumer);

        assert_eq!(Arc::strong_count(&tracker), 1);
    });
}
