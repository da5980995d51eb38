use std::any::type_name;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use tracing::trace;

use crate::{CacheAligned, NodeState, SlotHeader, UniqueSlot};

/// An intrusive, lock-free, multi-producer single-consumer FIFO of [`UniqueSlot`]s.
///
/// The slot headers themselves are the queue nodes, so pushing and popping never allocate.
/// Any number of threads may [`push()`][Self::push] concurrently. Only one thread at a time
/// may [`pop()`][Self::pop], which is why popping is `unsafe`. The typed
/// [`Consumer`][crate::Consumer] wraps the queue so that this is enforced by the compiler.
///
/// # Node lifecycle
///
/// A node is `Recorded` when pushed and becomes `Utilized` when popped. Popping does not
/// unlink the node: it stays at the head of the queue until a later pop finds a successor
/// and moves past it. The queue keeps its own hold on every node it links, so the consumer
/// may release a popped slot right away. The memory goes back to the allocator once both the
/// consumer and the queue have let go.
///
/// A producer may still be reading a node it found at the tail of the queue after the
/// consumer has moved past that node. The queue therefore lets go of consumed nodes in
/// batches, once every push that was in progress when the batch was sealed has returned.
/// A producer that stalls in the middle of a push delays the release of consumed nodes but
/// never hides other slots from the consumer.
///
/// The queue starts out with an embedded sentinel node that is already `Utilized`, so the
/// first pushed slot is the first one popped. Null pointers stand for the sentinel, which
/// keeps the queue free of pointers into itself and allows it to be moved.
///
/// # Ordering
///
/// Slots become visible to the consumer in the order in which producers linked them onto
/// the last node of the queue. Slots pushed by one thread are therefore popped in the order
/// that thread pushed them.
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use slab_mpsc::{Allocator, Queue};
///
/// let queue = Queue::new();
/// let mut allocator = Allocator::new(nz!(1), nz!(16)).unwrap();
///
/// for value in [1_u32, 2, 3] {
///     let mut slot = allocator.acquire::<u32>().unwrap();
///     slot.emplace(value).unwrap();
///     queue.push(slot).unwrap();
/// }
///
/// // SAFETY: This is the only thread that pops from the queue.
/// while let Some(mut slot) = unsafe { queue.pop() } {
///     // SAFETY: Every slot pushed into this queue carries a u32.
///     let value = unsafe { slot.take::<u32>() }.unwrap();
///     println!("{value}");
/// }
/// ```
pub struct Queue {
    /// The oldest node the consumer has not moved past. Only ever written by the consumer.
    head: CacheAligned<AtomicPtr<SlotHeader>>,

    /// The last node, or a node shortly before it while a producer has linked a node but
    /// not yet moved the tail onto it. Never behind `head`.
    tail: CacheAligned<AtomicPtr<SlotHeader>>,

    /// Incremented by the consumer to seal a batch of consumed nodes.
    epoch: CacheAligned<AtomicUsize>,

    /// Pushes in progress that registered under an even epoch.
    pushers_even: CacheAligned<AtomicUsize>,

    /// Pushes in progress that registered under an odd epoch.
    pushers_odd: CacheAligned<AtomicUsize>,

    /// The oldest node the queue still holds. Nodes from here up to `head` have been
    /// consumed and wait to be let go. Only accessed by the consumer.
    oldest: AtomicPtr<SlotHeader>,

    /// End of the sealed batch of consumed nodes, null if no batch is sealed. Only accessed
    /// by the consumer.
    sealed_until: AtomicPtr<SlotHeader>,

    sentinel: SlotHeader,
}

impl Queue {
    /// Creates an empty queue. Never allocates.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: CacheAligned(AtomicPtr::new(ptr::null_mut())),
            tail: CacheAligned(AtomicPtr::new(ptr::null_mut())),
            epoch: CacheAligned(AtomicUsize::new(0)),
            pushers_even: CacheAligned(AtomicUsize::new(0)),
            pushers_odd: CacheAligned(AtomicUsize::new(0)),
            oldest: AtomicPtr::new(ptr::null_mut()),
            sealed_until: AtomicPtr::new(ptr::null_mut()),
            sentinel: SlotHeader::sentinel(),
        }
    }

    /// Maps a node pointer held by the queue to the node it stands for.
    fn node(&self, ptr: *mut SlotHeader) -> &SlotHeader {
        match NonNull::new(ptr) {
            // SAFETY: Every non-null pointer stored in the queue refers to a node that the
            // queue still holds. Producers only dereference nodes they read from `tail`,
            // and the queue holds those until the producer's push has returned.
            Some(node) => unsafe { node.as_ref() },
            None => &self.sentinel,
        }
    }

    fn pushers(&self, epoch: usize) -> &AtomicUsize {
        if epoch.is_multiple_of(2) {
            &self.pushers_even
        } else {
            &self.pushers_odd
        }
    }

    /// Registers a push in progress for as long as the returned guard lives.
    fn enter_push(&self) -> ActivePush<'_> {
        loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            let pushers = self.pushers(epoch);

            pushers.fetch_add(1, Ordering::SeqCst);

            // If the consumer sealed a batch in the meantime, it may already have checked
            // this counter, so we register again under the new epoch.
            if self.epoch.load(Ordering::SeqCst) == epoch {
                return ActivePush { pushers };
            }

            pushers.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Moves `tail` from `from` to `to` and returns the new tail.
    ///
    /// If another thread has already moved the tail on, returns the tail it moved to.
    fn swing_tail(&self, from: *mut SlotHeader, to: *mut SlotHeader) -> *mut SlotHeader {
        match self
            .tail
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => to,
            Err(current) => current,
        }
    }

    /// Appends a slot to the end of the queue.
    ///
    /// Safe to call from any number of threads concurrently. Contention is resolved by
    /// retrying, never by blocking. A producer that finds the tail lagging behind a node
    /// linked by another producer moves the tail on before retrying.
    ///
    /// # Errors
    ///
    /// Returns the slot back if it is empty, or if it was popped from a queue that still
    /// holds it. Such a slot becomes pushable again once that queue's consumer has popped
    /// past it and the queue has let go of it.
    pub fn push(&self, slot: UniqueSlot) -> Result<(), UniqueSlot> {
        let Some(header) = slot.header() else {
            return Err(slot);
        };

        // SAFETY: The slot owns a holder, so the header is alive.
        let node = unsafe { header.as_ref() };

        // Acquire ordering: if a queue has just let go of the node, its last reads of the
        // node must happen before we link the node anew.
        if node.holders() != 1 {
            return Err(slot);
        }

        // The holder owned by the slot handle now belongs to the queue link.
        let Some(header) = slot.into_header() else {
            unreachable!("the slot was checked to be non-empty above");
        };

        node.next().store(ptr::null_mut(), Ordering::Relaxed);
        node.set_state(NodeState::Recorded);

        let _active = self.enter_push();

        let mut tail = self.tail.load(Ordering::SeqCst);

        loop {
            let last = self.node(tail);

            // Acquire ordering: we may move the tail onto this node, after which other
            // producers write into it.
            let next = last.next().load(Ordering::Acquire);

            if !next.is_null() {
                tail = self.swing_tail(tail, next);
                continue;
            }

            // Release ordering: the consumer reaches our node through this link and must see
            // the payload and the node state.
            match last.next().compare_exchange(
                ptr::null_mut(),
                header.as_ptr(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // Failing here is fine: whoever moved the tail did our job.
                    self.swing_tail(tail, header.as_ptr());
                    return Ok(());
                }
                Err(linked) => tail = self.swing_tail(tail, linked),
            }
        }
    }

    /// Removes the oldest slot from the queue.
    ///
    /// Returns `None` if the queue is empty. A slot counts as pushed once its producer has
    /// linked it, even if the producer has not returned from [`push()`][Self::push] yet.
    ///
    /// The returned slot stays linked as the head of the queue until a later pop moves past
    /// it, so it cannot be pushed again until then. Releasing it is always fine.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no other thread calls `pop()` or
    /// [`is_empty()`][Self::is_empty] on the same queue concurrently.
    #[must_use]
    pub unsafe fn pop(&self) -> Option<UniqueSlot> {
        // SAFETY: Forwarding the single consumer guarantee from the caller.
        let popped = unsafe { self.take_next() };

        // SAFETY: Forwarding the single consumer guarantee from the caller.
        unsafe {
            self.reclaim();
        }

        popped
    }

    /// # Safety
    ///
    /// Only the single consumer may call this.
    unsafe fn take_next(&self) -> Option<UniqueSlot> {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let node = self.node(head);

            if node.state() == NodeState::Recorded {
                node.set_state(NodeState::Utilized);
                node.add_holder();

                let header = NonNull::from(node);

                // SAFETY: We just added the holder that the slot takes over. The sentinel is
                // never in the recorded state, so this is a real slot.
                return Some(unsafe { UniqueSlot::from_header(header) });
            }

            // Acquire ordering: pairs with the producer linking the successor.
            let next = NonNull::new(node.next().load(Ordering::Acquire))?;

            // The tail must not fall behind the head, otherwise producers arriving later
            // could still find the nodes we move past.
            self.swing_tail(head, next.as_ptr());

            self.head.store(next.as_ptr(), Ordering::Relaxed);
        }
    }

    /// Lets go of consumed nodes that no producer can still be reading.
    ///
    /// Consumed nodes are sealed into a batch by advancing the epoch. The tail has already
    /// moved past all of them, so only pushes registered under an earlier epoch may have
    /// read one of them from the tail. The batch is released once those pushes are done.
    ///
    /// # Safety
    ///
    /// Only the single consumer may call this.
    unsafe fn reclaim(&self) {
        let sealed_until = self.sealed_until.load(Ordering::Relaxed);

        if !sealed_until.is_null() {
            let sealed_epoch = self.epoch.load(Ordering::Relaxed).wrapping_sub(1);

            if self.pushers(sealed_epoch).load(Ordering::SeqCst) != 0 {
                return;
            }

            // SAFETY: Every push that could have read a node of the batch has returned.
            unsafe {
                self.release_consumed(sealed_until);
            }
        }

        let head = self.head.load(Ordering::Relaxed);

        if self.oldest.load(Ordering::Relaxed) == head {
            return;
        }

        let sealed_epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        self.sealed_until.store(head, Ordering::Relaxed);

        if self.pushers(sealed_epoch).load(Ordering::SeqCst) == 0 {
            // SAFETY: No push registered under the sealed epoch is in progress, and pushes
            // registered later found the tail past the batch.
            unsafe {
                self.release_consumed(head);
            }
        }
    }

    /// # Safety
    ///
    /// Only the single consumer may call this, and no producer may still be reading any
    /// node from `oldest` up to `until`.
    unsafe fn release_consumed(&self, until: *mut SlotHeader) {
        // SAFETY: Forwarding the guarantees from the caller. All these nodes are behind the
        // head, so the consumer is done with them too.
        unsafe {
            self.release_nodes(self.oldest.load(Ordering::Relaxed), until);
        }

        self.oldest.store(until, Ordering::Relaxed);
        self.sealed_until.store(ptr::null_mut(), Ordering::Relaxed);
    }

    /// Drops the queue's holder of every node from `from` up to but not including `until`,
    /// or up to the end of the list if `until` is null. Returns how many were dropped.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that nothing reaches these nodes through the queue anymore.
    unsafe fn release_nodes(&self, from: *mut SlotHeader, until: *mut SlotHeader) -> usize {
        let mut current = if from.is_null() {
            self.sentinel.next().load(Ordering::Acquire)
        } else {
            from
        };

        let mut released: usize = 0;

        while current != until {
            let Some(node) = NonNull::new(current) else {
                debug_assert!(until.is_null(), "released past the end of the queue");
                break;
            };

            // SAFETY: The queue still holds the node.
            current = unsafe { node.as_ref() }.next().load(Ordering::Acquire);

            // SAFETY: The queue held the node and the caller guarantees that nothing reaches
            // the node through it anymore. Payloads are not ours to drop.
            unsafe {
                SlotHeader::drop_holder(node);
            }

            released = released.wrapping_add(1);
        }

        released
    }

    /// Whether the queue has no slot that [`pop()`][Self::pop] could return.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no other thread calls [`pop()`][Self::pop] or
    /// `is_empty()` on the same queue concurrently.
    #[must_use]
    pub unsafe fn is_empty(&self) -> bool {
        let node = self.node(self.head.load(Ordering::Relaxed));

        // Every node behind the head is still recorded, so only the head can be utilized.
        node.state() == NodeState::Utilized && node.next().load(Ordering::Acquire).is_null()
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        // We have exclusive access, so every push has returned.
        let oldest = self.oldest.load(Ordering::Acquire);

        // SAFETY: The queue is going away, so nothing reaches its nodes anymore.
        let released = unsafe { self.release_nodes(oldest, ptr::null_mut()) };

        if released != 0 {
            trace!(released, "queue dropped, released linked slots");
        }
    }
}

impl fmt::Debug for Queue {
    #[cfg_attr(test, mutants::skip)] // Diagnostic output only, no behavior to verify.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A push in progress, counted until dropped.
struct ActivePush<'a> {
    pushers: &'a AtomicUsize,
}

impl Drop for ActivePush<'_> {
    fn drop(&mut self) {
        // Release ordering: our reads of queue nodes must happen before the consumer lets
        // go of them.
        self.pushers.fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::integer_division,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::alloc::Layout;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Allocator;

    assert_impl_all!(Queue: Send, Sync, Default, fmt::Debug);

    fn slot_with(allocator: &mut Allocator, value: u64) -> UniqueSlot {
        let mut slot = allocator.acquire::<u64>().unwrap();
        slot.emplace(value).unwrap();
        slot
    }

    fn pop_value(queue: &Queue) -> Option<u64> {
        let mut slot = unsafe { queue.pop() }?;
        unsafe { slot.take::<u64>() }
    }

    #[test]
    fn fresh_queue_is_empty() {
        let queue = Queue::new();

        assert!(unsafe { queue.is_empty() });
        assert!(unsafe { queue.pop() }.is_none());
    }

    #[test]
    fn one_push_two_pops() {
        let queue = Queue::new();
        let mut allocator = Allocator::new(nz!(1), nz!(4)).unwrap();

        queue.push(slot_with(&mut allocator, 42)).unwrap();
        assert!(!unsafe { queue.is_empty() });

        assert_eq!(pop_value(&queue), Some(42));
        assert!(unsafe { queue.is_empty() });
        assert_eq!(pop_value(&queue), None);
    }

    #[test]
    fn single_thread_fifo() {
        let queue = Queue::new();
        let mut allocator = Allocator::new(nz!(1), nz!(64)).unwrap();

        for value in 0..50 {
            queue.push(slot_with(&mut allocator, value)).unwrap();
        }

        let popped = iter_values(&queue);
        assert_eq!(popped, (0..50).collect::<Vec<_>>());
    }

    fn iter_values(queue: &Queue) -> Vec<u64> {
        std::iter::from_fn(|| pop_value(queue)).collect()
    }

    #[test]
    fn interleaved_push_and_pop() {
        let queue = Queue::new();
        let mut allocator = Allocator::new(nz!(1), nz!(8)).unwrap();

        queue.push(slot_with(&mut allocator, 1)).unwrap();
        queue.push(slot_with(&mut allocator, 2)).unwrap();
        assert_eq!(pop_value(&queue), Some(1));

        queue.push(slot_with(&mut allocator, 3)).unwrap();
        assert_eq!(pop_value(&queue), Some(2));
        assert_eq!(pop_value(&queue), Some(3));
        assert_eq!(pop_value(&queue), None);

        queue.push(slot_with(&mut allocator, 4)).unwrap();
        assert_eq!(pop_value(&queue), Some(4));
    }

    #[test]
    fn empty_slot_is_rejected() {
        let queue = Queue::new();

        let rejected = queue.push(UniqueSlot::default()).unwrap_err();
        assert!(!rejected.is_valid());

        assert!(unsafe { queue.is_empty() });
    }

    #[test]
    fn slot_still_linked_as_head_is_rejected() {
        let queue = Queue::new();
        let mut allocator = Allocator::new(nz!(1), nz!(8)).unwrap();

        queue.push(slot_with(&mut allocator, 1)).unwrap();

        let popped = unsafe { queue.pop() }.unwrap();
        let popped = queue.push(popped).unwrap_err();
        assert!(popped.is_valid());

        // Once the consumer moves past it, the slot may be linked again.
        queue.push(slot_with(&mut allocator, 2)).unwrap();
        assert_eq!(pop_value(&queue), Some(2));

        queue.push(popped).unwrap();
        assert_eq!(pop_value(&queue), Some(1));
    }

    #[test]
    fn released_head_is_returned_after_queue_moves_on() {
        let queue = Queue::new();
        let mut allocator = Allocator::new(nz!(1), nz!(8)).unwrap();

        queue.push(slot_with(&mut allocator, 1)).unwrap();
        drop(unsafe { queue.pop() });

        // The queue still holds the head node.
        assert_eq!(allocator.outstanding(), 1);

        queue.push(slot_with(&mut allocator, 2)).unwrap();
        drop(unsafe { queue.pop() });

        // The first node has been let go; the second is now the head.
        assert_eq!(allocator.outstanding(), 1);
    }

    #[test]
    fn queue_can_be_moved() {
        let queue = Queue::new();
        let mut allocator = Allocator::new(nz!(1), nz!(8)).unwrap();

        // Moved while empty.
        let queue = Box::new(queue);
        queue.push(slot_with(&mut allocator, 1)).unwrap();
        queue.push(slot_with(&mut allocator, 2)).unwrap();

        // Moved while the sentinel links the first node.
        let queue = *queue;
        assert_eq!(pop_value(&queue), Some(1));

        let queue = Box::new(queue);
        assert_eq!(pop_value(&queue), Some(2));
        assert_eq!(pop_value(&queue), None);
    }

    #[test]
    fn drop_releases_linked_slots() {
        let mut allocator = Allocator::new(nz!(1), nz!(8)).unwrap();

        {
            let queue = Queue::new();

            for value in 0..5 {
                queue.push(slot_with(&mut allocator, value)).unwrap();
            }

            assert_eq!(pop_value(&queue), Some(0));
            assert_eq!(allocator.outstanding(), 5);
        }

        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn drop_without_pops_releases_every_slot() {
        let mut allocator = Allocator::new(nz!(1), nz!(8)).unwrap();

        {
            let queue = Queue::new();

            for value in 0..5 {
                queue.push(slot_with(&mut allocator, value)).unwrap();
            }

            assert_eq!(allocator.outstanding(), 5);
        }

        assert_eq!(allocator.outstanding(), 0);
    }

    /// Links a slot behind the sentinel the way a producer does, but without moving the tail
    /// onto it, as if the producer had stalled right after linking.
    fn link_without_moving_tail(queue: &Queue, slot: UniqueSlot) -> *mut SlotHeader {
        let header = slot.into_header().unwrap();
        unsafe { header.as_ref() }.set_state(NodeState::Recorded);

        queue
            .sentinel
            .next()
            .store(header.as_ptr(), Ordering::Release);

        header.as_ptr()
    }

    #[test]
    fn push_behind_lagging_tail_is_visible() {
        let queue = Queue::new();
        let mut allocator = Allocator::new(nz!(1), nz!(8)).unwrap();

        let stalled = link_without_moving_tail(&queue, slot_with(&mut allocator, 1));
        assert!(queue.tail.load(Ordering::Relaxed).is_null());

        // Another producer moves the tail on and links behind the stalled one.
        queue.push(slot_with(&mut allocator, 2)).unwrap();
        let tail = queue.tail.load(Ordering::Relaxed);
        assert_ne!(tail, stalled);
        assert_eq!(unsafe { &*stalled }.next().load(Ordering::Relaxed), tail);

        assert_eq!(pop_value(&queue), Some(1));
        assert_eq!(pop_value(&queue), Some(2));
        assert_eq!(pop_value(&queue), None);
    }

    #[test]
    fn pop_moves_lagging_tail_along() {
        let queue = Queue::new();
        let mut allocator = Allocator::new(nz!(1), nz!(8)).unwrap();

        let stalled = link_without_moving_tail(&queue, slot_with(&mut allocator, 1));

        assert_eq!(pop_value(&queue), Some(1));
        assert_eq!(queue.tail.load(Ordering::Relaxed), stalled);

        queue.push(slot_with(&mut allocator, 2)).unwrap();
        assert_eq!(pop_value(&queue), Some(2));
        assert_eq!(pop_value(&queue), None);
    }

    #[test]
    fn consumed_slots_wait_for_pushes_in_progress() {
        let queue = Queue::new();
        let mut allocator = Allocator::new(nz!(1), nz!(8)).unwrap();

        let in_progress = queue.enter_push();

        queue.push(slot_with(&mut allocator, 1)).unwrap();
        queue.push(slot_with(&mut allocator, 2)).unwrap();
        assert_eq!(pop_value(&queue), Some(1));
        assert_eq!(pop_value(&queue), Some(2));

        // The first node is consumed, but the push in progress may still be reading it.
        assert_eq!(allocator.outstanding(), 2);

        drop(in_progress);
        assert_eq!(pop_value(&queue), None);

        assert_eq!(allocator.outstanding(), 1);
    }

    #[test]
    fn pushes_registered_after_sealing_do_not_hold_back_the_batch() {
        let queue = Queue::new();
        let mut allocator = Allocator::new(nz!(1), nz!(8)).unwrap();

        for value in 1..=3 {
            queue.push(slot_with(&mut allocator, value)).unwrap();
        }

        assert_eq!(pop_value(&queue), Some(1));

        let early = queue.enter_push();

        // Moving past the first node seals it into a batch that waits for `early`.
        assert_eq!(pop_value(&queue), Some(2));
        assert_eq!(allocator.outstanding(), 3);

        let late = queue.enter_push();
        drop(early);

        assert_eq!(pop_value(&queue), Some(3));
        assert_eq!(allocator.outstanding(), 2);

        drop(late);
        assert_eq!(pop_value(&queue), None);
        assert_eq!(allocator.outstanding(), 1);
    }

    #[test]
    fn heap_slots_are_queued_too() {
        let queue = Queue::new();

        let mut slot = UniqueSlot::from_heap(Layout::new::<u64>()).unwrap();
        slot.emplace(9_u64).unwrap();
        queue.push(slot).unwrap();

        assert_eq!(pop_value(&queue), Some(9));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn concurrent_producers_lose_nothing() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 1000;

        let queue = Arc::new(Queue::new());

        let handles = (0..PRODUCERS)
            .map(|producer| {
                let queue = Arc::clone(&queue);

                thread::spawn(move || {
                    let mut allocator = Allocator::new(nz!(1), nz!(32)).unwrap();

                    for i in 0..PER_PRODUCER {
                        let value = producer * PER_PRODUCER + i;
                        queue.push(slot_with(&mut allocator, value)).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        let mut last_per_producer = vec![None::<u64>; PRODUCERS as usize];

        while seen.len() < (PRODUCERS * PER_PRODUCER) as usize {
            let Some(value) = pop_value(&queue) else {
                thread::yield_now();
                continue;
            };

            let producer = (value / PER_PRODUCER) as usize;
            let last = &mut last_per_producer[producer];
            assert!(last.is_none_or(|last| last < value), "out of order: {value}");
            *last = Some(value);

            assert!(seen.insert(value), "duplicate: {value}");
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pop_value(&queue), None);
    }
}
