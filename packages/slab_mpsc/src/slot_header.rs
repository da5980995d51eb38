use std::alloc::{Layout, dealloc};
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicPtr, AtomicU8, Ordering};

use crate::BlockHeader;

/// Identifies where the memory behind a [`UniqueSlot`][crate::UniqueSlot] came from,
/// which determines how it is released.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AllocKind {
    /// Carved from a memory block of an [`Allocator`][crate::Allocator]. Releasing the slot
    /// decrements the block's outstanding slot count.
    Pool,

    /// Allocated directly from the global allocator. Releasing the slot frees it.
    Heap,
}

/// Everything needed to give the memory of a slot back, recorded once at acquisition time
/// and never changed afterwards.
#[derive(Clone, Copy, Debug)]
pub(crate) enum SlotOrigin {
    /// Byte distance from the start of the slot back to the header of its memory block.
    Pool { block_offset: usize },

    /// Allocated from the global allocator with the slot layout of its payload.
    Heap,

    /// The queue-embedded sentinel, which owns no memory of its own.
    Sentinel,
}

/// Consumption state of a slot linked into a [`Queue`][crate::Queue].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum NodeState {
    /// Enqueued and not yet seen by the consumer.
    Recorded = 0,

    /// Handed to the consumer (or never carried a value, like the sentinel). Terminal.
    Utilized = 1,
}

impl NodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Recorded,
            1 => Self::Utilized,
            _ => unreachable!("node state is only ever written from NodeState values"),
        }
    }
}

/// Prefix of every slot, shared by pooled slots, heap slots and the queue sentinel.
///
/// The header doubles as the intrusive queue node: `next` and `state` are only meaningful
/// while the slot is linked into a queue.
///
/// `holders` counts the parties that keep the slot memory alive. A free-standing slot has
/// one holder - its [`UniqueSlot`][crate::UniqueSlot] handle. Pushing the slot into a queue
/// hands that holder over to the queue link. Popping adds a holder for the consumer's
/// handle, because the queue keeps reading the node until it moves past it. Whoever drops
/// the last holder gives the memory back.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct SlotHeader {
    next: AtomicPtr<SlotHeader>,
    state: AtomicU8,
    holders: AtomicU8,

    origin: SlotOrigin,

    /// Size and alignment of the payload region. The payload starts at the first offset
    /// past the header that satisfies this alignment.
    payload_layout: Layout,
}

impl SlotHeader {
    /// Creates the header that a queue embeds as its permanent sentinel node.
    pub(crate) const fn sentinel() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            state: AtomicU8::new(NodeState::Utilized as u8),
            holders: AtomicU8::new(1),
            origin: SlotOrigin::Sentinel,
            payload_layout: Layout::new::<()>(),
        }
    }

    /// Calculates the layout of a slot carrying a payload of the given layout.
    ///
    /// Returns `None` if the combined layout would overflow.
    #[must_use]
    pub(crate) fn slot_layout(payload_layout: Layout) -> Option<Layout> {
        let (combined, _) = Layout::new::<Self>().extend(payload_layout).ok()?;

        Some(combined.pad_to_align())
    }

    /// Byte distance from the start of a slot to its payload region.
    fn payload_offset(payload_layout: Layout) -> usize {
        // The header size is a multiple of its own alignment, so this matches the offset
        // calculated by `slot_layout()`.
        size_of::<Self>().next_multiple_of(payload_layout.align())
    }

    /// Writes a fresh header at `slot` with one holder.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `slot` is valid for writes of the layout returned by
    /// [`slot_layout()`][Self::slot_layout] for `payload_layout` and that it is aligned for
    /// that layout.
    pub(crate) unsafe fn init(
        slot: NonNull<u8>,
        origin: SlotOrigin,
        payload_layout: Layout,
    ) -> NonNull<Self> {
        let header = slot.cast::<Self>();

        // SAFETY: Forwarding the validity and alignment guarantees from the caller.
        unsafe {
            header.write(Self {
                next: AtomicPtr::new(ptr::null_mut()),
                state: AtomicU8::new(NodeState::Utilized as u8),
                holders: AtomicU8::new(1),
                origin,
                payload_layout,
            });
        }

        header
    }

    pub(crate) fn next(&self) -> &AtomicPtr<Self> {
        &self.next
    }

    pub(crate) fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn holders(&self) -> u8 {
        self.holders.load(Ordering::Acquire)
    }

    pub(crate) fn add_holder(&self) {
        // Relaxed is enough: the new holder is created from an existing one, which already
        // keeps the memory alive.
        let previous = self.holders.fetch_add(1, Ordering::Relaxed);

        debug_assert_ne!(previous, 0, "added a holder to a slot that had already been freed");
    }

    #[cfg(test)]
    pub(crate) fn origin(&self) -> SlotOrigin {
        self.origin
    }

    pub(crate) fn alloc_kind(&self) -> AllocKind {
        match self.origin {
            SlotOrigin::Pool { .. } => AllocKind::Pool,
            SlotOrigin::Heap => AllocKind::Heap,
            SlotOrigin::Sentinel => unreachable!("the queue sentinel is never exposed as a slot"),
        }
    }

    pub(crate) fn payload_layout(&self) -> Layout {
        self.payload_layout
    }

    /// Returns a pointer to the payload region of the slot.
    pub(crate) fn payload(this: NonNull<Self>) -> NonNull<u8> {
        // SAFETY: The header is alive for as long as the caller holds the pointer.
        let payload_offset = Self::payload_offset(unsafe { this.as_ref() }.payload_layout);

        // SAFETY: The payload region lies within the slot allocation, right after the header.
        unsafe { this.cast::<u8>().byte_add(payload_offset) }
    }

    /// Drops one holder of the slot, giving the memory back if it was the last one.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `this` points to a live slot header (not the queue
    /// sentinel), that the caller owns one of its holders and that the caller does not
    /// access the slot after this call.
    pub(crate) unsafe fn drop_holder(this: NonNull<Self>) {
        // SAFETY: The caller owns a holder, so the memory is alive.
        let header = unsafe { this.as_ref() };

        // Release ordering: our use of the slot must happen before whoever frees it.
        let previous = header.holders.fetch_sub(1, Ordering::Release);

        debug_assert_ne!(previous, 0, "dropped a holder of a slot that had no holders");

        if previous != 1 {
            return;
        }

        atomic::fence(Ordering::Acquire);

        match header.origin {
            SlotOrigin::Pool { block_offset } => {
                // SAFETY: The offset was recorded when the slot was carved from its block,
                // so stepping back by it lands on the block header.
                let block = unsafe { this.byte_sub(block_offset) }.cast::<BlockHeader>();

                // SAFETY: We were the last holder, so this slot is returned exactly once.
                unsafe {
                    BlockHeader::release(block);
                }
            }
            SlotOrigin::Heap => {
                let layout = Self::slot_layout(header.payload_layout)
                    .expect("slot layout was calculated successfully when the slot was allocated");

                // SAFETY: The slot was allocated from the global allocator with this layout
                // and we were the last holder, so it is freed exactly once.
                unsafe {
                    dealloc(this.as_ptr().cast::<u8>(), layout);
                }
            }
            SlotOrigin::Sentinel => {
                unreachable!("the queue sentinel is never released");
            }
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
    use std::alloc::alloc;
    use std::mem;

    use super::*;
    use crate::CACHE_LINE_SIZE;

    #[test]
    fn header_leaves_room_in_one_cache_line() {
        // Small payloads must fit into a single chunk of the default size.
        assert!(mem::size_of::<SlotHeader>() <= CACHE_LINE_SIZE - 16);
    }

    #[test]
    fn payload_follows_header() {
        let payload_layout = Layout::new::<u64>();
        let layout = SlotHeader::slot_layout(payload_layout).unwrap();
        let payload_offset = SlotHeader::payload_offset(payload_layout);

        assert!(payload_offset >= mem::size_of::<SlotHeader>());
        assert_eq!(payload_offset % mem::align_of::<u64>(), 0);
        assert!(layout.size() >= payload_offset + mem::size_of::<u64>());
        assert_eq!(layout.size() % layout.align(), 0);
    }

    #[test]
    fn over_aligned_payload_is_padded() {
        #[repr(align(32))]
        struct Wide {
            _data: [u8; 32],
        }

        let layout = SlotHeader::slot_layout(Layout::new::<Wide>()).unwrap();

        assert_eq!(SlotHeader::payload_offset(Layout::new::<Wide>()) % 32, 0);
        assert_eq!(layout.align(), 32);
    }

    #[test]
    fn zero_sized_payload_still_has_header() {
        let layout = SlotHeader::slot_layout(Layout::new::<()>()).unwrap();

        assert!(layout.size() >= mem::size_of::<SlotHeader>());
    }

    #[test]
    fn sentinel_starts_utilized() {
        let sentinel = SlotHeader::sentinel();

        assert_eq!(sentinel.state(), NodeState::Utilized);
        assert!(sentinel.next().load(Ordering::Relaxed).is_null());
        assert!(matches!(sentinel.origin(), SlotOrigin::Sentinel));
    }

    #[test]
    fn heap_slot_is_freed_by_last_holder() {
        let payload_layout = Layout::new::<u32>();
        let layout = SlotHeader::slot_layout(payload_layout).unwrap();

        let memory = NonNull::new(unsafe { alloc(layout) }).unwrap();
        let header = unsafe { SlotHeader::init(memory, SlotOrigin::Heap, payload_layout) };

        unsafe { header.as_ref() }.add_holder();
        assert_eq!(unsafe { header.as_ref() }.holders(), 2);
        assert_eq!(unsafe { header.as_ref() }.alloc_kind(), AllocKind::Heap);

        unsafe {
            SlotHeader::payload(header).cast::<u32>().write(7);
            SlotHeader::drop_holder(header);
        }

        // Still one holder left, so the memory is still ours.
        assert_eq!(unsafe { SlotHeader::payload(header).cast::<u32>().read() }, 7);

        unsafe {
            SlotHeader::drop_holder(header);
        }
    }

    #[test]
    fn state_transitions() {
        let payload_layout = Layout::new::<u8>();
        let layout = SlotHeader::slot_layout(payload_layout).unwrap();

        let memory = NonNull::new(unsafe { alloc(layout) }).unwrap();
        let header = unsafe { SlotHeader::init(memory, SlotOrigin::Heap, payload_layout) };

        let node = unsafe { header.as_ref() };
        assert_eq!(node.state(), NodeState::Utilized);

        node.set_state(NodeState::Recorded);
        assert_eq!(node.state(), NodeState::Recorded);

        node.set_state(NodeState::Utilized);
        assert_eq!(node.state(), NodeState::Utilized);

        unsafe {
            SlotHeader::drop_holder(header);
        }
    }
}
