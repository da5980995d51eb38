//! Metrics for the slab allocator.
//!
//! None of these are observed on the push/pop fast path - only when an allocator has to do
//! something other than carving a slot from its current block.

use nm::{Event, Magnitude};

/// Histogram buckets for the payload size of slots allocated from the heap, in bytes.
///
/// Heap slots are the fallback for pool exhaustion and for payloads that do not fit a block,
/// so we expect anything from small messages to payloads of many kilobytes.
const HEAP_SLOT_BYTES_BUCKETS: &[Magnitude] = &[16, 64, 256, 1024, 4096, 16384, 65536];

thread_local! {
    /// Counts memory blocks appended to an allocator after construction.
    pub(crate) static BLOCKS_GROWN: Event = Event::builder()
        .name("slab_mpsc_blocks_grown")
        .build();

    /// Counts acquisitions that found no room in the probed blocks.
    pub(crate) static POOL_EXHAUSTED: Event = Event::builder()
        .name("slab_mpsc_pool_exhausted")
        .build();

    /// Observes the payload size of every slot allocated directly from the heap.
    ///
    /// The magnitude is the payload size in bytes.
    pub(crate) static HEAP_SLOT_BYTES: Event = Event::builder()
        .name("slab_mpsc_heap_slot_bytes")
        .histogram(HEAP_SLOT_BYTES_BUCKETS)
        .build();
}
