use std::alloc::{Layout, alloc};
use std::any::type_name;
use std::fmt;
use std::mem::{self, ManuallyDrop};
use std::ptr::NonNull;

use tracing::trace;

use crate::metrics::HEAP_SLOT_BYTES;
use crate::{AllocKind, SlotHeader, SlotOrigin};

/// Exclusive ownership of one slot of memory sized for a specific payload.
///
/// A slot is acquired from an [`Allocator`][crate::Allocator] (or directly from the heap via
/// [`from_heap()`][Self::from_heap]), filled with a value, pushed into a
/// [`Queue`][crate::Queue] by a producer and popped again by the consumer, who reads the value
/// and releases the slot.
///
/// The slot does not know the type of its payload. Typed access goes through
/// [`emplace()`][Self::emplace], [`get()`][Self::get], [`take()`][Self::take] and
/// [`drop_and_release()`][Self::drop_and_release], and it is up to the caller to run the
/// destructor of the payload before releasing the slot, if the payload needs one.
///
/// # Release
///
/// Releasing gives the memory back to where it came from: a pooled slot decrements the
/// outstanding slot count of its memory block, a heap slot is freed. Release happens exactly
/// once - [`release()`][Self::release] empties the handle, so calling it again (or dropping the
/// handle afterwards) does nothing. Moving the handle moves the responsibility with it.
///
/// A slot returned by [`Queue::pop()`][crate::Queue::pop] may still be referenced by the
/// queue. Releasing it is always allowed, but the memory only goes back once the queue has
/// moved past the slot too.
///
/// # Thread safety
///
/// The handle is thread-mobile ([`Send`]) so that producers can hand slots to the consumer.
/// Whether the payload may cross threads is the responsibility of whoever reads it through
/// the `unsafe` typed accessors.
///
/// # Examples
///
/// ```
/// use std::alloc::Layout;
///
/// use slab_mpsc::{AllocKind, UniqueSlot};
///
/// let mut slot = UniqueSlot::from_heap(Layout::new::<u64>()).unwrap();
/// assert_eq!(slot.alloc_kind(), Some(AllocKind::Heap));
///
/// slot.emplace(42_u64).unwrap();
///
/// // SAFETY: We just placed a u64 into the slot.
/// let value = unsafe { slot.take::<u64>() };
/// assert_eq!(value, Some(42));
///
/// slot.release();
/// assert!(!slot.is_valid());
///
/// // Releasing again is a no-op.
/// slot.release();
/// ```
#[derive(Default)]
pub struct UniqueSlot {
    /// `None` once the slot has been released.
    header: Option<NonNull<SlotHeader>>,
}

// SAFETY: The handle exclusively owns one holder of the slot, and holders are counted
// atomically, so the handle may be moved to and dropped on any thread. Access to the
// payload itself is unsafe and the caller is responsible for the payload's thread safety.
unsafe impl Send for UniqueSlot {}

impl UniqueSlot {
    /// Allocates a slot for a payload of the given layout directly from the global allocator.
    ///
    /// This never touches a memory block, so it can serve payloads that are larger or more
    /// strictly aligned than any block supports.
    ///
    /// Returns `None` if the global allocator is out of memory.
    #[must_use]
    pub fn from_heap(payload_layout: Layout) -> Option<Self> {
        let layout = SlotHeader::slot_layout(payload_layout)?;

        // SAFETY: The slot layout always includes the header, so it is not zero-sized.
        let memory = NonNull::new(unsafe { alloc(layout) })?;

        // SAFETY: The memory was just allocated with the slot layout.
        let header = unsafe { SlotHeader::init(memory, SlotOrigin::Heap, payload_layout) };

        trace!(
            size = payload_layout.size(),
            align = payload_layout.align(),
            "slot allocated from heap"
        );
        HEAP_SLOT_BYTES.with(|event| event.observe(payload_layout.size()));

        Some(Self {
            header: Some(header),
        })
    }

    /// Takes over one holder of an initialized slot header.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `header` points to a live slot header (not a queue
    /// sentinel) and that the caller transfers ownership of one of its holders to the handle.
    #[must_use]
    pub(crate) unsafe fn from_header(header: NonNull<SlotHeader>) -> Self {
        Self {
            header: Some(header),
        }
    }

    /// Gives up the handle without releasing the slot, returning the holder it owned.
    #[must_use]
    pub(crate) fn into_header(self) -> Option<NonNull<SlotHeader>> {
        let this = ManuallyDrop::new(self);
        this.header
    }

    pub(crate) fn header(&self) -> Option<NonNull<SlotHeader>> {
        self.header
    }

    fn header_ref(&self) -> Option<&SlotHeader> {
        // SAFETY: While the handle owns a holder, the header is alive.
        self.header.map(|header| unsafe { header.as_ref() })
    }

    /// Returns `true` if the handle still owns a slot, `false` once it has been released.
    #[must_use]
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.header.is_some()
    }

    /// Where the slot memory came from, or `None` if the handle is empty.
    #[must_use]
    pub fn alloc_kind(&self) -> Option<AllocKind> {
        self.header_ref().map(SlotHeader::alloc_kind)
    }

    /// The size and alignment of the payload region, or `None` if the handle is empty.
    #[must_use]
    pub fn payload_layout(&self) -> Option<Layout> {
        self.header_ref().map(SlotHeader::payload_layout)
    }

    /// Returns a pointer to the raw payload region, or `None` if the handle is empty.
    ///
    /// The region is valid for reads and writes of
    /// [`payload_layout()`][Self::payload_layout] bytes for as long as the handle owns the slot.
    #[must_use]
    pub fn as_ptr(&self) -> Option<NonNull<u8>> {
        self.header.map(SlotHeader::payload)
    }

    /// Returns a pointer to the payload region reinterpreted as a `T`.
    ///
    /// Returns `None` if the handle is empty or if a `T` does not fit the payload region.
    /// Whether a valid `T` lives there is up to the caller.
    #[must_use]
    pub fn get<T>(&self) -> Option<NonNull<T>> {
        let layout = self.payload_layout()?;

        if !fits::<T>(layout) {
            return None;
        }

        self.as_ptr().map(NonNull::cast::<T>)
    }

    /// Moves `value` into the payload region and returns a pointer to it.
    ///
    /// Any previous payload is overwritten without being dropped.
    ///
    /// # Errors
    ///
    /// Returns the value back if the handle is empty or if a `T` does not fit the payload
    /// region.
    pub fn emplace<T>(&mut self, value: T) -> Result<NonNull<T>, T> {
        let Some(ptr) = self.get::<T>() else {
            return Err(value);
        };

        // SAFETY: The payload region is valid for writes and properly sized and aligned for
        // a T, as checked by get(). We own the slot exclusively.
        unsafe {
            ptr.write(value);
        }

        Ok(ptr)
    }

    /// Moves the `T` out of the payload region.
    ///
    /// Returns `None` if the handle is empty or if a `T` does not fit the payload region.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the payload region holds an initialized `T` that may be
    /// used on the current thread, and must treat the region as uninitialized afterwards.
    #[must_use]
    pub unsafe fn take<T>(&mut self) -> Option<T> {
        let ptr = self.get::<T>()?;

        // SAFETY: Forwarding the initialization guarantee from the caller; get() checked the
        // size and alignment.
        Some(unsafe { ptr.read() })
    }

    /// Drops the `T` in the payload region in place and releases the slot.
    ///
    /// Does nothing if the handle is empty. If a `T` does not fit the payload region, the
    /// slot is released without dropping anything.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the payload region holds an initialized `T` that may be
    /// dropped on the current thread.
    pub unsafe fn drop_and_release<T>(&mut self) {
        if let Some(ptr) = self.get::<T>() {
            // SAFETY: Forwarding the initialization guarantee from the caller.
            unsafe {
                ptr.drop_in_place();
            }
        }

        self.release();
    }

    /// Gives the slot memory back to where it came from and empties the handle.
    ///
    /// Does nothing if the handle is already empty. The payload is not dropped.
    pub fn release(&mut self) {
        let Some(header) = self.header.take() else {
            return;
        };

        // SAFETY: The handle owned one holder of a live slot, and it has just been emptied
        // so the slot is not accessed through it again.
        unsafe {
            SlotHeader::drop_holder(header);
        }
    }
}

fn fits<T>(layout: Layout) -> bool {
    mem::size_of::<T>() <= layout.size() && mem::align_of::<T>() <= layout.align()
}

impl Drop for UniqueSlot {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for UniqueSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("alloc_kind", &self.alloc_kind())
            .field("payload_layout", &self.payload_layout())
            .field("payload", &self.as_ptr())
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::thread;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(UniqueSlot: Send, fmt::Debug, Default);
    assert_not_impl_any!(UniqueSlot: Sync, Clone);

    #[test]
    fn heap_slot_roundtrip() {
        let mut slot = UniqueSlot::from_heap(Layout::new::<String>()).unwrap();

        assert!(slot.is_valid());
        assert_eq!(slot.alloc_kind(), Some(AllocKind::Heap));
        assert_eq!(slot.payload_layout(), Some(Layout::new::<String>()));

        let ptr = slot.emplace("hello".to_string()).unwrap();
        assert_eq!(unsafe { ptr.as_ref() }, "hello");

        let value = unsafe { slot.take::<String>() };
        assert_eq!(value.as_deref(), Some("hello"));
    }

    #[test]
    fn default_slot_is_empty() {
        let mut slot = UniqueSlot::default();

        assert!(!slot.is_valid());
        assert!(slot.alloc_kind().is_none());
        assert!(slot.as_ptr().is_none());
        assert!(slot.get::<u8>().is_none());
        assert_eq!(slot.emplace(5_u8), Err(5));

        slot.release();
        assert!(!slot.is_valid());
    }

    #[test]
    fn release_is_idempotent() {
        let mut slot = UniqueSlot::from_heap(Layout::new::<u64>()).unwrap();

        slot.release();
        assert!(!slot.is_valid());

        slot.release();
        assert!(!slot.is_valid());
        assert!(slot.get::<u64>().is_none());
    }

    #[test]
    fn moving_out_leaves_empty_handle() {
        let mut slot = UniqueSlot::from_heap(Layout::new::<u64>()).unwrap();

        let mut moved = mem::take(&mut slot);
        assert!(!slot.is_valid());
        assert!(moved.is_valid());

        // Releasing the moved-from handle must not touch the slot.
        slot.release();
        assert!(moved.emplace(1_u64).is_ok());

        moved.release();
    }

    #[test]
    fn payload_that_does_not_fit_is_refused() {
        let mut slot = UniqueSlot::from_heap(Layout::new::<u16>()).unwrap();

        assert!(slot.get::<u64>().is_none());
        assert_eq!(slot.emplace(7_u64), Err(7));

        // Smaller types fit.
        assert!(slot.emplace(7_u8).is_ok());
    }

    struct CountDrops(Rc<Cell<usize>>);

    impl Drop for CountDrops {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn drop_and_release_runs_destructor() {
        let drops = Rc::new(Cell::new(0));

        let mut slot = UniqueSlot::from_heap(Layout::new::<CountDrops>()).unwrap();
        assert!(slot.emplace(CountDrops(Rc::clone(&drops))).is_ok());

        unsafe {
            slot.drop_and_release::<CountDrops>();
        }

        assert_eq!(drops.get(), 1);
        assert!(!slot.is_valid());

        // Already released, so nothing is dropped a second time.
        unsafe {
            slot.drop_and_release::<CountDrops>();
        }

        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn release_on_another_thread() {
        let mut slot = UniqueSlot::from_heap(Layout::new::<u32>()).unwrap();
        assert!(slot.emplace(99_u32).is_ok());

        let value = thread::spawn(move || {
            let value = unsafe { slot.take::<u32>() };
            drop(slot);
            value
        })
        .join()
        .unwrap();

        assert_eq!(value, Some(99));
    }

    #[test]
    fn oversized_layout_is_refused() {
        let layout = Layout::from_size_align(isize::MAX as usize - 8, 8).unwrap();

        assert!(UniqueSlot::from_heap(layout).is_none());
    }

    #[test]
    fn debug_output_names_kind() {
        let slot = UniqueSlot::from_heap(Layout::new::<u8>()).unwrap();

        let output = format!("{slot:?}");
        assert!(output.contains("Heap"));
    }
}
