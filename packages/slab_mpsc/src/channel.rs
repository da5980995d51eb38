use std::marker::PhantomData;

use crate::Queue;

/// The queue shared by a [`Consumer`][crate::Consumer] and its
/// [`Producer`][crate::Producer]s, together with the payload type of every slot in it.
///
/// Whoever lets go of the channel last drops the values that were never received.
#[derive(Debug)]
pub(crate) struct Channel<T> {
    queue: Queue,

    // Only ever reached through producers and consumers, which carry the thread safety
    // bounds for `T` themselves.
    _values: PhantomData<fn(T) -> T>,
}

impl<T> Channel<T> {
    pub(crate) const fn new() -> Self {
        Self {
            queue: Queue::new(),
            _values: PhantomData,
        }
    }

    /// Every slot pushed into this queue carries an initialized `T`.
    pub(crate) fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Drops every value still in the queue.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that nobody else pops from the queue concurrently.
    pub(crate) unsafe fn drop_queued(&self) {
        // SAFETY: Forwarding the single consumer guarantee from the caller.
        while let Some(mut slot) = unsafe { self.queue.pop() } {
            // SAFETY: Every slot in the queue carries a `T` that nobody has received yet.
            unsafe {
                slot.drop_and_release::<T>();
            }
        }
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        // SAFETY: We have exclusive access, so nobody else pops concurrently.
        unsafe {
            self.drop_queued();
        }
    }
}
