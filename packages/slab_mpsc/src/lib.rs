#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A lock-free multi-producer single-consumer queue whose nodes live in a chunked slab
//! allocator.
//!
//! This crate is built for handing messages from many writer threads to one reader thread
//! without a heap allocation or a lock per message. It consists of two coupled parts:
//!
//! * [`Allocator`] hands out [`UniqueSlot`]s, each a run of fixed-size chunks carved from a
//!   memory block. Blocks count their outstanding slots and are reused wholesale once full
//!   and drained, so releasing a slot is a single atomic decrement on any thread.
//! * [`Queue`] links slots into a FIFO through a header embedded in every slot. Any number of
//!   threads push concurrently, one thread pops.
//!
//! On top of these, [`Consumer`] and [`Producer`] offer a typed channel that moves values of
//! one type through the queue with a safe API.
//!
//! # Examples
//!
//! The typed channel, with one allocator per producer:
//!
//! ```
//! use std::thread;
//!
//! use new_zealand::nz;
//! use slab_mpsc::{Allocator, Consumer};
//!
//! let mut consumer = Consumer::<u64>::new();
//!
//! let handles = (0..4_u64)
//!     .map(|id| {
//!         let mut producer = consumer.producer(Allocator::new(nz!(1), nz!(128)).unwrap());
//!
//!         thread::spawn(move || {
//!             for i in 0..100 {
//!                 producer.send(id * 1000 + i).unwrap();
//!             }
//!         })
//!     })
//!     .collect::<Vec<_>>();
//!
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//!
//! assert_eq!(consumer.drain().count(), 400);
//! ```
//!
//! The untyped core, where the caller is responsible for the payload type:
//!
//! ```
//! use new_zealand::nz;
//! use slab_mpsc::{Allocator, Queue};
//!
//! let queue = Queue::new();
//! let mut allocator = Allocator::new(nz!(1), nz!(64)).unwrap();
//!
//! let mut slot = allocator
//!     .try_acquire::<[u8; 16]>()
//!     .or_else(|| allocator.acquire_from_heap::<[u8; 16]>())
//!     .unwrap();
//! slot.emplace([1_u8; 16]).unwrap();
//! queue.push(slot).unwrap();
//!
//! // SAFETY: This is the only thread popping from the queue.
//! let mut popped = unsafe { queue.pop() }.unwrap();
//!
//! // SAFETY: We pushed a [u8; 16] into this slot.
//! let payload = unsafe { popped.take::<[u8; 16]>() }.unwrap();
//! assert_eq!(payload, [1; 16]);
//!
//! popped.release();
//! ```
//!
//! # Memory reclamation
//!
//! Popping a slot does not unlink it: the queue keeps its own hold on the node until the
//! consumer moves past it and no push that may still be reading it is in progress, while the
//! popped [`UniqueSlot`] holds it for the consumer. The memory returns to its block (or to the
//! heap) when both have let go. Dropping a [`Queue`]
//! releases the memory of every slot it still links without dropping their payloads. Dropping
//! an [`Allocator`] does not invalidate slots acquired from it: a block with outstanding slots
//! is freed by the release of its last slot.

mod allocator;
mod block_list;
mod builder;
mod cache_line;
mod channel;
mod consumer;
mod error;
mod memory_block;
mod metrics;
mod producer;
mod queue;
mod slot_header;
mod unique_slot;

pub use allocator::Allocator;
pub(crate) use block_list::BlockList;
pub use builder::AllocatorBuilder;
pub use cache_line::CACHE_LINE_SIZE;
pub(crate) use cache_line::CacheAligned;
pub(crate) use channel::Channel;
pub use consumer::Consumer;
pub use error::Error;
pub(crate) use error::Result;
pub(crate) use memory_block::{BlockHeader, MemoryBlock, chunk_alignment};
pub use producer::Producer;
pub use queue::Queue;
pub use slot_header::AllocKind;
pub(crate) use slot_header::{NodeState, SlotHeader, SlotOrigin};
pub use unique_slot::UniqueSlot;
