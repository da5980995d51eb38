//! Basic operations of the slab-backed queue: acquiring slots, push/pop round trips and the
//! typed channel.
//!
//! The allocation tracker confirms that steady-state traffic through a warmed-up allocator
//! does not touch the global allocator.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::time::Instant;

use alloc_tracker::{Allocator, Session};
use criterion::{Criterion, criterion_group, criterion_main};
use new_zealand::nz;
use slab_mpsc::{Consumer, Queue};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

type Message = [u64; 4];

fn entrypoint(c: &mut Criterion) {
    let allocs = Session::new();

    let mut group = c.benchmark_group("slab_mpsc");

    let allocs_op = allocs.operation("acquire_release");
    group.bench_function("acquire_release", |b| {
        b.iter_custom(|iters| {
            let mut allocator = slab_mpsc::Allocator::new(nz!(1), nz!(1024)).unwrap();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                let slot = allocator.acquire::<Message>();
                drop(black_box(slot));
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("heap_acquire_release");
    group.bench_function("heap_acquire_release", |b| {
        b.iter_custom(|iters| {
            let allocator = slab_mpsc::Allocator::new(nz!(1), nz!(1024)).unwrap();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                let slot = allocator.acquire_from_heap::<Message>();
                drop(black_box(slot));
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("push_pop");
    group.bench_function("push_pop", |b| {
        b.iter_custom(|iters| {
            let queue = Queue::new();
            let mut allocator = slab_mpsc::Allocator::new(nz!(1), nz!(1024)).unwrap();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for i in 0..iters {
                let mut slot = allocator.acquire::<Message>().unwrap();
                slot.emplace([i; 4]).unwrap();
                queue.push(slot).unwrap();

                // SAFETY: This is the only thread popping from the queue.
                let mut popped = unsafe { queue.pop() }.unwrap();

                // SAFETY: Every slot in the queue carries a Message.
                black_box(unsafe { popped.take::<Message>() });
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("channel_batch_of_64");
    group.bench_function("channel_batch_of_64", |b| {
        b.iter_custom(|iters| {
            let mut consumer = Consumer::<Message>::new();
            let mut producer =
                consumer.producer(slab_mpsc::Allocator::new(nz!(1), nz!(1024)).unwrap());

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for i in 0..iters {
                for j in 0..64 {
                    producer.send([i, j, 0, 0]).unwrap();
                }

                for message in consumer.drain() {
                    black_box(message);
                }
            }

            start.elapsed()
        });
    });

    group.finish();

    allocs.print_to_stdout();
}
