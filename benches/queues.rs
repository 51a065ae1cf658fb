//! Queue and wait set benchmarks
//!
//! - Uncontended push/pop round trip of both queue flavours
//! - Raise-to-wait latency through a wait set on a single thread

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use venom_sync::{
    Deadline, LockFreeFifoQueue, QueueFullPolicy, SpscSofi, Trigger, WaitSet,
};

fn bench_fifo_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("fifo_round_trip");
    for policy in [QueueFullPolicy::RejectNewest, QueueFullPolicy::DiscardOldest] {
        let queue = LockFreeFifoQueue::<u64, 1024>::new(policy);
        group.bench_with_input(BenchmarkId::from_parameter(format!("{policy:?}")), &queue, |b, queue| {
            let mut value = 0u64;
            b.iter(|| {
                value = value.wrapping_add(1);
                let _ = queue.try_push(black_box(value));
                black_box(queue.pop())
            })
        });
    }
    group.finish();
}

fn bench_fifo_overflow(c: &mut Criterion) {
    let queue = LockFreeFifoQueue::<u64, 64>::new(QueueFullPolicy::DiscardOldest);
    for value in 0..64 {
        let _ = queue.try_push(value);
    }
    c.bench_function("fifo_push_evicting", |b| {
        let mut value = 0u64;
        b.iter(|| {
            value = value.wrapping_add(1);
            black_box(queue.try_push(black_box(value)))
        })
    });
}

fn bench_sofi_round_trip(c: &mut Criterion) {
    let sofi = SpscSofi::<u64, 1024>::new();
    c.bench_function("sofi_round_trip", |b| {
        let mut value = 0u64;
        b.iter(|| {
            value = value.wrapping_add(1);
            black_box(sofi.push(black_box(value)));
            black_box(sofi.pop())
        })
    });
}

fn bench_raise_and_wait(c: &mut Criterion) {
    let mut waitset = match WaitSet::<4>::new() {
        Ok(waitset) => waitset,
        Err(e) => panic!("wait set: {e}"),
    };
    let trigger = Trigger::new();
    if let Err(e) = waitset.attach_condition(&trigger) {
        panic!("attach: {e}");
    }

    c.bench_function("raise_then_wait_immediate", |b| {
        b.iter(|| {
            trigger.raise();
            black_box(waitset.wait(Deadline::Immediate))
        })
    });
}

criterion_group!(
    benches,
    bench_fifo_round_trip,
    bench_fifo_overflow,
    bench_sofi_round_trip,
    bench_raise_and_wait
);
criterion_main!(benches);
