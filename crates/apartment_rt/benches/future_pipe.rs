// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(
    clippy::arithmetic_side_effects,
    reason = "it is fine to let our guard down in benchmark/test code"
)]

use std::hint::black_box;

use apartment_rt::{AsyncContext, Future};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

fn criterion_benchmark(c: &mut Criterion) {
    group_pipe_chain(c);
    group_post(c);
}

/// Measures the cost of chaining `count` `then` pipes off a single resolved future and waiting on
/// the tail, all run inline on the posting thread's own apartment (`INLINE_PRIORITY`).
fn group_pipe_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipe chain");
    for count in [1, 10, 100, 1000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::new("then", count), &count, |b, &count| {
            b.iter(|| {
                let mut future = Future::resolved(0_u64);
                for _ in 0..count {
                    future = future.then(None, AsyncContext::empty(), |value| Ok(value + 1));
                }
                black_box(future.wait().unwrap());
            });
        });
    }
    group.finish();
}

/// Measures the cost of posting `count` independent bodies to a multi-thread apartment and waiting
/// on all of them.
fn group_post(c: &mut Criterion) {
    let mut group = c.benchmark_group("post");
    let apartment = apartment_rt::apartment::spawn_mta("bench-post", 4);
    apartment.start();

    for count in [1, 10, 100, 1000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::new("spawn_mta", count), &count, |b, &count| {
            b.iter(|| {
                let futures: Vec<_> = (0..count)
                    .map(|i| Future::post(apartment.clone(), AsyncContext::empty(), move || Ok(i)))
                    .collect();
                for future in futures {
                    black_box(future.wait().unwrap());
                }
            });
        });
    }
    group.finish();

    apartment.async_stop();
    apartment.wait();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
