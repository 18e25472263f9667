// SPDX-License-Identifier: Apache-2.0
//! Gillespie step throughput over mixtures of increasing size.
#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use sitemix_benches::heterodimerization;

fn step_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("step_throughput");
    for n in [100usize, 1000, 5000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_batched(
                || heterodimerization(n, 42),
                |mut system| {
                    for _ in 0..100 {
                        system.update().unwrap();
                    }
                    system
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, step_throughput);
criterion_main!(benches);
