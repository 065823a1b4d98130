use criterion::{black_box, criterion_group, criterion_main, Criterion};
use kube_perf_collector::parsing::normalize_quantity;
use kube_perf_collector::ranking::top_k;
use std::collections::HashMap;

fn cpu_quantity_benchmark(c: &mut Criterion) {
    let test_values = vec!["100m", "1", "0.5", "2.5", "1000000000n", "1000000u", "500m", "1500m"];

    c.bench_function("normalize_quantity/cpu", |b| {
        b.iter(|| {
            for value in &test_values {
                let _ = black_box(normalize_quantity(black_box(value)));
            }
        })
    });
}

fn memory_quantity_benchmark(c: &mut Criterion) {
    let test_values = vec!["1Ki", "1Mi", "1Gi", "1Ti", "1K", "1M", "1G", "1T", "512Mi", "2.5Gi", "4096"];

    c.bench_function("normalize_quantity/memory", |b| {
        b.iter(|| {
            for value in &test_values {
                let _ = black_box(normalize_quantity(black_box(value)));
            }
        })
    });
}

fn ranking_benchmark(c: &mut Criterion) {
    let usage: HashMap<String, f64> = (0..500)
        .map(|i| (format!("namespace-{:03}", i), ((i * 37) % 101) as f64 / 10.0))
        .collect();

    c.bench_function("top_k/500", |b| b.iter(|| black_box(top_k(black_box(&usage), 10))));
}

criterion_group!(benches, cpu_quantity_benchmark, memory_quantity_benchmark, ranking_benchmark);
criterion_main!(benches);
