//! Benchmarks for the in-memory numeric kernels.
//!
//! Run with: `cargo bench`

use credit_risk_factory::clustering::KMeans;
use credit_risk_factory::transformers::outlier_handling::cap_outliers;
use credit_risk_factory::transformers::scaling::standardize;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// Skewed, deterministic amounts with a few extreme values.
fn amounts(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let base = ((i * 7919) % 1000) as f64;
            if i % 97 == 0 {
                base * 1_000.0
            } else if i % 89 == 0 {
                -base * 50.0
            } else {
                base
            }
        })
        .collect()
}

/// Standardized RFM-like points.
fn rfm_points(n: usize) -> Vec<Vec<f64>> {
    let recency: Vec<f64> = (0..n).map(|i| ((i * 31) % 365) as f64).collect();
    let frequency: Vec<f64> = (0..n).map(|i| ((i * 17) % 50 + 1) as f64).collect();
    let monetary = amounts(n);
    let (r, f, m) = (
        standardize(&recency),
        standardize(&frequency),
        standardize(&monetary),
    );
    (0..n).map(|i| vec![r[i], f[i], m[i]]).collect()
}

fn bench_cap_outliers(c: &mut Criterion) {
    let mut group = c.benchmark_group("cap_outliers");
    for n in [1_000, 100_000] {
        let values = amounts(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &values, |b, v| {
            b.iter(|| cap_outliers(black_box(v), 1.5))
        });
    }
    group.finish();
}

fn bench_kmeans(c: &mut Criterion) {
    let mut group = c.benchmark_group("kmeans_rfm");
    group.sample_size(20);
    for n in [1_000, 10_000] {
        let points = rfm_points(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &points, |b, p| {
            b.iter(|| KMeans::new(3).fit(black_box(p)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cap_outliers, bench_kmeans);
criterion_main!(benches);
