//! Forest build and query benchmarks
//!
//! Run with: cargo bench --bench forest

use canopy::{ForestIndex, Metric};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

const DIM: usize = 64;

fn random_vectors(n: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..DIM).map(|_| rng.gen::<f32>() - 0.5).collect())
        .collect()
}

fn loaded_index(metric: Metric, vectors: &[Vec<f32>]) -> ForestIndex {
    let mut index = ForestIndex::new(DIM, metric).unwrap();
    for (id, v) in vectors.iter().enumerate() {
        index.add_item(id as u32, v).unwrap();
    }
    index
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("forest_build");

    // Each iteration rebuilds the whole forest
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(10));

    for num_vectors in [1_000, 10_000] {
        let vectors = random_vectors(num_vectors, 1000 + num_vectors as u64);
        group.bench_with_input(
            BenchmarkId::from_parameter(num_vectors),
            &vectors,
            |b, vectors| {
                b.iter(|| {
                    let mut index = loaded_index(Metric::Angular, vectors);
                    index.build(Some(10), None).unwrap();
                    black_box(index.get_n_trees())
                })
            },
        );
    }

    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("forest_query");
    let vectors = random_vectors(20_000, 42);
    let queries = random_vectors(100, 43);

    for metric in [Metric::Angular, Metric::Euclidean, Metric::DotProduct] {
        let mut index = loaded_index(metric, &vectors);
        index.build(Some(20), None).unwrap();

        for search_k in [100, 1_000, 10_000] {
            group.bench_with_input(
                BenchmarkId::new(metric.name(), search_k),
                &search_k,
                |b, &search_k| {
                    let mut i = 0;
                    b.iter(|| {
                        let q = &queries[i % queries.len()];
                        i += 1;
                        black_box(index.get_nns_by_vector(q, 10, Some(search_k)).unwrap())
                    })
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_build, bench_query);
criterion_main!(benches);
