//! Distance kernel benchmarks
//!
//! Run with: cargo bench --bench kernels

use canopy::simd::{dot_product, hamming_distance, l2_distance_squared, manhattan_distance};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_vector(dim: usize, rng: &mut StdRng) -> Vec<f32> {
    (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect()
}

fn bench_float_kernels(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let kernels: [(&str, fn(&[f32], &[f32]) -> f32); 3] = [
        ("dot_product", dot_product),
        ("l2_distance_squared", l2_distance_squared),
        ("manhattan_distance", manhattan_distance),
    ];

    for (name, kernel) in kernels {
        let mut group = c.benchmark_group(name);
        for dim in [64, 128, 256, 512] {
            group.throughput(Throughput::Elements(dim as u64));
            let a = random_vector(dim, &mut rng);
            let b = random_vector(dim, &mut rng);
            group.bench_function(format!("dim_{}", dim), |bencher| {
                bencher.iter(|| kernel(black_box(&a), black_box(&b)))
            });
        }
        group.finish();
    }
}

fn bench_hamming(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(8);
    let mut group = c.benchmark_group("hamming_distance");

    for bits in [64, 256, 1024] {
        group.throughput(Throughput::Elements(bits as u64));
        let a: Vec<u64> = (0..bits / 64).map(|_| rng.gen()).collect();
        let b: Vec<u64> = (0..bits / 64).map(|_| rng.gen()).collect();
        group.bench_function(format!("bits_{}", bits), |bencher| {
            bencher.iter(|| hamming_distance(black_box(&a), black_box(&b)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_float_kernels, bench_hamming);
criterion_main!(benches);
