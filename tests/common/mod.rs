#![allow(dead_code)]

use canopy::{ForestIndex, Metric};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

/// Route canopy logs to the test harness. Set `RUST_LOG=canopy_core=debug` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}

pub fn index_with(metric: Metric, vectors: &[Vec<f32>]) -> ForestIndex {
    let mut index = ForestIndex::new(vectors[0].len(), metric).unwrap();
    for (id, v) in vectors.iter().enumerate() {
        index.add_item(id as u32, v).unwrap();
    }
    index
}

pub fn ids(results: &[canopy::Neighbor]) -> Vec<u32> {
    results.iter().map(|r| r.id).collect()
}
