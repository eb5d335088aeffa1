//! Forest traversal and candidate ranking
//!
//! **Search**: push every root at the metric's initial priority, then
//! repeatedly pop the most promising node. Split nodes push both children,
//! the far side penalized by the query's margin; leaves contribute their
//! items as candidates. Once `search_k` distinct candidates are collected
//! they are ranked by exact distance.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::metric::Side;
use crate::node::{Node, NodeLayout};
use crate::visited::SeenItems;

/// One ranked search result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: u32,
    /// Reported (normalized) distance to the query.
    pub distance: f32,
}

/// Frontier entry (max-heap: higher priority first, then higher node id)
#[derive(Clone, Copy)]
struct Frontier {
    priority: f32,
    node: u32,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier {}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then(self.node.cmp(&other.node))
    }
}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Read-only view of a built forest, over heap or mapped storage.
#[derive(Clone, Copy)]
pub(crate) struct Reader<'a> {
    layout: &'a NodeLayout,
    region: &'a [u8],
    n_items: u32,
    roots: &'a [u32],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(
        layout: &'a NodeLayout,
        region: &'a [u8],
        n_items: u32,
        roots: &'a [u32],
    ) -> Self {
        Self {
            layout,
            region,
            n_items,
            roots,
        }
    }

    /// Slots in the region.
    #[inline]
    fn n_nodes(&self) -> u32 {
        (self.region.len() / self.layout.stride()) as u32
    }

    /// Whether `id` names a stored item. Mapped files are not trusted, so
    /// ids read from nodes pass through here before being ranked.
    #[inline]
    fn is_item(&self, id: u32) -> bool {
        id < self.n_items && self.node(id).n_descendants() == 1
    }

    #[inline]
    fn node(&self, id: u32) -> Node<'a> {
        self.layout.node(self.region, id)
    }

    /// Default candidate budget: `n` per tree, never below `n`.
    pub(crate) fn effective_search_k(&self, n: usize, search_k: Option<usize>) -> usize {
        match search_k {
            Some(k) if k > 0 => k,
            _ => n.saturating_mul(self.roots.len()),
        }
        .max(n)
    }

    /// The `n` nearest items to `query` (an item-shaped slot).
    pub(crate) fn search(
        &self,
        query: Node<'_>,
        n: usize,
        search_k: Option<usize>,
    ) -> Vec<Neighbor> {
        if n == 0 || self.roots.is_empty() {
            return Vec::new();
        }

        let metric = self.layout.metric();
        let search_k = self.effective_search_k(n, search_k);
        let leaf_capacity = self.layout.leaf_capacity() as u32;
        let n_nodes = self.n_nodes();

        let start = metric.initial_priority(self.layout.dimensions());
        let mut frontier: BinaryHeap<Frontier> = self
            .roots
            .iter()
            .map(|&node| Frontier {
                priority: start,
                node,
            })
            .collect();

        let mut seen = SeenItems::new(self.n_items as usize);
        let mut candidates: Vec<u32> = Vec::with_capacity(search_k.min(self.n_items as usize));

        // Each split node pushes two children, so a well-formed forest never
        // pops more than this. A corrupt one with cycles stops here.
        let max_pops = 2 * n_nodes as u64 + self.roots.len() as u64;
        let mut pops = 0u64;
        while candidates.len() < search_k && pops < max_pops {
            let Some(Frontier { priority, node: id }) = frontier.pop() else {
                break;
            };
            pops += 1;
            if id >= n_nodes {
                continue;
            }
            let node = self.node(id);

            if id < self.n_items {
                if node.n_descendants() == 1 && seen.insert(id) {
                    candidates.push(id);
                }
            } else if node.n_descendants() <= leaf_capacity {
                candidates.extend(
                    node.leaf_items()
                        .iter()
                        .copied()
                        .filter(|&item| self.is_item(item) && seen.insert(item)),
                );
            } else {
                let margin = metric.margin(node, query);
                let [left, right] = node.children();
                frontier.push(Frontier {
                    priority: metric.child_priority(priority, margin, Side::Right),
                    node: right,
                });
                frontier.push(Frontier {
                    priority: metric.child_priority(priority, margin, Side::Left),
                    node: left,
                });
            }
        }

        let mut ranked: Vec<(f32, u32)> = candidates
            .into_iter()
            .map(|id| (metric.distance(query, self.node(id)), id))
            .collect();

        let by_distance = |a: &(f32, u32), b: &(f32, u32)| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1));
        if ranked.len() > n {
            ranked.select_nth_unstable_by(n, by_distance);
            ranked.truncate(n);
        }
        ranked.sort_unstable_by(by_distance);

        ranked
            .into_iter()
            .map(|(distance, id)| Neighbor {
                id,
                distance: metric.normalized_distance(distance),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_forest, ForestPlan};
    use crate::metric::Metric;
    use crate::storage::NodeStorage;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct Fixture {
        storage: NodeStorage,
        roots: Vec<u32>,
        n_items: u32,
        vectors: Vec<Vec<f32>>,
    }

    impl Fixture {
        fn new(metric: Metric, dim: usize, vectors: Vec<Vec<f32>>, n_trees: usize) -> Self {
            let layout = NodeLayout::new(metric, dim);
            let mut storage = NodeStorage::in_memory(layout);
            storage.allocate(vectors.len()).unwrap();
            for (id, v) in vectors.iter().enumerate() {
                layout.write_item(&mut storage.node_mut(id as u32), v);
            }
            let n_items = vectors.len() as u32;
            metric.prepare_items(&layout, storage.region_mut(), n_items);
            let plan = ForestPlan {
                n_trees: Some(n_trees),
                n_threads: Some(2),
                seed: 7,
                verbose: false,
            };
            let roots = build_forest(&mut storage, n_items, &plan).unwrap();
            Self {
                storage,
                roots,
                n_items,
                vectors,
            }
        }

        fn reader(&self) -> Reader<'_> {
            Reader::new(self.storage.layout(), self.storage.region(), self.n_items, &self.roots)
        }

        fn query(&self, v: &[f32], n: usize, search_k: Option<usize>) -> Vec<Neighbor> {
            let slot = self.storage.layout().query_slot(v);
            let query = self.storage.layout().node(slot.as_bytes(), 0);
            self.reader().search(query, n, search_k)
        }
    }

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect())
            .collect()
    }

    #[test]
    fn test_exhaustive_search_matches_brute_force() {
        let vectors = random_vectors(200, 8, 11);
        let fx = Fixture::new(Metric::Euclidean, 8, vectors, 5);
        let query = vec![0.1f32; 8];

        let results = fx.query(&query, 10, Some(10_000));

        let mut truth: Vec<(f32, u32)> = fx
            .vectors
            .iter()
            .enumerate()
            .map(|(id, v)| {
                let d: f32 = v.iter().zip(&query).map(|(a, b)| (a - b).powi(2)).sum();
                (d.sqrt(), id as u32)
            })
            .collect();
        truth.sort_by(|a, b| a.0.total_cmp(&b.0));

        let ids: Vec<u32> = results.iter().map(|r| r.id).collect();
        let expected: Vec<u32> = truth.iter().take(10).map(|t| t.1).collect();
        assert_eq!(ids, expected);
        for (r, t) in results.iter().zip(&truth) {
            assert!((r.distance - t.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_recall_with_default_budget() {
        let vectors = random_vectors(1000, 16, 21);
        let fx = Fixture::new(Metric::Angular, 16, vectors, 10);
        let k = 10;

        let mut total_recall = 0.0;
        for q in random_vectors(10, 16, 99) {
            let exact: std::collections::HashSet<u32> = fx
                .query(&q, k, Some(usize::MAX))
                .iter()
                .map(|r| r.id)
                .collect();
            let approx = fx.query(&q, k, Some(400));
            let hits = approx.iter().filter(|r| exact.contains(&r.id)).count();
            total_recall += hits as f64 / k as f64;
        }

        let avg_recall = total_recall / 10.0;
        assert!(avg_recall > 0.8, "Recall should be > 80%, got {:.2}%", avg_recall * 100.0);
    }

    // ============== Edge Case Tests ==============

    #[test]
    fn test_zero_results_requested() {
        let fx = Fixture::new(Metric::Euclidean, 2, random_vectors(20, 2, 1), 2);
        assert!(fx.query(&[0.0, 0.0], 0, None).is_empty());
    }

    #[test]
    fn test_n_greater_than_item_count() {
        let fx = Fixture::new(Metric::Manhattan, 2, random_vectors(5, 2, 2), 3);
        let results = fx.query(&[0.0, 0.0], 50, None);
        assert_eq!(results.len(), 5);
        assert!(results.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_ties_break_by_id() {
        let vectors = vec![vec![1.0, 1.0]; 6];
        let fx = Fixture::new(Metric::Euclidean, 2, vectors, 2);
        let ids: Vec<u32> = fx.query(&[1.0, 1.0], 6, None).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_small_search_k_is_clamped_to_n() {
        let fx = Fixture::new(Metric::Euclidean, 3, random_vectors(500, 3, 4), 4);
        assert_eq!(fx.reader().effective_search_k(10, Some(1)), 10);
        assert_eq!(fx.reader().effective_search_k(10, None), 40);
        assert_eq!(fx.reader().effective_search_k(10, Some(0)), 40);
        assert_eq!(fx.query(&[0.0; 3], 10, Some(1)).len(), 10);
    }

    #[test]
    fn test_no_duplicate_ids() {
        let fx = Fixture::new(Metric::Angular, 4, random_vectors(300, 4, 8), 10);
        let results = fx.query(&[0.3, -0.2, 0.1, 0.5], 100, Some(3000));
        let mut ids: Vec<u32> = results.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_corrupt_nodes_are_skipped() {
        let mut fx = Fixture::new(Metric::Euclidean, 4, random_vectors(300, 4, 13), 3);
        let k = fx.storage.layout().leaf_capacity() as u32;
        let n_items = fx.n_items;

        for id in n_items..fx.storage.len() as u32 {
            let mut node = fx.storage.node_mut(id);
            if node.as_node().n_descendants() <= k {
                // Out-of-range id and a tree node posing as an item
                node.set_leaf_items(&[u32::MAX, n_items + 1]);
            } else {
                // Self-loop on one side, far out of range on the other
                node.header_mut().children = [id, 0x00FF_FFFF];
            }
        }

        let results = fx.query(&[0.0; 4], 10, Some(1_000));
        assert!(results.len() <= 10);
        assert!(results.iter().all(|r| r.id < n_items));
    }

    #[test]
    fn test_hamming_search() {
        let mut rng = StdRng::seed_from_u64(5);
        let vectors: Vec<Vec<f32>> = (0..300)
            .map(|_| (0..72).map(|_| if rng.gen::<bool>() { 1.0 } else { 0.0 }).collect())
            .collect();
        let target = vectors[123].clone();
        let fx = Fixture::new(Metric::Hamming, 72, vectors, 10);

        let results = fx.query(&target, 3, None);
        assert_eq!(results[0].id, 123);
        assert_eq!(results[0].distance, 0.0);
    }

    #[test]
    fn test_dot_prefers_largest_inner_product() {
        let vectors = vec![vec![1.0, 0.0], vec![2.0, 0.0], vec![0.0, 3.0], vec![-1.0, 0.0]];
        let fx = Fixture::new(Metric::DotProduct, 2, vectors, 4);
        let results = fx.query(&[1.0, 0.0], 4, None);

        let ids: Vec<u32> = results.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 0, 2, 3]);
        assert!((results[0].distance - (1.0 - 2.0)).abs() < 1e-6);
    }
}
