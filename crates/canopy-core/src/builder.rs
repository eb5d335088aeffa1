//! Forest construction
//!
//! Each tree is built independently by a [`TreeBuilder`] into its own
//! [`TreeFragment`], on a rayon pool. Fragments address their own slots as if
//! the first one had id `n_items`, so merging a fragment into the shared
//! [`NodeStorage`] is a single allocation, a copy, and a constant shift of
//! every tree-internal child id. Merging happens on the calling thread in
//! tree order, which keeps the storage single-writer and makes the forest a
//! pure function of the seed, whatever the thread count.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::error::Result;
use crate::metric::Side;
use crate::node::{Node, NodeLayout, SlotBuf};
use crate::storage::NodeStorage;

/// Hyperplanes tried per split before settling for the most balanced one.
const SPLIT_ATTEMPTS: usize = 20;

/// A split at most this lopsided is accepted immediately.
const ACCEPT_IMBALANCE: f64 = 0.95;

/// Anything more lopsided than this is replaced by an id bisection.
const MAX_IMBALANCE: f64 = 0.99;

/// How many trees to build and on how many threads.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ForestPlan {
    /// `None` keeps adding trees until tree nodes outnumber items.
    pub n_trees: Option<usize>,
    /// `None` uses every core.
    pub n_threads: Option<usize>,
    pub seed: u64,
    pub verbose: bool,
}

/// One tree's slots, pre-order, relative to a virtual base id of `n_items`.
pub(crate) struct TreeFragment {
    slots: SlotBuf,
    root: u32,
}

impl TreeFragment {
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Independent RNG seed for tree `tree`.
fn tree_seed(seed: u64, tree: usize) -> u64 {
    seed ^ (tree as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

pub(crate) struct TreeBuilder<'a> {
    layout: &'a NodeLayout,
    items: &'a [u8],
    n_items: u32,
    rng: StdRng,
    slots: SlotBuf,
    trial: SlotBuf,
    best: SlotBuf,
}

impl<'a> TreeBuilder<'a> {
    /// `items` is the item region of the node storage (slots `0..n_items`).
    pub(crate) fn new(layout: &'a NodeLayout, items: &'a [u8], n_items: u32, seed: u64) -> Self {
        let scratch = || {
            let mut buf = SlotBuf::new(layout.stride());
            buf.resize(1);
            buf
        };
        Self {
            layout,
            items,
            n_items,
            rng: StdRng::seed_from_u64(seed),
            slots: SlotBuf::new(layout.stride()),
            trial: scratch(),
            best: scratch(),
        }
    }

    /// Build one tree over `active` (non-empty).
    pub(crate) fn build(mut self, active: &[u32]) -> TreeFragment {
        let root = self.make_tree(active.to_vec(), true);
        TreeFragment {
            slots: self.slots,
            root,
        }
    }

    #[inline]
    fn item(&self, id: u32) -> Node<'a> {
        self.layout.node(self.items, id)
    }

    fn make_tree(&mut self, mut indices: Vec<u32>, is_root: bool) -> u32 {
        // Roots always get a slot so every tree adds at least one node
        if indices.len() == 1 && !is_root {
            return indices[0];
        }

        let slot = self.slots.push_zeroed();
        let id = self.n_items + slot as u32;

        if indices.len() <= self.layout.leaf_capacity() {
            self.layout
                .node_mut(self.slots.as_bytes_mut(), slot as u32)
                .set_leaf_items(&indices);
            return id;
        }

        let (left, right) = match self.split(&indices) {
            Some(sides) => {
                let best = self.layout.node(self.best.as_bytes(), 0);
                self.layout
                    .node_mut(self.slots.as_bytes_mut(), slot as u32)
                    .copy_from(best);
                sides
            }
            None => {
                // Degenerate: the plane stays zeroed and ids are bisected
                indices.sort_unstable();
                let right = indices.split_off(indices.len() / 2);
                (indices, right)
            }
        };
        let n_descendants = (left.len() + right.len()) as u32;

        let children = if left.len() <= right.len() {
            let l = self.make_tree(left, false);
            [l, self.make_tree(right, false)]
        } else {
            let r = self.make_tree(right, false);
            [self.make_tree(left, false), r]
        };

        let mut node = self.layout.node_mut(self.slots.as_bytes_mut(), slot as u32);
        let header = node.header_mut();
        header.n_descendants = n_descendants;
        header.children = children;
        id
    }

    /// Try several hyperplanes; leave the winner in `self.best`.
    ///
    /// Returns `None` when no usable plane was found.
    fn split(&mut self, indices: &[u32]) -> Option<(Vec<u32>, Vec<u32>)> {
        let metric = self.layout.metric();
        let sample_size = (2 * self.layout.leaf_capacity()).min(indices.len());
        let mut best: Option<(f64, Vec<u32>, Vec<u32>)> = None;

        for _ in 0..SPLIT_ATTEMPTS {
            let sample: Vec<Node<'a>> = index::sample(&mut self.rng, indices.len(), sample_size)
                .iter()
                .map(|i| self.item(indices[i]))
                .collect();

            let (mut left, mut right) = (Vec::new(), Vec::new());
            {
                let mut trial = self.layout.node_mut(self.trial.as_bytes_mut(), 0);
                metric.create_split(self.layout, &sample, &mut self.rng, &mut trial);
                let plane = trial.as_node();
                for &id in indices {
                    match metric.side(plane, self.layout.node(self.items, id), &mut self.rng) {
                        Side::Left => left.push(id),
                        Side::Right => right.push(id),
                    }
                }
            }
            if left.is_empty() || right.is_empty() {
                continue;
            }

            let imbalance = left.len().max(right.len()) as f64 / indices.len() as f64;
            if best.as_ref().map_or(true, |(b, _, _)| imbalance < *b) {
                self.best.as_bytes_mut().copy_from_slice(self.trial.as_bytes());
                best = Some((imbalance, left, right));
            }
            if imbalance < ACCEPT_IMBALANCE {
                break;
            }
        }

        best.filter(|(imbalance, _, _)| *imbalance <= MAX_IMBALANCE)
            .map(|(_, left, right)| (left, right))
    }
}

/// Copy a fragment into storage and return its root's global id.
fn merge(storage: &mut NodeStorage, fragment: TreeFragment, n_items: u32) -> Result<u32> {
    let layout = *storage.layout();
    let count = fragment.len();
    let base = storage.allocate(count)?;
    let delta = base - n_items;
    let leaf_capacity = layout.leaf_capacity() as u32;

    let stride = layout.stride();
    let start = base as usize * stride;
    let dst = &mut storage.region_mut()[start..start + count * stride];
    dst.copy_from_slice(fragment.slots.as_bytes());

    for slot in 0..count as u32 {
        let mut node = layout.node_mut(dst, slot);
        let header = node.header_mut();
        if header.n_descendants > leaf_capacity {
            for child in header.children.iter_mut().filter(|c| **c >= n_items) {
                *child += delta;
            }
        }
    }
    Ok(fragment.root + delta)
}

/// Build the forest over every item slot below `n_items` that holds an item,
/// appending tree nodes to `storage`. Returns the root ids in tree order.
pub(crate) fn build_forest(
    storage: &mut NodeStorage,
    n_items: u32,
    plan: &ForestPlan,
) -> Result<Vec<u32>> {
    let layout = *storage.layout();
    let active: Vec<u32> = (0..n_items)
        .filter(|&id| storage.node(id).n_descendants() == 1)
        .collect();
    if active.is_empty() {
        progress!(plan.verbose, "no items to index, built 0 trees");
        return Ok(Vec::new());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(plan.n_threads.unwrap_or(0))
        .build()?;
    let round = match plan.n_trees {
        Some(n) if n > 0 => n,
        _ => pool.current_num_threads(),
    };

    let mut roots = Vec::new();
    let mut next_tree = 0;
    'rounds: loop {
        let fragments: Vec<TreeFragment> = {
            let items = &storage.region()[..n_items as usize * layout.stride()];
            let active = &active;
            pool.install(|| {
                (next_tree..next_tree + round)
                    .into_par_iter()
                    .map(|tree| {
                        TreeBuilder::new(&layout, items, n_items, tree_seed(plan.seed, tree))
                            .build(active)
                    })
                    .collect()
            })
        };
        next_tree += round;

        for fragment in fragments {
            if plan.n_trees.map_or(true, |n| n == 0)
                && storage.len() >= 2 * n_items as usize
            {
                break 'rounds;
            }
            roots.push(merge(storage, fragment, n_items)?);
            progress!(
                plan.verbose,
                tree = roots.len(),
                nodes = storage.len(),
                "built tree"
            );
        }
        if plan.n_trees.is_some_and(|n| n > 0) {
            break;
        }
    }

    progress!(
        plan.verbose,
        trees = roots.len(),
        items = active.len(),
        nodes = storage.len(),
        "forest built"
    );
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Metric;
    use rand::Rng;

    fn filled_storage(metric: Metric, dim: usize, n: usize, seed: u64) -> NodeStorage {
        let layout = NodeLayout::new(metric, dim);
        let mut storage = NodeStorage::in_memory(layout);
        storage.allocate(n).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        for id in 0..n as u32 {
            let v: Vec<f32> = (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect();
            layout.write_item(&mut storage.node_mut(id), &v);
        }
        storage
    }

    fn plan(n_trees: Option<usize>, n_threads: Option<usize>) -> ForestPlan {
        ForestPlan {
            n_trees,
            n_threads,
            seed: 42,
            verbose: false,
        }
    }

    /// Items reachable from `id`, with a descendant-count check on the way.
    fn collect_items(storage: &NodeStorage, n_items: u32, id: u32, out: &mut Vec<u32>) {
        if id < n_items {
            out.push(id);
            return;
        }
        let node = storage.node(id);
        let k = storage.layout().leaf_capacity() as u32;
        if node.n_descendants() <= k {
            out.extend_from_slice(node.leaf_items());
            return;
        }
        let before = out.len();
        for child in node.children() {
            collect_items(storage, n_items, child, out);
        }
        assert_eq!((out.len() - before) as u32, node.n_descendants());
    }

    #[test]
    fn test_every_tree_covers_every_item_once() {
        for metric in Metric::ALL {
            let mut storage = filled_storage(metric, 8, 300, 1);
            let roots = build_forest(&mut storage, 300, &plan(Some(4), Some(2))).unwrap();
            assert_eq!(roots.len(), 4);

            for &root in &roots {
                assert!(root >= 300);
                let mut items = Vec::new();
                collect_items(&storage, 300, root, &mut items);
                items.sort_unstable();
                assert_eq!(items, (0..300).collect::<Vec<_>>(), "metric {metric}");
            }
        }
    }

    #[test]
    fn test_thread_count_does_not_change_forest() {
        let mut one = filled_storage(Metric::Angular, 6, 500, 3);
        let mut four = filled_storage(Metric::Angular, 6, 500, 3);

        let roots_one = build_forest(&mut one, 500, &plan(Some(7), Some(1))).unwrap();
        let roots_four = build_forest(&mut four, 500, &plan(Some(7), Some(4))).unwrap();

        assert_eq!(roots_one, roots_four);
        assert_eq!(one.region(), four.region());
    }

    #[test]
    fn test_heuristic_tree_count() {
        let mut storage = filled_storage(Metric::Euclidean, 4, 200, 5);
        let roots = build_forest(&mut storage, 200, &plan(None, Some(3))).unwrap();

        assert!(!roots.is_empty());
        assert!(storage.len() >= 400);

        // Same forest on a different thread count
        let mut other = filled_storage(Metric::Euclidean, 4, 200, 5);
        let other_roots = build_forest(&mut other, 200, &plan(Some(0), Some(1))).unwrap();
        assert_eq!(roots, other_roots);
    }

    #[test]
    fn test_single_item_gets_composite_root() {
        let mut storage = filled_storage(Metric::Euclidean, 3, 1, 9);
        let roots = build_forest(&mut storage, 1, &plan(Some(2), None)).unwrap();

        assert_eq!(roots, vec![1, 2]);
        assert_eq!(storage.node(1).leaf_items(), &[0]);
    }

    #[test]
    fn test_holes_are_skipped() {
        let layout = NodeLayout::new(Metric::Euclidean, 2);
        let mut storage = NodeStorage::in_memory(layout);
        storage.allocate(50).unwrap();
        for id in (0..50u32).step_by(5) {
            layout.write_item(&mut storage.node_mut(id), &[id as f32, 1.0]);
        }

        let roots = build_forest(&mut storage, 50, &plan(Some(3), None)).unwrap();
        for root in roots {
            let mut items = Vec::new();
            collect_items(&storage, 50, root, &mut items);
            items.sort_unstable();
            assert_eq!(items, (0..50).step_by(5).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_identical_vectors_terminate() {
        let layout = NodeLayout::new(Metric::Angular, 4);
        let mut storage = NodeStorage::in_memory(layout);
        storage.allocate(2000).unwrap();
        for id in 0..2000u32 {
            layout.write_item(&mut storage.node_mut(id), &[1.0, 2.0, 3.0, 4.0]);
        }

        let roots = build_forest(&mut storage, 2000, &plan(Some(2), None)).unwrap();
        let mut items = Vec::new();
        collect_items(&storage, 2000, roots[0], &mut items);
        assert_eq!(items.len(), 2000);
    }

    #[test]
    fn test_empty_forest() {
        let layout = NodeLayout::new(Metric::Manhattan, 2);
        let mut storage = NodeStorage::in_memory(layout);
        storage.allocate(10).unwrap(); // all holes
        let roots = build_forest(&mut storage, 10, &plan(None, None)).unwrap();
        assert!(roots.is_empty());
        assert_eq!(storage.len(), 10);
    }
}
