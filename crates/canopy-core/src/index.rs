//! The public index: lifecycle, persistence, and queries.
//!
//! ```text
//!            add_item*             build
//!   Empty ─────────────► Loading ─────────► Built ──save──► Mapped
//!     ▲  on_disk_build ──────▲     unbuild ───┘               │
//!     └─────────────────────────── unload ────────────────────┘
//!                   load(path) from any state ──► Mapped
//! ```
//!
//! Item lookups (`get_item_vector`, `get_distance`) work once items exist;
//! neighbor queries need a `Built` or `Mapped` index. All queries take
//! `&self`, so a built index can be shared across threads.

use std::fs;
use std::path::Path;

use crate::builder::{build_forest, ForestPlan};
use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::format::{write_index, IndexHeader};
use crate::metric::Metric;
use crate::node::{Node, NodeLayout};
use crate::search::{Neighbor, Reader};
use crate::storage::{MappedNodes, NodeRead, NodeStorage};

enum State {
    Empty,
    Loading(NodeStorage),
    Built {
        storage: NodeStorage,
        n_items: u32,
        roots: Vec<u32>,
    },
    Mapped {
        nodes: MappedNodes,
        roots: Vec<u32>,
    },
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Empty => "empty",
            State::Loading(_) => "loading",
            State::Built { .. } => "built",
            State::Mapped { .. } => "mapped",
        }
    }
}

/// Approximate nearest-neighbor index over a forest of random-projection trees.
pub struct ForestIndex {
    layout: NodeLayout,
    seed: u64,
    verbose: bool,
    state: State,
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

impl ForestIndex {
    /// Create an empty index for `dimensions`-long vectors.
    pub fn new(dimensions: usize, metric: Metric) -> Result<Self> {
        Self::with_config(IndexConfig::new(dimensions, metric))
    }

    pub fn with_config(config: IndexConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            layout: NodeLayout::new(config.metric, config.dimensions),
            seed: config.seed,
            verbose: config.verbose,
            state: State::Empty,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.layout.dimensions()
    }

    pub fn metric(&self) -> Metric {
        self.layout.metric()
    }

    /// Seed for subsequent builds. Same seed and items give the same forest.
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    /// Raise build and persistence progress logs from debug to info.
    pub fn verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Lifecycle state: `empty`, `loading`, `built`, or `mapped`.
    pub fn state(&self) -> &'static str {
        self.state.name()
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.layout.dimensions() {
            return Err(Error::DimensionMismatch {
                expected: self.layout.dimensions(),
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Store `vector` under id `item`.
    ///
    /// Ids need not be dense; skipped ids become holes that never show up in
    /// results. Re-adding an id overwrites it.
    pub fn add_item(&mut self, item: u32, vector: &[f32]) -> Result<()> {
        self.check_dimensions(vector)?;

        if matches!(self.state, State::Empty) {
            self.state = State::Loading(NodeStorage::in_memory(self.layout));
        }
        let State::Loading(storage) = &mut self.state else {
            return Err(Error::state("add items", self.state.name()));
        };

        storage.ensure_len(item as usize + 1)?;
        self.layout.write_item(&mut storage.node_mut(item), vector);
        Ok(())
    }

    /// Build nodes straight into `path` instead of memory.
    ///
    /// Must be called before any item is added. After [`build`](Self::build)
    /// the file is a complete index.
    pub fn on_disk_build(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if !matches!(self.state, State::Empty) {
            return Err(Error::state("start an on-disk build", self.state.name()));
        }
        let path = path.as_ref();
        self.state = State::Loading(NodeStorage::on_disk(self.layout, path)?);
        progress!(self.verbose, path = %path.display(), "building on disk");
        Ok(())
    }

    /// Build the forest.
    ///
    /// `n_trees` of `None` or 0 keeps adding trees until tree nodes
    /// outnumber items. `n_threads` of `None` or 0 uses every core; the
    /// resulting forest does not depend on it.
    pub fn build(&mut self, n_trees: Option<usize>, n_threads: Option<usize>) -> Result<()> {
        let mut storage = match std::mem::replace(&mut self.state, State::Empty) {
            State::Empty => NodeStorage::in_memory(self.layout),
            State::Loading(storage) => storage,
            other => {
                let state = other.name();
                self.state = other;
                return Err(Error::state("build", state));
            }
        };

        let n_items = storage.len() as u32;
        let plan = ForestPlan {
            n_trees,
            n_threads: n_threads.filter(|&n| n > 0),
            seed: self.seed,
            verbose: self.verbose,
        };

        self.layout
            .metric()
            .prepare_items(&self.layout, storage.region_mut(), n_items);

        let sealed = build_forest(&mut storage, n_items, &plan).and_then(|roots| {
            let header =
                IndexHeader::new(&self.layout, n_items, storage.len() as u32, roots.len() as u32);
            storage.seal(&header, &roots)?;
            Ok(roots)
        });
        let roots = match sealed {
            Ok(roots) => roots,
            Err(err) => {
                storage.truncate(n_items as usize);
                self.state = State::Loading(storage);
                return Err(err);
            }
        };

        self.state = State::Built {
            storage,
            n_items,
            roots,
        };
        Ok(())
    }

    /// Drop the forest so more items can be added.
    pub fn unbuild(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Empty) {
            State::Built {
                mut storage,
                n_items,
                ..
            } => {
                storage.truncate(n_items as usize);
                self.state = State::Loading(storage);
                Ok(())
            }
            State::Mapped { nodes, roots } => {
                self.state = State::Mapped { nodes, roots };
                Err(Error::state("unbuild", "mapped"))
            }
            other => {
                self.state = other;
                Ok(())
            }
        }
    }

    /// Write the built index to `path`, then serve queries from a read-only
    /// mapping of that file.
    pub fn save(&mut self, path: impl AsRef<Path>, prefault: bool) -> Result<()> {
        let path = path.as_ref();
        match &self.state {
            State::Built {
                storage,
                n_items,
                roots,
            } => {
                let already_there = storage.path().is_some_and(|p| same_file(p, path));
                if !already_there {
                    let header = IndexHeader::new(
                        &self.layout,
                        *n_items,
                        storage.len() as u32,
                        roots.len() as u32,
                    );
                    write_index(path, &header, storage.region(), roots)?;
                }
            }
            State::Mapped { nodes, roots } => {
                if !same_file(nodes.path(), path) {
                    write_index(path, nodes.header(), nodes.region(), roots)?;
                }
            }
            other => return Err(Error::state("save", other.name())),
        }

        progress!(self.verbose, path = %path.display(), "saved index");
        self.load(path, prefault)
    }

    /// Map a saved index read-only, replacing whatever this index held.
    ///
    /// A missing, truncated, or incompatible file returns an error and
    /// leaves the index untouched.
    pub fn load(&mut self, path: impl AsRef<Path>, prefault: bool) -> Result<()> {
        let path = path.as_ref();
        let nodes = MappedNodes::open(path, &self.layout, prefault)?;
        let roots = nodes.roots()?.to_vec();

        progress!(
            self.verbose,
            path = %path.display(),
            trees = roots.len(),
            items = nodes.header().n_items,
            prefault,
            "mapped index"
        );
        self.state = State::Mapped { nodes, roots };
        Ok(())
    }

    /// Release all nodes and mappings.
    pub fn unload(&mut self) {
        self.state = State::Empty;
        progress!(self.verbose, "unloaded index");
    }

    /// Item slots (max id + 1), holes included.
    pub fn get_n_items(&self) -> u32 {
        match &self.state {
            State::Empty => 0,
            State::Loading(storage) => storage.len() as u32,
            State::Built { n_items, .. } => *n_items,
            State::Mapped { nodes, .. } => nodes.header().n_items,
        }
    }

    pub fn get_n_trees(&self) -> usize {
        match &self.state {
            State::Built { roots, .. } | State::Mapped { roots, .. } => roots.len(),
            _ => 0,
        }
    }

    fn reader(&self, operation: &'static str) -> Result<Reader<'_>> {
        match &self.state {
            State::Built {
                storage,
                n_items,
                roots,
            } => Ok(Reader::new(&self.layout, storage.region(), *n_items, roots)),
            State::Mapped { nodes, roots } => Ok(Reader::new(
                &self.layout,
                nodes.region(),
                nodes.header().n_items,
                roots,
            )),
            other => Err(Error::state(operation, other.name())),
        }
    }

    fn item(&self, item: u32) -> Result<Node<'_>> {
        let (region, n_items) = match &self.state {
            State::Empty => (&[][..], 0),
            State::Loading(storage) => (storage.region(), storage.len() as u32),
            State::Built { storage, n_items, .. } => (storage.region(), *n_items),
            State::Mapped { nodes, .. } => (nodes.region(), nodes.header().n_items),
        };
        if item >= n_items {
            return Err(Error::NotFound { item, n_items });
        }
        let node = self.layout.node(region, item);
        if node.n_descendants() != 1 {
            return Err(Error::NotFound { item, n_items });
        }
        Ok(node)
    }

    /// The `n` nearest items to stored item `item`, which is its own
    /// nearest neighbor at distance 0.
    pub fn get_nns_by_item(
        &self,
        item: u32,
        n: usize,
        search_k: Option<usize>,
    ) -> Result<Vec<Neighbor>> {
        let reader = self.reader("query")?;
        let query = self.item(item)?;
        Ok(reader.search(query, n, search_k))
    }

    /// The `n` nearest items to `vector`.
    ///
    /// `search_k` bounds how many candidates are ranked; `None` or 0 means
    /// `n × trees`.
    pub fn get_nns_by_vector(
        &self,
        vector: &[f32],
        n: usize,
        search_k: Option<usize>,
    ) -> Result<Vec<Neighbor>> {
        self.check_dimensions(vector)?;
        let reader = self.reader("query")?;
        let slot = self.layout.query_slot(vector);
        Ok(reader.search(self.layout.node(slot.as_bytes(), 0), n, search_k))
    }

    pub fn get_item_vector(&self, item: u32) -> Result<Vec<f32>> {
        Ok(self.layout.read_item(self.item(item)?))
    }

    /// Reported distance between two stored items.
    pub fn get_distance(&self, i: u32, j: u32) -> Result<f32> {
        let metric = self.layout.metric();
        let distance = metric.distance(self.item(i)?, self.item(j)?);
        Ok(metric.normalized_distance(distance))
    }
}
