//! Canopy: approximate nearest-neighbor search over a forest of
//! random-projection trees
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ForestIndex (canopy)                     │
//! │       add_item → build → get_nns_by_{item,vector}           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Tree builder / searcher                    │
//! │         Random hyperplane splits, best-first descent        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 NodeStorage (heap or mmap)                  │
//! │            Fixed-stride slots, zero-copy .cnp files         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ```no_run
//! use canopy::{ForestIndex, Metric};
//!
//! let mut index = ForestIndex::new(3, Metric::Angular)?;
//! index.add_item(0, &[0.0, 0.0, 1.0])?;
//! index.add_item(1, &[0.0, 1.0, 0.0])?;
//! index.build(Some(10), None)?;
//! index.save("test.cnp", false)?;
//!
//! let nearest = index.get_nns_by_vector(&[0.0, 0.9, 0.1], 1, None)?;
//! assert_eq!(nearest[0].id, 1);
//! # Ok::<(), canopy::Error>(())
//! ```

pub use canopy_core::{
    config, error, format, index, metric, node, simd, storage, Error, FormatError, ForestIndex,
    IndexConfig, IndexHeader, Metric, Neighbor, Result, StorageError, DEFAULT_SEED,
};
