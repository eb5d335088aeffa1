//! Canopy Core – Random-projection forest, node storage, and SIMD distance kernels
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ForestIndex (lifecycle)                    │
//! │      add · build · unbuild · save · load · query            │
//! ├─────────────────────────────────────────────────────────────┤
//! │      Tree builder (rayon)   ·   Best-first forest search    │
//! ├─────────────────────────────────────────────────────────────┤
//! │     Metrics: angular · euclidean · manhattan · dot · hamming│
//! ├─────────────────────────────────────────────────────────────┤
//! │   NodeStorage: heap arena · on-disk build · mmap (.cnp v1)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

/// Log at info when `$verbose` is set, otherwise at debug.
macro_rules! progress {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

mod builder;
pub mod config;
pub mod error;
pub mod format;
pub mod index;
pub mod metric;
pub mod node;
mod search;
pub mod simd;
pub mod storage;
mod visited;

pub use config::{IndexConfig, DEFAULT_SEED};
pub use error::{Error, Result};
pub use format::{FormatError, IndexHeader};
pub use index::ForestIndex;
pub use metric::Metric;
pub use search::Neighbor;
pub use storage::StorageError;
