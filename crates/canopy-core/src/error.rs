//! Error types for index construction, persistence, and queries.

use thiserror::Error;

use crate::format::FormatError;
use crate::storage::StorageError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot {operation} while the index is {state}")]
    State {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Item {item} not found (index holds {n_items} item slots)")]
    NotFound { item: u32, n_items: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index file error: {0}")]
    Format(#[from] FormatError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Node id space exhausted: {requested} nodes requested")]
    Capacity { requested: u64 },

    #[error("Failed to start build workers: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
    /// Whether the caller can reasonably retry or fall back after this error.
    ///
    /// Load/save failures and misuse of the lifecycle leave the index intact.
    /// Storage failures during an on-disk build and id-space exhaustion do not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::State { .. }
            | Error::DimensionMismatch { .. }
            | Error::NotFound { .. }
            | Error::Io(_)
            | Error::Format(_)
            | Error::Config(_)
            | Error::UnknownMetric(_) => true,
            Error::Storage(_) | Error::Capacity { .. } | Error::ThreadPool(_) => false,
        }
    }

    pub(crate) fn state(operation: &'static str, state: &'static str) -> Self {
        Error::State { operation, state }
    }
}
