//! Index construction parameters.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metric::Metric;
use crate::node::NODE_HEADER_SIZE;

/// Seed used when the caller never sets one, so unseeded builds still repeat.
pub const DEFAULT_SEED: u64 = 1_234_567_890;

/// Configuration for a [`ForestIndex`](crate::ForestIndex)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Vector length `f` (default: 0, must be set)
    pub dimensions: usize,

    /// Distance metric (default: angular)
    pub metric: Metric,

    /// Base seed for tree construction (default: [`DEFAULT_SEED`])
    pub seed: u64,

    /// Log build and persistence progress at info level (default: false)
    pub verbose: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimensions: 0,
            metric: Metric::Angular,
            seed: DEFAULT_SEED,
            verbose: false,
        }
    }
}

impl IndexConfig {
    pub fn new(dimensions: usize, metric: Metric) -> Self {
        Self {
            dimensions,
            metric,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimensions == 0 {
            return Err(Error::Config("dimensions must be at least 1".into()));
        }
        // Stride is stored as u32 in the file header
        let max_dimensions = (u32::MAX as usize - NODE_HEADER_SIZE) / std::mem::size_of::<f32>();
        if self.dimensions > max_dimensions {
            return Err(Error::Config(format!(
                "dimensions must be at most {max_dimensions}, got {}",
                self.dimensions
            )));
        }
        Ok(())
    }
}
