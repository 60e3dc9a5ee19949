//! Configuration structures for index population.

use crate::error::{IndexError, Result};
use crate::page::MAX_ENTRY_SIZE;
use serde::{Deserialize, Serialize};

/// Smallest block size accepted by `PopulationConfig::validate`.
///
/// A block must always be able to hold at least one maximum-size entry
/// together with its length framing.
pub const MIN_BLOCK_SIZE: usize = 4 * 1024;

/// Tuning for block-based bulk population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulationConfig {
    /// Bytes buffered in memory per block before it is sorted and spilled.
    pub block_size: usize,
    /// Maximum number of blocks merged together in a single merge pass.
    pub merge_factor: usize,
    /// Number of scan workers, and thereby populator parts, in a partitioned population.
    pub population_workers: usize,
    /// Read-ahead buffer per block cursor during merge.
    pub read_buffer_size: usize,
    /// Sync spill files and the index file to disk before reporting completion.
    pub fsync_enabled: bool,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            block_size: 1024 * 1024,
            merge_factor: 8,
            population_workers: num_cpus().min(8),
            read_buffer_size: 64 * 1024,
            fsync_enabled: false,
        }
    }
}

impl PopulationConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(IndexError::ConfigError(format!(
                "block_size {} is below the minimum of {} bytes",
                self.block_size, MIN_BLOCK_SIZE
            )));
        }
        if self.block_size < MAX_ENTRY_SIZE + 4 {
            return Err(IndexError::ConfigError(format!(
                "block_size {} cannot hold an entry of {} bytes",
                self.block_size, MAX_ENTRY_SIZE
            )));
        }
        if self.merge_factor < 2 {
            return Err(IndexError::ConfigError(format!(
                "merge_factor must be at least 2, got {}",
                self.merge_factor
            )));
        }
        if self.population_workers == 0 {
            return Err(IndexError::ConfigError(
                "population_workers must be at least 1".to_string(),
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(IndexError::ConfigError(
                "read_buffer_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the buffer arena backing block storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Upper bound on bytes handed out at once. `None` means unbounded.
    pub max_bytes: Option<usize>,
    /// Keep released buffers for reuse.
    pub pooled: bool,
    /// Maximum number of released buffers kept in the pool.
    pub max_pooled_buffers: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            max_bytes: None,
            pooled: true,
            max_pooled_buffers: 64,
        }
    }
}

/// Settings for the space-filling curve used to order spatial keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurveSettings {
    /// Total bits of the derived curve value. Split evenly across dimensions.
    pub max_bits: u32,
    /// Half-width of the indexed extent for cartesian coordinate systems.
    pub cartesian_extent: f64,
}

impl Default for CurveSettings {
    fn default() -> Self {
        Self {
            max_bits: 60,
            cartesian_extent: 1_000_000.0,
        }
    }
}

/// Returns the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
