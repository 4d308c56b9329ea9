//! Transfer configuration.
//!
//! Strongly-typed configuration for the read-prefetch and streaming-write
//! paths, loaded from:
//! 1. a `blobfs.toml` file (base configuration)
//! 2. environment variables (prefixed with `BLOBFS_`)
//!
//! Every knob the core recognizes is a field below; there are no hidden
//! settings. Parsing and semantic validation are separate steps: serde
//! defaults fill missing fields, [`TransferConfig::validate`] enforces the
//! runtime invariants (block size at least 1 MiB, a sane window shape).

use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest block size the prefetcher accepts at runtime.
pub const MIN_BLOCK_SIZE_BYTES: u64 = 1024 * 1024;

/// Configuration-loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment extraction failed.
    #[error(transparent)]
    Extract(#[from] Box<figment::Error>),

    /// Parsed values violate a semantic constraint.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Knobs for the per-handle transfer pipelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Block size in bytes, the unit of both prefetch and upload.
    #[serde(default = "default_prefetch_block_size_bytes")]
    pub prefetch_block_size_bytes: u64,

    /// Hard ceiling on in-flight prefetched blocks per handle.
    #[serde(default = "default_max_prefetch_block_cnt")]
    pub max_prefetch_block_cnt: usize,

    /// Window size a fresh read position starts with.
    #[serde(default = "default_initial_prefetch_block_cnt")]
    pub initial_prefetch_block_cnt: usize,

    /// Blocks a newly opened handle reserves from the global budget.
    #[serde(default = "default_min_blocks_per_handle")]
    pub min_blocks_per_handle: usize,

    /// Random seeks tolerated before the reader asks for a fallback.
    #[serde(default = "default_random_seek_threshold")]
    pub random_seek_threshold: u32,

    /// Per-chunk upload timeout handed to the store writer, in seconds.
    #[serde(default = "default_chunk_transfer_timeout_secs")]
    pub chunk_transfer_timeout_secs: u64,

    /// Total retry deadline for one upload chunk, in seconds.
    #[serde(default = "default_chunk_retry_deadline_secs")]
    pub chunk_retry_deadline_secs: u64,
}

fn default_prefetch_block_size_bytes() -> u64 {
    8 * 1024 * 1024
}

fn default_max_prefetch_block_cnt() -> usize {
    20
}

fn default_initial_prefetch_block_cnt() -> usize {
    2
}

fn default_min_blocks_per_handle() -> usize {
    2
}

fn default_random_seek_threshold() -> u32 {
    3
}

fn default_chunk_transfer_timeout_secs() -> u64 {
    10
}

fn default_chunk_retry_deadline_secs() -> u64 {
    30
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            prefetch_block_size_bytes: default_prefetch_block_size_bytes(),
            max_prefetch_block_cnt: default_max_prefetch_block_cnt(),
            initial_prefetch_block_cnt: default_initial_prefetch_block_cnt(),
            min_blocks_per_handle: default_min_blocks_per_handle(),
            random_seek_threshold: default_random_seek_threshold(),
            chunk_transfer_timeout_secs: default_chunk_transfer_timeout_secs(),
            chunk_retry_deadline_secs: default_chunk_retry_deadline_secs(),
        }
    }
}

impl TransferConfig {
    /// Load from `blobfs.toml` and `BLOBFS_`-prefixed environment
    /// variables, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("blobfs.toml")
    }

    /// Load from a specific TOML file plus the environment, then validate.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("BLOBFS_"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Enforce the semantic constraints the pipelines rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch_block_size_bytes < MIN_BLOCK_SIZE_BYTES {
            return Err(ConfigError::Invalid(format!(
                "prefetch_block_size_bytes must be at least {MIN_BLOCK_SIZE_BYTES} (got {})",
                self.prefetch_block_size_bytes
            )));
        }
        if self.max_prefetch_block_cnt == 0 {
            return Err(ConfigError::Invalid(
                "max_prefetch_block_cnt must be positive".to_owned(),
            ));
        }
        if self.initial_prefetch_block_cnt == 0 {
            return Err(ConfigError::Invalid(
                "initial_prefetch_block_cnt must be positive".to_owned(),
            ));
        }
        if self.initial_prefetch_block_cnt > self.max_prefetch_block_cnt {
            return Err(ConfigError::Invalid(format!(
                "initial_prefetch_block_cnt ({}) exceeds max_prefetch_block_cnt ({})",
                self.initial_prefetch_block_cnt, self.max_prefetch_block_cnt
            )));
        }
        if self.chunk_transfer_timeout_secs == 0 || self.chunk_retry_deadline_secs == 0 {
            return Err(ConfigError::Invalid(
                "chunk timeouts must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    /// Block size as a `usize`.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.prefetch_block_size_bytes as usize
    }

    /// Number of blocks needed to cover an object of `size` bytes.
    #[must_use]
    pub fn blocks_in_object(&self, size: u64) -> u64 {
        size.div_ceil(self.prefetch_block_size_bytes)
    }

    /// Per-chunk upload timeout.
    #[must_use]
    pub fn chunk_transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_transfer_timeout_secs)
    }

    /// Total retry deadline for one chunk.
    #[must_use]
    pub fn chunk_retry_deadline(&self) -> Duration {
        Duration::from_secs(self.chunk_retry_deadline_secs)
    }
}
