//! CloudRaid Core - Striped download reconstruction
//!
//! This crate provides the buffer manager that turns the bytes fetched over
//! several parallel connections back into one ordered file. Files stored in
//! "cloudraid" form are split into 5 data shards plus 1 XOR parity shard, so a
//! download can lose any single connection and still rebuild every byte.

pub mod raid;
pub mod transfer;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use raid::{
    stripe_size, ErrorVerdict, FilePiece, NextRange, RaidBufferManager, RaidError, ShardState,
};
pub use transfer::{DirectReadSession, OutputMode, TransferSession};

/// Main error type for CloudRaid operations
#[derive(Error, Debug)]
pub enum CloudRaidError {
    #[error("Raid error: {0}")]
    Raid(#[from] raid::RaidError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, CloudRaidError>;

/// Tuning knobs for a raid download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaidConfig {
    /// Maximum bytes requested by a single fetch
    pub max_request_size: u64,

    /// Stripe lines combined per read chunk
    pub lines_per_chunk: u64,

    /// A connection this many chunks ahead of its slowest peer is paused
    pub pause_chunks: u64,

    /// A paused connection resumes once its lead drops below this many chunks
    pub unpause_chunks: u64,

    /// Consecutive errors on one connection that fail the transfer
    pub max_errors: u32,
}

impl RaidConfig {
    const DEFAULT_MAX_REQUEST_SIZE: u64 = 16 * 1024 * 1024;

    /// Derive the line count from a request size: room for two chunk sets
    /// incoming and one outgoing, across all six parts.
    fn lines_for_request_size(max_request_size: u64) -> u64 {
        let lines = max_request_size / (raid::RAID_PARTS as u64 * 3 * raid::RAID_SECTOR as u64);
        lines.clamp(5 * 1024, 64 * 1024)
    }

    /// Set the maximum request size, re-deriving the lines per chunk
    pub fn with_max_request_size(mut self, size: u64) -> Self {
        self.max_request_size = size;
        self.lines_per_chunk = Self::lines_for_request_size(size);
        self
    }

    /// Set the number of stripe lines per chunk
    pub fn with_lines_per_chunk(mut self, lines: u64) -> Self {
        self.lines_per_chunk = lines;
        self
    }

    /// Set the pause/unpause hysteresis band, in chunks
    pub fn with_pause_thresholds(mut self, pause_chunks: u64, unpause_chunks: u64) -> Self {
        self.pause_chunks = pause_chunks;
        self.unpause_chunks = unpause_chunks;
        self
    }

    /// Set the per-connection error threshold
    pub fn with_max_errors(mut self, max_errors: u32) -> Self {
        self.max_errors = max_errors;
        self
    }

    /// Check the knobs are usable together
    pub fn validate(&self) -> std::result::Result<(), RaidError> {
        if self.max_request_size == 0 || self.lines_per_chunk == 0 {
            return Err(RaidError::InvalidConfig("chunk sizes must be non-zero".into()));
        }
        if self.unpause_chunks >= self.pause_chunks {
            return Err(RaidError::InvalidConfig(format!(
                "unpause threshold {} must be below pause threshold {}",
                self.unpause_chunks, self.pause_chunks
            )));
        }
        if self.max_errors == 0 {
            return Err(RaidError::InvalidConfig("error threshold must be at least 1".into()));
        }
        Ok(())
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CloudRaidError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Export to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CloudRaidError::Serialization(e.to_string()))
    }
}

impl Default for RaidConfig {
    fn default() -> Self {
        Self {
            max_request_size: Self::DEFAULT_MAX_REQUEST_SIZE,
            lines_per_chunk: Self::lines_for_request_size(Self::DEFAULT_MAX_REQUEST_SIZE),
            pause_chunks: 8,
            unpause_chunks: 4,
            max_errors: 3,
        }
    }
}
