//! Raid Module - Reconstruction of cloudraid downloads
//!
//! Collects the pieces fetched on each connection, rebuilds the file from the
//! 5 data shards (using the parity shard when one is missing), and plans the
//! next byte range for every connection.

mod manager;
mod piece;
mod planner;
mod recovery;
mod shard;
mod stripe;

pub use manager::RaidBufferManager;
pub use piece::{ChunkMac, ChunkMacMap, FilePiece, PiecePool, CIPHER_PAD};
pub use planner::NextRange;
pub use recovery::ErrorVerdict;
pub use shard::ShardState;
pub use stripe::{combine_last_line, encode_stripes, recover_sector, stripe_size};

use thiserror::Error;

/// Number of parts a raid file is split into (5 data + 1 parity)
pub const RAID_PARTS: usize = 6;

/// Number of data parts
pub const DATA_PARTS: usize = RAID_PARTS - 1;

/// Index of the parity part
pub const PARITY_PART: usize = DATA_PARTS;

/// Parity granularity, in bytes
pub const RAID_SECTOR: usize = 16;

/// One sector from each data part
pub const RAID_LINE: usize = DATA_PARTS * RAID_SECTOR;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaidError {
    #[error("Expected 6 (raid) or 1 (non-raid) sources, got {0}")]
    InvalidSourceCount(usize),

    #[error("Raid mode was already decided for this transfer")]
    RaidAlreadyKnown,

    #[error("Raid mode has not been decided yet")]
    RaidNotKnown,

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid connection number: {0}")]
    InvalidConnection(usize),

    #[error("Piece at {got} for shard {shard} does not follow buffered data ending at {expected}")]
    OutOfOrderSubmit { shard: usize, expected: u64, got: u64 },

    #[error("Piece of {len} bytes for shard {shard} is not sector aligned")]
    MisalignedPiece { shard: usize, len: usize },

    #[error("No output buffer is borrowed on connection {0}")]
    BufferNotBorrowed(usize),

    #[error("Shard {shard} failed after {errors} consecutive errors")]
    ShardFailed { shard: usize, errors: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RaidError {
    /// Whether this error ends the transfer (as opposed to a caller bug)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RaidError::InvalidSourceCount(_) | RaidError::ShardFailed { .. }
        )
    }
}
