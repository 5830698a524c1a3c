//! Transfer Module - Where reconstructed output goes
//!
//! Two consumers drive the buffer manager:
//! - Disk write: whole MAC chunks are decrypted, authenticated and written to a
//!   local file; completion feeds the chunk MACs back to the transfer.
//! - Streaming: pieces are decrypted and handed straight to the reader as soon
//!   as they are combined.

mod chunk;

pub use chunk::{chunk_ceil, chunk_floor, SEGMENT_SIZE};

use crate::raid::{ChunkMacMap, FilePiece};

/// The download-to-disk side of a transfer
pub trait TransferSession {
    fn file_size(&self) -> u64;

    /// Where a previous, interrupted download left off
    fn resume_pos(&self) -> u64 {
        0
    }

    /// Decrypt the piece in place and fill in its chunk MACs
    fn decrypt_and_mac(&mut self, piece: &mut FilePiece);

    /// A piece reached the disk
    fn write_completed(&mut self, pos: u64, len: u64, chunk_macs: ChunkMacMap);
}

/// The streaming side of a transfer: a reader waiting for a byte range
pub trait DirectReadSession {
    fn file_size(&self) -> u64;

    /// Range the reader asked for, as (start, end)
    fn requested_range(&self) -> (u64, u64);

    fn decrypt(&mut self, piece: &mut FilePiece);

    /// Hand bytes at file position `pos` to the reader
    fn deliver(&mut self, pos: u64, data: &[u8]);
}

pub struct DiskWriteMode {
    session: Box<dyn TransferSession>,
    completed: u64,
}

pub struct StreamingMode {
    session: Box<dyn DirectReadSession>,
    delivered: u64,
}

/// The consumer a buffer manager produces for
pub enum OutputMode {
    DiskWrite(DiskWriteMode),
    Streaming(StreamingMode),
}

impl OutputMode {
    pub fn disk_write(session: impl TransferSession + 'static) -> Self {
        OutputMode::DiskWrite(DiskWriteMode {
            session: Box::new(session),
            completed: 0,
        })
    }

    pub fn streaming(session: impl DirectReadSession + 'static) -> Self {
        OutputMode::Streaming(StreamingMode {
            session: Box::new(session),
            delivered: 0,
        })
    }

    /// Resume position, read-to position and file size of the transfer
    pub(crate) fn bounds(&self) -> (u64, u64, u64) {
        match self {
            OutputMode::DiskWrite(mode) => {
                let size = mode.session.file_size();
                (mode.session.resume_pos().min(size), size, size)
            }
            OutputMode::Streaming(mode) => {
                let size = mode.session.file_size();
                let (start, end) = mode.session.requested_range();
                let end = end.min(size);
                (start.min(end), end, size)
            }
        }
    }

    /// Furthest position output may be released up to, given data acquired
    /// up to `acquired_pos`
    pub fn chunk_boundary_for(&self, acquired_pos: u64) -> u64 {
        match self {
            // Decryption and MACs work on whole chunks
            OutputMode::DiskWrite(_) => chunk_floor(acquired_pos),
            OutputMode::Streaming(_) => acquired_pos,
        }
    }

    /// Process a freshly combined piece before it is lent out
    pub(crate) fn finalize(&mut self, piece: &mut FilePiece) {
        match self {
            OutputMode::DiskWrite(mode) => mode.session.decrypt_and_mac(piece),
            OutputMode::Streaming(mode) => {
                mode.session.decrypt(piece);
                mode.session.deliver(piece.pos, piece.data());
            }
        }
    }

    /// The consumer finished with a lent piece
    pub(crate) fn write_completed(&mut self, piece: &mut FilePiece) {
        let len = piece.len() as u64;

        match self {
            OutputMode::DiskWrite(mode) => {
                let chunk_macs = std::mem::take(&mut piece.chunk_macs);
                tracing::debug!("Written {} bytes at {}", len, piece.pos);
                mode.session.write_completed(piece.pos, len, chunk_macs);
                mode.completed += len;
            }
            OutputMode::Streaming(mode) => mode.delivered += len,
        }
    }

    /// Bytes written to disk, or delivered to the reader
    pub fn bytes_completed(&self) -> u64 {
        match self {
            OutputMode::DiskWrite(mode) => mode.completed,
            OutputMode::Streaming(mode) => mode.delivered,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, OutputMode::Streaming(_))
    }
}
