//! File pieces - owned byte buffers tagged with their file position

use std::collections::BTreeMap;

/// Extra capacity kept after the data so ciphers can process whole blocks in place
pub const CIPHER_PAD: usize = 16;

/// Partial authentication state of one MAC chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkMac {
    /// Running MAC value
    pub mac: [u8; 16],

    /// Bytes of the chunk covered so far
    pub offset: u32,

    /// Whole chunk covered
    pub finished: bool,
}

/// Chunk start position -> authentication state
pub type ChunkMacMap = BTreeMap<u64, ChunkMac>;

/// A run of file (or shard) bytes starting at `pos`.
///
/// Not `Clone`: a piece has exactly one owner, moving from the network to the
/// buffer manager on submit and staying there until the consumer completes it.
#[derive(Debug, Default)]
pub struct FilePiece {
    /// Position of the first byte, in the file or (for raid input) in the shard
    pub pos: u64,

    buf: Vec<u8>,

    /// Authentication state for the chunks this piece touches
    pub chunk_macs: ChunkMacMap,
}

impl FilePiece {
    /// Takes ownership of `data`
    pub fn new(pos: u64, mut data: Vec<u8>) -> Self {
        data.reserve(CIPHER_PAD);
        Self {
            pos,
            buf: data,
            chunk_macs: ChunkMacMap::new(),
        }
    }

    /// A zero-filled piece of `len` bytes
    pub fn with_len(pos: u64, len: usize) -> Self {
        let mut buf = Vec::with_capacity(len + CIPHER_PAD);
        buf.resize(len, 0);
        Self {
            pos,
            buf,
            chunk_macs: ChunkMacMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Position just past the last byte
    pub fn end(&self) -> u64 {
        self.pos + self.buf.len() as u64
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Give up the piece, keeping its bytes
    pub fn into_data(self) -> Vec<u8> {
        self.buf
    }

    /// Drop `n` bytes from the front
    pub(crate) fn advance(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
        self.pos += n as u64;
    }

    /// Keep only the first `len` bytes
    pub(crate) fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Split at `at`, returning the tail as a new piece
    pub(crate) fn split_off(&mut self, at: usize) -> FilePiece {
        let tail = self.buf.split_off(at);
        FilePiece::new(self.pos + at as u64, tail)
    }
}

/// Free list of byte buffers, so output pieces reuse released allocations
#[derive(Debug)]
pub struct PiecePool {
    free: Vec<Vec<u8>>,
    max_free: usize,
}

impl PiecePool {
    pub fn new(max_free: usize) -> Self {
        Self {
            free: Vec::new(),
            max_free,
        }
    }

    /// A zero-filled piece of `len` bytes, reusing a released buffer if one is large enough
    pub fn take(&mut self, pos: u64, len: usize) -> FilePiece {
        let reusable = self
            .free
            .iter()
            .position(|b| b.capacity() >= len + CIPHER_PAD);

        match reusable {
            Some(i) => {
                let mut buf = self.free.swap_remove(i);
                buf.clear();
                buf.resize(len, 0);
                FilePiece {
                    pos,
                    buf,
                    chunk_macs: ChunkMacMap::new(),
                }
            }
            None => FilePiece::with_len(pos, len),
        }
    }

    /// Return a piece's buffer to the pool
    pub fn give_back(&mut self, piece: FilePiece) {
        if self.free.len() < self.max_free && piece.buf.capacity() > 0 {
            self.free.push(piece.buf);
        }
    }

    /// Number of buffers waiting for reuse
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

impl Default for PiecePool {
    fn default() -> Self {
        Self::new(8)
    }
}
