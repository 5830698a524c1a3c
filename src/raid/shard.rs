//! Per-shard accumulation of fetched pieces

use std::borrow::Cow;
use std::collections::{BTreeMap, VecDeque};

use super::piece::{FilePiece, PiecePool};

/// Where a shard's connection stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    /// Fetching normally
    Active,

    /// Too far ahead of its peers; waiting for them
    Paused,

    /// Dropped after an error; its data is rebuilt from parity
    Excluded,

    /// Hit the error threshold; the transfer is over
    Failed,
}

/// Everything known about one of the 6 parts (or the whole file, for non-raid)
#[derive(Debug)]
pub(crate) struct Shard {
    pub(crate) index: usize,

    /// Offset within the shard up to which data has been requested
    pub(crate) request_pos: u64,

    /// Received pieces, contiguous from the combine point
    queue: VecDeque<FilePiece>,

    /// Bytes of the front piece already combined
    front_offset: usize,

    /// Pieces kept back after a failover, keyed by position
    recovery: BTreeMap<u64, FilePiece>,

    pub(crate) error_count: u32,
    pub(crate) paused: bool,
    pub(crate) excluded: bool,
    pub(crate) failed: bool,
}

impl Shard {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            request_pos: 0,
            queue: VecDeque::new(),
            front_offset: 0,
            recovery: BTreeMap::new(),
            error_count: 0,
            paused: false,
            excluded: false,
            failed: false,
        }
    }

    pub(crate) fn state(&self) -> ShardState {
        if self.failed {
            ShardState::Failed
        } else if self.excluded {
            ShardState::Excluded
        } else if self.paused {
            ShardState::Paused
        } else {
            ShardState::Active
        }
    }

    /// Bytes queued beyond the combine point
    pub(crate) fn queued_len(&self) -> u64 {
        let total: usize = self.queue.iter().map(|p| p.len()).sum();
        (total - self.front_offset) as u64
    }

    /// End of the data buffered contiguously from `base` (the combine point)
    pub(crate) fn contiguous_end(&self, base: u64) -> u64 {
        self.queue.back().map_or(base, |p| p.end())
    }

    pub(crate) fn push(&mut self, piece: FilePiece) {
        if piece.is_empty() {
            return;
        }
        self.request_pos = self.request_pos.max(piece.end());
        self.queue.push_back(piece);
    }

    /// Keep a piece that does not (yet) follow the queue
    pub(crate) fn stash(&mut self, piece: FilePiece, pool: &mut PiecePool) {
        if piece.is_empty() {
            return;
        }
        // Keep the longer of two pieces starting at the same place
        match self.recovery.get(&piece.pos) {
            Some(existing) if existing.len() >= piece.len() => pool.give_back(piece),
            _ => {
                if let Some(old) = self.recovery.insert(piece.pos, piece) {
                    pool.give_back(old);
                }
            }
        }
    }

    /// The next `n` queued bytes; borrowed when they sit in a single piece
    pub(crate) fn read_front(&self, n: usize) -> Cow<'_, [u8]> {
        if let Some(front) = self.queue.front() {
            let avail = &front.data()[self.front_offset..];
            if avail.len() >= n {
                return Cow::Borrowed(&avail[..n]);
            }
        }

        let mut out = Vec::with_capacity(n);
        let mut skip = self.front_offset;
        for piece in &self.queue {
            if out.len() == n {
                break;
            }
            let data = &piece.data()[skip..];
            skip = 0;
            let take = (n - out.len()).min(data.len());
            out.extend_from_slice(&data[..take]);
        }
        Cow::Owned(out)
    }

    /// Discard `n` combined bytes from the front of the queue
    pub(crate) fn roll(&mut self, mut n: usize, pool: &mut PiecePool) {
        while n > 0 {
            let Some(front) = self.queue.front() else {
                break;
            };
            let avail = front.len() - self.front_offset;
            if n >= avail {
                n -= avail;
                self.front_offset = 0;
                if let Some(done) = self.queue.pop_front() {
                    pool.give_back(done);
                }
            } else {
                self.front_offset += n;
                n = 0;
            }
        }
    }

    /// Move every queued piece into the recovery store
    pub(crate) fn drain_to_recovery(&mut self, pool: &mut PiecePool) {
        let offset = std::mem::take(&mut self.front_offset);
        let mut first = true;

        while let Some(mut piece) = self.queue.pop_front() {
            if first {
                piece.advance(offset);
                first = false;
            }
            self.stash(piece, pool);
        }
    }

    /// Move recovery pieces that continue the queue into it. Pieces wholly
    /// before the queue end are dropped; one straddling it is trimmed.
    /// Returns whether any data was added.
    pub(crate) fn absorb_recovery(&mut self, base: u64, pool: &mut PiecePool) -> bool {
        let mut absorbed = false;

        loop {
            let end = self.contiguous_end(base);
            let Some(pos) = self.recovery.range(..=end).next_back().map(|(pos, _)| *pos) else {
                break;
            };
            let Some(mut piece) = self.recovery.remove(&pos) else {
                break;
            };

            if piece.end() <= end {
                pool.give_back(piece);
                continue;
            }

            piece.advance((end - piece.pos) as usize);
            self.push(piece);
            absorbed = true;
        }

        self.request_pos = self.request_pos.max(self.contiguous_end(base));
        absorbed
    }

    /// Start of the first recovery piece at or after `pos`
    pub(crate) fn next_recovery_start(&self, pos: u64) -> Option<u64> {
        self.recovery.range(pos..).next().map(|(start, _)| *start)
    }

    /// First position at or after `pos` not already held in the recovery store
    pub(crate) fn skip_recovered(&self, mut pos: u64) -> u64 {
        while let Some(end) = self
            .recovery
            .range(..=pos)
            .map(|(_, piece)| piece.end())
            .filter(|end| *end > pos)
            .max()
        {
            pos = end;
        }
        pos
    }

    /// Move the request cursor back to the first byte not held in the queue
    /// or the recovery store
    pub(crate) fn rewind_cursor(&mut self, base: u64) {
        self.request_pos = self.skip_recovered(self.contiguous_end(base));
    }

    pub(crate) fn recovery_len(&self) -> usize {
        self.recovery.len()
    }

    /// Release every buffered piece
    pub(crate) fn clear(&mut self, pool: &mut PiecePool) {
        for piece in self.queue.drain(..) {
            pool.give_back(piece);
        }
        for (_, piece) in std::mem::take(&mut self.recovery) {
            pool.give_back(piece);
        }
        self.front_offset = 0;
    }
}
