//! Raid Buffer Manager - turns fetched pieces into ordered output
//!
//! For non-raid files the single connection's pieces pass straight through.
//! For raid files, pieces are queued per part until every part in use holds
//! the same stretch of data, which is then interleaved back into file order
//! (rebuilding the excluded part, if any, from parity).
//!
//! Output is lent out per connection: `output_buffer` hands out at most one
//! piece per connection and `buffer_write_completed` takes it back.

use std::collections::HashMap;

use super::piece::{FilePiece, PiecePool};
use super::shard::{Shard, ShardState};
use super::stripe::{combine_last_line, recover_sector, stripe_size};
use super::{RaidError, DATA_PARTS, RAID_LINE, RAID_PARTS, RAID_SECTOR};
use crate::transfer::OutputMode;
use crate::RaidConfig;

/// How much one combine step takes from the input queues
#[derive(Debug, Clone, Copy)]
struct CombinePlan {
    /// Bytes taken from each part in use (raid), or from the single queue
    parts_len: usize,

    /// File bytes of the final partial stripe line, when it is included
    last_line_len: usize,
}

/// Buffer manager for one download, raid or not
pub struct RaidBufferManager {
    config: RaidConfig,
    mode: OutputMode,

    raid_known: bool,
    is_raid: bool,
    failure: Option<RaidError>,

    /// 6 entries for a raid file, 1 otherwise
    temp_urls: Vec<String>,

    /// End of the data the client asked for
    deliver_limit: u64,

    /// End of the data needed to deliver that (up to the next stripe line)
    acquire_limit: u64,

    file_size: u64,

    pub(super) shards: [Shard; RAID_PARTS],

    /// The part currently rebuilt from parity instead of fetched
    pub(super) excluded: Option<usize>,

    /// Raid: offset in every part where the input queues begin.
    /// Non-raid: file position where the single queue begins.
    pub(super) shard_pos: u64,

    /// File position of the next output (the leftover piece starts here)
    output_pos: u64,

    /// Bytes before the resume point that the first combine still produces
    resume_skip: usize,

    /// Combined bytes held back until a chunk boundary is reached
    leftover: Option<FilePiece>,

    /// Output lent to each connection
    output_buffers: HashMap<usize, FilePiece>,

    pub(super) pool: PiecePool,
}

impl RaidBufferManager {
    /// Create a manager; raid-ness is decided later by `set_is_raid` or `start`
    pub fn new(config: RaidConfig, mode: OutputMode) -> Result<Self, RaidError> {
        config.validate()?;

        Ok(Self {
            config,
            mode,
            raid_known: false,
            is_raid: false,
            failure: None,
            temp_urls: Vec::new(),
            deliver_limit: 0,
            acquire_limit: 0,
            file_size: 0,
            shards: std::array::from_fn(Shard::new),
            excluded: None,
            shard_pos: 0,
            output_pos: 0,
            resume_skip: 0,
            leftover: None,
            output_buffers: HashMap::new(),
            pool: PiecePool::default(),
        })
    }

    /// Decide raid-ness from the source list, using the range and file size
    /// the output mode's session reports
    pub fn start(&mut self, temp_urls: Vec<String>) -> Result<(), RaidError> {
        let (resume_pos, read_to_pos, file_size) = self.mode.bounds();
        self.set_is_raid(temp_urls, resume_pos, read_to_pos, file_size)
    }

    /// Decide raid-ness (6 sources) or not (1 source). Can only happen once.
    pub fn set_is_raid(
        &mut self,
        temp_urls: Vec<String>,
        resume_pos: u64,
        read_to_pos: u64,
        file_size: u64,
    ) -> Result<(), RaidError> {
        if self.raid_known {
            return Err(RaidError::RaidAlreadyKnown);
        }

        let count = temp_urls.len();
        if count != RAID_PARTS && count != 1 {
            let err = RaidError::InvalidSourceCount(count);
            self.fail_transfer(err.clone());
            return Err(err);
        }

        if resume_pos > read_to_pos || read_to_pos > file_size {
            return Err(RaidError::InvalidRange(format!(
                "resume {} / read to {} / file size {}",
                resume_pos, read_to_pos, file_size
            )));
        }

        self.temp_urls = temp_urls;
        self.raid_known = true;
        self.is_raid = count == RAID_PARTS;
        self.file_size = file_size;
        self.deliver_limit = read_to_pos;

        if self.is_raid {
            let line = RAID_LINE as u64;
            self.acquire_limit = read_to_pos
                .div_ceil(line)
                .saturating_mul(line)
                .min(file_size);

            // Start reading on a sector boundary and skip output up to the resume point
            let part_pos = resume_pos / DATA_PARTS as u64;
            self.shard_pos = part_pos - part_pos % RAID_SECTOR as u64;
            self.output_pos = self.shard_pos * DATA_PARTS as u64;
            self.resume_skip = (resume_pos - self.output_pos) as usize;

            for shard in &mut self.shards {
                shard.request_pos = self.shard_pos;
            }
        } else {
            self.acquire_limit = read_to_pos;
            self.shard_pos = resume_pos;
            self.output_pos = resume_pos;
            self.resume_skip = 0;
            self.shards[0].request_pos = resume_pos;
        }

        tracing::info!(
            "Transfer is {}: resume {}, deliver to {}, acquire to {}, file size {}",
            if self.is_raid { "raid" } else { "non-raid" },
            resume_pos,
            self.deliver_limit,
            self.acquire_limit,
            file_size
        );

        Ok(())
    }

    pub fn is_raid(&self) -> bool {
        self.is_raid
    }

    pub fn is_raid_known(&self) -> bool {
        self.raid_known
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// The terminal error, once the transfer has failed
    pub fn failure(&self) -> Option<&RaidError> {
        self.failure.as_ref()
    }

    /// In case URLs expire: swap them in and restart every connection from the
    /// end of the data it has buffered. Requests in flight are abandoned.
    pub fn update_urls_and_reset_pos(&mut self, temp_urls: Vec<String>) -> Result<(), RaidError> {
        self.check_live()?;

        if temp_urls.len() != self.temp_urls.len() {
            let err = RaidError::InvalidSourceCount(temp_urls.len());
            self.fail_transfer(err.clone());
            return Err(err);
        }
        self.temp_urls = temp_urls;

        let base = self.shard_pos;
        let in_use = if self.is_raid { RAID_PARTS } else { 1 };
        for shard in &mut self.shards[..in_use] {
            shard.rewind_cursor(base);
        }

        tracing::info!("Source URLs refreshed, restarting from part position {}", base);
        Ok(())
    }

    /// Source for a connection (the single source for non-raid)
    pub fn temp_url(&self, connection: usize) -> Option<&str> {
        if self.is_raid {
            self.temp_urls.get(connection).map(String::as_str)
        } else {
            self.temp_urls.first().map(String::as_str)
        }
    }

    pub fn temp_urls(&self) -> &[String] {
        &self.temp_urls
    }

    /// Hand a fetched piece to the manager. For raid, `piece.pos` is the
    /// offset within the connection's part; otherwise it is the file position.
    pub fn submit_buffer(&mut self, connection: usize, piece: FilePiece) -> Result<(), RaidError> {
        self.check_live()?;
        self.check_connection(connection)?;

        if !self.is_raid {
            let fetched = !piece.is_empty();
            self.accept_in_order(0, piece)?;
            if fetched {
                self.shards[0].error_count = 0;
            }
            return Ok(());
        }

        let part_len = stripe_size(connection, self.acquire_limit);
        if piece.end() > part_len {
            return Err(RaidError::InvalidRange(format!(
                "piece {}..{} beyond part {} length {}",
                piece.pos,
                piece.end(),
                connection,
                part_len
            )));
        }
        if piece.len() % RAID_SECTOR != 0 && piece.end() != part_len {
            return Err(RaidError::MisalignedPiece {
                shard: connection,
                len: piece.len(),
            });
        }

        if piece.is_empty() {
            return Ok(());
        }

        if self.shards[connection].excluded {
            // Bytes already rebuilt from parity, or already kept, do not count as a fetch
            let shard = &self.shards[connection];
            let needed_from = shard.skip_recovered(piece.pos.max(self.shard_pos));
            if piece.end() <= needed_from {
                return Err(RaidError::OutOfOrderSubmit {
                    shard: connection,
                    expected: needed_from,
                    got: piece.pos,
                });
            }

            // A successful fetch brings the part back into use
            self.shards[connection].error_count = 0;
            self.shards[connection].stash(piece, &mut self.pool);
            self.readmit(connection);
            return Ok(());
        }

        self.accept_in_order(connection, piece)?;
        self.shards[connection].error_count = 0;
        Ok(())
    }

    fn accept_in_order(&mut self, index: usize, mut piece: FilePiece) -> Result<(), RaidError> {
        if piece.is_empty() {
            return Ok(());
        }

        let base = self.shard_pos;
        let shard = &mut self.shards[index];
        let expected = shard.contiguous_end(base);

        if piece.end() <= expected {
            return Err(RaidError::OutOfOrderSubmit {
                shard: index,
                expected,
                got: piece.pos,
            });
        }

        if piece.pos > expected {
            // Ahead of the queue: keep it until the gap is filled
            shard.stash(piece, &mut self.pool);
            return Ok(());
        }

        piece.advance((expected - piece.pos) as usize);
        shard.push(piece);
        shard.absorb_recovery(base, &mut self.pool);
        Ok(())
    }

    /// Combine whatever input is available into an output piece lent to
    /// `connection`. Returns whether a new piece was produced; does nothing
    /// while the connection still holds one.
    pub fn combine(&mut self, connection: usize) -> Result<bool, RaidError> {
        self.check_live()?;
        self.check_connection(connection)?;

        if self.output_buffers.contains_key(&connection) {
            return Ok(false);
        }

        while let Some(plan) = self.plan_combine() {
            let Some(mut out) = self.combine_step(plan) else {
                continue;
            };

            self.mode.finalize(&mut out);
            tracing::debug!(
                "Output for connection {}: {} bytes at {}",
                connection,
                out.len(),
                out.pos
            );
            self.output_buffers.insert(connection, out);
            return Ok(true);
        }

        Ok(false)
    }

    /// Output lent to `connection`, combining a new piece if it has none.
    /// The manager keeps ownership until `buffer_write_completed`.
    pub fn output_buffer(&mut self, connection: usize) -> Result<Option<&FilePiece>, RaidError> {
        self.combine(connection)?;
        Ok(self.output_buffers.get(&connection))
    }

    /// The consumer is done with the piece lent to `connection`
    pub fn buffer_write_completed(&mut self, connection: usize, success: bool) -> Result<(), RaidError> {
        let Some(mut piece) = self.output_buffers.remove(&connection) else {
            return Err(RaidError::BufferNotBorrowed(connection));
        };

        if success {
            self.mode.write_completed(&mut piece);
        } else {
            tracing::warn!(
                "Output at {} ({} bytes) on connection {} was not written",
                piece.pos,
                piece.len(),
                connection
            );
        }

        self.pool.give_back(piece);
        Ok(())
    }

    fn plan_combine(&self) -> Option<CombinePlan> {
        let cap = self.request_len();

        if !self.is_raid {
            let parts_len = self.shards[0].queued_len().min(cap);
            return (parts_len > 0).then_some(CombinePlan {
                parts_len: parts_len as usize,
                last_line_len: 0,
            });
        }

        let sector = RAID_SECTOR as u64;
        let line = RAID_LINE as u64;
        let full_lines_end = self.acquire_limit / line * sector;

        let available = self
            .shards
            .iter()
            .filter(|s| !s.excluded)
            .map(|s| s.queued_len())
            .min()
            .unwrap_or(0);

        let mut parts_len = available
            .min(full_lines_end.saturating_sub(self.shard_pos))
            .min(cap);
        parts_len -= parts_len % sector;

        // The final partial line goes in once every part in use holds its tail
        let take_last_line = self.acquire_limit % line != 0
            && self.shard_pos + parts_len == full_lines_end
            && self.shards.iter().filter(|s| !s.excluded).all(|s| {
                s.queued_len()
                    >= stripe_size(s.index, self.acquire_limit).saturating_sub(self.shard_pos)
            });
        let last_line_len = if take_last_line {
            (self.acquire_limit % line) as usize
        } else {
            0
        };

        (parts_len > 0 || last_line_len > 0).then_some(CombinePlan {
            parts_len: parts_len as usize,
            last_line_len,
        })
    }

    /// Run one combine step. Returns the output piece, or `None` when all of
    /// it went to the resume skip or the leftover.
    fn combine_step(&mut self, plan: CombinePlan) -> Option<FilePiece> {
        let carry = self.leftover.as_ref().map_or(0, FilePiece::len);
        let lines_len = if self.is_raid {
            plan.parts_len * DATA_PARTS
        } else {
            plan.parts_len
        };

        let mut out = self
            .pool
            .take(self.output_pos, carry + lines_len + plan.last_line_len);
        if let Some(leftover) = self.leftover.take() {
            out.data_mut()[..carry].copy_from_slice(leftover.data());
            self.pool.give_back(leftover);
        }

        if self.is_raid {
            let (lines, last) = out.data_mut()[carry..].split_at_mut(lines_len);
            self.combine_lines(lines, plan.parts_len);
            if plan.last_line_len > 0 {
                self.combine_last(last);
            }
        } else {
            self.pass_through(&mut out.data_mut()[carry..], plan.parts_len);
        }

        let acquired_end = out.end();
        let reached_end = acquired_end >= self.acquire_limit;

        if self.resume_skip > 0 {
            let n = self.resume_skip.min(out.len());
            out.advance(n);
            self.resume_skip -= n;
        }

        if reached_end {
            if out.end() > self.deliver_limit {
                out.truncate(self.deliver_limit.saturating_sub(out.pos) as usize);
            }
        } else {
            // Only release up to a boundary the output mode can process
            let boundary = self
                .mode
                .chunk_boundary_for(acquired_end)
                .clamp(out.pos, out.end());
            if boundary < out.end() {
                let tail = out.split_off((boundary - out.pos) as usize);
                tracing::debug!("Holding back {} bytes at {}", tail.len(), tail.pos);
                self.leftover = Some(tail);
            }
        }

        let held = self.leftover.as_ref().map_or(0, FilePiece::len) as u64;
        self.output_pos = acquired_end - held;

        if out.is_empty() {
            self.pool.give_back(out);
            return None;
        }
        Some(out)
    }

    /// Interleave `parts_len` bytes of whole lines from every part into `dest`
    fn combine_lines(&mut self, dest: &mut [u8], parts_len: usize) {
        {
            let fronts: [Option<_>; RAID_PARTS] = std::array::from_fn(|i| {
                let shard = &self.shards[i];
                (!shard.excluded).then(|| shard.read_front(parts_len))
            });
            let inputs: [Option<&[u8]>; RAID_PARTS] = std::array::from_fn(|i| fronts[i].as_deref());

            let mut sectors = dest.chunks_exact_mut(RAID_SECTOR);
            for offset in (0..parts_len).step_by(RAID_SECTOR) {
                for input in &inputs[..DATA_PARTS] {
                    let Some(sector) = sectors.next() else {
                        break;
                    };
                    match input {
                        Some(data) => sector.copy_from_slice(&data[offset..offset + RAID_SECTOR]),
                        None => recover_sector(sector, &inputs, offset),
                    }
                }
            }
        }

        for shard in self.shards.iter_mut().filter(|s| !s.excluded) {
            shard.roll(parts_len, &mut self.pool);
        }
        self.shard_pos += parts_len as u64;
    }

    /// Fill `dest` with the final partial line, each part contributing its short tail
    fn combine_last(&mut self, dest: &mut [u8]) {
        let tail_lens: [usize; RAID_PARTS] = std::array::from_fn(|i| {
            stripe_size(i, self.acquire_limit).saturating_sub(self.shard_pos) as usize
        });

        {
            let fronts: [Option<_>; RAID_PARTS] = std::array::from_fn(|i| {
                let shard = &self.shards[i];
                (!shard.excluded).then(|| shard.read_front(tail_lens[i]))
            });
            let tails: [Option<&[u8]>; RAID_PARTS] = std::array::from_fn(|i| fronts[i].as_deref());
            combine_last_line(dest, &tails);
        }

        for shard in self.shards.iter_mut().filter(|s| !s.excluded) {
            shard.roll(tail_lens[shard.index], &mut self.pool);
        }
        self.shard_pos += RAID_SECTOR as u64;
    }

    fn pass_through(&mut self, dest: &mut [u8], len: usize) {
        dest.copy_from_slice(&self.shards[0].read_front(len));
        self.shards[0].roll(len, &mut self.pool);
        self.shard_pos += len as u64;
    }

    pub(super) fn check_live(&self) -> Result<(), RaidError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        if !self.raid_known {
            return Err(RaidError::RaidNotKnown);
        }
        Ok(())
    }

    pub(super) fn check_connection(&self, connection: usize) -> Result<(), RaidError> {
        let count = if self.is_raid { RAID_PARTS } else { 1 };
        if connection >= count {
            return Err(RaidError::InvalidConnection(connection));
        }
        Ok(())
    }

    /// Enter the terminal state: drop every buffer, nothing more is delivered
    pub(super) fn fail_transfer(&mut self, err: RaidError) {
        tracing::error!("Transfer failed: {}", err);

        for shard in &mut self.shards {
            shard.clear(&mut self.pool);
        }
        self.leftover = None;
        self.output_buffers.clear();
        self.failure = Some(err);
    }

    pub fn config(&self) -> &RaidConfig {
        &self.config
    }

    pub fn mode(&self) -> &OutputMode {
        &self.mode
    }

    pub fn deliver_limit(&self) -> u64 {
        self.deliver_limit
    }

    pub fn acquire_limit(&self) -> u64 {
        self.acquire_limit
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// File position the next output piece starts at
    pub fn output_pos(&self) -> u64 {
        self.output_pos
    }

    /// Offset in each part (raid) or file position (non-raid) of the combine point
    pub fn shard_pos(&self) -> u64 {
        self.shard_pos
    }

    pub fn resume_skip(&self) -> usize {
        self.resume_skip
    }

    /// Bytes combined but held back for a chunk boundary
    pub fn leftover_len(&self) -> usize {
        self.leftover.as_ref().map_or(0, FilePiece::len)
    }

    /// The part currently rebuilt from parity
    pub fn excluded_shard(&self) -> Option<usize> {
        self.excluded
    }

    pub fn shard_state(&self, shard: usize) -> Option<ShardState> {
        self.shards.get(shard).map(Shard::state)
    }

    pub fn error_count(&self, shard: usize) -> Option<u32> {
        self.shards.get(shard).map(|s| s.error_count)
    }

    /// Bytes buffered for a part beyond the combine point
    pub fn queued_len(&self, shard: usize) -> Option<u64> {
        self.shards.get(shard).map(Shard::queued_len)
    }
}
