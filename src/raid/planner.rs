//! Request planning - which byte range each connection fetches next

use super::manager::RaidBufferManager;
use super::stripe::stripe_size;
use super::{RaidError, RAID_LINE, RAID_SECTOR};

/// The next byte range a connection should fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextRange {
    /// First byte, in the connection's part (raid) or the file (non-raid)
    pub start: u64,

    /// One past the last byte
    pub end: u64,

    /// False when the range is already satisfied from kept-back data, or
    /// there is nothing left to fetch
    pub fresh_fetch_needed: bool,

    /// The connection is too far ahead of its peers and should wait
    pub should_pause: bool,
}

impl NextRange {
    fn done(pos: u64) -> Self {
        Self {
            start: pos,
            end: pos,
            fresh_fetch_needed: false,
            should_pause: false,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl RaidBufferManager {
    /// Bytes one request fetches: a chunk's worth of lines from one part
    /// (raid) or of the file (non-raid), capped by the request size limit
    pub fn request_len(&self) -> u64 {
        let config = self.config();

        if self.is_raid() {
            let sector = RAID_SECTOR as u64;
            let len = config
                .lines_per_chunk
                .saturating_mul(sector)
                .min(config.max_request_size);
            (len - len % sector).max(sector)
        } else {
            config
                .lines_per_chunk
                .saturating_mul(RAID_LINE as u64)
                .min(config.max_request_size)
                .max(1)
        }
    }

    /// Total bytes a connection has to fetch
    pub fn transfer_size(&self, connection: usize) -> u64 {
        if self.is_raid() {
            stripe_size(connection, self.acquire_limit())
        } else {
            self.acquire_limit()
        }
    }

    /// Position up to which a connection has requested data
    pub fn transfer_pos(&self, connection: usize) -> u64 {
        let index = if self.is_raid() { connection } else { 0 };
        self.shards.get(index).map_or(0, |s| s.request_pos)
    }

    /// Record that `connection` has requested data up to `end`
    pub fn mark_requested(&mut self, connection: usize, end: u64) -> Result<(), RaidError> {
        self.check_live()?;
        self.check_connection(connection)?;

        let size = self.transfer_size(connection);
        if end > size {
            return Err(RaidError::InvalidRange(format!(
                "request end {} beyond {} bytes for connection {}",
                end, size, connection
            )));
        }

        let shard = &mut self.shards[connection];
        shard.request_pos = shard.request_pos.max(end);
        Ok(())
    }

    /// Plan the next fetch for `connection`. Does not advance its cursor:
    /// call `mark_requested` once the request is issued.
    pub fn next_range(&mut self, connection: usize) -> Result<NextRange, RaidError> {
        self.check_live()?;
        self.check_connection(connection)?;

        let request_len = self.request_len();

        if !self.is_raid() {
            let start = self.shards[0].request_pos;
            let end = start.saturating_add(request_len).min(self.deliver_limit()).max(start);
            return Ok(NextRange {
                start,
                end,
                fresh_fetch_needed: end > start,
                should_pause: false,
            });
        }

        let part_len = self.transfer_size(connection);
        let base = self.shard_pos;
        let excluded = self.shards[connection].excluded;

        if !excluded {
            // Data kept back from an earlier failover may already cover the next request
            let shard = &mut self.shards[connection];
            let before = shard.contiguous_end(base);
            if shard.absorb_recovery(base, &mut self.pool) {
                let after = shard.contiguous_end(base);
                tracing::debug!(
                    "Connection {} reuses kept data {}..{}",
                    connection,
                    before,
                    after
                );
                return Ok(NextRange {
                    start: before,
                    end: after,
                    fresh_fetch_needed: false,
                    should_pause: false,
                });
            }
        }

        let shard = &mut self.shards[connection];
        if excluded {
            shard.request_pos = shard.request_pos.max(base);
        }
        let start = shard.skip_recovered(shard.request_pos);
        shard.request_pos = start;

        if start >= part_len {
            return Ok(NextRange::done(start));
        }

        let mut end = start.saturating_add(request_len).min(part_len);
        if let Some(kept) = shard.next_recovery_start(start) {
            end = end.min(kept);
        }

        let should_pause = !excluded && self.update_pause(connection);

        Ok(NextRange {
            start,
            end,
            fresh_fetch_needed: true,
            should_pause,
        })
    }

    /// Hysteresis: pause once the lead over the slowest peer exceeds the
    /// pause threshold, resume once it drops below the unpause threshold
    fn update_pause(&mut self, connection: usize) -> bool {
        let pos = self.shards[connection].request_pos;
        let slowest = self
            .shards
            .iter()
            .filter(|s| s.index != connection && !s.excluded)
            .map(|s| s.request_pos)
            .min();
        let Some(slowest) = slowest else {
            return false;
        };

        let lead = pos.saturating_sub(slowest);
        let chunk = self.request_len();
        let pause_at = self.config().pause_chunks.saturating_mul(chunk);
        let unpause_below = self.config().unpause_chunks.saturating_mul(chunk);

        let shard = &mut self.shards[connection];
        let paused = if shard.paused {
            lead >= unpause_below
        } else {
            lead > pause_at
        };

        if paused != shard.paused {
            tracing::debug!(
                "Connection {} {} ({} bytes ahead)",
                connection,
                if paused { "paused" } else { "resumed" },
                lead
            );
            shard.paused = paused;
        }
        paused
    }

    /// Whether every connection in use other than `connection` is paused.
    /// Always false for non-raid transfers.
    pub fn all_peers_paused(&self, connection: usize) -> bool {
        self.is_raid()
            && self
                .shards
                .iter()
                .filter(|s| s.index != connection && !s.excluded)
                .all(|s| s.paused)
    }
}

#[cfg(test)]
mod tests {
    use crate::raid::manager::tests::{feed, streaming_manager, test_data, urls};
    use crate::raid::{encode_stripes, RAID_PARTS};
    use crate::RaidConfig;

    #[test]
    fn test_non_raid_range_from_resume() {
        let config = RaidConfig::default().with_lines_per_chunk(1024);
        let (mut manager, _recorder) = streaming_manager(config, 1_000_000, (500, 1_000_000));
        manager.start(urls(1)).unwrap();

        let range = manager.next_range(0).unwrap();
        assert_eq!((range.start, range.end), (500, 500 + 1024 * 80));
        assert!(range.fresh_fetch_needed);
        assert!(!range.should_pause);
        assert!(!manager.all_peers_paused(0));
    }

    #[test]
    fn test_raid_ranges_walk_the_part() {
        let config = RaidConfig::default().with_lines_per_chunk(4);
        let (mut manager, _recorder) = streaming_manager(config, 80 * 10 + 20, (0, 820));
        manager.start(urls(6)).unwrap();
        assert_eq!(manager.request_len(), 64);

        // Part 0: 160 bytes + a 16 byte tail
        let mut ranges = Vec::new();
        loop {
            let range = manager.next_range(0).unwrap();
            if !range.fresh_fetch_needed {
                assert!(range.is_empty());
                break;
            }
            ranges.push((range.start, range.end));
            manager.mark_requested(0, range.end).unwrap();
        }
        assert_eq!(ranges, vec![(0, 64), (64, 128), (128, 176)]);

        // Part 2 has no tail
        manager.mark_requested(2, 160).unwrap();
        assert!(!manager.next_range(2).unwrap().fresh_fetch_needed);
        assert!(manager.mark_requested(2, 161).is_err());
    }

    #[test]
    fn test_pause_hysteresis() {
        let config = RaidConfig::default().with_lines_per_chunk(4);
        let (mut manager, _recorder) = streaming_manager(config, 80 * 1000, (0, 80_000));
        manager.start(urls(6)).unwrap();

        // 8 chunks of 64 bytes ahead is still fine; one more pauses
        manager.mark_requested(0, 512).unwrap();
        assert!(!manager.next_range(0).unwrap().should_pause);
        manager.mark_requested(0, 576).unwrap();
        assert!(manager.next_range(0).unwrap().should_pause);
        assert_eq!(manager.shard_state(0), Some(crate::ShardState::Paused));

        // Still paused at exactly 4 chunks ahead
        for peer in 1..RAID_PARTS {
            manager.mark_requested(peer, 320).unwrap();
        }
        assert!(manager.next_range(0).unwrap().should_pause);

        for peer in 1..RAID_PARTS {
            manager.mark_requested(peer, 336).unwrap();
        }
        assert!(!manager.next_range(0).unwrap().should_pause);
        assert_eq!(manager.shard_state(0), Some(crate::ShardState::Active));
    }

    #[test]
    fn test_all_peers_paused() {
        let config = RaidConfig::default().with_lines_per_chunk(4);
        let (mut manager, _recorder) = streaming_manager(config, 80 * 1000, (0, 80_000));
        manager.start(urls(6)).unwrap();

        // Parts 1..5 race ahead of part 0
        for peer in 1..RAID_PARTS {
            manager.mark_requested(peer, 1024).unwrap();
            assert!(manager.next_range(peer).unwrap().should_pause);
        }
        assert!(manager.all_peers_paused(0));
        assert!(!manager.all_peers_paused(1));
    }

    #[test]
    fn test_excluded_part_skips_kept_data() {
        let data = test_data(80 * 100, 3);
        let parts = encode_stripes(&data);
        let config = RaidConfig::default().with_lines_per_chunk(4);
        let (mut manager, _recorder) = streaming_manager(config, 8000, (0, 8000));
        manager.start(urls(6)).unwrap();

        feed(&mut manager, &parts, 3, 0, 128);
        manager.on_connection_error(3).unwrap();
        assert_eq!(manager.excluded_shard(), Some(3));
        assert_eq!(manager.transfer_pos(3), 128);

        // Its 128 buffered bytes were kept back, so a retry starts after them
        let range = manager.next_range(3).unwrap();
        assert_eq!((range.start, range.end), (128, 192));
        assert!(!range.should_pause);
    }
}
