//! Connection failure handling
//!
//! A raid download survives losing any one part: the failing connection is
//! excluded and its data rebuilt from parity. Whatever it had buffered is kept
//! back, so a later success (or a swap with another failing part) can pick up
//! where it left off. Too many consecutive errors on one connection end the
//! transfer.

use super::manager::RaidBufferManager;
use super::{RaidError, RAID_PARTS};

/// What the caller should do after reporting a connection error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorVerdict {
    /// Retry or carry on without the connection
    Recoverable,

    /// The transfer has failed
    Terminal,
}

impl RaidBufferManager {
    /// Report a failed request on `connection`
    pub fn on_connection_error(&mut self, connection: usize) -> Result<ErrorVerdict, RaidError> {
        if self.is_failed() {
            return Ok(ErrorVerdict::Terminal);
        }
        self.check_live()?;
        self.check_connection(connection)?;

        let base = self.shard_pos;
        let max_errors = self.config().max_errors;

        let shard = &mut self.shards[connection];
        shard.error_count += 1;
        let errors = shard.error_count;

        // Whatever that request would have returned must be fetched again
        shard.rewind_cursor(base);

        if errors >= max_errors {
            shard.failed = true;
            self.fail_transfer(RaidError::ShardFailed {
                shard: connection,
                errors,
            });
            return Ok(ErrorVerdict::Terminal);
        }

        tracing::warn!(
            "Connection {} error ({} of {} allowed)",
            connection,
            errors,
            max_errors - 1
        );

        if !self.is_raid() {
            return Ok(ErrorVerdict::Recoverable);
        }

        match self.excluded {
            Some(excluded) if excluded == connection => {}
            Some(excluded) => {
                // Only one part can be rebuilt from parity: swap
                tracing::warn!(
                    "Connection {} failed while {} was excluded, swapping",
                    connection,
                    excluded
                );
                self.readmit(excluded);
                self.exclude(connection);
            }
            None => self.exclude(connection),
        }

        Ok(ErrorVerdict::Recoverable)
    }

    /// Stop using a part: its data is rebuilt from the other five
    pub(super) fn exclude(&mut self, connection: usize) {
        let base = self.shard_pos;
        let shard = &mut self.shards[connection];

        shard.drain_to_recovery(&mut self.pool);
        shard.excluded = true;
        shard.paused = false;
        shard.rewind_cursor(base);
        self.excluded = Some(connection);

        tracing::info!(
            "Continuing with {} connections, part {} rebuilt from parity",
            RAID_PARTS - 1,
            connection
        );
    }

    /// Bring an excluded part back, starting from the combine point
    pub(super) fn readmit(&mut self, connection: usize) {
        let base = self.shard_pos;
        let shard = &mut self.shards[connection];

        shard.excluded = false;
        shard.absorb_recovery(base, &mut self.pool);
        shard.rewind_cursor(base);
        if self.excluded == Some(connection) {
            self.excluded = None;
        }

        tracing::info!("Part {} back in use from {}", connection, base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raid::manager::tests::{drain, feed, streaming_manager, test_data, urls};
    use crate::raid::{encode_stripes, FilePiece};
    use crate::{RaidConfig, ShardState};

    #[test]
    fn test_two_errors_then_success() {
        let data = test_data(80 * 400 + 21, 12);
        let parts = encode_stripes(&data);
        let size = data.len() as u64;
        let config = RaidConfig::default().with_lines_per_chunk(64);
        let (mut manager, recorder) = streaming_manager(config, size, (0, size));
        manager.start(urls(6)).unwrap();

        for part in 0..RAID_PARTS {
            feed(&mut manager, &parts, part, 0, 1024);
        }
        drain(&mut manager);

        assert_eq!(manager.on_connection_error(3).unwrap(), ErrorVerdict::Recoverable);
        assert_eq!(manager.on_connection_error(3).unwrap(), ErrorVerdict::Recoverable);
        assert_eq!(manager.shard_state(3), Some(ShardState::Excluded));
        assert_eq!(manager.error_count(3), Some(2));

        // The others carry on; part 3 is rebuilt from parity
        for part in (0..RAID_PARTS).filter(|p| *p != 3) {
            feed(&mut manager, &parts, part, 1024, 1024);
        }
        drain(&mut manager);
        assert_eq!(manager.shard_pos(), 2048);

        // The retry succeeds: part 3 is back and its count reset
        let range = manager.next_range(3).unwrap();
        assert_eq!(range.start, 2048);
        let len = manager.transfer_size(3) - 2048;
        feed(&mut manager, &parts, 3, 2048, len);
        assert_eq!(manager.shard_state(3), Some(ShardState::Active));
        assert_eq!(manager.error_count(3), Some(0));
        assert_eq!(manager.excluded_shard(), None);

        for part in (0..RAID_PARTS).filter(|p| *p != 3) {
            let start = manager.transfer_pos(part);
            let len = manager.transfer_size(part) - start;
            feed(&mut manager, &parts, part, start, len);
        }
        drain(&mut manager);

        assert_eq!(recorder.bytes(), data);
    }

    #[test]
    fn test_third_error_is_terminal() {
        let data = test_data(80 * 50, 13);
        let parts = encode_stripes(&data);
        let (mut manager, recorder) = streaming_manager(RaidConfig::default(), 4000, (0, 4000));
        manager.start(urls(6)).unwrap();

        for part in 0..RAID_PARTS {
            feed(&mut manager, &parts, part, 0, 160);
        }

        assert_eq!(manager.on_connection_error(3).unwrap(), ErrorVerdict::Recoverable);
        assert_eq!(manager.on_connection_error(3).unwrap(), ErrorVerdict::Recoverable);
        assert_eq!(manager.on_connection_error(3).unwrap(), ErrorVerdict::Terminal);

        let failure = RaidError::ShardFailed { shard: 3, errors: 3 };
        assert_eq!(manager.failure(), Some(&failure));
        assert_eq!(manager.shard_state(3), Some(ShardState::Failed));

        // Nothing more comes out
        assert_eq!(manager.output_buffer(0).unwrap_err(), failure);
        assert_eq!(manager.next_range(1).unwrap_err(), failure);
        assert_eq!(
            manager.submit_buffer(1, FilePiece::new(160, parts[1][160..176].to_vec())),
            Err(failure)
        );
        assert_eq!(manager.on_connection_error(0).unwrap(), ErrorVerdict::Terminal);
        assert!(recorder.delivered.borrow().is_empty());
    }

    #[test]
    fn test_exclusion_keeps_cursor_past_kept_data() {
        let data = test_data(80 * 100, 16);
        let parts = encode_stripes(&data);
        let (mut manager, _recorder) = streaming_manager(RaidConfig::default(), 8000, (0, 8000));
        manager.start(urls(6)).unwrap();

        feed(&mut manager, &parts, 3, 0, 128);
        manager.on_connection_error(3).unwrap();
        assert_eq!(manager.transfer_pos(3), 128);

        // Bytes it already holds are not a new fetch
        assert_eq!(
            manager.submit_buffer(3, FilePiece::new(32, parts[3][32..96].to_vec())),
            Err(RaidError::OutOfOrderSubmit { shard: 3, expected: 128, got: 32 })
        );
        assert_eq!(manager.error_count(3), Some(1));
        assert_eq!(manager.shard_state(3), Some(ShardState::Excluded));

        // A second error leaves the cursor where it was
        manager.on_connection_error(3).unwrap();
        assert_eq!(manager.transfer_pos(3), 128);
    }

    #[test]
    fn test_stale_piece_does_not_readmit() {
        let data = test_data(80 * 50, 17);
        let parts = encode_stripes(&data);
        let (mut manager, _recorder) = streaming_manager(RaidConfig::default(), 4000, (0, 4000));
        manager.start(urls(6)).unwrap();

        for part in 0..RAID_PARTS {
            feed(&mut manager, &parts, part, 0, 32);
        }
        drain(&mut manager);
        manager.on_connection_error(3).unwrap();

        for part in (0..RAID_PARTS).filter(|p| *p != 3) {
            feed(&mut manager, &parts, part, 32, 128);
        }
        drain(&mut manager);
        assert_eq!(manager.shard_pos(), 160);

        // Already rebuilt from parity
        assert_eq!(
            manager.submit_buffer(3, FilePiece::new(0, parts[3][..64].to_vec())),
            Err(RaidError::OutOfOrderSubmit { shard: 3, expected: 160, got: 0 })
        );
        assert_eq!(manager.shard_state(3), Some(ShardState::Excluded));
        assert_eq!(manager.error_count(3), Some(1));

        // Reaching past the combine point counts as a fetch
        feed(&mut manager, &parts, 3, 144, 32);
        assert_eq!(manager.shard_state(3), Some(ShardState::Active));
        assert_eq!(manager.error_count(3), Some(0));
        assert_eq!(manager.queued_len(3), Some(16));
        assert_eq!(manager.transfer_pos(3), 176);
    }

    #[test]
    fn test_success_between_errors_resets_count() {
        let data = test_data(80 * 50, 14);
        let parts = encode_stripes(&data);
        let (mut manager, _recorder) = streaming_manager(RaidConfig::default(), 4000, (0, 4000));
        manager.start(urls(6)).unwrap();

        manager.on_connection_error(2).unwrap();
        manager.on_connection_error(2).unwrap();
        feed(&mut manager, &parts, 2, 0, 64);
        assert_eq!(manager.error_count(2), Some(0));

        assert_eq!(manager.on_connection_error(2).unwrap(), ErrorVerdict::Recoverable);
        assert!(!manager.is_failed());
    }

    #[test]
    fn test_second_failure_swaps_exclusion() {
        let data = test_data(80 * 100 + 45, 15);
        let parts = encode_stripes(&data);
        let size = data.len() as u64;
        let (mut manager, recorder) = streaming_manager(RaidConfig::default(), size, (0, size));
        manager.start(urls(6)).unwrap();

        // Part 1 buffers some data, then fails
        feed(&mut manager, &parts, 1, 0, 320);
        manager.on_connection_error(1).unwrap();
        assert_eq!(manager.excluded_shard(), Some(1));
        assert_eq!(manager.queued_len(1), Some(0));

        for part in [0, 2, 3, 4, 5] {
            feed(&mut manager, &parts, part, 0, 160);
        }
        drain(&mut manager);
        assert_eq!(manager.shard_pos(), 160);

        // Part 4 fails: part 1 comes back with the data it kept
        manager.on_connection_error(4).unwrap();
        assert_eq!(manager.excluded_shard(), Some(4));
        assert_eq!(manager.shard_state(1), Some(ShardState::Active));
        assert_eq!(manager.queued_len(1), Some(160));
        assert_eq!(manager.transfer_pos(1), 320);

        for part in [0, 1, 2, 3, 5] {
            let start = manager.transfer_pos(part);
            let len = manager.transfer_size(part) - start;
            feed(&mut manager, &parts, part, start, len);
        }
        drain(&mut manager);

        assert_eq!(recorder.bytes(), data);
    }

    #[test]
    fn test_non_raid_errors() {
        let (mut manager, _recorder) = streaming_manager(RaidConfig::default(), 1000, (0, 1000));
        manager.start(urls(1)).unwrap();

        manager.mark_requested(0, 500).unwrap();
        assert_eq!(manager.on_connection_error(0).unwrap(), ErrorVerdict::Recoverable);
        assert_eq!(manager.transfer_pos(0), 0);
        assert_eq!(manager.excluded_shard(), None);
    }
}
