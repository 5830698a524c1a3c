//! MAC chunk boundaries
//!
//! Files are authenticated in chunks that grow from 128 KiB to 1 MiB: the
//! first eight are 1, 2, ... 8 segments long, every later one is 8 segments.

/// Segment size the chunk ladder is built from
pub const SEGMENT_SIZE: u64 = 128 * 1024;

const LADDER_STEPS: u64 = 8;

/// End of the growing part of the ladder (1 + 2 + ... + 8 segments)
const LADDER_END: u64 = SEGMENT_SIZE * LADDER_STEPS * (LADDER_STEPS + 1) / 2;

const FULL_CHUNK: u64 = LADDER_STEPS * SEGMENT_SIZE;

/// Start of the chunk containing `pos`
pub fn chunk_floor(pos: u64) -> u64 {
    let mut start = 0;
    for step in 1..=LADDER_STEPS {
        let next = start + step * SEGMENT_SIZE;
        if pos < next {
            return start;
        }
        start = next;
    }

    ((pos - LADDER_END) & !(FULL_CHUNK - 1)) + LADDER_END
}

/// End of the chunk containing `pos`, capped at `limit` (the file size)
pub fn chunk_ceil(pos: u64, limit: u64) -> u64 {
    let start = chunk_floor(pos);
    let len = if start < LADDER_END {
        // start is the sum of the first k steps; the chunk there is k + 1 segments
        let mut sum = 0;
        let mut step = 1;
        while sum < start {
            sum += step * SEGMENT_SIZE;
            step += 1;
        }
        step * SEGMENT_SIZE
    } else {
        FULL_CHUNK
    };

    (start + len).min(limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KB: u64 = 1024;

    #[test]
    fn test_chunk_floor_ladder() {
        assert_eq!(chunk_floor(0), 0);
        assert_eq!(chunk_floor(128 * KB - 1), 0);
        assert_eq!(chunk_floor(128 * KB), 128 * KB);
        assert_eq!(chunk_floor(384 * KB - 1), 128 * KB);
        assert_eq!(chunk_floor(384 * KB), 384 * KB);
        assert_eq!(chunk_floor(768 * KB), 768 * KB);
    }

    #[test]
    fn test_chunk_floor_megabyte_steps() {
        let ladder_end = 36 * SEGMENT_SIZE;

        assert_eq!(chunk_floor(ladder_end - 1), 28 * SEGMENT_SIZE);
        assert_eq!(chunk_floor(ladder_end), ladder_end);
        assert_eq!(chunk_floor(ladder_end + 1024 * KB - 1), ladder_end);
        assert_eq!(chunk_floor(ladder_end + 1024 * KB), ladder_end + 1024 * KB);
        assert_eq!(chunk_floor(ladder_end + 5 * 1024 * KB + 7), ladder_end + 5 * 1024 * KB);
    }

    #[test]
    fn test_chunk_ceil() {
        assert_eq!(chunk_ceil(0, u64::MAX), 128 * KB);
        assert_eq!(chunk_ceil(200 * KB, u64::MAX), 384 * KB);
        assert_eq!(chunk_ceil(200 * KB, 300 * KB), 300 * KB);
        assert_eq!(chunk_ceil(28 * SEGMENT_SIZE, u64::MAX), 36 * SEGMENT_SIZE);
        assert_eq!(chunk_ceil(36 * SEGMENT_SIZE + 5, u64::MAX), 44 * SEGMENT_SIZE);
    }

    #[test]
    fn test_chunks_tile_the_file() {
        let size = 50 * 1024 * KB + 123;
        let mut pos = 0;
        while pos < size {
            assert_eq!(chunk_floor(pos), pos);
            let end = chunk_ceil(pos, size);
            assert!(end > pos);
            assert_eq!(chunk_floor(end - 1), pos);
            pos = end;
        }
        assert_eq!(pos, size);
    }
}
