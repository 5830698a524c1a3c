//! Stripe geometry and XOR parity
//!
//! Sectors are dealt round-robin across the 5 data parts, one stripe line at a
//! time, and each line gets one parity sector: the XOR of its data sectors. Any
//! one missing sector of a line is the XOR of the five that remain.

use super::{DATA_PARTS, PARITY_PART, RAID_LINE, RAID_PARTS, RAID_SECTOR};

/// Exact byte length of one part of a raid file of `file_size` bytes.
///
/// The last partial line hands out its remainder a sector at a time, so only
/// the leading data parts get bytes from it. The parity part is as long as the
/// longest data part (part 0).
pub fn stripe_size(part: usize, file_size: u64) -> u64 {
    let line = RAID_LINE as u64;
    let sector = RAID_SECTOR as u64;
    let residual = file_size % line;

    let lead = if part == PARITY_PART { 0 } else { part as u64 };
    let tail = residual.saturating_sub(lead * sector).min(sector);

    (file_size - residual) / DATA_PARTS as u64 + tail
}

/// Rebuild the sector at `offset` into `dest` by XOR-ing the corresponding
/// sectors of every part that is present. Exactly one part should be `None`.
pub fn recover_sector(dest: &mut [u8], inputs: &[Option<&[u8]>; RAID_PARTS], offset: usize) {
    let dest = &mut dest[..RAID_SECTOR];
    dest.fill(0);

    for input in inputs.iter().flatten() {
        let sector = &input[offset..offset + RAID_SECTOR];
        for (d, s) in dest.iter_mut().zip(sector) {
            *d ^= s;
        }
    }
}

/// Assemble the final, partial stripe line into `dest` (its length is the
/// number of file bytes in the line). `tails` holds each present part's last
/// short sector; a missing data part is rebuilt from the others, treating
/// absent bytes as zero.
pub fn combine_last_line(dest: &mut [u8], tails: &[Option<&[u8]>; RAID_PARTS]) {
    let mut offset = 0;

    for part in 0..DATA_PARTS {
        let take = (dest.len() - offset).min(RAID_SECTOR);
        if take == 0 {
            break;
        }
        let out = &mut dest[offset..offset + take];

        match tails[part] {
            Some(tail) => out.copy_from_slice(&tail[..take]),
            None => {
                let mut xor = [0u8; RAID_SECTOR];
                for tail in tails
                    .iter()
                    .enumerate()
                    .filter(|(other, _)| *other != part)
                    .filter_map(|(_, t)| *t)
                {
                    for (x, b) in xor.iter_mut().zip(tail) {
                        *x ^= b;
                    }
                }
                out.copy_from_slice(&xor[..take]);
            }
        }

        offset += take;
    }
}

/// Split `data` into its 6 raid parts (the upload direction)
pub fn encode_stripes(data: &[u8]) -> [Vec<u8>; RAID_PARTS] {
    let size = data.len() as u64;
    let mut parts: [Vec<u8>; RAID_PARTS] =
        std::array::from_fn(|part| Vec::with_capacity(stripe_size(part, size) as usize));

    for line in data.chunks(RAID_LINE) {
        let mut parity = [0u8; RAID_SECTOR];

        for (part, sector) in line.chunks(RAID_SECTOR).enumerate() {
            parts[part].extend_from_slice(sector);
            for (p, b) in parity.iter_mut().zip(sector) {
                *p ^= b;
            }
        }

        // Short last line: parity is as long as the first data sector
        let parity_len = line.len().min(RAID_SECTOR);
        parts[PARITY_PART].extend_from_slice(&parity[..parity_len]);
    }

    parts
}
