//! Raid download simulator
//!
//! Stripes random data into 6 parts, then downloads it through the buffer
//! manager with randomly failing connections and checks the result.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::bail;
use clap::Parser;
use rand::{Rng, RngCore, SeedableRng};
use tracing_subscriber::EnvFilter;

use cloudraid_core::raid::{encode_stripes, ChunkMac, ChunkMacMap, RAID_PARTS};
use cloudraid_core::transfer::{chunk_ceil, chunk_floor};
use cloudraid_core::{ErrorVerdict, FilePiece, OutputMode, RaidBufferManager, RaidConfig, TransferSession};

/// Counts the chunk MACs the manager reports back
#[derive(Clone)]
struct MacLog {
    size: u64,
    finished_chunks: Rc<RefCell<usize>>,
}

impl TransferSession for MacLog {
    fn file_size(&self) -> u64 {
        self.size
    }

    fn decrypt_and_mac(&mut self, piece: &mut FilePiece) {
        let mut pos = piece.pos;
        while pos < piece.end() {
            let start = chunk_floor(pos);
            let end = chunk_ceil(pos, self.size).min(piece.end());
            let bytes = &piece.data()[(pos - piece.pos) as usize..(end - piece.pos) as usize];

            let mut mac = [0u8; 16];
            mac.copy_from_slice(&blake3::hash(bytes).as_bytes()[..16]);
            piece.chunk_macs.insert(
                start,
                ChunkMac {
                    mac,
                    offset: (end - start) as u32,
                    finished: end == chunk_ceil(start, self.size),
                },
            );
            pos = end;
        }
    }

    fn write_completed(&mut self, _pos: u64, _len: u64, chunk_macs: ChunkMacMap) {
        *self.finished_chunks.borrow_mut() += chunk_macs.values().filter(|m| m.finished).count();
    }
}

#[derive(Parser, Debug)]
#[command(name = "raid_sim")]
#[command(version)]
#[command(about = "Download a striped file through the raid buffer manager", long_about = None)]
struct Args {
    /// File size in bytes
    #[arg(short, long, default_value_t = 10 * 1024 * 1024)]
    size: usize,

    /// Probability that a request fails
    #[arg(short, long, default_value_t = 0.02)]
    failure_rate: f64,

    /// Seed for the file contents and the injected failures
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let Args {
        size,
        failure_rate,
        seed,
    } = Args::parse();
    if !(0.0..1.0).contains(&failure_rate) {
        bail!("failure rate must be in [0, 1)");
    }

    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; size];
    rng.fill_bytes(&mut data);
    let parts = encode_stripes(&data);

    let log = MacLog {
        size: size as u64,
        finished_chunks: Rc::new(RefCell::new(0)),
    };
    let config = RaidConfig::default().with_max_request_size(1024 * 1024);
    let mut manager = RaidBufferManager::new(config, OutputMode::disk_write(log.clone()))?;
    manager.start((0..RAID_PARTS).map(|i| format!("sim://part{}", i)).collect())?;

    let mut file = vec![0u8; size];
    let mut errors = 0usize;
    let mut rounds = 0usize;

    while manager.mode().bytes_completed() < size as u64 {
        rounds += 1;
        if rounds > 1_000_000 {
            bail!("no progress after {} rounds", rounds);
        }

        for connection in 0..RAID_PARTS {
            let range = manager.next_range(connection)?;

            if range.fresh_fetch_needed && !range.should_pause {
                if rng.gen_bool(failure_rate) {
                    errors += 1;
                    if manager.on_connection_error(connection)? == ErrorVerdict::Terminal {
                        bail!("transfer failed: {:?}", manager.failure());
                    }
                    continue;
                }

                manager.mark_requested(connection, range.end)?;
                let bytes = parts[connection][range.start as usize..range.end as usize].to_vec();
                manager.submit_buffer(connection, FilePiece::new(range.start, bytes))?;
            }

            while let Some(piece) = manager.output_buffer(connection)? {
                let start = piece.pos as usize;
                file[start..start + piece.len()].copy_from_slice(piece.data());
                manager.buffer_write_completed(connection, true)?;
            }
        }
    }

    let expected = blake3::hash(&data);
    let actual = blake3::hash(&file);
    tracing::info!(
        "{} bytes in {} rounds, {} injected errors, {} chunks authenticated",
        size,
        rounds,
        errors,
        log.finished_chunks.borrow()
    );

    if expected != actual {
        bail!("reconstructed file differs: {} != {}", actual.to_hex(), expected.to_hex());
    }
    println!("OK {}", actual.to_hex());
    Ok(())
}
