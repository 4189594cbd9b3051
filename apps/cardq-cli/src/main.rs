mod profile;
mod ramcard;

use crate::profile::Profile;
use crate::ramcard::{Faults, RamCard};
use anyhow::{Context, Result, ensure};
use cardq_core::{BlockQueue, CardQueue, Direction, Outcome, QueueLimits, Request};
use clap::Parser;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "cardq", version)]
#[command(about = "Drive a RAM-backed card through the card request queue", long_about = None)]
struct Args {
    /// JSON profile with host limits and queue tunables.
    #[arg(long, value_name = "PATH")]
    profile: Option<PathBuf>,
    /// Card name used for the worker thread and logs.
    #[arg(long, default_value = "mmc0")]
    card: String,
    /// Override: segments the host addresses per transfer (1 enables bouncing).
    #[arg(long)]
    max_hw_segs: Option<usize>,
    /// Override: largest segment in bytes.
    #[arg(long)]
    max_seg_size: Option<usize>,
    /// Override: largest transfer in bytes.
    #[arg(long)]
    max_req_size: Option<usize>,
    /// Override: largest transfer in blocks.
    #[arg(long)]
    max_blk_count: Option<usize>,
    /// Card size in blocks.
    #[arg(long, default_value_t = 8192)]
    capacity_blocks: usize,
    /// Requests per round (half writes, half reads).
    #[arg(long, default_value_t = 64)]
    requests: usize,
    /// Number of write/read rounds.
    #[arg(long, default_value_t = 4)]
    rounds: usize,
    /// Suspend and resume the queue between rounds.
    #[arg(long)]
    suspend_cycles: bool,
    /// Fail every Nth transfer.
    #[arg(long)]
    fail_every: Option<u64>,
    /// Fail every Nth status query.
    #[arg(long)]
    status_glitch_every: Option<u64>,
    /// Requests left pending at teardown.
    #[arg(long, default_value_t = 8)]
    stragglers: usize,
    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,
}

struct Completed {
    direction: Direction,
    sector: u64,
    buffers: Vec<Vec<u8>>,
    outcome: Outcome,
}

#[derive(Debug, Default)]
struct Tally {
    ok: usize,
    failed: usize,
    mismatches: usize,
    bytes: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut profile = match args.profile.as_ref() {
        Some(path) => {
            info!(path = ?path, "loading profile");
            Profile::load(path)?
        }
        None => {
            debug!("no profile; using default host limits");
            Profile::default()
        }
    };
    apply_overrides(&args, &mut profile);
    let block_size = profile.queue.block_size;
    // Removal cooldown of the driver default would dominate a short run.
    if args.status_glitch_every.is_some() && args.profile.is_none() {
        profile.queue.removal_cooldown_ms = 20;
    }

    let card = RamCard::new(
        args.capacity_blocks,
        block_size,
        Faults {
            fail_every: args.fail_every,
            status_glitch_every: args.status_glitch_every,
        },
    );
    let removal_hints = card.removal_hints();
    let blk = Arc::new(BlockQueue::new());
    let queue = CardQueue::construct(
        args.card.clone(),
        Box::new(card),
        blk.clone(),
        profile.limits,
        profile.queue.clone(),
    )
    .context("construct card queue")?;
    info!(
        card = %args.card,
        bounce_capacity = ?queue.bounce_capacity(),
        limits = ?queue.queue_limits(),
        "card queue ready"
    );

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut shadow = vec![0u8; args.capacity_blocks * block_size];
    let mut tally = Tally::default();
    let (tx, rx) = mpsc::channel();
    let limits = queue.queue_limits();
    let started = Instant::now();

    for round in 0..args.rounds {
        let writes = args.requests.div_ceil(2);
        let mut expected = 0;
        for _ in 0..writes {
            let (sector, sizes) = pick_range(&mut rng, &limits, args.capacity_blocks);
            let buffers = sizes
                .into_iter()
                .map(|len| {
                    let mut buf = vec![0u8; len];
                    rng.fill(&mut buf[..]);
                    buf
                })
                .collect();
            submit(&blk, Request::write(sector, buffers), &tx);
            expected += 1;
        }
        collect(&rx, expected, block_size, &mut shadow, &mut tally)?;

        if args.suspend_cycles {
            queue.suspend();
            debug!(round, depth = blk.depth(), "suspended between rounds");
            queue.resume();
        }

        let mut expected = 0;
        for _ in 0..args.requests - writes {
            let (sector, sizes) = pick_range(&mut rng, &limits, args.capacity_blocks);
            let buffers = sizes.into_iter().map(|len| vec![0u8; len]).collect();
            submit(&blk, Request::read(sector, buffers), &tx);
            expected += 1;
        }
        collect(&rx, expected, block_size, &mut shadow, &mut tally)?;
        info!(round, ok = tally.ok, failed = tally.failed, "round complete");
    }
    let elapsed = started.elapsed();

    queue.suspend();
    for _ in 0..args.stragglers {
        let (sector, sizes) = pick_range(&mut rng, &limits, args.capacity_blocks);
        let buffers = sizes.into_iter().map(|len| vec![0u8; len]).collect();
        submit(&blk, Request::read(sector, buffers), &tx);
    }
    let pending = blk.depth();
    let drained = queue.teardown();
    let failed_at_teardown = rx
        .try_iter()
        .filter(|done: &Completed| done.outcome.is_err())
        .count();

    info!(
        ok = tally.ok,
        failed = tally.failed,
        mismatches = tally.mismatches,
        bytes = tally.bytes,
        elapsed_ms = elapsed.as_millis() as u64,
        removal_hints = removal_hints.load(Ordering::Relaxed),
        pending,
        drained,
        "workload finished"
    );
    ensure!(
        tally.mismatches == 0,
        "{} reads returned unexpected data",
        tally.mismatches
    );
    ensure!(
        drained == pending && failed_at_teardown == pending,
        "teardown drained {drained} of {pending} pending requests"
    );
    Ok(())
}

fn apply_overrides(args: &Args, profile: &mut Profile) {
    let limits = &mut profile.limits;
    if let Some(segs) = args.max_hw_segs {
        limits.max_hw_segs = segs;
        limits.max_phys_segs = limits.max_phys_segs.max(segs);
    }
    if let Some(size) = args.max_seg_size {
        limits.max_seg_size = size;
    }
    if let Some(size) = args.max_req_size {
        limits.max_req_size = size;
    }
    if let Some(count) = args.max_blk_count {
        limits.max_blk_count = count;
    }
}

/// Random block range that fits the queue limits, split into buffers of
/// whole blocks.
fn pick_range(rng: &mut StdRng, limits: &QueueLimits, capacity_blocks: usize) -> (u64, Vec<usize>) {
    let seg_blocks = (limits.max_segment_size / limits.block_size).max(1);
    let max_blocks = limits
        .max_sectors
        .min(limits.max_segments * seg_blocks)
        .min(capacity_blocks)
        .clamp(1, 64);
    let blocks = rng.gen_range(1..=max_blocks);
    let sector = rng.gen_range(0..=capacity_blocks - blocks) as u64;

    let parts = rng.gen_range(1..=limits.max_segments.min(blocks).max(1));
    let mut sizes = vec![1usize; parts];
    for _ in parts..blocks {
        let candidates: Vec<usize> = (0..parts).filter(|&i| sizes[i] < seg_blocks).collect();
        match candidates.len() {
            0 => break,
            n => sizes[candidates[rng.gen_range(0..n)]] += 1,
        }
    }
    let sizes = sizes.into_iter().map(|b| b * limits.block_size).collect();
    (sector, sizes)
}

fn submit(blk: &BlockQueue, request: Request, tx: &mpsc::Sender<Completed>) {
    let tx = tx.clone();
    blk.submit(request.with_completion(move |req, outcome| {
        let _ = tx.send(Completed {
            direction: req.direction,
            sector: req.sector,
            buffers: req.buffers,
            outcome,
        });
    }));
}

/// Wait for `expected` completions, applying successful writes to the shadow
/// copy and checking successful reads against it. Completions arrive in
/// submission order, so the shadow tracks the card exactly.
fn collect(
    rx: &mpsc::Receiver<Completed>,
    expected: usize,
    block_size: usize,
    shadow: &mut [u8],
    tally: &mut Tally,
) -> Result<()> {
    for _ in 0..expected {
        let done = rx
            .recv_timeout(COMPLETION_TIMEOUT)
            .context("wait for completion")?;
        let start = done.sector as usize * block_size;
        match &done.outcome {
            Ok(bytes) => {
                tally.ok += 1;
                tally.bytes += bytes;
                let data = done.buffers.concat();
                let range = start..start + data.len();
                match done.direction {
                    Direction::Write => shadow[range].copy_from_slice(&data),
                    Direction::Read => {
                        if shadow[range] != data[..] {
                            warn!(sector = done.sector, "read data mismatch");
                            tally.mismatches += 1;
                        }
                    }
                }
            }
            Err(err) => {
                debug!(sector = done.sector, direction = %done.direction, error = %err, "request failed");
                tally.failed += 1;
            }
        }
    }
    Ok(())
}
