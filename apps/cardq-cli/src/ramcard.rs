use cardq_core::{CardHost, CardStatus, Direction, IssueContext};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Fault injection knobs for [`RamCard`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Faults {
    /// Fail every Nth transfer with EIO before touching storage.
    pub fail_every: Option<u64>,
    /// Fail every Nth status query.
    pub status_glitch_every: Option<u64>,
}

/// Card backed by a byte vector, driven directly through the mapped segments.
pub struct RamCard {
    storage: Vec<u8>,
    block_size: usize,
    faults: Faults,
    transfers: u64,
    status_queries: u64,
    removal_hints: Arc<AtomicU64>,
}

impl RamCard {
    pub fn new(blocks: usize, block_size: usize, faults: Faults) -> Self {
        Self {
            storage: vec![0; blocks * block_size],
            block_size,
            faults,
            transfers: 0,
            status_queries: 0,
            removal_hints: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter bumped whenever the queue reports a possible removal.
    pub fn removal_hints(&self) -> Arc<AtomicU64> {
        self.removal_hints.clone()
    }
}

fn every(n: Option<u64>, count: u64) -> bool {
    matches!(n, Some(n) if n > 0 && count % n == 0)
}

impl CardHost for RamCard {
    fn issue(&mut self, io: &mut IssueContext<'_>) -> io::Result<()> {
        self.transfers += 1;
        let start = io.sector() as usize * self.block_size;
        let len = io.transfer_len();
        if start + len > self.storage.len() {
            return Err(io::Error::from_raw_os_error(libc::ERANGE));
        }
        if every(self.faults.fail_every, self.transfers) {
            debug!(sector = io.sector(), "injected transfer failure");
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }

        let mut pos = start;
        for i in 0..io.map_segments() {
            match io.direction() {
                Direction::Write => {
                    let seg = io.segment(i);
                    self.storage[pos..pos + seg.len()].copy_from_slice(seg);
                    pos += seg.len();
                }
                Direction::Read => {
                    let seg = io.segment_mut(i);
                    let n = seg.len();
                    seg.copy_from_slice(&self.storage[pos..pos + n]);
                    pos += n;
                }
            }
        }
        trace!(
            direction = %io.direction(),
            sector = io.sector(),
            segments = io.map_segments(),
            len,
            "ram card transfer"
        );
        Ok(())
    }

    fn query_status(&mut self) -> io::Result<CardStatus> {
        self.status_queries += 1;
        if every(self.faults.status_glitch_every, self.status_queries) {
            return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
        }
        Ok(CardStatus::READY_FOR_DATA.with_state(CardStatus::STATE_TRAN))
    }

    fn notify_possible_removal(&mut self) {
        self.removal_hints.fetch_add(1, Ordering::Relaxed);
    }
}
