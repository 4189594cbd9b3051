use crate::BounceRegion;
use anyhow::{Context, Result, ensure};
use std::cmp;

/// Where the bytes described by an [`SgEntry`] live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SgSource {
    /// A range inside one of the request's own buffers.
    Buffer { index: usize, offset: usize },
    /// A range inside the queue's bounce region.
    Region { offset: usize },
}

/// One (address, length) range of a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SgEntry {
    pub addr: u64,
    pub len: usize,
    pub source: SgSource,
}

/// Fixed-capacity scatter-gather table.
///
/// Capacity is decided once from the host limits and never grows. Pushing past
/// it is a contract violation by whoever produced the request and panics.
#[derive(Debug)]
pub struct SgTable {
    entries: Vec<SgEntry>,
    capacity: usize,
}

impl SgTable {
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        ensure!(capacity > 0, "sg table capacity must be positive");
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(capacity)
            .context("allocate sg table")?;
        Ok(Self { entries, capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    /// Sum of all entry lengths.
    pub fn total_len(&self) -> usize {
        self.entries.iter().map(|entry| entry.len).sum()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Describe `buffers` in order, splitting any buffer longer than
    /// `max_seg_size`. Empty buffers produce no entries.
    pub fn map_buffers<B: AsRef<[u8]>>(&mut self, buffers: &[B], max_seg_size: usize) -> usize {
        assert!(max_seg_size > 0, "max segment size must be positive");
        self.entries.clear();
        for (index, buf) in buffers.iter().enumerate() {
            let buf = buf.as_ref();
            let mut offset = 0;
            while offset < buf.len() {
                let len = cmp::min(max_seg_size, buf.len() - offset);
                self.push(SgEntry {
                    addr: buf[offset..].as_ptr() as u64,
                    len,
                    source: SgSource::Buffer { index, offset },
                });
                offset += len;
            }
        }
        self.entries.len()
    }

    /// Reset the table to a single entry covering the first `len` bytes of `region`.
    pub fn init_one(&mut self, region: &BounceRegion, len: usize) {
        assert!(
            len <= region.len(),
            "transfer of {len} bytes exceeds bounce region of {} bytes",
            region.len()
        );
        self.entries.clear();
        self.push(SgEntry {
            addr: region.addr(),
            len,
            source: SgSource::Region { offset: 0 },
        });
    }

    fn push(&mut self, entry: SgEntry) {
        assert!(
            self.entries.len() < self.capacity,
            "sg table overflow: capacity {}",
            self.capacity
        );
        self.entries.push(entry);
    }
}

/// Number of entries [`SgTable::map_buffers`] would produce for `buffers`.
pub fn segment_count<B: AsRef<[u8]>>(buffers: &[B], max_seg_size: usize) -> usize {
    if max_seg_size == 0 {
        return usize::MAX;
    }
    buffers
        .iter()
        .map(|buf| buf.as_ref().len().div_ceil(max_seg_size))
        .sum()
}

/// Copy the buffer ranges described by `table`, in order, into `dst`.
///
/// Stops once `dst` is full and returns the number of bytes copied.
pub fn gather<B: AsRef<[u8]>>(table: &SgTable, buffers: &[B], dst: &mut [u8]) -> usize {
    let mut copied = 0;
    for entry in table.entries() {
        if copied == dst.len() {
            break;
        }
        let SgSource::Buffer { index, offset } = entry.source else {
            continue;
        };
        let src = &buffers[index].as_ref()[offset..offset + entry.len];
        let n = cmp::min(src.len(), dst.len() - copied);
        dst[copied..copied + n].copy_from_slice(&src[..n]);
        copied += n;
    }
    copied
}

/// Copy `src` out to the buffer ranges described by `table`, in order.
///
/// Stops once `src` is exhausted and returns the number of bytes copied.
pub fn scatter<B: AsMut<[u8]>>(table: &SgTable, buffers: &mut [B], src: &[u8]) -> usize {
    let mut copied = 0;
    for entry in table.entries() {
        if copied == src.len() {
            break;
        }
        let SgSource::Buffer { index, offset } = entry.source else {
            continue;
        };
        let dst = &mut buffers[index].as_mut()[offset..offset + entry.len];
        let n = cmp::min(dst.len(), src.len() - copied);
        dst[..n].copy_from_slice(&src[copied..copied + n]);
        copied += n;
    }
    copied
}
