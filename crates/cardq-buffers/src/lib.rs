//! Memory building blocks for the card request queue: the contiguous bounce
//! region and the scatter-gather tables handed to the host controller.

mod sg;

pub use sg::{SgEntry, SgSource, SgTable, gather, scatter, segment_count};

use anyhow::{Context, Result, ensure};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;
use std::slice;
use tracing::trace;

const REGION_ALIGNMENT: usize = 4096;

/// Page-aligned contiguous staging region used when the host can only address
/// a single segment per transfer.
pub struct BounceRegion {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for BounceRegion {}
unsafe impl Sync for BounceRegion {}

impl BounceRegion {
    pub fn new(len: usize) -> Result<Self> {
        ensure!(len > 0, "bounce region length must be positive");
        let layout = Layout::from_size_align(len, REGION_ALIGNMENT).context("bounce layout")?;
        // Safety: layout has non-zero size and alignment validated above.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).context("allocate bounce region")?;
        trace!(len, addr = ptr.as_ptr() as u64, "bounce region allocated");
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the region as seen by the controller.
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    fn layout(&self) -> Layout {
        Layout::from_size_align(self.len, REGION_ALIGNMENT).expect("bounce layout")
    }
}

impl Drop for BounceRegion {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout());
        }
    }
}
