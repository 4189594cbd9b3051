//! Transfer strategies: how a claimed request's buffers are presented to the
//! host controller.
//!
//! Hosts able to address several segments per transfer get the request's
//! buffers mapped directly. Hosts limited to a single segment get a bounce
//! region: writes are gathered into it before issue, reads are scattered out
//! of it afterwards.

use crate::block::QueueLimits;
use crate::config::{HostLimits, QueueConfig};
use crate::error::{QueueError, QueueResult};
use crate::request::{Direction, Request};
use cardq_buffers::{BounceRegion, SgTable, gather, scatter};
use std::cmp;
use tracing::{debug, warn};

/// Capability shared by both strategies. Each method runs on the worker
/// thread while it exclusively owns the request.
pub trait TransferStrategy {
    /// Build the table handed to the controller; returns its segment count.
    fn prepare(&mut self, request: &Request) -> usize;

    /// Stage write data ahead of issue.
    fn pre_copy(&mut self, request: &Request);

    /// Deliver read data after a successful issue.
    fn post_copy(&mut self, request: &mut Request);

    /// Table the controller transfers from or into.
    fn sg(&self) -> &SgTable;
}

/// Bounce capacity for `limits`, or `None` when bouncing does not apply.
///
/// Only single-segment hosts bounce, and only when the resulting region holds
/// more than one block.
pub fn bounce_capacity(limits: &HostLimits, config: &QueueConfig) -> Option<usize> {
    if limits.max_hw_segs != 1 {
        return None;
    }
    let capacity = config
        .bounce_size
        .min(limits.max_req_size)
        .min(limits.max_seg_size)
        .min(limits.max_blk_count.saturating_mul(config.block_size));
    (capacity > config.block_size).then_some(capacity)
}

/// Request buffers mapped straight into the controller's table.
pub struct DirectTransfer {
    sg: SgTable,
    max_seg_size: usize,
}

impl DirectTransfer {
    fn new(limits: &HostLimits) -> QueueResult<Self> {
        let sg = SgTable::with_capacity(limits.max_phys_segs).map_err(|err| {
            warn!(capacity = limits.max_phys_segs, error = %err, "sg table allocation failed");
            QueueError::OutOfMemory { what: "sg table" }
        })?;
        Ok(Self {
            sg,
            max_seg_size: limits.max_seg_size,
        })
    }
}

impl TransferStrategy for DirectTransfer {
    fn prepare(&mut self, request: &Request) -> usize {
        self.sg.map_buffers(&request.buffers, self.max_seg_size)
    }

    fn pre_copy(&mut self, _request: &Request) {}

    fn post_copy(&mut self, _request: &mut Request) {}

    fn sg(&self) -> &SgTable {
        &self.sg
    }
}

/// Request buffers staged through one contiguous region.
pub struct BouncedTransfer {
    region: BounceRegion,
    /// Single entry describing the region; what the controller sees.
    sg: SgTable,
    /// The request's own buffers, used by the copies.
    bounce_sg: SgTable,
}

impl BouncedTransfer {
    fn new(capacity: usize, block_size: usize) -> QueueResult<Self> {
        let region = BounceRegion::new(capacity).map_err(|err| {
            warn!(capacity, error = %err, "bounce region allocation failed");
            QueueError::OutOfMemory {
                what: "bounce buffer",
            }
        })?;
        let sg = SgTable::with_capacity(1).map_err(|err| {
            warn!(error = %err, "sg table allocation failed");
            QueueError::OutOfMemory { what: "sg table" }
        })?;
        let bounce_segments = capacity / block_size;
        let bounce_sg = SgTable::with_capacity(bounce_segments).map_err(|err| {
            warn!(capacity = bounce_segments, error = %err, "bounce sg table allocation failed");
            QueueError::OutOfMemory {
                what: "bounce sg table",
            }
        })?;
        Ok(Self {
            region,
            sg,
            bounce_sg,
        })
    }

    pub fn region(&self) -> &BounceRegion {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut BounceRegion {
        &mut self.region
    }

    pub fn bounce_sg(&self) -> &SgTable {
        &self.bounce_sg
    }

    fn staged_len(&self) -> usize {
        self.sg.entries().first().map_or(0, |entry| entry.len)
    }
}

impl TransferStrategy for BouncedTransfer {
    fn prepare(&mut self, request: &Request) -> usize {
        let capacity = self.region.len();
        self.bounce_sg.map_buffers(&request.buffers, capacity);
        let total = self.bounce_sg.total_len();
        self.sg.init_one(&self.region, total);
        1
    }

    fn pre_copy(&mut self, request: &Request) {
        if request.direction != Direction::Write {
            return;
        }
        // The worker holds the only reference to the request's buffers here.
        let len = self.staged_len();
        gather(
            &self.bounce_sg,
            &request.buffers,
            &mut self.region.as_mut_slice()[..len],
        );
    }

    fn post_copy(&mut self, request: &mut Request) {
        if request.direction != Direction::Read {
            return;
        }
        let len = self.staged_len();
        scatter(
            &self.bounce_sg,
            &mut request.buffers,
            &self.region.as_slice()[..len],
        );
    }

    fn sg(&self) -> &SgTable {
        &self.sg
    }
}

/// The strategy a queue was built with, chosen once from the host limits.
pub enum Transfer {
    Direct(DirectTransfer),
    Bounced(BouncedTransfer),
}

impl Transfer {
    /// Allocate the tables (and bounce region) the host limits call for.
    ///
    /// Nothing allocated here outlives a failure: partial allocations are
    /// dropped before the error is returned.
    pub fn build(limits: &HostLimits, config: &QueueConfig) -> QueueResult<Self> {
        match bounce_capacity(limits, config) {
            Some(capacity) => {
                debug!(capacity, "host addresses one segment per transfer; bouncing");
                Ok(Transfer::Bounced(BouncedTransfer::new(
                    capacity,
                    config.block_size,
                )?))
            }
            None => Ok(Transfer::Direct(DirectTransfer::new(limits)?)),
        }
    }

    pub fn is_bounced(&self) -> bool {
        matches!(self, Transfer::Bounced(_))
    }

    pub fn bounce_capacity(&self) -> Option<usize> {
        match self {
            Transfer::Direct(_) => None,
            Transfer::Bounced(bounced) => Some(bounced.region.len()),
        }
    }

    /// Limits the block queue must enforce so that every request it hands
    /// over fits this strategy's tables.
    pub fn queue_limits(&self, limits: &HostLimits, config: &QueueConfig) -> QueueLimits {
        match self {
            Transfer::Bounced(bounced) => {
                let capacity = bounced.region.len();
                QueueLimits {
                    max_sectors: capacity / config.block_size,
                    max_segments: bounced.bounce_sg.capacity(),
                    max_segment_size: capacity,
                    block_size: config.block_size,
                }
            }
            Transfer::Direct(direct) => QueueLimits {
                max_sectors: cmp::min(
                    limits.max_blk_count,
                    limits.max_req_size / config.block_size,
                ),
                max_segments: cmp::min(limits.max_hw_segs, direct.sg.capacity()),
                max_segment_size: limits.max_seg_size,
                block_size: config.block_size,
            },
        }
    }
}

impl TransferStrategy for Transfer {
    fn prepare(&mut self, request: &Request) -> usize {
        match self {
            Transfer::Direct(direct) => direct.prepare(request),
            Transfer::Bounced(bounced) => bounced.prepare(request),
        }
    }

    fn pre_copy(&mut self, request: &Request) {
        match self {
            Transfer::Direct(direct) => direct.pre_copy(request),
            Transfer::Bounced(bounced) => bounced.pre_copy(request),
        }
    }

    fn post_copy(&mut self, request: &mut Request) {
        match self {
            Transfer::Direct(direct) => direct.post_copy(request),
            Transfer::Bounced(bounced) => bounced.post_copy(request),
        }
    }

    fn sg(&self) -> &SgTable {
        match self {
            Transfer::Direct(direct) => direct.sg(),
            Transfer::Bounced(bounced) => bounced.sg(),
        }
    }
}
