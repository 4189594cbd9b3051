//! Minimal FIFO block request queue.
//!
//! Plays the part of the generic block layer: it owns the submission lock,
//! filters malformed requests, and tells the attached card queue when work is
//! available. It performs no merging or reordering.

use crate::error::eio;
use crate::metrics;
use crate::request::{Outcome, Request};
use crate::worker::WorkerWaker;
use cardq_buffers::segment_count;
use std::collections::VecDeque;
use std::mem;
use std::sync::Mutex;
use tracing::{debug, trace, warn};

/// Limits a card queue installs on its block queue at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueLimits {
    /// Largest request in blocks.
    pub max_sectors: usize,
    pub max_segments: usize,
    pub max_segment_size: usize,
    pub block_size: usize,
}

impl QueueLimits {
    fn check(&self, request: &Request) -> Result<(), String> {
        let bytes = request.byte_len();
        if bytes % self.block_size != 0 {
            return Err(format!(
                "length {bytes} not a multiple of block size {}",
                self.block_size
            ));
        }
        if bytes / self.block_size > self.max_sectors {
            return Err(format!(
                "{} blocks exceeds limit of {}",
                bytes / self.block_size,
                self.max_sectors
            ));
        }
        let segments = segment_count(&request.buffers, self.max_segment_size);
        if segments > self.max_segments {
            return Err(format!(
                "{segments} segments exceeds limit of {}",
                self.max_segments
            ));
        }
        Ok(())
    }
}

enum Dispatch {
    /// No card queue attached yet; requests wait.
    Unattached,
    Attached(WorkerWaker),
    /// The card queue was torn down; requests fail immediately.
    Detached,
}

struct Inner {
    pending: VecDeque<Request>,
    stopped: bool,
    /// Set by teardown; nothing is handed out until the next attach.
    closing: bool,
    dispatch: Dispatch,
    limits: Option<QueueLimits>,
    next_id: u64,
}

pub struct BlockQueue {
    inner: Mutex<Inner>,
}

impl Default for BlockQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                stopped: false,
                closing: false,
                dispatch: Dispatch::Unattached,
                limits: None,
                next_id: 1,
            }),
        }
    }

    /// Queue `request` and wake the card queue if it is idle. Returns the
    /// sequence number assigned to the request.
    ///
    /// Malformed requests, and any request arriving after the card queue was
    /// torn down, complete immediately with EIO.
    pub fn submit(&self, mut request: Request) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        request.set_id(id);

        let rejected = if matches!(inner.dispatch, Dispatch::Detached) {
            Some("queue detached".to_string())
        } else if request.byte_len() == 0 {
            Some("empty request".to_string())
        } else {
            inner.limits.as_ref().and_then(|limits| limits.check(&request).err())
        };
        if let Some(reason) = rejected {
            drop(inner);
            warn!(id, direction = %request.direction, reason = %reason, "rejecting request");
            metrics::record_rejected();
            request.finish(Err(eio()));
            return id;
        }

        trace!(
            id,
            direction = %request.direction,
            sector = request.sector,
            bytes = request.byte_len(),
            "request queued"
        );
        inner.pending.push_back(request);
        if !inner.stopped {
            if let Dispatch::Attached(waker) = &inner.dispatch {
                waker.kick();
            }
        }
        id
    }

    /// Next request in arrival order, or `None` when empty, stopped or
    /// closing.
    pub fn next_available(&self) -> Option<Request> {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped || inner.closing {
            return None;
        }
        inner.pending.pop_front()
    }

    /// Return a finished request to its origin.
    pub fn complete(&self, request: Request, outcome: Outcome) {
        trace!(
            id = request.id(),
            ok = outcome.is_ok(),
            "request complete"
        );
        request.finish(outcome);
    }

    /// Fail every pending request with EIO. Returns how many were failed.
    pub fn drain_all(&self) -> usize {
        let drained = mem::take(&mut self.inner.lock().unwrap().pending);
        let count = drained.len();
        for request in drained {
            request.finish(Err(eio()));
        }
        if count > 0 {
            debug!(count, "drained pending requests");
        }
        count
    }

    /// Stop handing out requests.
    pub fn stop(&self) {
        self.inner.lock().unwrap().stopped = true;
    }

    /// Resume handing out requests, waking the card queue if work is pending.
    pub fn start(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopped = false;
        if !inner.pending.is_empty() && !inner.closing {
            if let Dispatch::Attached(waker) = &inner.dispatch {
                waker.kick();
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }

    /// Number of requests waiting to be claimed.
    pub fn depth(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn limits(&self) -> Option<QueueLimits> {
        self.inner.lock().unwrap().limits
    }

    /// Install `limits`, failing queued requests that do not fit them.
    pub(crate) fn set_limits(&self, limits: QueueLimits) {
        let rejected: Vec<(Request, String)> = {
            let mut inner = self.inner.lock().unwrap();
            inner.limits = Some(limits);
            let (keep, reject): (VecDeque<_>, VecDeque<_>) = mem::take(&mut inner.pending)
                .into_iter()
                .partition(|request| limits.check(request).is_ok());
            inner.pending = keep;
            reject
                .into_iter()
                .map(|request| {
                    let reason = limits.check(&request).err().unwrap_or_default();
                    (request, reason)
                })
                .collect()
        };
        for (request, reason) in rejected {
            warn!(id = request.id(), reason = %reason, "rejecting queued request");
            metrics::record_rejected();
            request.finish(Err(eio()));
        }
    }

    pub(crate) fn attach(&self, waker: WorkerWaker) {
        let mut inner = self.inner.lock().unwrap();
        inner.closing = false;
        if !inner.pending.is_empty() && !inner.stopped {
            waker.kick();
        }
        inner.dispatch = Dispatch::Attached(waker);
    }

    /// Stop handing out requests for good, ahead of a teardown drain.
    pub(crate) fn close(&self) {
        self.inner.lock().unwrap().closing = true;
    }

    pub(crate) fn detach(&self) {
        self.inner.lock().unwrap().dispatch = Dispatch::Detached;
    }
}
