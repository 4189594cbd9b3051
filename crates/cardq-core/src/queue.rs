use crate::block::{BlockQueue, QueueLimits};
use crate::config::{HostLimits, QueueConfig};
use crate::error::{QueueError, QueueResult};
use crate::host::CardHost;
use crate::metrics;
use crate::transfer::Transfer;
use crate::worker::{WorkerConfig, WorkerExit, WorkerShared, WorkerState, WorkerWaker, spawn_worker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{error, info};

/// Request pipeline for one attached card.
///
/// Owns the worker thread and, through it, the transfer resources sized at
/// construction. Suspend, resume and teardown are synchronous and must not be
/// called from the worker thread itself (that is, from inside
/// [`CardHost`] callbacks).
pub struct CardQueue {
    card: String,
    blk: Arc<BlockQueue>,
    shared: Arc<WorkerShared>,
    waker: WorkerWaker,
    worker: Option<JoinHandle<WorkerExit>>,
    worker_id: ThreadId,
    /// Serialises suspend and resume; never taken by readers of `suspended`.
    transition: Mutex<()>,
    suspended: AtomicBool,
    paranoid_resume: bool,
    limits: QueueLimits,
    bounce_capacity: Option<usize>,
}

impl CardQueue {
    /// Size and allocate the transfer resources for `limits`, start the
    /// worker and attach it to `blk`.
    ///
    /// On failure nothing stays allocated and `blk` is left untouched.
    pub fn construct(
        card: impl Into<String>,
        host: Box<dyn CardHost>,
        blk: Arc<BlockQueue>,
        limits: HostLimits,
        config: QueueConfig,
    ) -> QueueResult<Self> {
        let card = card.into();
        limits.validate()?;
        config.validate()?;
        if limits.max_req_size < config.block_size {
            return Err(QueueError::InvalidLimits(format!(
                "max_req_size {} is smaller than block size {}",
                limits.max_req_size, config.block_size
            )));
        }

        let transfer = Transfer::build(&limits, &config)?;
        let queue_limits = transfer.queue_limits(&limits, &config);
        let bounce_capacity = transfer.bounce_capacity();
        let paranoid_resume = config.paranoid_resume;

        let shared = Arc::new(WorkerShared::new());
        let (wake_tx, wake_rx) = async_channel::bounded(1);
        let worker = spawn_worker(WorkerConfig {
            card: card.clone(),
            host,
            blk: blk.clone(),
            transfer,
            shared: shared.clone(),
            wake_rx,
            config,
        })
        .map_err(QueueError::Spawn)?;
        let worker_id = worker.thread().id();

        blk.set_limits(queue_limits);
        blk.attach(WorkerWaker::new(wake_tx.clone(), shared.clone()));

        info!(
            card = %card,
            bounced = bounce_capacity.is_some(),
            bounce_capacity,
            max_sectors = queue_limits.max_sectors,
            max_segments = queue_limits.max_segments,
            max_segment_size = queue_limits.max_segment_size,
            "card queue attached"
        );

        Ok(Self {
            card,
            blk,
            waker: WorkerWaker::new(wake_tx, shared.clone()),
            shared,
            worker: Some(worker),
            worker_id,
            transition: Mutex::new(()),
            suspended: AtomicBool::new(false),
            paranoid_resume,
            limits: queue_limits,
            bounce_capacity,
        })
    }

    pub fn card(&self) -> &str {
        &self.card
    }

    pub fn block_queue(&self) -> &Arc<BlockQueue> {
        &self.blk
    }

    pub fn is_bounced(&self) -> bool {
        self.bounce_capacity.is_some()
    }

    pub fn bounce_capacity(&self) -> Option<usize> {
        self.bounce_capacity
    }

    /// Limits installed on the block queue.
    pub fn queue_limits(&self) -> QueueLimits {
        self.limits
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn worker_state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Stop claiming new requests and wait for the in-flight one, if any, to
    /// finish. Does nothing when already suspended.
    pub fn suspend(&self) {
        debug_assert_ne!(
            thread::current().id(),
            self.worker_id,
            "suspend called from the queue worker"
        );
        let _transition = self.transition.lock().unwrap();
        if self.suspended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.blk.stop();
        self.shared.gate.acquire();
        metrics::record_suspended(true);
        info!(card = %self.card, "card queue suspended");
    }

    /// Undo [`CardQueue::suspend`] and wake the worker. Does nothing when not
    /// suspended.
    pub fn resume(&self) {
        let _transition = self.transition.lock().unwrap();
        if !self.suspended.swap(false, Ordering::SeqCst) {
            return;
        }
        if self.paranoid_resume {
            self.shared.check_status.store(true, Ordering::SeqCst);
        }
        self.shared.gate.release();
        self.blk.start();
        self.waker.kick();
        metrics::record_suspended(false);
        info!(card = %self.card, "card queue resumed");
    }

    /// Stop the worker, fail every request still pending on the block queue
    /// and free the transfer resources. Returns the number of requests failed.
    pub fn teardown(mut self) -> usize {
        self.shutdown()
    }

    fn shutdown(&mut self) -> usize {
        let Some(worker) = self.worker.take() else {
            return 0;
        };
        // Raised before the forced resume so the woken worker exits instead
        // of claiming requests that are about to be failed.
        self.shared.stop.store(true, Ordering::SeqCst);
        self.blk.close();
        self.resume();
        self.waker.wake();

        let exit = match worker.join() {
            Ok(exit) => Some(exit),
            Err(err) => {
                error!(card = %self.card, "queue worker join failed: {:?}", err);
                None
            }
        };

        self.blk.detach();
        let drained = self.blk.drain_all();
        metrics::record_drained(drained);

        if let Some(WorkerExit { host, transfer }) = exit {
            drop(transfer);
            drop(host);
        }
        info!(card = %self.card, drained, "card queue torn down");
        drained
    }
}

impl Drop for CardQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CardQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardQueue")
            .field("card", &self.card)
            .field("bounce_capacity", &self.bounce_capacity)
            .field("limits", &self.limits)
            .field("worker_state", &self.worker_state())
            .finish()
    }
}
