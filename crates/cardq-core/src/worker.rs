//! The per-card worker thread.
//!
//! One worker services one block queue: it claims a single request, maps and
//! stages it, issues it to the host, verifies the card afterwards and only
//! then looks at the next request. Parking on the wake channel is the only
//! place it blocks while idle.

use crate::block::BlockQueue;
use crate::config::QueueConfig;
use crate::gate::DrainGate;
use crate::host::{CardHost, IssueContext};
use crate::metrics;
use crate::request::Request;
use crate::transfer::{Transfer, TransferStrategy};
use async_channel::{Receiver, Sender};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{Level, debug, error, info, trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Dequeuing,
    Mapping,
    Issuing,
    Verifying,
    Stopped,
}

impl WorkerState {
    fn as_str(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Dequeuing => "dequeuing",
            WorkerState::Mapping => "mapping",
            WorkerState::Issuing => "issuing",
            WorkerState::Verifying => "verifying",
            WorkerState::Stopped => "stopped",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerState::Idle,
            1 => WorkerState::Dequeuing,
            2 => WorkerState::Mapping,
            3 => WorkerState::Issuing,
            4 => WorkerState::Verifying,
            _ => WorkerState::Stopped,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags shared between the worker and the lifecycle side.
pub(crate) struct WorkerShared {
    pub(crate) stop: AtomicBool,
    /// A request is claimed; submitters need not wake the worker.
    pub(crate) busy: AtomicBool,
    /// Poll card readiness before the next request.
    pub(crate) check_status: AtomicBool,
    pub(crate) gate: DrainGate,
    state: AtomicU8,
}

impl WorkerShared {
    pub(crate) fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            check_status: AtomicBool::new(false),
            gate: DrainGate::new(),
            state: AtomicU8::new(WorkerState::Idle as u8),
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// Submission-side handle that wakes a parked worker.
pub(crate) struct WorkerWaker {
    tx: Sender<()>,
    shared: Arc<WorkerShared>,
}

impl WorkerWaker {
    pub(crate) fn new(tx: Sender<()>, shared: Arc<WorkerShared>) -> Self {
        Self { tx, shared }
    }

    /// Wake the worker unless it is busy with a request; a busy worker
    /// re-polls the block queue before parking.
    pub(crate) fn kick(&self) {
        if !self.shared.busy.load(Ordering::SeqCst) {
            self.wake();
        }
    }

    pub(crate) fn wake(&self) {
        // A full channel already holds a pending wake.
        let _ = self.tx.try_send(());
    }
}

/// Holder for the one request the worker owns at a time.
struct RequestSlot {
    request: Option<Request>,
}

impl RequestSlot {
    fn new() -> Self {
        Self { request: None }
    }

    fn claim(&mut self, request: Request) -> &mut Request {
        assert!(self.request.is_none(), "request slot already occupied");
        self.request.insert(request)
    }

    fn release(&mut self) -> Option<Request> {
        self.request.take()
    }
}

pub(crate) struct WorkerConfig {
    pub(crate) card: String,
    pub(crate) host: Box<dyn CardHost>,
    pub(crate) blk: Arc<BlockQueue>,
    pub(crate) transfer: Transfer,
    pub(crate) shared: Arc<WorkerShared>,
    pub(crate) wake_rx: Receiver<()>,
    pub(crate) config: QueueConfig,
}

/// Resources handed back when the worker exits, freed by teardown.
pub(crate) struct WorkerExit {
    pub(crate) host: Box<dyn CardHost>,
    pub(crate) transfer: Transfer,
}

pub(crate) fn spawn_worker(cfg: WorkerConfig) -> io::Result<JoinHandle<WorkerExit>> {
    let name = format!("{}-{}", cfg.config.thread_prefix, cfg.card);
    thread::Builder::new().name(name).spawn(move || worker_main(cfg))
}

struct Worker {
    card: String,
    host: Box<dyn CardHost>,
    blk: Arc<BlockQueue>,
    transfer: Transfer,
    shared: Arc<WorkerShared>,
    config: QueueConfig,
    slot: RequestSlot,
}

fn worker_main(cfg: WorkerConfig) -> WorkerExit {
    let WorkerConfig {
        card,
        host,
        blk,
        transfer,
        shared,
        wake_rx,
        config,
    } = cfg;

    let span = tracing::span!(Level::INFO, "cardq-worker", card = %card);
    let _enter = span.enter();
    debug!(bounced = transfer.is_bounced(), "worker starting");

    let mut worker = Worker {
        card,
        host,
        blk,
        transfer,
        shared,
        config,
        slot: RequestSlot::new(),
    };
    worker.run(&wake_rx);

    info!("worker stopped");
    let Worker { host, transfer, .. } = worker;
    WorkerExit { host, transfer }
}

impl Worker {
    fn run(&mut self, wake_rx: &Receiver<()>) {
        self.shared.gate.acquire();
        loop {
            if self.shared.stop.load(Ordering::SeqCst) {
                break;
            }
            self.shared.set_state(WorkerState::Dequeuing);
            let Some(request) = self.blk.next_available() else {
                if self.shared.stop.load(Ordering::SeqCst) {
                    break;
                }
                self.shared.set_state(WorkerState::Idle);
                self.shared.gate.release();
                let closed = wake_rx.recv_blocking().is_err();
                self.shared.gate.acquire();
                if closed {
                    warn!("wake channel closed");
                    break;
                }
                continue;
            };

            self.shared.busy.store(true, Ordering::SeqCst);
            self.service(request);
            self.shared.busy.store(false, Ordering::SeqCst);
        }
        self.shared.set_state(WorkerState::Stopped);
        self.shared.gate.release();
    }

    /// One full iteration: claim, map, issue, verify, release.
    fn service(&mut self, request: Request) {
        if self.shared.check_status.swap(false, Ordering::SeqCst) {
            self.wait_until_ready();
        }

        let request = self.slot.claim(request);
        let direction = request.direction;
        let id = request.id();
        self.host.before_request();

        self.shared.set_state(WorkerState::Mapping);
        let sg_len = self.transfer.prepare(request);
        self.transfer.pre_copy(request);
        let bytes = self.transfer.sg().total_len();
        trace!(
            id,
            direction = %direction,
            sector = request.sector,
            sg_len,
            bytes,
            "request mapped"
        );

        self.shared.set_state(WorkerState::Issuing);
        let started = Instant::now();
        let result = {
            let mut io = IssueContext::new(request, &mut self.transfer, sg_len);
            self.host.issue(&mut io)
        };
        metrics::observe_issue(direction, bytes, started.elapsed());

        self.shared.set_state(WorkerState::Verifying);
        let outcome = match result {
            Ok(()) => {
                self.transfer.post_copy(request);
                Ok(bytes)
            }
            Err(err) => {
                warn!(id, direction = %direction, error = %err, "request failed");
                metrics::record_request_error();
                Err(err)
            }
        };
        let succeeded = outcome.is_ok();
        if let Some(request) = self.slot.release() {
            self.blk.complete(request, outcome);
        }

        if succeeded && self.config.status_check {
            self.verify_card();
        }
    }

    /// Post-transfer liveness check. A failed query is treated as a possible
    /// removal: the host is told, the worker cools down and carries on.
    ///
    /// A card that keeps failing the query is never given up on, so a dead
    /// bus costs one cooldown per successful request indefinitely.
    fn verify_card(&mut self) {
        if let Err(err) = self.host.query_status() {
            error!(
                card = %self.card,
                error = %err,
                "failed to get status, card may have been removed"
            );
            metrics::record_status_failure();
            self.host.notify_possible_removal();
            thread::sleep(self.config.removal_cooldown());
        }
    }

    /// Poll the card until it is ready for data, giving up after the
    /// configured number of attempts.
    fn wait_until_ready(&mut self) {
        for attempt in 1..=self.config.paranoid_retries {
            match self.host.query_status() {
                Ok(status) if status.is_ready() => {
                    debug!(attempt, status = status.bits(), "card ready after resume");
                    return;
                }
                Ok(status) => {
                    debug!(attempt, status = status.bits(), "card busy after resume");
                }
                Err(err) => {
                    error!(attempt, error = %err, "failed to get status after resume");
                }
            }
            thread::sleep(self.config.paranoid_retry_delay());
        }
        warn!(
            retries = self.config.paranoid_retries,
            "card not ready after resume; issuing anyway"
        );
    }
}
