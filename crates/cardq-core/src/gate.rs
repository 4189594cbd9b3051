use async_channel::{Receiver, Sender};
use tracing::warn;

/// Binary semaphore serialising suspend against an in-flight iteration.
///
/// The worker holds the gate whenever it is not parked. A suspender takes it
/// and keeps it until resume, which keeps the worker parked. Acquire and
/// release may happen on different threads.
pub(crate) struct DrainGate {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl DrainGate {
    pub(crate) fn new() -> Self {
        let (tx, rx) = async_channel::bounded(1);
        tx.try_send(()).expect("fresh gate has room for its token");
        Self { tx, rx }
    }

    /// Block until the gate is free, then hold it.
    pub(crate) fn acquire(&self) {
        // Both channel ends live in `self`, so the channel cannot close here.
        self.rx.recv_blocking().expect("drain gate channel closed");
    }

    #[cfg(test)]
    pub(crate) fn try_acquire(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    pub(crate) fn release(&self) {
        if self.tx.try_send(()).is_err() {
            warn!("drain gate released while not held");
        }
    }
}
