//! Per-card block request queue.
//!
//! A [`CardQueue`] pulls requests one at a time from a [`BlockQueue`] on a
//! dedicated worker thread, maps them for the host controller (staging through
//! a bounce region on single-segment hosts), issues them through a
//! [`CardHost`] and checks the card afterwards.

pub mod block;
pub mod config;
pub mod error;
mod gate;
pub mod host;
pub mod metrics;
pub mod queue;
pub mod request;
pub mod transfer;
mod worker;

pub use block::{BlockQueue, QueueLimits};
pub use cardq_buffers::{SgEntry, SgSource, SgTable};
pub use config::{DEFAULT_BLOCK_SIZE, DEFAULT_BOUNCE_SIZE, HostLimits, QueueConfig};
pub use error::{QueueError, QueueResult};
pub use host::{CardHost, CardStatus, IssueContext};
pub use queue::CardQueue;
pub use request::{CompletionFn, Direction, Outcome, Request};
pub use transfer::{BouncedTransfer, DirectTransfer, Transfer, TransferStrategy, bounce_capacity};
pub use worker::WorkerState;
