use std::io;

pub type QueueResult<T> = core::result::Result<T, QueueError>;

/// Failures surfaced while attaching a queue to a card.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("out of memory allocating {what}")]
    OutOfMemory { what: &'static str },
    #[error("invalid host limits: {0}")]
    InvalidLimits(String),
    #[error("invalid queue config: {0}")]
    InvalidConfig(String),
    #[error("spawn queue worker")]
    Spawn(#[source] io::Error),
}

/// Error used for every request the queue fails on its own behalf.
pub(crate) fn eio() -> io::Error {
    io::Error::from_raw_os_error(libc::EIO)
}
