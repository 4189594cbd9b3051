use std::fmt;
use std::io;

/// Transfer direction of a block request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result handed back to the origin of a request: bytes transferred or the
/// error that ended it.
pub type Outcome = io::Result<usize>;

/// Completion callback. Receives the finished request so read data travels
/// back to the submitter together with the outcome.
pub type CompletionFn = Box<dyn FnOnce(Request, Outcome) + Send + 'static>;

/// One block I/O operation over a contiguous sector range, backed by an
/// ordered list of scattered buffers.
pub struct Request {
    id: u64,
    pub direction: Direction,
    pub sector: u64,
    pub buffers: Vec<Vec<u8>>,
    complete: Option<CompletionFn>,
}

impl Request {
    pub fn read(sector: u64, buffers: Vec<Vec<u8>>) -> Self {
        Self::new(Direction::Read, sector, buffers)
    }

    pub fn write(sector: u64, buffers: Vec<Vec<u8>>) -> Self {
        Self::new(Direction::Write, sector, buffers)
    }

    pub fn new(direction: Direction, sector: u64, buffers: Vec<Vec<u8>>) -> Self {
        Self {
            id: 0,
            direction,
            sector,
            buffers,
            complete: None,
        }
    }

    /// Set the callback invoked exactly once when the request finishes.
    pub fn with_completion<F>(mut self, complete: F) -> Self
    where
        F: FnOnce(Request, Outcome) + Send + 'static,
    {
        self.complete = Some(Box::new(complete));
        self
    }

    /// Sequence number assigned by the block queue on submission.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    /// Total bytes across all buffers.
    pub fn byte_len(&self) -> usize {
        self.buffers.iter().map(Vec::len).sum()
    }

    pub fn sector_count(&self, block_size: usize) -> u64 {
        (self.byte_len() / block_size) as u64
    }

    /// Hand the request back to its origin.
    pub(crate) fn finish(mut self, outcome: Outcome) {
        if let Some(complete) = self.complete.take() {
            complete(self, outcome);
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("sector", &self.sector)
            .field("segments", &self.buffers.len())
            .field("bytes", &self.byte_len())
            .finish()
    }
}
