use crate::request::{Direction, Request};
use crate::transfer::{Transfer, TransferStrategy};
use bitflags::bitflags;
use cardq_buffers::{SgSource, SgTable};
use std::io;

bitflags! {
    /// Card status word as returned by a status query.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CardStatus: u32 {
        const APP_CMD = 1 << 5;
        const READY_FOR_DATA = 1 << 8;
        const CURRENT_STATE = 0xf << 9;
        const ERASE_RESET = 1 << 13;
        const CARD_ECC_FAILED = 1 << 21;
        const ADDRESS_ERROR = 1 << 30;
        const OUT_OF_RANGE = 1 << 31;
    }
}

impl CardStatus {
    /// State the card is transferring data in.
    pub const STATE_TRAN: u32 = 4;
    /// State the card is programming flash in.
    pub const STATE_PRG: u32 = 7;

    pub fn current_state(self) -> u32 {
        (self.bits() & Self::CURRENT_STATE.bits()) >> 9
    }

    pub fn with_state(self, state: u32) -> Self {
        Self::from_bits_retain((self.bits() & !Self::CURRENT_STATE.bits()) | ((state & 0xf) << 9))
    }

    /// Ready for the next transfer: accepting data and not busy programming.
    pub fn is_ready(self) -> bool {
        self.contains(Self::READY_FOR_DATA) && self.current_state() != Self::STATE_PRG
    }
}

/// Host controller driving the physical link to one card.
///
/// All methods run on the queue's worker thread.
pub trait CardHost: Send {
    /// Called once per claimed request before it is mapped, so a host that
    /// powers its link down between requests can bring it back up.
    fn before_request(&mut self) {}

    /// Execute one mapped request. Returning `Err` fails the request with
    /// that error; the queue moves on to the next request either way.
    fn issue(&mut self, io: &mut IssueContext<'_>) -> io::Result<()>;

    /// Liveness check run after a successful transfer.
    fn query_status(&mut self) -> io::Result<CardStatus> {
        Ok(CardStatus::READY_FOR_DATA.with_state(CardStatus::STATE_TRAN))
    }

    /// Hint that the card may have been removed.
    fn notify_possible_removal(&mut self) {}
}

/// View of the claimed request and its mapped segments during `issue`.
pub struct IssueContext<'a> {
    request: &'a mut Request,
    transfer: &'a mut Transfer,
    sg_len: usize,
}

impl<'a> IssueContext<'a> {
    pub(crate) fn new(request: &'a mut Request, transfer: &'a mut Transfer, sg_len: usize) -> Self {
        Self {
            request,
            transfer,
            sg_len,
        }
    }

    pub fn request(&self) -> &Request {
        &*self.request
    }

    pub fn direction(&self) -> Direction {
        self.request.direction
    }

    pub fn sector(&self) -> u64 {
        self.request.sector
    }

    /// Segment count of the mapped table handed to the controller.
    pub fn map_segments(&self) -> usize {
        self.sg_len
    }

    pub fn sg(&self) -> &SgTable {
        self.transfer.sg()
    }

    /// Total bytes described by the mapped table.
    pub fn transfer_len(&self) -> usize {
        self.sg().total_len()
    }

    /// Bytes of mapped segment `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.map_segments()`.
    pub fn segment(&self, index: usize) -> &[u8] {
        let entry = self.transfer.sg().entries()[index];
        match (entry.source, &*self.transfer) {
            (SgSource::Buffer { index, offset }, _) => {
                &self.request.buffers[index][offset..offset + entry.len]
            }
            (SgSource::Region { offset }, Transfer::Bounced(bounced)) => {
                &bounced.region().as_slice()[offset..offset + entry.len]
            }
            (SgSource::Region { .. }, Transfer::Direct(_)) => {
                unreachable!("direct transfers never map the bounce region")
            }
        }
    }

    /// Mutable bytes of mapped segment `index`, for reads.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.map_segments()`.
    pub fn segment_mut(&mut self, index: usize) -> &mut [u8] {
        let entry = self.transfer.sg().entries()[index];
        match (entry.source, &mut *self.transfer) {
            (SgSource::Buffer { index, offset }, _) => {
                &mut self.request.buffers[index][offset..offset + entry.len]
            }
            (SgSource::Region { offset }, Transfer::Bounced(bounced)) => {
                &mut bounced.region_mut().as_mut_slice()[offset..offset + entry.len]
            }
            (SgSource::Region { .. }, Transfer::Direct(_)) => {
                unreachable!("direct transfers never map the bounce region")
            }
        }
    }
}
