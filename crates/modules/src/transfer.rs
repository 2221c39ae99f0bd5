//! Async transfer records and the per-module FIFO queue.

use heapless::{Deque, Vec};

use crate::protocol::ErrorCode;
use crate::regmap::MAX_REG_WIDTH;

/// Capacity of a transfer's payload buffer (two full-width registers).
pub const TRANSFER_DATA_MAX: usize = 2 * MAX_REG_WIDTH;

/// Identifies a queued transfer; returned to the caller on enqueue and echoed
/// in the matching [`Completion`].
pub type Token = u16;

/// Default retry budget for a transfer.
pub const DEFAULT_RETRIES: u8 = 3;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Read `count` consecutive registers starting at `addr`.
    Read,
    /// Write the carried payload starting at `addr`.
    Write,
}

/// One queued register transfer.
#[derive(Debug, Clone)]
pub struct Transfer {
    /// Transfer direction.
    pub dir: Direction,
    /// First register address.
    pub addr: u8,
    /// Number of consecutive registers (sequential addressing), ≥ 1.
    pub count: u8,
    /// Write payload (sequential writes carry the concatenated payload).
    pub data: Vec<u8, TRANSFER_DATA_MAX>,
    /// Remaining retry budget.
    pub retries_left: u8,
    /// Completion correlation token.
    pub token: Token,
}

/// Completion of a transfer, delivered in main-loop context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Completion {
    /// Token of the completed transfer.
    pub token: Token,
    /// Whether the transfer succeeded.
    pub ok: bool,
    /// Low bytes of the first transferred register (little-endian), for
    /// single-value reads.
    pub value: u32,
    /// Width of the first transferred register in bytes.
    pub width: u8,
    /// Error code when `ok == false` and the remote reported one.
    pub error: Option<ErrorCode>,
}

impl Completion {
    #[allow(clippy::cast_possible_truncation)] // register widths are ≤ 32
    pub(crate) fn success(token: Token, value: u32, width: usize) -> Self {
        Self {
            token,
            ok: true,
            value,
            width: width as u8,
            error: None,
        }
    }

    pub(crate) fn failure(token: Token, error: Option<ErrorCode>) -> Self {
        Self {
            token,
            ok: false,
            value: 0,
            width: 0,
            error,
        }
    }
}

/// Errors when enqueueing a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror_no_std::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EnqueueError {
    /// The transfer queue is full.
    #[error("transfer queue full")]
    QueueFull,
    /// Address invalid or payload length does not match the register widths.
    #[error("invalid register access")]
    BadAccess,
}

/// FIFO of pending transfers with at most one in flight.
pub struct TransferQueue<const DEPTH: usize> {
    queue: Deque<Transfer, DEPTH>,
    in_flight: Option<Transfer>,
    next_token: Token,
}

impl<const DEPTH: usize> TransferQueue<DEPTH> {
    /// Empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            queue: Deque::new(),
            in_flight: None,
            next_token: 1,
        }
    }

    /// Number of pending transfers (excluding the in-flight one).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Whether a transfer is currently in flight.
    #[must_use]
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Drop everything, including the in-flight transfer.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.in_flight = None;
    }

    /// Enqueue a transfer at the back; returns its token.
    pub fn enqueue(
        &mut self,
        dir: Direction,
        addr: u8,
        count: u8,
        data: Vec<u8, TRANSFER_DATA_MAX>,
    ) -> Result<Token, EnqueueError> {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1).max(1);
        let transfer = Transfer {
            dir,
            addr,
            count,
            data,
            retries_left: DEFAULT_RETRIES,
            token,
        };
        self.queue
            .push_back(transfer)
            .map_err(|_| EnqueueError::QueueFull)?;
        Ok(token)
    }

    /// Move the next queued transfer in flight and return a copy of it.
    pub fn start_next(&mut self) -> Option<&Transfer> {
        if self.in_flight.is_none() {
            self.in_flight = self.queue.pop_front();
        }
        self.in_flight.as_ref()
    }

    /// The transfer currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> Option<&Transfer> {
        self.in_flight.as_ref()
    }

    /// Complete the in-flight transfer successfully.
    pub fn finish(&mut self) -> Option<Transfer> {
        self.in_flight.take()
    }

    /// Fail the in-flight transfer.
    ///
    /// Retryable failures with remaining budget are requeued at the *head*
    /// (they run again before anything queued later); otherwise the transfer
    /// is dropped and `Some(transfer)` is returned for completion reporting.
    pub fn fail(&mut self, retryable: bool) -> Option<Transfer> {
        let mut transfer = self.in_flight.take()?;
        if retryable && transfer.retries_left > 0 {
            transfer.retries_left -= 1;
            // requeue at the head; a full queue cannot happen since we just
            // freed the in-flight slot of a bounded system, but fall back to
            // reporting failure rather than losing the ordering silently
            if self.queue.push_front(transfer.clone()).is_ok() {
                return None;
            }
        }
        Some(transfer)
    }
}

impl<const DEPTH: usize> Default for TransferQueue<DEPTH> {
    fn default() -> Self {
        Self::new()
    }
}
