//! Master-side module client over the framed UART link.
//!
//! Commands go out as frames, responses come back as `READ_DATA` /
//! `WRITE_ACK` / `ERROR` messages; unsolicited `CHANGE_NOTIFICATION` and
//! `EVENT` traffic updates the shadow and the event queue. One transfer is
//! in flight at a time with a cycle-based response timeout.

use heapless::{Deque, Vec};
use link::{encode_frame, FrameDecoder};
use platform::timing::{cycles, Cycles};

use crate::protocol::{ErrorCode, EventKind, ModuleEvent, MsgType};
use crate::regmap::{RegisterLayout, RegisterShadow};
use crate::transfer::{
    Completion, Direction, EnqueueError, Token, TransferQueue, TRANSFER_DATA_MAX,
};

/// Capacity of one encoded outgoing frame (worst-case escaped write).
pub const FRAME_MAX: usize = 192;

/// Receive parse buffer capacity.
const PARSE_MAX: usize = 256;

/// Default response timeout for one transfer attempt.
pub const RESPONSE_TIMEOUT: Cycles = cycles(500);

/// UART master client for one remote module.
///
/// `SIZE` is the shadow size ([`crate::regmap::total_size`] of the layout),
/// `DEPTH` the transfer queue depth.
pub struct UartMaster<const SIZE: usize, const DEPTH: usize> {
    shadow: RegisterShadow<SIZE>,
    queue: TransferQueue<DEPTH>,
    completions: Deque<Completion, DEPTH>,
    events: Deque<ModuleEvent, 16>,
    decoder: FrameDecoder<PARSE_MAX>,
    tx: Deque<Vec<u8, FRAME_MAX>, 4>,
    response_timeout: Cycles,
    remaining_timeout: Cycles,
    awaiting_response: bool,
}

impl<const SIZE: usize, const DEPTH: usize> UartMaster<SIZE, DEPTH> {
    /// Create a client for the given register layout.
    #[must_use]
    pub fn new(layout: RegisterLayout) -> Self {
        Self {
            shadow: RegisterShadow::new(layout),
            queue: TransferQueue::new(),
            completions: Deque::new(),
            events: Deque::new(),
            decoder: FrameDecoder::new(),
            tx: Deque::new(),
            response_timeout: RESPONSE_TIMEOUT,
            remaining_timeout: 0,
            awaiting_response: false,
        }
    }

    /// Local shadow of the remote register map.
    #[must_use]
    pub fn shadow(&self) -> &RegisterShadow<SIZE> {
        &self.shadow
    }

    /// Queue a read of register `addr`.
    ///
    /// # Errors
    ///
    /// [`EnqueueError::BadAccess`] for invalid addresses,
    /// [`EnqueueError::QueueFull`] when the queue is saturated.
    pub fn read_register(&mut self, addr: u8) -> Result<Token, EnqueueError> {
        if !self.shadow.layout().is_valid(addr) {
            return Err(EnqueueError::BadAccess);
        }
        self.queue.enqueue(Direction::Read, addr, 1, Vec::new())
    }

    /// Queue a write of `data` to register `addr`.
    ///
    /// String registers accept any length up to their bound; fixed registers
    /// require an exact match.
    ///
    /// # Errors
    ///
    /// See [`UartMaster::read_register`].
    pub fn write_register(&mut self, addr: u8, data: &[u8]) -> Result<Token, EnqueueError> {
        let width = self.shadow.layout().width(addr);
        if width == 0 || data.len() > width || data.is_empty() {
            return Err(EnqueueError::BadAccess);
        }
        let mut payload: Vec<u8, TRANSFER_DATA_MAX> = Vec::new();
        payload
            .extend_from_slice(data)
            .map_err(|_| EnqueueError::BadAccess)?;
        self.queue.enqueue(Direction::Write, addr, 1, payload)
    }

    /// Take the next encoded frame to put on the wire.
    pub fn take_tx(&mut self) -> Option<Vec<u8, FRAME_MAX>> {
        self.tx.pop_front()
    }

    /// Pop the next transfer completion.
    pub fn next_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }

    /// Pop the next module event.
    pub fn next_event(&mut self) -> Option<ModuleEvent> {
        self.events.pop_front()
    }

    /// Drop all pending work (used when re-initialising after a reset).
    pub fn abort_all(&mut self) {
        self.queue.clear();
        self.awaiting_response = false;
        self.remaining_timeout = 0;
        self.tx.clear();
        self.decoder.reset();
    }

    /// Per-cycle update: timeout bookkeeping and transfer dispatch.
    pub fn poll(&mut self) {
        if self.awaiting_response {
            if self.remaining_timeout > 0 {
                self.remaining_timeout -= 1;
            }
            if self.remaining_timeout == 0 {
                // response never came: retry or report failure
                self.awaiting_response = false;
                if let Some(failed) = self.queue.fail(true) {
                    self.push_completion(Completion::failure(failed.token, None));
                }
            }
        }

        if !self.awaiting_response {
            self.dispatch_next();
        }
    }

    /// Feed one received byte from the link.
    pub fn on_rx_byte(&mut self, byte: u8) {
        let Some(result) = self.decoder.push(byte) else {
            return;
        };
        match result {
            Ok(payload) => {
                // detach the payload from the decoder borrow
                let mut frame: Vec<u8, PARSE_MAX> = Vec::new();
                if frame.extend_from_slice(payload).is_err() {
                    return;
                }
                self.process_frame(&frame);
            }
            Err(_) => {
                // local decode errors on the master side are transient;
                // the pending transfer recovers through its timeout
            }
        }
    }

    fn dispatch_next(&mut self) {
        let Some(transfer) = self.queue.start_next() else {
            return;
        };
        let mut payload: Vec<u8, TRANSFER_DATA_MAX> = Vec::new();
        let ok = match transfer.dir {
            Direction::Read => {
                payload.push(MsgType::READ).is_ok() && payload.push(transfer.addr).is_ok()
            }
            Direction::Write => {
                payload.push(MsgType::WRITE).is_ok()
                    && payload.push(transfer.addr).is_ok()
                    && payload.extend_from_slice(&transfer.data).is_ok()
            }
        };
        if !ok {
            if let Some(failed) = self.queue.fail(false) {
                self.push_completion(Completion::failure(failed.token, None));
            }
            return;
        }
        match encode_frame::<FRAME_MAX>(&payload) {
            Ok(frame) => {
                if self.tx.push_back(frame).is_ok() {
                    self.awaiting_response = true;
                    self.remaining_timeout = self.response_timeout;
                } else if let Some(failed) = self.queue.fail(true) {
                    self.push_completion(Completion::failure(failed.token, None));
                }
            }
            Err(_) => {
                if let Some(failed) = self.queue.fail(false) {
                    self.push_completion(Completion::failure(failed.token, None));
                }
            }
        }
    }

    fn process_frame(&mut self, payload: &[u8]) {
        let Some((&msg_type, rest)) = payload.split_first() else {
            return;
        };
        match msg_type {
            MsgType::EVENT => self.process_event(rest),
            MsgType::CHANGE_NOTIFICATION => {
                if let Some((&addr, data)) = rest.split_first() {
                    if self.shadow.store(addr, data) {
                        self.push_event(ModuleEvent::RegisterChanged(addr));
                    }
                }
            }
            MsgType::READ_DATA => {
                if let Some((&addr, data)) = rest.split_first() {
                    self.shadow.store(addr, data);
                    self.complete_read(addr, data);
                }
            }
            _ => {}
        }
    }

    fn process_event(&mut self, rest: &[u8]) {
        let Some((&kind, params)) = rest.split_first() else {
            return;
        };
        match kind {
            k if k == EventKind::McuReset as u8 => {
                // pending command is gone with the remote state
                self.fail_in_flight(None, true);
                self.push_event(ModuleEvent::ModuleReset);
            }
            k if k == EventKind::BtReset as u8 => {
                self.push_event(ModuleEvent::BtReset);
            }
            k if k == EventKind::WriteAck as u8 => {
                if let Some(&addr) = params.first() {
                    self.complete_write(addr);
                }
            }
            k if k == EventKind::Error as u8 => {
                if params.len() >= 2 {
                    let code = ErrorCode(u16::from_le_bytes([params[0], params[1]]));
                    self.push_event(ModuleEvent::RemoteError(code));
                    self.fail_in_flight(Some(code), code.is_retryable());
                }
            }
            _ => {}
        }
    }

    fn complete_read(&mut self, addr: u8, data: &[u8]) {
        let matches = self
            .queue
            .in_flight()
            .is_some_and(|t| t.dir == Direction::Read && t.addr == addr);
        if !matches {
            return;
        }
        self.awaiting_response = false;
        if let Some(done) = self.queue.finish() {
            let completion = Completion::success(done.token, le_value(data), data.len());
            self.push_completion(completion);
        }
    }

    fn complete_write(&mut self, addr: u8) {
        let matches = self
            .queue
            .in_flight()
            .is_some_and(|t| t.dir == Direction::Write && t.addr == addr);
        if !matches {
            return;
        }
        self.awaiting_response = false;
        if let Some(done) = self.queue.finish() {
            let completion = Completion::success(done.token, le_value(&done.data), done.data.len());
            self.push_completion(completion);
        }
    }

    fn fail_in_flight(&mut self, code: Option<ErrorCode>, retryable: bool) {
        if !self.queue.has_in_flight() {
            return;
        }
        self.awaiting_response = false;
        if let Some(failed) = self.queue.fail(retryable) {
            self.push_completion(Completion::failure(failed.token, code));
        }
    }

    fn push_completion(&mut self, completion: Completion) {
        // a full completion queue drops the oldest entry; consumers that care
        // about every completion size DEPTH accordingly
        if self.completions.push_back(completion).is_err() {
            self.completions.pop_front();
            let _ = self.completions.push_back(completion);
        }
    }

    fn push_event(&mut self, event: ModuleEvent) {
        if self.events.push_back(event).is_err() {
            self.events.pop_front();
            let _ = self.events.push_back(event);
        }
    }
}

/// Little-endian value of the first ≤ 4 bytes.
fn le_value(data: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    let n = data.len().min(4);
    word[..n].copy_from_slice(&data[..n]);
    u32::from_le_bytes(word)
}
