//! Slave-side UART host: serves a register bank and originates events.
//!
//! Owns the receive decoder, the outbound notification queue (with
//! high-priority front insertion and per-item retransmit budgets) and the
//! change-notification diff engine. All bank callbacks run in main-loop
//! context; ISRs only deposit bytes and completion flags upstream.

use heapless::{Deque, Vec};
use link::{encode_frame, FrameDecoder, FrameError};
use platform::timing::{cycles, Cycles};

use crate::protocol::{ErrorCode, EventKind, MsgType};
use crate::regmap::{RegisterLayout, RegisterShadow, MAX_REG_WIDTH};

/// Period of the change-notification check.
pub const CHANGE_NOTIF_CHECK_PERIOD: Cycles = cycles(1000);

/// Retransmit attempts per outbound frame before the driver resets.
pub const RETRANSMIT_ATTEMPTS: u8 = 3;

/// Non-idle watchdog: a frame left open this long without completing resets
/// the receive path.
pub const RX_FRAME_TIMEOUT: Cycles = cycles(50);

/// Capacity of one encoded outbound frame.
pub const TX_FRAME_MAX: usize = 96;

const PARSE_MAX: usize = 96;
const TX_QUEUE_DEPTH: usize = 16;

/// What kind of read is being served (some status bits are clear-on-read and
/// must not be consumed by change notifications).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReadKind {
    /// A read requested by the host controller.
    Host,
    /// A snapshot read for the change-notification engine.
    Notification,
}

/// Context handed to [`RegisterBank::read`].
pub struct ReadAccess<'a> {
    /// See [`ReadKind`].
    pub kind: ReadKind,
    /// Sticky link-error flag; a `Host` read of the status register reports
    /// and clears it.
    pub link_error: &'a mut bool,
}

/// Node-side effect of an accepted register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteOutcome {
    /// Plain write, acknowledge it.
    Accepted,
    /// The write requested a controller reset; the node driver performs it
    /// after the acknowledgement drains.
    ResetRequested,
}

/// A module's register bank as served over either link.
pub trait RegisterBank {
    /// Width table of this module.
    fn layout(&self) -> RegisterLayout;

    /// Serve a read of `addr` into `out` (`out.len()` equals the register
    /// width). Returns the number of valid bytes, which may be shorter for
    /// string registers.
    ///
    /// # Errors
    ///
    /// An [`ErrorCode`] to report to the host instead of data.
    fn read(&mut self, addr: u8, out: &mut [u8], access: ReadAccess<'_>)
        -> Result<usize, ErrorCode>;

    /// Apply a write of `data` to `addr`.
    ///
    /// # Errors
    ///
    /// An [`ErrorCode`] to report to the host; the write is discarded.
    fn write(&mut self, addr: u8, data: &[u8]) -> Result<WriteOutcome, ErrorCode>;
}

/// Change-notification behaviour of a UART-attached bank (I²C modules use
/// the interrupt line instead and don't implement this).
pub trait NotifyingBank: RegisterBank {
    /// Registers eligible for change notifications, ascending.
    fn notified_registers(&self) -> &'static [u8];

    /// Notification-mask register address.
    fn notif_mask_addr(&self) -> u8;

    /// Writable bits of the notification mask.
    fn notif_mask_allowed(&self) -> u32;

    /// Default notification mask (restored on MCU reset only).
    fn default_notif_mask(&self) -> u32;

    /// Whether a register changed in a way worth notifying.
    ///
    /// The default is bitwise; banks override it for status words (compare
    /// semantically relevant groups), floats (NaN-aware) and strings.
    fn differs(&self, addr: u8, last: &[u8], current: &[u8]) -> bool {
        let _ = addr;
        last != current
    }
}

struct TxItem {
    frame: Vec<u8, TX_FRAME_MAX>,
    attempts: u8,
}

/// UART slave host around a [`RegisterBank`].
///
/// `SIZE` is the packed size of the bank's layout (for the notification
/// snapshot).
pub struct UartSlave<B, const SIZE: usize> {
    bank: B,
    decoder: FrameDecoder<PARSE_MAX>,
    snapshot: RegisterShadow<SIZE>,
    notif_mask: u32,
    queue: Deque<TxItem, TX_QUEUE_DEPTH>,
    in_flight: Option<TxItem>,
    transmit_ready: bool,
    force_check: bool,
    link_error: bool,
    driver_error: bool,
    mid_frame_cycles: Cycles,
}

impl<B: NotifyingBank, const SIZE: usize> UartSlave<B, SIZE> {
    /// Wrap a bank; the notification mask starts at the bank default.
    #[must_use]
    pub fn new(bank: B) -> Self {
        let snapshot = RegisterShadow::new(bank.layout());
        let notif_mask = bank.default_notif_mask();
        Self {
            bank,
            decoder: FrameDecoder::new(),
            snapshot,
            notif_mask,
            queue: Deque::new(),
            in_flight: None,
            transmit_ready: true,
            force_check: false,
            link_error: false,
            driver_error: false,
            mid_frame_cycles: 0,
        }
    }

    /// The served bank (node driver access).
    pub fn bank_mut(&mut self) -> &mut B {
        &mut self.bank
    }

    /// The served bank.
    pub fn bank(&self) -> &B {
        &self.bank
    }

    /// Current notification mask.
    #[must_use]
    pub fn notif_mask(&self) -> u32 {
        self.notif_mask
    }

    /// Queue the MCU-reset announcement (high priority) and restore the
    /// default notification mask.
    pub fn announce_mcu_reset(&mut self) {
        self.notif_mask = self.bank.default_notif_mask();
        self.queue_event(EventKind::McuReset, &[], true);
    }

    /// Report a node-level error to the host.
    pub fn report_error(&mut self, code: ErrorCode, high_priority: bool) {
        if matches!(
            code,
            ErrorCode::UART_FORMAT
                | ErrorCode::UART_CRC
                | ErrorCode::INTERNAL_UART
                | ErrorCode::COMMAND_NOT_ALLOWED
        ) {
            self.link_error = true;
        }
        self.queue_event(EventKind::Error, &code.0.to_le_bytes(), high_priority);
    }

    /// Run the change-notification check on the next poll.
    pub fn force_change_check(&mut self) {
        self.force_check = true;
    }

    /// Feed one received byte from the link.
    pub fn on_rx_byte(&mut self, byte: u8) {
        let outcome = match self.decoder.push(byte) {
            None => return,
            Some(Ok(payload)) => {
                let mut frame: Vec<u8, PARSE_MAX> = Vec::new();
                if frame.extend_from_slice(payload).is_err() {
                    return;
                }
                Ok(frame)
            }
            Some(Err(e)) => Err(e),
        };
        match outcome {
            Ok(frame) => self.process_command(&frame),
            Err(FrameError::Crc) => self.report_error(ErrorCode::UART_CRC, false),
            Err(_) => self.report_error(ErrorCode::UART_FORMAT, false),
        }
    }

    /// Signal a hardware-level link fault (ISR sets a flag, node driver
    /// forwards it here); the driver resets its state and tells the host.
    pub fn on_link_fault(&mut self) {
        self.driver_error = true;
    }

    /// Completion of the physical transmission of the current frame.
    pub fn on_tx_complete(&mut self) {
        self.in_flight = None;
        self.transmit_ready = true;
    }

    /// Physical transmission failure of the current frame.
    pub fn on_tx_error(&mut self) {
        self.transmit_ready = true;
        let Some(mut item) = self.in_flight.take() else {
            return;
        };
        if item.attempts >= RETRANSMIT_ATTEMPTS {
            self.driver_error = true;
            return;
        }
        item.attempts += 1;
        if self.queue.push_front(item).is_err() {
            self.driver_error = true;
        }
    }

    /// Per-cycle update. Returns the next frame to transmit, if the link is
    /// free and something is queued.
    pub fn poll(&mut self, loop_count: u32) -> Option<Vec<u8, TX_FRAME_MAX>> {
        if self.driver_error {
            // internal reset: drop everything, re-announce with an error event
            self.driver_error = false;
            self.queue.clear();
            self.in_flight = None;
            self.transmit_ready = true;
            self.decoder.reset();
            self.link_error = true;
            self.queue_event(EventKind::Error, &ErrorCode::INTERNAL_UART.0.to_le_bytes(), true);
        }

        // non-idle watchdog: a frame that never closes keeps the parser
        // hostage; time it out with a format error
        if self.decoder.is_mid_frame() {
            self.mid_frame_cycles += 1;
            if self.mid_frame_cycles >= RX_FRAME_TIMEOUT {
                self.mid_frame_cycles = 0;
                self.decoder.reset();
                self.report_error(ErrorCode::UART_FORMAT, false);
            }
        } else {
            self.mid_frame_cycles = 0;
        }

        if self.force_check || loop_count % CHANGE_NOTIF_CHECK_PERIOD == 0 {
            self.force_check = false;
            self.run_change_check();
        }

        if !self.transmit_ready {
            return None;
        }
        let item = self.queue.pop_front()?;
        let frame = item.frame.clone();
        self.in_flight = Some(item);
        self.transmit_ready = false;
        Some(frame)
    }

    // ── command handling ────────────────────────────────────────────────

    fn process_command(&mut self, frame: &[u8]) {
        match frame.split_first() {
            Some((&MsgType::READ, rest)) if rest.len() == 1 => self.serve_read(rest[0]),
            Some((&MsgType::WRITE, rest)) if rest.len() >= 2 => {
                self.serve_write(rest[0], &rest[1..]);
            }
            _ => self.report_error(ErrorCode::UART_FORMAT, false),
        }
    }

    fn serve_read(&mut self, addr: u8) {
        if addr == self.bank.notif_mask_addr() {
            #[allow(clippy::cast_possible_truncation)] // mask registers are 16-bit
            let mask = self.notif_mask as u16;
            self.queue_status(MsgType::READ_DATA, addr, &mask.to_le_bytes());
            return;
        }
        let width = self.bank.layout().width(addr);
        if width == 0 {
            self.report_error(ErrorCode::UART_FORMAT, false);
            return;
        }
        let mut buf = [0u8; MAX_REG_WIDTH];
        let access = ReadAccess {
            kind: ReadKind::Host,
            link_error: &mut self.link_error,
        };
        match self.bank.read(addr, &mut buf[..width], access) {
            Ok(len) => self.queue_status(MsgType::READ_DATA, addr, &buf[..len]),
            Err(code) => self.report_error(code, false),
        }
    }

    fn serve_write(&mut self, addr: u8, data: &[u8]) {
        if addr == self.bank.notif_mask_addr() {
            if data.len() == 2 {
                self.notif_mask =
                    u32::from(u16::from_le_bytes([data[0], data[1]])) & self.bank.notif_mask_allowed();
                self.queue_event(EventKind::WriteAck, &[addr], false);
            } else {
                self.report_error(ErrorCode::UART_FORMAT, false);
            }
            return;
        }
        let width = self.bank.layout().width(addr);
        if width == 0 || data.len() > width {
            self.report_error(ErrorCode::UART_FORMAT, false);
            return;
        }
        match self.bank.write(addr, data) {
            Ok(_outcome) => self.queue_event(EventKind::WriteAck, &[addr], false),
            Err(code) => self.report_error(code, false),
        }
    }

    // ── change notifications ────────────────────────────────────────────

    fn run_change_check(&mut self) {
        let regs = self.bank.notified_registers();
        for &addr in regs {
            let width = self.bank.layout().width(addr);
            if width == 0 {
                continue;
            }
            let mut buf = [0u8; MAX_REG_WIDTH];
            let access = ReadAccess {
                kind: ReadKind::Notification,
                link_error: &mut self.link_error,
            };
            let Ok(len) = self.bank.read(addr, &mut buf[..width], access) else {
                continue;
            };
            let masked = addr < 32 && self.notif_mask & (1u32 << addr) != 0;
            if masked && self.bank.differs(addr, self.snapshot.bytes(addr), &buf[..len]) {
                self.queue_status(MsgType::CHANGE_NOTIFICATION, addr, &buf[..len]);
            }
            // snapshot every notified register so un-masking later doesn't
            // replay stale diffs
            self.snapshot.store(addr, &buf[..len]);
        }
    }

    // ── outbound queue ──────────────────────────────────────────────────

    fn queue_status(&mut self, msg_type: u8, addr: u8, data: &[u8]) {
        let mut payload: Vec<u8, { TX_FRAME_MAX / 2 }> = Vec::new();
        let ok = payload.push(msg_type).is_ok()
            && payload.push(addr).is_ok()
            && payload.extend_from_slice(data).is_ok();
        if ok {
            self.queue_frame(&payload, false);
        } else {
            self.driver_error = true;
        }
    }

    fn queue_event(&mut self, kind: EventKind, params: &[u8], high_priority: bool) {
        let mut payload: Vec<u8, { TX_FRAME_MAX / 2 }> = Vec::new();
        let ok = payload.push(MsgType::EVENT).is_ok()
            && payload.push(kind as u8).is_ok()
            && payload.extend_from_slice(params).is_ok();
        if ok {
            self.queue_frame(&payload, high_priority);
        } else {
            self.driver_error = true;
        }
    }

    fn queue_frame(&mut self, payload: &[u8], high_priority: bool) {
        let Ok(frame) = encode_frame::<TX_FRAME_MAX>(payload) else {
            self.driver_error = true;
            return;
        };
        let item = TxItem { frame, attempts: 0 };
        let pushed = if high_priority {
            self.queue.push_front(item)
        } else {
            self.queue.push_back(item)
        };
        if pushed.is_err() {
            self.driver_error = true;
        }
    }
}
