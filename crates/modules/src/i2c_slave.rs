//! Slave-side I²C register server.
//!
//! Byte-level state machine behind the vendor I²C ISR: the first received
//! byte of a transaction selects the register, further written bytes carry
//! write data, a repeated-start read streams out prepared data. Sequential
//! access continues into `addr+1` without re-addressing; running onto an
//! invalid address degrades to dummy bytes and latches the link-error bit
//! served by the bank's status register.
//!
//! With CRC enabled each register's data is followed by one CRC-8 byte; the
//! first register's pre-image includes the bus address and direction bytes,
//! chained registers restart the CRC over their data bytes only (the same
//! rules the master side applies).

use link::crc::crc8;
use platform::timing::{cycles, Cycles};

use crate::regmap::MAX_REG_WIDTH;
use crate::uart_slave::{ReadAccess, ReadKind, RegisterBank, WriteOutcome};

/// Non-idle watchdog: a transaction stuck mid-flight this long resets the
/// driver.
pub const NON_IDLE_TIMEOUT: Cycles = cycles(50);

/// Bus-level faults reported to the node driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlaveFault {
    /// Non-idle watchdog expired; the peripheral should be reset.
    Watchdog,
    /// Peripheral reported busy while the driver was idle, twice in a row.
    IdleBusy,
}

/// Transaction direction as seen from the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusDirection {
    /// Master transmits (register address, then optionally write data).
    MasterWrite,
    /// Master receives (register read-out).
    MasterRead,
}

enum State {
    Idle,
    WaitingAddr,
    /// Register selected; waiting for write data or a repeated-start read.
    Selected,
    Write,
    Read,
}

/// I²C slave server around a [`RegisterBank`].
pub struct I2cSlave<B> {
    bank: B,
    state: State,
    own_address: u8,
    crc_enabled: bool,

    reg_addr: u8,
    reg_valid: bool,
    first_reg: bool,

    /// Read-side staging: prepared data (+ CRC) streamed to the master.
    read_buf: [u8; MAX_REG_WIDTH + 1],
    read_len: usize,
    read_pos: usize,

    /// Write-side staging: data (+ CRC) accumulated from the master.
    write_buf: [u8; MAX_REG_WIDTH + 1],
    write_expected: usize,
    write_pos: usize,

    link_error: bool,
    non_idle_remaining: Cycles,
    idle_busy_count: u8,
}

impl<B: RegisterBank> I2cSlave<B> {
    /// Wrap a bank served at the given 7-bit bus address.
    #[must_use]
    pub fn new(bank: B, own_address: u8, crc_enabled: bool) -> Self {
        Self {
            bank,
            state: State::Idle,
            own_address,
            crc_enabled,
            reg_addr: 0,
            reg_valid: false,
            first_reg: true,
            read_buf: [0; MAX_REG_WIDTH + 1],
            read_len: 0,
            read_pos: 0,
            write_buf: [0; MAX_REG_WIDTH + 1],
            write_expected: 0,
            write_pos: 0,
            link_error: false,
            non_idle_remaining: 0,
            idle_busy_count: 0,
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

    /// Address-match from the bus ISR.
    pub fn on_addressed(&mut self, direction: BusDirection) {
        self.non_idle_remaining = NON_IDLE_TIMEOUT;
        match direction {
            BusDirection::MasterWrite => {
                // a write always starts with the register address byte
                self.state = State::WaitingAddr;
            }
            BusDirection::MasterRead => {
                if matches!(self.state, State::Selected) {
                    self.state = State::Read;
                    self.prepare_read(true);
                } else {
                    // read without prior register selection: serve dummies
                    self.mark_invalid();
                    self.state = State::Read;
                    self.prepare_read(true);
                }
            }
        }
    }

    /// One byte received from the master.
    pub fn on_byte_written(&mut self, byte: u8) {
        self.non_idle_remaining = NON_IDLE_TIMEOUT;
        match self.state {
            State::WaitingAddr => {
                self.select_register(byte);
                self.state = State::Selected;
            }
            State::Selected | State::Write => {
                self.state = State::Write;
                self.accept_write_byte(byte);
            }
            _ => {
                // data in an unexpected state: swallow it, flag the error
                self.link_error = true;
            }
        }
    }

    /// Next byte to transmit to the master.
    pub fn next_read_byte(&mut self) -> u8 {
        self.non_idle_remaining = NON_IDLE_TIMEOUT;
        if !matches!(self.state, State::Read) {
            self.link_error = true;
            return 0;
        }
        if self.read_pos >= self.read_len {
            // register exhausted: chain into the next one
            self.advance_register();
            self.prepare_read(false);
        }
        let byte = self.read_buf[self.read_pos];
        self.read_pos += 1;
        byte
    }

    /// Stop condition / transaction end.
    pub fn on_stop(&mut self) {
        self.state = match self.state {
            // a write that only carried the register address keeps the
            // selection for a following repeated-start read
            State::Selected => State::Selected,
            _ => State::Idle,
        };
        self.non_idle_remaining = 0;
    }

    /// Per-cycle housekeeping.
    ///
    /// `bus_busy` is the peripheral's busy flag; two sightings of a busy bus
    /// while the driver is idle indicate a wedged peripheral.
    pub fn poll(&mut self, bus_busy: bool) -> Option<SlaveFault> {
        if matches!(self.state, State::Idle) {
            self.non_idle_remaining = 0;
            if bus_busy {
                self.idle_busy_count += 1;
                if self.idle_busy_count > 1 {
                    self.idle_busy_count = 0;
                    return Some(SlaveFault::IdleBusy);
                }
            } else {
                self.idle_busy_count = 0;
            }
            return None;
        }

        if self.non_idle_remaining > 0 {
            self.non_idle_remaining -= 1;
            if self.non_idle_remaining == 0 {
                self.reset_after_fault();
                return Some(SlaveFault::Watchdog);
            }
        }
        None
    }

    /// Reset the protocol state (after a peripheral reset).
    pub fn reset_after_fault(&mut self) {
        self.state = State::Idle;
        self.link_error = true;
        self.non_idle_remaining = 0;
        self.idle_busy_count = 0;
    }

    // ── internals ───────────────────────────────────────────────────────

    fn select_register(&mut self, addr: u8) {
        self.first_reg = true;
        if self.bank.layout().width(addr) == 0 {
            self.mark_invalid();
            return;
        }
        self.reg_addr = addr;
        self.reg_valid = true;
        self.begin_write_staging();
    }

    fn mark_invalid(&mut self) {
        self.reg_addr = 0;
        self.reg_valid = false;
        self.link_error = true;
        self.write_expected = 1;
        self.write_pos = 0;
    }

    fn begin_write_staging(&mut self) {
        let width = self.bank.layout().width(self.reg_addr);
        self.write_expected = width + usize::from(self.crc_enabled);
        self.write_pos = 0;
    }

    fn accept_write_byte(&mut self, byte: u8) {
        if self.write_pos < self.write_buf.len() {
            self.write_buf[self.write_pos] = byte;
        }
        self.write_pos += 1;
        if self.write_pos < self.write_expected {
            return;
        }

        if self.reg_valid {
            let width = self.write_expected - usize::from(self.crc_enabled);
            let data_ok = if self.crc_enabled {
                let mut crc = if self.first_reg {
                    crc8(0, &[self.own_address << 1, self.reg_addr])
                } else {
                    0
                };
                crc = crc8(crc, &self.write_buf[..width]);
                crc == self.write_buf[width]
            } else {
                true
            };

            if data_ok {
                let mut buf = [0u8; MAX_REG_WIDTH];
                buf[..width].copy_from_slice(&self.write_buf[..width]);
                match self.bank.write(self.reg_addr, &buf[..width]) {
                    Ok(WriteOutcome::Accepted | WriteOutcome::ResetRequested) => {}
                    Err(_code) => self.link_error = true,
                }
            } else {
                self.link_error = true;
            }
        }

        self.advance_register();
        self.begin_write_staging();
    }

    fn advance_register(&mut self) {
        self.first_reg = false;
        if !self.reg_valid {
            return;
        }
        let next = self.reg_addr.wrapping_add(1);
        if next != 0 && self.bank.layout().width(next) > 0 {
            self.reg_addr = next;
        } else {
            self.reg_addr = 0;
            self.reg_valid = false;
        }
    }

    fn prepare_read(&mut self, first: bool) {
        self.read_pos = 0;
        if !self.reg_valid {
            // dummy byte stream for invalid runs
            self.read_buf[0] = 0;
            self.read_len = 1 + usize::from(self.crc_enabled);
            if self.crc_enabled {
                self.read_buf[1] = 0;
            }
            return;
        }

        let width = self.bank.layout().width(self.reg_addr);
        let mut link_error = self.link_error;
        let access = ReadAccess {
            kind: ReadKind::Host,
            link_error: &mut link_error,
        };
        let served = self
            .bank
            .read(self.reg_addr, &mut self.read_buf[..width], access);
        self.link_error = link_error;

        match served {
            Ok(_) => {}
            Err(_code) => {
                self.read_buf[..width].fill(0);
                self.link_error = true;
            }
        }
        self.read_len = width;

        if self.crc_enabled {
            let mut crc = if first {
                let addr_w = self.own_address << 1;
                crc8(0, &[addr_w, self.reg_addr, addr_w | 0x01])
            } else {
                0
            };
            crc = crc8(crc, &self.read_buf[..width]);
            self.read_buf[width] = crc;
            self.read_len = width + 1;
        }
    }

    /// Sticky link-error flag, shared with the bank's status register via
    /// [`ReadAccess`] on reads; exposed for node drivers that surface it as
    /// an interrupt.
    #[must_use]
    pub fn link_error_pending(&self) -> bool {
        self.link_error
    }
}
