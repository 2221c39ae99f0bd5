//! Blocking I²C driver for the battery-gauge IC.
//!
//! Three access families:
//!
//! - **Direct commands**: one-byte register address, raw data.
//! - **Subcommands**: 16-bit command written little-endian to the transfer
//!   register, data exchanged through the 32-byte transfer buffer with a
//!   one's-complement sum checksum and auto-increment on long reads.
//! - **Data memory**: subcommand access at the data-memory addresses.
//!
//! The gauge may run with per-byte CRC-8 protection on or off; the driver
//! mirrors the mode in [`GaugeDriver::crc_active`] and the supervisor
//! auto-detects it (the mode can flip underneath us on a gauge reset).

use embedded_hal::i2c::I2c;
use link::crc::crc8;

/// 7-bit bus address of the gauge.
pub const GAUGE_ADDR: u8 = crate::config::SET_I2C_ADDRESS;

/// Expected DEVICE_NUMBER readback.
pub const EXPECTED_DEVICE_NUMBER: u16 = 0x7605;

/// Default retry budget for gauge transfers.
pub const COMM_MAX_TRIES: u8 = 3;

/// Direct command addresses.
pub mod dircmd {
    /// Safety alert raw byte A.
    pub const SAFETY_ALERT_A: u8 = 0x02;
    /// Safety fault raw byte A.
    pub const SAFETY_STATUS_A: u8 = 0x03;
    /// Safety alert raw byte B.
    pub const SAFETY_ALERT_B: u8 = 0x04;
    /// Safety fault raw byte B.
    pub const SAFETY_STATUS_B: u8 = 0x05;
    /// Battery status word.
    pub const BATTERY_STATUS: u8 = 0x12;
    /// Cell 1 voltage (cells 1–5 contiguous, mV).
    pub const CELL1_VOLTAGE: u8 = 0x14;
    /// Stack voltage (mV).
    pub const STACK_VOLTAGE: u8 = 0x34;
    /// Pack current (user units).
    pub const CURRENT: u8 = 0x3A;
    /// Alarm status word (write-1-to-clear).
    pub const ALARM_STATUS: u8 = 0x62;
    /// Internal die temperature.
    pub const INT_TEMP: u8 = 0x68;
    /// Thermistor measurement.
    pub const TS_MEASUREMENT: u8 = 0x70;
    /// FET control register.
    pub const FET_CONTROL: u8 = 0x97;
}

/// Subcommand codes.
pub mod subcmd {
    /// Device identification.
    pub const DEVICE_NUMBER: u16 = 0x0001;
    /// Full gauge reset.
    pub const RESET: u16 = 0x0012;
    /// Toggle host FET control.
    pub const FET_ENABLE: u16 = 0x0022;
    /// Enter CFGUPDATE mode.
    pub const SET_CFGUPDATE: u16 = 0x0090;
    /// Exit CFGUPDATE mode.
    pub const EXIT_CFGUPDATE: u16 = 0x0092;
    /// Enter deepsleep (must be sent twice).
    pub const DEEPSLEEP: u16 = 0x000F;
    /// Exit deepsleep.
    pub const EXIT_DEEPSLEEP: u16 = 0x000E;
    /// Shutdown (twice = scheduled, three times = instant).
    pub const SHUTDOWN: u16 = 0x0010;
    /// Disable autonomous sleep.
    pub const SLEEP_DISABLE: u16 = 0x009A;
    /// Accumulated charge + integration time.
    pub const PASSQ: u16 = 0x0074;
}

/// Base address of the data-memory calibration region.
pub const DATA_MEM_BASE: u16 = 0x9000;

/// Transfer-buffer registers used by the subcommand protocol.
const REG_SUBCOMMAND: u8 = 0x3E;
const REG_DATA: u8 = 0x40;
const REG_CHECKSUM: u8 = 0x60;

/// Driver errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror_no_std::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GaugeError {
    /// Bus transaction failed.
    #[error("gauge bus error")]
    Bus,
    /// CRC or transfer-buffer checksum mismatch.
    #[error("gauge checksum mismatch")]
    Checksum,
    /// Unexpected readback (command echo, chunk length).
    #[error("gauge bad response")]
    BadResponse,
    /// Length/parameter out of range.
    #[error("gauge invalid parameter")]
    InvalidParam,
}

/// Raw transaction buffer: 32 data bytes with CRC interleave, plus command.
const BUF: usize = 1 + 2 * 36;

/// The gauge bus driver.
pub struct GaugeDriver {
    /// Whether per-byte CRC protection is active.
    pub crc_active: bool,
    address: u8,
}

impl GaugeDriver {
    /// Driver assuming no-CRC mode until detection says otherwise.
    #[must_use]
    pub fn new(address: u8) -> Self {
        Self {
            crc_active: false,
            address,
        }
    }

    /// Read `out.len()` bytes from direct command `cmd`.
    ///
    /// # Errors
    ///
    /// [`GaugeError`] after the retry budget is exhausted.
    pub fn direct_read<B: I2c>(
        &mut self,
        bus: &mut B,
        cmd: u8,
        out: &mut [u8],
        max_tries: u8,
    ) -> Result<(), GaugeError> {
        let len = out.len();
        if len == 0 || len > 36 {
            return Err(GaugeError::InvalidParam);
        }
        let wire_len = if self.crc_active { 2 * len } else { len };

        let mut last = GaugeError::Bus;
        for _ in 0..max_tries {
            let mut raw = [0u8; BUF];
            if bus
                .write_read(self.address, &[cmd], &mut raw[..wire_len])
                .is_err()
            {
                last = GaugeError::Bus;
                continue;
            }

            if self.crc_active {
                let addr_w = self.address << 1;
                let mut ok = true;
                for (i, slot) in out.iter_mut().enumerate() {
                    let data = raw[2 * i];
                    let received = raw[2 * i + 1];
                    let mut crc = if i == 0 {
                        crc8(0, &[addr_w, cmd, addr_w | 0x01])
                    } else {
                        0
                    };
                    crc = crc8(crc, &[data]);
                    if crc != received {
                        ok = false;
                        break;
                    }
                    *slot = data;
                }
                if !ok {
                    last = GaugeError::Checksum;
                    continue;
                }
            } else {
                out.copy_from_slice(&raw[..len]);
            }
            return Ok(());
        }
        Err(last)
    }

    /// Write `data` to direct command `cmd`.
    ///
    /// # Errors
    ///
    /// [`GaugeError`] after the retry budget is exhausted.
    pub fn direct_write<B: I2c>(
        &mut self,
        bus: &mut B,
        cmd: u8,
        data: &[u8],
        max_tries: u8,
    ) -> Result<(), GaugeError> {
        let len = data.len();
        if len == 0 || len > 36 {
            return Err(GaugeError::InvalidParam);
        }

        let mut raw = [0u8; BUF];
        raw[0] = cmd;
        let wire_len = if self.crc_active {
            let addr_w = self.address << 1;
            for (i, &byte) in data.iter().enumerate() {
                let mut crc = if i == 0 { crc8(0, &[addr_w, cmd]) } else { 0 };
                crc = crc8(crc, &[byte]);
                raw[1 + 2 * i] = byte;
                raw[2 + 2 * i] = crc;
            }
            1 + 2 * len
        } else {
            raw[1..1 + len].copy_from_slice(data);
            1 + len
        };

        for _ in 0..max_tries {
            if bus.write(self.address, &raw[..wire_len]).is_ok() {
                return Ok(());
            }
        }
        Err(GaugeError::Bus)
    }

    /// Issue a bare subcommand.
    ///
    /// # Errors
    ///
    /// See [`GaugeDriver::direct_write`].
    pub fn subcommand_only<B: I2c>(
        &mut self,
        bus: &mut B,
        cmd: u16,
        max_tries: u8,
    ) -> Result<(), GaugeError> {
        self.direct_write(bus, REG_SUBCOMMAND, &cmd.to_le_bytes(), max_tries)
    }

    /// Read `out.len()` bytes of subcommand response data, chunked through
    /// the 32-byte transfer buffer with echo and checksum verification.
    ///
    /// # Errors
    ///
    /// [`GaugeError::BadResponse`] on echo/length mismatch,
    /// [`GaugeError::Checksum`] on a bad transfer checksum.
    pub fn subcommand_read<B: I2c>(
        &mut self,
        bus: &mut B,
        cmd: u16,
        out: &mut [u8],
        max_tries: u8,
    ) -> Result<(), GaugeError> {
        if out.is_empty() {
            return Err(GaugeError::InvalidParam);
        }

        let mut last = GaugeError::Bus;
        'attempt: for _ in 0..max_tries {
            if let Err(e) = self.subcommand_only(bus, cmd, 1) {
                last = e;
                continue;
            }

            let total = out.len();
            let mut offset = 0usize;
            while offset < total {
                // read back echo, data window, checksum and length; the read
                // also auto-increments the gauge's internal address
                let mut window = [0u8; 36];
                if let Err(e) = self.direct_read(bus, REG_SUBCOMMAND, &mut window, 1) {
                    last = e;
                    continue 'attempt;
                }

                let echo = u16::from_le_bytes([window[0], window[1]]);
                #[allow(clippy::cast_possible_truncation)]
                let expected_echo = cmd.wrapping_add(offset as u16);
                if echo != expected_echo {
                    last = GaugeError::BadResponse;
                    continue 'attempt;
                }

                let chunk_len = usize::from(window[35]);
                let remaining = total - offset;
                if chunk_len < 36 && remaining + 4 > chunk_len {
                    last = GaugeError::BadResponse;
                    continue 'attempt;
                }

                let mut sum = 0u8;
                for &b in window.iter().take(chunk_len.saturating_sub(2).min(34)) {
                    sum = sum.wrapping_add(b);
                }
                if !sum != window[34] {
                    last = GaugeError::Checksum;
                    continue 'attempt;
                }

                let take = remaining.min(chunk_len.saturating_sub(4)).min(32);
                out[offset..offset + take].copy_from_slice(&window[2..2 + take]);
                offset += 32;
            }
            return Ok(());
        }
        Err(last)
    }

    /// Write `data` as subcommand payload (≤ 32 bytes).
    ///
    /// # Errors
    ///
    /// See [`GaugeDriver::direct_write`].
    pub fn subcommand_write<B: I2c>(
        &mut self,
        bus: &mut B,
        cmd: u16,
        data: &[u8],
        max_tries: u8,
    ) -> Result<(), GaugeError> {
        if data.is_empty() || data.len() > 32 {
            return Err(GaugeError::InvalidParam);
        }

        // one's-complement sum over command and data, length includes the
        // 4 bytes of echo + checksum/length trailer
        let cmd_bytes = cmd.to_le_bytes();
        let mut sum = cmd_bytes[0].wrapping_add(cmd_bytes[1]);
        for &b in data {
            sum = sum.wrapping_add(b);
        }
        #[allow(clippy::cast_possible_truncation)]
        let trailer = [!sum, (data.len() + 4) as u8];

        let mut last = GaugeError::Bus;
        for _ in 0..max_tries {
            if let Err(e) = self.subcommand_only(bus, cmd, 1) {
                last = e;
                continue;
            }
            if let Err(e) = self.direct_write(bus, REG_DATA, data, 1) {
                last = e;
                continue;
            }
            match self.direct_write(bus, REG_CHECKSUM, &trailer, 1) {
                Ok(()) => return Ok(()),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// Read from data memory (subcommand access at the memory address).
    ///
    /// # Errors
    ///
    /// See [`GaugeDriver::subcommand_read`].
    pub fn data_memory_read<B: I2c>(
        &mut self,
        bus: &mut B,
        address: u16,
        out: &mut [u8],
        max_tries: u8,
    ) -> Result<(), GaugeError> {
        self.subcommand_read(bus, address, out, max_tries)
    }

    /// Write to data memory (CFGUPDATE mode required for persistence).
    ///
    /// # Errors
    ///
    /// See [`GaugeDriver::subcommand_write`].
    pub fn data_memory_write<B: I2c>(
        &mut self,
        bus: &mut B,
        address: u16,
        data: &[u8],
        max_tries: u8,
    ) -> Result<(), GaugeError> {
        self.subcommand_write(bus, address, data, max_tries)
    }
}
