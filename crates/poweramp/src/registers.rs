//! Register bank of the power-amp node (I²C-attached).

use modules::interrupts::{IntController, INT_RESET};
use modules::{total_size, ErrorCode, ReadAccess, ReadKind, RegisterBank, RegisterLayout, WriteOutcome};

use crate::monitor::{ChannelStats, OutputMonitor, CHANNELS};
use crate::pvdd::{PvddController, PvddEvent, OFFSET_MAX};
use crate::safety::{Kind, SafetySupervisor, Scale, Severity};

/// General status (2 B bit field, r).
pub const REG_STATUS: u8 = 0x01;
/// General control (1 B, rw).
pub const REG_CONTROL: u8 = 0x08;
/// Interrupt mask (1 B, rw).
pub const REG_INT_MASK: u8 = 0x10;
/// Interrupt flags (1 B, rc, write 0 to clear).
pub const REG_INT_FLAGS: u8 = 0x11;
/// PVDD target voltage (4 B f32 LE, rw).
pub const REG_PVDD_TARGET: u8 = 0x20;
/// PVDD requested voltage (4 B f32 LE, r).
pub const REG_PVDD_REQ: u8 = 0x21;
/// PVDD measured voltage (4 B f32 LE, r).
pub const REG_PVDD_MEASURED: u8 = 0x22;
/// First monitor register: V_rms fast, channel A. The monitor block runs
/// through 0x4F as {V_rms, I_rms, P_avg, P_app} × {fast, slow} × {A–D}.
pub const REG_MON_BASE: u8 = 0x30;
/// First error-threshold register (I_rms inst A); see the map comment.
pub const REG_SERR_BASE: u8 = 0x50;
/// First warning-threshold register.
pub const REG_SWARN_BASE: u8 = 0x80;
/// Safety status (1 B, r).
pub const REG_SAFETY_STATUS: u8 = 0xB0;
/// Latched error source (2 B, r).
pub const REG_SERR_SOURCE: u8 = 0xB1;
/// Warning source (2 B, r).
pub const REG_SWARN_SOURCE: u8 = 0xB2;
/// Module identity (1 B, r).
pub const REG_MODULE_ID: u8 = 0xFF;

/// MODULE_ID constant of the power amp.
pub const AMP_MODULE_ID: u8 = 0xAF;

/// STATUS bits.
pub mod status {
    /// Amplifier IC fault pin active.
    pub const AMP_FAULT: u16 = 0x0001;
    /// Amplifier IC clip/over-temperature warning pin active.
    pub const AMP_CLIPOTW: u16 = 0x0002;
    /// Amp held in reset (any shutdown cause).
    pub const AMP_SD: u16 = 0x0004;
    /// PVDD rail matches its request.
    pub const PVDD_VALID: u16 = 0x0008;
    /// PVDD reduction in progress.
    pub const PVDD_RED: u16 = 0x0010;
    /// PVDD offset non-zero.
    pub const PVDD_ONZ: u16 = 0x0020;
    /// PVDD offset at its limit.
    pub const PVDD_OLIM: u16 = 0x0040;
    /// Any safety warning active.
    pub const SWARN: u16 = 0x0080;
    /// Link error since last STATUS read (clear-on-read).
    pub const I2CERR: u16 = 0x8000;
}

/// CONTROL bits.
pub mod control {
    /// Interrupt output enable.
    pub const INT_EN: u8 = 0x01;
    /// Manual amplifier shutdown.
    pub const AMP_MAN_SD: u8 = 0x02;
    /// Reset nibble position; write [`RESET_VALUE`] to reboot.
    pub const RESET_POS: u8 = 4;
    /// Reset nibble magic.
    pub const RESET_VALUE: u8 = 0xA;
}

/// SAFETY_STATUS bits.
pub mod safety_status {
    /// Safety shutdown latched.
    pub const SERR_SD: u8 = 0x01;
    /// Manual shutdown asserted.
    pub const MAN_SD: u8 = 0x02;
}

/// Interrupt flag bits (bit 0 is the shared reset flag).
pub mod int_flags {
    /// Module reset (set at boot).
    pub const RESET: u8 = super::INT_RESET;
    /// Safety error latched.
    pub const SERR: u8 = 0x02;
    /// Safety warning raised.
    pub const SWARN: u8 = 0x04;
    /// PVDD fault.
    pub const PVDD_ERR: u8 = 0x08;
    /// PVDD reduction finished.
    pub const PVDD_REDDONE: u8 = 0x10;
    /// PVDD offset hit its limit.
    pub const PVDD_OLIM: u8 = 0x20;
}

const fn widths() -> [u8; 256] {
    let mut w = [0u8; 256];
    w[REG_STATUS as usize] = 2;
    w[REG_CONTROL as usize] = 1;
    w[REG_INT_MASK as usize] = 1;
    w[REG_INT_FLAGS as usize] = 1;
    w[REG_PVDD_TARGET as usize] = 4;
    w[REG_PVDD_REQ as usize] = 4;
    w[REG_PVDD_MEASURED as usize] = 4;
    // monitor block: 8 arrays × 4 channels of f32
    let mut a = REG_MON_BASE as usize;
    while a < 0x50 {
        w[a] = 4;
        a += 1;
    }
    // threshold blocks: 3 kinds × 3 scales × 5 slots with a gap per kind
    let mut kind = 0;
    while kind < 3 {
        let mut i = 0;
        while i < 15 {
            w[REG_SERR_BASE as usize + 0x10 * kind + i] = 4;
            w[REG_SWARN_BASE as usize + 0x10 * kind + i] = 4;
            i += 1;
        }
        kind += 1;
    }
    w[REG_SAFETY_STATUS as usize] = 1;
    w[REG_SERR_SOURCE as usize] = 2;
    w[REG_SWARN_SOURCE as usize] = 2;
    w[REG_MODULE_ID as usize] = 1;
    w
}

/// Width table of the power-amp map.
pub static AMP_WIDTHS: [u8; 256] = widths();
/// Packed shadow size of the power-amp map.
pub const AMP_SHADOW_SIZE: usize = total_size(&AMP_WIDTHS);

/// Layout handle for master-side clients.
#[must_use]
pub fn amp_layout() -> RegisterLayout {
    RegisterLayout::new(&AMP_WIDTHS)
}

fn decode_threshold(addr: u8) -> Option<(Severity, Kind, Scale, usize)> {
    let (severity, base) = if (REG_SERR_BASE..REG_SWARN_BASE).contains(&addr) {
        (Severity::Error, REG_SERR_BASE)
    } else if (REG_SWARN_BASE..=0xAE).contains(&addr) {
        (Severity::Warning, REG_SWARN_BASE)
    } else {
        return None;
    };
    let offset = usize::from(addr - base);
    let kind = match offset / 0x10 {
        0 => Kind::Current,
        1 => Kind::RealPower,
        2 => Kind::ApparentPower,
        _ => return None,
    };
    let within = offset % 0x10;
    if within >= 15 {
        return None;
    }
    let scale = match within / 5 {
        0 => Scale::Inst,
        1 => Scale::Fast,
        _ => Scale::Slow,
    };
    Some((severity, kind, scale, within % 5))
}

fn mon_value(stats_fast: &ChannelStats, stats_slow: &ChannelStats, addr: u8) -> f32 {
    let offset = usize::from(addr - REG_MON_BASE);
    let (stats, array) = if offset < 0x10 {
        (stats_fast, offset / CHANNELS)
    } else {
        (stats_slow, (offset - 0x10) / CHANNELS)
    };
    let ch = offset % CHANNELS;
    match array {
        0 => stats.rms_voltage[ch],
        1 => stats.rms_current[ch],
        2 => stats.real_power[ch],
        _ => stats.apparent_power[ch],
    }
}

/// The power-amp node's register bank.
pub struct AmpRegisters {
    /// Output measurement state.
    pub monitor: OutputMonitor,
    /// Threshold engine.
    pub safety: SafetySupervisor,
    /// Rail controller.
    pub pvdd: PvddController,
    /// Interrupt flag/mask state.
    pub ints: IntController,
    /// Amplifier IC fault pin level (node-maintained).
    pub amp_fault: bool,
    /// Amplifier IC clip/OTW pin level (node-maintained).
    pub amp_clip_otw: bool,
    reset_requested: bool,
    pending_dac: Option<u16>,
}

impl AmpRegisters {
    /// Bank in its boot state.
    #[must_use]
    pub fn new(monitor: OutputMonitor) -> Self {
        Self {
            monitor,
            safety: SafetySupervisor::new(),
            pvdd: PvddController::new(),
            ints: IntController::new(),
            amp_fault: false,
            amp_clip_otw: false,
            reset_requested: false,
            pending_dac: None,
        }
    }

    /// Whether a host-commanded reset is pending (node driver consumes it).
    #[must_use]
    pub fn reset_requested(&self) -> bool {
        self.reset_requested
    }

    /// DAC code produced by the last accepted PVDD write, for the node
    /// driver to forward to the hardware.
    pub fn take_dac_code(&mut self) -> Option<u16> {
        self.pending_dac.take()
    }

    /// Fold a PVDD event into the interrupt flags (shared with the node's
    /// own poll path).
    pub fn note_pvdd_event(&mut self, event: PvddEvent) {
        let flag = match event {
            PvddEvent::Error => int_flags::PVDD_ERR,
            PvddEvent::ReductionDone => int_flags::PVDD_REDDONE,
            PvddEvent::OffsetLimit => int_flags::PVDD_OLIM,
        };
        self.ints.trigger(flag);
    }

    fn status_word(&mut self, access: &mut ReadAccess<'_>) -> u16 {
        let mut s = 0u16;
        if self.amp_fault {
            s |= status::AMP_FAULT;
        }
        if self.amp_clip_otw {
            s |= status::AMP_CLIPOTW;
        }
        if self.safety.is_shutdown(self.pvdd.is_valid()) {
            s |= status::AMP_SD;
        }
        if self.pvdd.is_valid() {
            s |= status::PVDD_VALID;
        }
        if self.pvdd.reduction_ongoing() {
            s |= status::PVDD_RED;
        }
        let offset = self.pvdd.offset();
        if offset.abs() > 1e-5 {
            s |= status::PVDD_ONZ;
        }
        if offset.abs() >= OFFSET_MAX {
            s |= status::PVDD_OLIM;
        }
        if self.safety.warn_source().0 != 0 {
            s |= status::SWARN;
        }
        if access.kind == ReadKind::Host && *access.link_error {
            s |= status::I2CERR;
            *access.link_error = false;
        }
        s
    }
}

impl RegisterBank for AmpRegisters {
    fn layout(&self) -> RegisterLayout {
        amp_layout()
    }

    fn read(
        &mut self,
        addr: u8,
        out: &mut [u8],
        mut access: ReadAccess<'_>,
    ) -> Result<usize, ErrorCode> {
        match addr {
            REG_STATUS => {
                let word = self.status_word(&mut access);
                out.copy_from_slice(&word.to_le_bytes());
                Ok(2)
            }
            REG_CONTROL => {
                let mut c = 0u8;
                if self.ints.enabled() {
                    c |= control::INT_EN;
                }
                if self.safety.manual_shutdown() {
                    c |= control::AMP_MAN_SD;
                }
                out[0] = c;
                Ok(1)
            }
            REG_INT_MASK => {
                out[0] = self.ints.mask();
                Ok(1)
            }
            REG_INT_FLAGS => {
                out[0] = self.ints.flags();
                Ok(1)
            }
            REG_PVDD_TARGET => {
                out.copy_from_slice(&self.pvdd.target().to_le_bytes());
                Ok(4)
            }
            REG_PVDD_REQ => {
                out.copy_from_slice(&self.pvdd.requested().to_le_bytes());
                Ok(4)
            }
            REG_PVDD_MEASURED => {
                out.copy_from_slice(&self.pvdd.measured().to_le_bytes());
                Ok(4)
            }
            a if (REG_MON_BASE..0x50).contains(&a) => {
                let value = mon_value(&self.monitor.fast(), &self.monitor.slow(), a);
                out.copy_from_slice(&value.to_le_bytes());
                Ok(4)
            }
            a if decode_threshold(a).is_some() => {
                let (severity, kind, scale, slot) =
                    decode_threshold(a).ok_or(ErrorCode::UART_FORMAT)?;
                let value = self.safety.threshold(severity, kind, scale, slot);
                out.copy_from_slice(&value.to_le_bytes());
                Ok(4)
            }
            REG_SAFETY_STATUS => {
                let mut s = 0u8;
                if self.safety.safety_shutdown() {
                    s |= safety_status::SERR_SD;
                }
                if self.safety.manual_shutdown() {
                    s |= safety_status::MAN_SD;
                }
                out[0] = s;
                Ok(1)
            }
            REG_SERR_SOURCE => {
                out.copy_from_slice(&self.safety.err_source().0.to_le_bytes());
                Ok(2)
            }
            REG_SWARN_SOURCE => {
                out.copy_from_slice(&self.safety.warn_source().0.to_le_bytes());
                Ok(2)
            }
            REG_MODULE_ID => {
                out[0] = AMP_MODULE_ID;
                Ok(1)
            }
            _ => Err(ErrorCode::UART_FORMAT),
        }
    }

    fn write(&mut self, addr: u8, data: &[u8]) -> Result<WriteOutcome, ErrorCode> {
        let width = self.layout().width(addr);
        if data.len() != width {
            return Err(ErrorCode::UART_FORMAT);
        }

        match addr {
            REG_CONTROL => {
                let value = data[0];
                let reset_code = value >> control::RESET_POS;
                if reset_code != 0 && reset_code != control::RESET_VALUE {
                    return Err(ErrorCode::UART_FORMAT);
                }
                self.ints.set_enabled(value & control::INT_EN != 0);
                self.safety
                    .set_manual_shutdown(value & control::AMP_MAN_SD != 0);
                if reset_code == control::RESET_VALUE {
                    self.reset_requested = true;
                    return Ok(WriteOutcome::ResetRequested);
                }
                Ok(WriteOutcome::Accepted)
            }
            REG_INT_MASK => {
                self.ints.write_mask(data[0]);
                Ok(WriteOutcome::Accepted)
            }
            REG_INT_FLAGS => {
                self.ints.write_flags(data[0]);
                Ok(WriteOutcome::Accepted)
            }
            REG_PVDD_TARGET => {
                let volts = f32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                let action = self
                    .pvdd
                    .set_target(volts)
                    .map_err(|_| ErrorCode::UART_FORMAT)?;
                self.pending_dac = action.dac_code;
                if let Some(event) = action.event {
                    self.note_pvdd_event(event);
                }
                Ok(WriteOutcome::Accepted)
            }
            a if decode_threshold(a).is_some() => {
                let (severity, kind, scale, slot) =
                    decode_threshold(a).ok_or(ErrorCode::UART_FORMAT)?;
                let value = f32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                self.safety
                    .write_threshold(severity, kind, scale, slot, value)
                    .map_err(|_| ErrorCode::COMMAND_NOT_ALLOWED)?;
                Ok(WriteOutcome::Accepted)
            }
            _ => Err(ErrorCode::UART_FORMAT),
        }
    }
}
