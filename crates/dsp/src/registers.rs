//! Register bank of the audio-processor node (I²C-attached).

use modules::interrupts::{IntController, INT_RESET};
use modules::{total_size, ErrorCode, ReadAccess, ReadKind, RegisterBank, RegisterLayout, WriteOutcome};

use crate::converter::SampleRate;
use crate::pipeline::AudioPipeline;
use crate::processor::{SP_CHANNELS, SP_MAX_BIQUADS, SP_MAX_FIR_LENGTH};
use crate::router::Source;

/// General status (1 B, r).
pub const REG_STATUS: u8 = 0x01;
/// General control (1 B, rw).
pub const REG_CONTROL: u8 = 0x08;
/// Interrupt mask (1 B, rw).
pub const REG_INT_MASK: u8 = 0x10;
/// Interrupt flags (1 B, rc, write 0 to clear).
pub const REG_INT_FLAGS: u8 = 0x11;
/// Active input source (1 B, rw).
pub const REG_INPUT_ACTIVE: u8 = 0x20;
/// Available-input bitmap (1 B, r).
pub const REG_INPUTS_AVAILABLE: u8 = 0x21;
/// Nominal I²S input rates in Hz (4 B u32 LE, rw).
pub const REG_I2S1_RATE: u8 = 0x28;
/// See [`REG_I2S1_RATE`].
pub const REG_I2S2_RATE: u8 = 0x29;
/// See [`REG_I2S1_RATE`].
pub const REG_I2S3_RATE: u8 = 0x2A;
/// Converter input rate in Hz (4 B u32 LE, r).
pub const REG_SRC_INPUT_RATE: u8 = 0x30;
/// Relative average rate error (4 B f32 LE, r).
pub const REG_SRC_RATE_ERROR: u8 = 0x31;
/// Average buffer fill error in samples (4 B f32 LE, r).
pub const REG_SRC_BUFFER_ERROR: u8 = 0x32;
/// Mixer gain matrix (16 B, 2×2 Q31 LE row-major, rw).
pub const REG_MIXER_GAINS: u8 = 0x40;
/// Volume gains in dB (8 B, 2 f32 LE, rw).
pub const REG_VOLUME_GAINS: u8 = 0x41;
/// Loudness gains in dB (8 B, 2 f32 LE, rw).
pub const REG_LOUDNESS_GAINS: u8 = 0x42;
/// Biquad stage counts + post-shifts (4 B, rw while processor disabled).
pub const REG_BIQUAD_SETUP: u8 = 0x50;
/// Biquad coefficient window selector `(channel, stage)` (2 B, rw).
pub const REG_BIQUAD_INDEX: u8 = 0x51;
/// Selected stage's `b0 b1 b2 a1 a2` (20 B Q31 LE, rw while disabled).
pub const REG_BIQUAD_COEFFS: u8 = 0x52;
/// FIR lengths (4 B, 2 u16 LE, rw while disabled).
pub const REG_FIR_SETUP: u8 = 0x58;
/// FIR coefficient window selector `(channel, page-of-8)` (2 B, rw).
pub const REG_FIR_INDEX: u8 = 0x59;
/// Selected 8-tap window (32 B Q31 LE, rw while disabled).
pub const REG_FIR_COEFFS: u8 = 0x5A;
/// Module identity (1 B, r).
pub const REG_MODULE_ID: u8 = 0xFF;

/// MODULE_ID constant of the audio processor.
pub const DAP_MODULE_ID: u8 = 0xD5;

/// STATUS bits.
pub mod status {
    /// Converter ready and processing chain engaged.
    pub const STREAMING: u8 = 0x01;
    /// Converter pre-fill complete.
    pub const SRC_READY: u8 = 0x02;
    /// USB audio interface enumerated.
    pub const USB_CONN: u8 = 0x04;
    /// Link error since last STATUS read (clear-on-read).
    pub const I2CERR: u8 = 0x80;
}

/// CONTROL bits.
pub mod control {
    /// Interrupt output enable.
    pub const INT_EN: u8 = 0x01;
    /// Processing chain enable.
    pub const SP_EN: u8 = 0x02;
    /// Allow positive total gains.
    pub const ALLOW_POS_GAIN: u8 = 0x04;
    /// Reset nibble position; write [`RESET_VALUE`] to reboot.
    pub const RESET_POS: u8 = 4;
    /// Reset nibble magic.
    pub const RESET_VALUE: u8 = 0xA;
}

/// Interrupt flag bits (bit 0 is the shared reset flag).
pub mod int_flags {
    /// Module reset (set at boot).
    pub const RESET: u8 = super::INT_RESET;
    /// Active input or availability changed.
    pub const INPUT_CHANGE: u8 = 0x02;
    /// Converter ready state changed.
    pub const SRC_STATE: u8 = 0x04;
}

const fn widths() -> [u8; 256] {
    let mut w = [0u8; 256];
    w[REG_STATUS as usize] = 1;
    w[REG_CONTROL as usize] = 1;
    w[REG_INT_MASK as usize] = 1;
    w[REG_INT_FLAGS as usize] = 1;
    w[REG_INPUT_ACTIVE as usize] = 1;
    w[REG_INPUTS_AVAILABLE as usize] = 1;
    w[REG_I2S1_RATE as usize] = 4;
    w[REG_I2S2_RATE as usize] = 4;
    w[REG_I2S3_RATE as usize] = 4;
    w[REG_SRC_INPUT_RATE as usize] = 4;
    w[REG_SRC_RATE_ERROR as usize] = 4;
    w[REG_SRC_BUFFER_ERROR as usize] = 4;
    w[REG_MIXER_GAINS as usize] = 16;
    w[REG_VOLUME_GAINS as usize] = 8;
    w[REG_LOUDNESS_GAINS as usize] = 8;
    w[REG_BIQUAD_SETUP as usize] = 4;
    w[REG_BIQUAD_INDEX as usize] = 2;
    w[REG_BIQUAD_COEFFS as usize] = 20;
    w[REG_FIR_SETUP as usize] = 4;
    w[REG_FIR_INDEX as usize] = 2;
    w[REG_FIR_COEFFS as usize] = 32;
    w[REG_MODULE_ID as usize] = 1;
    w
}

/// Width table of the audio-processor map.
pub static DAP_WIDTHS: [u8; 256] = widths();
/// Packed shadow size of the audio-processor map.
pub const DAP_SHADOW_SIZE: usize = total_size(&DAP_WIDTHS);

/// Layout handle for master-side clients.
#[must_use]
pub fn dap_layout() -> RegisterLayout {
    RegisterLayout::new(&DAP_WIDTHS)
}

/// The audio-processor node's register bank.
pub struct DapRegisters {
    /// The pipeline the registers control.
    pub pipeline: AudioPipeline,
    /// Interrupt flag/mask state.
    pub ints: IntController,
    /// USB enumeration state, maintained by the node driver.
    pub usb_connected: bool,
    reset_requested: bool,
    biquad_index: (u8, u8),
    fir_index: (u8, u8),
}

impl DapRegisters {
    /// Wrap a pipeline.
    #[must_use]
    pub fn new(pipeline: AudioPipeline) -> Self {
        Self {
            pipeline,
            ints: IntController::new(),
            usb_connected: false,
            reset_requested: false,
            biquad_index: (0, 0),
            fir_index: (0, 0),
        }
    }

    /// Whether a host-commanded reset is pending (node driver consumes it).
    #[must_use]
    pub fn reset_requested(&self) -> bool {
        self.reset_requested
    }

    fn coefficient_registers_locked(&self) -> bool {
        self.pipeline.sp_enabled
    }

    fn write_control(&mut self, value: u8) -> Result<WriteOutcome, ErrorCode> {
        let reset_code = value >> control::RESET_POS;
        if reset_code != 0 && reset_code != control::RESET_VALUE {
            return Err(ErrorCode::UART_FORMAT);
        }

        self.ints.set_enabled(value & control::INT_EN != 0);

        let enable = value & control::SP_EN != 0;
        if enable && !self.pipeline.sp_enabled {
            // engage with clean filter state
            self.pipeline.sp.reset();
        }
        self.pipeline.sp_enabled = enable;
        self.pipeline
            .sp
            .set_allow_positive_gain(value & control::ALLOW_POS_GAIN != 0);

        if reset_code == control::RESET_VALUE {
            self.reset_requested = true;
            return Ok(WriteOutcome::ResetRequested);
        }
        Ok(WriteOutcome::Accepted)
    }
}

impl RegisterBank for DapRegisters {
    fn layout(&self) -> RegisterLayout {
        dap_layout()
    }

    fn read(
        &mut self,
        addr: u8,
        out: &mut [u8],
        access: ReadAccess<'_>,
    ) -> Result<usize, ErrorCode> {
        match addr {
            REG_STATUS => {
                let ready = self.pipeline.src.is_ready();
                let mut s = 0u8;
                if ready && self.pipeline.sp_enabled {
                    s |= status::STREAMING;
                }
                if ready {
                    s |= status::SRC_READY;
                }
                if self.usb_connected {
                    s |= status::USB_CONN;
                }
                if access.kind == ReadKind::Host && *access.link_error {
                    s |= status::I2CERR;
                    *access.link_error = false;
                }
                out[0] = s;
                Ok(1)
            }
            REG_CONTROL => {
                let mut c = 0u8;
                if self.ints.enabled() {
                    c |= control::INT_EN;
                }
                if self.pipeline.sp_enabled {
                    c |= control::SP_EN;
                }
                if self.pipeline.sp.allow_positive_gain() {
                    c |= control::ALLOW_POS_GAIN;
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
            REG_INPUT_ACTIVE => {
                out[0] = self.pipeline.router.active() as u8;
                Ok(1)
            }
            REG_INPUTS_AVAILABLE => {
                out[0] = self.pipeline.router.available_mask();
                Ok(1)
            }
            REG_I2S1_RATE | REG_I2S2_RATE | REG_I2S3_RATE => {
                let idx = usize::from(addr - REG_I2S1_RATE);
                out.copy_from_slice(&self.pipeline.router.i2s_rate(idx).hz().to_le_bytes());
                Ok(4)
            }
            REG_SRC_INPUT_RATE => {
                out.copy_from_slice(&self.pipeline.src.current_rate().hz().to_le_bytes());
                Ok(4)
            }
            REG_SRC_RATE_ERROR => {
                out.copy_from_slice(&self.pipeline.src.average_rate_error().to_le_bytes());
                Ok(4)
            }
            REG_SRC_BUFFER_ERROR => {
                out.copy_from_slice(&self.pipeline.src.average_buffer_fill_error().to_le_bytes());
                Ok(4)
            }
            REG_MIXER_GAINS => {
                let gains = self.pipeline.sp.mixer_gains();
                for (i, g) in gains.iter().flatten().enumerate() {
                    out[4 * i..4 * i + 4].copy_from_slice(&g.to_le_bytes());
                }
                Ok(16)
            }
            REG_VOLUME_GAINS => {
                for (i, db) in self.pipeline.sp.volume_db().iter().enumerate() {
                    out[4 * i..4 * i + 4].copy_from_slice(&db.to_le_bytes());
                }
                Ok(8)
            }
            REG_LOUDNESS_GAINS => {
                for (i, db) in self.pipeline.sp.loudness_db().iter().enumerate() {
                    out[4 * i..4 * i + 4].copy_from_slice(&db.to_le_bytes());
                }
                Ok(8)
            }
            REG_BIQUAD_SETUP => {
                let (stages, shifts) = self.pipeline.sp.biquad_setup();
                out[0] = stages[0];
                out[1] = stages[1];
                out[2] = shifts[0];
                out[3] = shifts[1];
                Ok(4)
            }
            REG_BIQUAD_INDEX => {
                out[0] = self.biquad_index.0;
                out[1] = self.biquad_index.1;
                Ok(2)
            }
            REG_BIQUAD_COEFFS => {
                let (ch, stage) = self.biquad_index;
                let coeffs = self
                    .pipeline
                    .sp
                    .read_biquad_stage(usize::from(ch), usize::from(stage))
                    .map_err(|_| ErrorCode::UART_FORMAT)?;
                for (i, c) in coeffs.iter().enumerate() {
                    out[4 * i..4 * i + 4].copy_from_slice(&c.to_le_bytes());
                }
                Ok(20)
            }
            REG_FIR_SETUP => {
                let lengths = self.pipeline.sp.fir_setup();
                out[0..2].copy_from_slice(&lengths[0].to_le_bytes());
                out[2..4].copy_from_slice(&lengths[1].to_le_bytes());
                Ok(4)
            }
            REG_FIR_INDEX => {
                out[0] = self.fir_index.0;
                out[1] = self.fir_index.1;
                Ok(2)
            }
            REG_FIR_COEFFS => {
                let (ch, page) = self.fir_index;
                let mut taps = [0i32; 8];
                self.pipeline
                    .sp
                    .read_fir_taps(usize::from(ch), usize::from(page) * 8, &mut taps)
                    .map_err(|_| ErrorCode::UART_FORMAT)?;
                for (i, t) in taps.iter().enumerate() {
                    out[4 * i..4 * i + 4].copy_from_slice(&t.to_le_bytes());
                }
                Ok(32)
            }
            REG_MODULE_ID => {
                out[0] = DAP_MODULE_ID;
                Ok(1)
            }
            _ => Err(ErrorCode::UART_FORMAT),
        }
    }

    fn write(&mut self, addr: u8, data: &[u8]) -> Result<WriteOutcome, ErrorCode> {
        // filter setup and coefficients are locked while the chain runs
        if (REG_BIQUAD_SETUP..=REG_FIR_COEFFS).contains(&addr) && self.coefficient_registers_locked()
        {
            return Err(ErrorCode::COMMAND_NOT_ALLOWED);
        }

        let width = self.layout().width(addr);
        if data.len() != width {
            return Err(ErrorCode::UART_FORMAT);
        }

        match addr {
            REG_CONTROL => self.write_control(data[0]),
            REG_INT_MASK => {
                self.ints.write_mask(data[0]);
                Ok(WriteOutcome::Accepted)
            }
            REG_INT_FLAGS => {
                self.ints.write_flags(data[0]);
                Ok(WriteOutcome::Accepted)
            }
            REG_INPUT_ACTIVE => {
                let source = Source::from_u8(data[0]).ok_or(ErrorCode::UART_FORMAT)?;
                self.pipeline
                    .activate(source)
                    .map_err(|_| ErrorCode::COMMAND_NOT_ALLOWED)?;
                self.ints.trigger(int_flags::INPUT_CHANGE);
                Ok(WriteOutcome::Accepted)
            }
            REG_I2S1_RATE | REG_I2S2_RATE | REG_I2S3_RATE => {
                let hz = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                let rate = SampleRate::from_hz(hz).ok_or(ErrorCode::UART_FORMAT)?;
                self.pipeline
                    .set_i2s_rate(usize::from(addr - REG_I2S1_RATE), rate);
                Ok(WriteOutcome::Accepted)
            }
            REG_MIXER_GAINS => {
                let mut gains = [[0i32; 2]; SP_CHANNELS];
                for (i, g) in gains.iter_mut().flatten().enumerate() {
                    *g = i32::from_le_bytes([
                        data[4 * i],
                        data[4 * i + 1],
                        data[4 * i + 2],
                        data[4 * i + 3],
                    ]);
                }
                self.pipeline.sp.set_mixer_gains(gains);
                Ok(WriteOutcome::Accepted)
            }
            REG_VOLUME_GAINS => {
                for ch in 0..SP_CHANNELS {
                    let db = f32::from_le_bytes([
                        data[4 * ch],
                        data[4 * ch + 1],
                        data[4 * ch + 2],
                        data[4 * ch + 3],
                    ]);
                    self.pipeline
                        .sp
                        .set_volume_db(ch, db)
                        .map_err(|_| ErrorCode::UART_FORMAT)?;
                }
                Ok(WriteOutcome::Accepted)
            }
            REG_LOUDNESS_GAINS => {
                for ch in 0..SP_CHANNELS {
                    let db = f32::from_le_bytes([
                        data[4 * ch],
                        data[4 * ch + 1],
                        data[4 * ch + 2],
                        data[4 * ch + 3],
                    ]);
                    self.pipeline
                        .sp
                        .set_loudness_db(ch, db)
                        .map_err(|_| ErrorCode::UART_FORMAT)?;
                }
                Ok(WriteOutcome::Accepted)
            }
            REG_BIQUAD_SETUP => {
                self.pipeline
                    .sp
                    .setup_biquads([data[0], data[1]], [data[2], data[3]])
                    .map_err(|_| ErrorCode::UART_FORMAT)?;
                self.pipeline.sp.reset();
                Ok(WriteOutcome::Accepted)
            }
            REG_BIQUAD_INDEX => {
                if usize::from(data[0]) >= SP_CHANNELS || usize::from(data[1]) >= SP_MAX_BIQUADS {
                    return Err(ErrorCode::UART_FORMAT);
                }
                self.biquad_index = (data[0], data[1]);
                Ok(WriteOutcome::Accepted)
            }
            REG_BIQUAD_COEFFS => {
                let (ch, stage) = self.biquad_index;
                let mut coeffs = [0i32; 5];
                for (i, c) in coeffs.iter_mut().enumerate() {
                    *c = i32::from_le_bytes([
                        data[4 * i],
                        data[4 * i + 1],
                        data[4 * i + 2],
                        data[4 * i + 3],
                    ]);
                }
                self.pipeline
                    .sp
                    .write_biquad_stage(usize::from(ch), usize::from(stage), coeffs)
                    .map_err(|_| ErrorCode::UART_FORMAT)?;
                Ok(WriteOutcome::Accepted)
            }
            REG_FIR_SETUP => {
                let lengths = [
                    u16::from_le_bytes([data[0], data[1]]),
                    u16::from_le_bytes([data[2], data[3]]),
                ];
                self.pipeline
                    .sp
                    .setup_firs(lengths)
                    .map_err(|_| ErrorCode::UART_FORMAT)?;
                self.pipeline.sp.reset();
                Ok(WriteOutcome::Accepted)
            }
            REG_FIR_INDEX => {
                let pages = SP_MAX_FIR_LENGTH / 8;
                if usize::from(data[0]) >= SP_CHANNELS || usize::from(data[1]) >= pages {
                    return Err(ErrorCode::UART_FORMAT);
                }
                self.fir_index = (data[0], data[1]);
                Ok(WriteOutcome::Accepted)
            }
            REG_FIR_COEFFS => {
                let (ch, page) = self.fir_index;
                let mut taps = [0i32; 8];
                for (i, t) in taps.iter_mut().enumerate() {
                    *t = i32::from_le_bytes([
                        data[4 * i],
                        data[4 * i + 1],
                        data[4 * i + 2],
                        data[4 * i + 3],
                    ]);
                }
                self.pipeline
                    .sp
                    .write_fir_taps(usize::from(ch), usize::from(page) * 8, &taps)
                    .map_err(|_| ErrorCode::UART_FORMAT)?;
                Ok(WriteOutcome::Accepted)
            }
            _ => Err(ErrorCode::UART_FORMAT),
        }
    }
}
