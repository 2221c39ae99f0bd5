//! Sample-rate conversion to the fixed 96 kHz internal rate.
//!
//! Incoming batches pass through up to three stages:
//!
//! | input     | 2× interp | fixed 160/147 | adaptive |
//! |-----------|-----------|---------------|----------|
//! | 44.1 kHz  | yes       | yes           | yes      |
//! | 48 kHz    | yes       | no            | yes      |
//! | 96 kHz    | no        | no            | yes      |
//!
//! The final stage's fractional step is retuned once per output batch by a
//! PI/PD controller over the measured input-rate error and the fill level of
//! the semi-circular buffer, keeping producer and consumer locked without a
//! common clock. Both channels always get the identical step so they stay
//! phase-locked.

use crate::ffir::{AdaptiveFfir, Ffir160147, FfirError};
use crate::interp::Interpolator2x;
use crate::q31::shift_block;

/// Channels carried through the converter.
pub const SRC_CHANNELS: usize = 2;

/// Output samples per channel per batch.
pub const BATCH: usize = 96;
/// Clamp range of the adaptive step (inputs consumed per output batch).
pub const BATCH_INPUT_MIN: f32 = (BATCH - 2) as f32;
/// See [`BATCH_INPUT_MIN`].
pub const BATCH_INPUT_MAX: f32 = (BATCH + 2) as f32;

/// Ideal buffer fill ahead of the reader, in batches.
const IDEAL_BATCHES: usize = 4;
/// Ideal fill level before a read, in samples per channel.
pub const BUF_IDEAL: usize = (IDEAL_BATCHES + 1) * BATCH;
/// Semi-circular buffer length per channel.
pub const BUF_TOTAL: usize = (2 * IDEAL_BATCHES + 1) * BATCH;
/// Below this fill level the converter reverts to not-ready.
pub const BUF_CRITICAL: usize = BATCH + 3;

/// Maximum input samples per channel per call.
pub const INPUT_MAX: usize = 128;
const SCRATCH: usize = 2 * INPUT_MAX;

/// Rate-error averaging lengths, in batches.
const RATE_ERR_INITIAL: u32 = 8;
const RATE_ERR_LEN: usize = 6144;
const BUF_ERR_LEN: usize = 8192;

/// Buffer-fill error controller coefficients.
const FILL_COEFF_P: f32 = 1.0 / 4096.0;
const FILL_COEFF_D: f32 = 2.0;

/// Right pre-shift applied to all incoming samples for filter headroom; the
/// output feeder shifts back.
pub const INPUT_SHIFT: i8 = -4;

/// Supported input sample rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SampleRate {
    /// Not configured.
    #[default]
    Unknown,
    /// 44.1 kHz.
    Hz44100,
    /// 48 kHz.
    Hz48000,
    /// 96 kHz.
    Hz96000,
}

impl SampleRate {
    /// Parse a rate in Hz.
    #[must_use]
    pub fn from_hz(hz: u32) -> Option<Self> {
        match hz {
            44_100 => Some(Self::Hz44100),
            48_000 => Some(Self::Hz48000),
            96_000 => Some(Self::Hz96000),
            _ => None,
        }
    }

    /// Rate in Hz (0 for unknown).
    #[must_use]
    pub fn hz(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Hz44100 => 44_100,
            Self::Hz48000 => 48_000,
            Self::Hz96000 => 96_000,
        }
    }
}

/// Errors from configuration or input submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SrcError {
    /// Rate not one of the supported three.
    InvalidRate,
    /// Converter has no configured input rate.
    NotConfigured,
    /// Channel slices empty, unequal or longer than [`INPUT_MAX`].
    InvalidInput,
}

/// Result of one output-batch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BatchOutcome {
    /// A full batch was written to the output slices.
    Produced,
    /// Buffer still pre-filling (or freshly reconfigured); nothing written.
    NotReady,
    /// Fill level went critical: converter went not-ready and the active
    /// input should be stopped until the buffer refills.
    Starved,
}

/// The three-stage converter with its adaptive-rate controller.
pub struct SampleRateConverter {
    rate: SampleRate,
    ready: bool,

    buffers: [[i32; 2 * BUF_TOTAL - 1]; SRC_CHANNELS],
    read_ptr: usize,
    write_ptr: usize,

    int2: [Interpolator2x; SRC_CHANNELS],
    fixed: [Ffir160147; SRC_CHANNELS],
    adaptive: [AdaptiveFfir; SRC_CHANNELS],

    scratch_a: [[i32; SCRATCH]; SRC_CHANNELS],
    scratch_b: [[i32; SCRATCH]; SRC_CHANNELS],

    rate_err_hist: [i16; RATE_ERR_LEN],
    rate_err_pos: usize,
    rate_err_len: u32,
    rate_err_sum: i32,
    buf_err_hist: [i16; BUF_ERR_LEN],
    buf_err_pos: usize,
    buf_err_sum: i32,
    last_buf_err_avg: f32,
    input_since_output: u16,
}

impl SampleRateConverter {
    /// Build the converter (unconfigured; call [`SampleRateConverter::configure`]).
    ///
    /// # Errors
    ///
    /// Propagates coefficient-table construction errors (statically
    /// impossible with the generated tables).
    pub fn new() -> Result<Self, FfirError> {
        Ok(Self {
            rate: SampleRate::Unknown,
            ready: false,
            buffers: [[0; 2 * BUF_TOTAL - 1]; SRC_CHANNELS],
            read_ptr: 0,
            write_ptr: 0,
            int2: [Interpolator2x::new(), Interpolator2x::new()],
            fixed: [Ffir160147::fixed_160_147()?, Ffir160147::fixed_160_147()?],
            adaptive: [AdaptiveFfir::adaptive()?, AdaptiveFfir::adaptive()?],
            scratch_a: [[0; SCRATCH]; SRC_CHANNELS],
            scratch_b: [[0; SCRATCH]; SRC_CHANNELS],
            rate_err_hist: [0; RATE_ERR_LEN],
            rate_err_pos: 0,
            rate_err_len: RATE_ERR_INITIAL,
            rate_err_sum: 0,
            buf_err_hist: [0; BUF_ERR_LEN],
            buf_err_pos: 0,
            buf_err_sum: 0,
            last_buf_err_avg: 0.0,
            input_since_output: 0,
        })
    }

    /// Configured input rate.
    #[must_use]
    pub fn current_rate(&self) -> SampleRate {
        self.rate
    }

    /// Whether the buffer has pre-filled past the ideal level.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Average input-rate error relative to nominal.
    #[must_use]
    pub fn average_rate_error(&self) -> f32 {
        let per_batch = self.rate_err_sum as f32 / self.rate_err_len as f32;
        per_batch / BATCH as f32
    }

    /// Average buffer fill error in samples.
    #[must_use]
    pub fn average_buffer_fill_error(&self) -> f32 {
        self.buf_err_sum as f32 / BUF_ERR_LEN as f32
    }

    /// Samples buffered ahead of the reader (per channel).
    #[must_use]
    pub fn available_data(&self) -> usize {
        (self.write_ptr + BUF_TOTAL - self.read_ptr) % BUF_TOTAL
    }

    fn free_space(&self) -> usize {
        BUF_TOTAL - self.available_data() - 1
    }

    /// Reconfigure for a new input signal; resets the filter chain needed for
    /// `rate` and empties the buffer. Atomic with respect to the audio ISR
    /// (the node driver wraps this in its critical section).
    ///
    /// # Errors
    ///
    /// [`SrcError::InvalidRate`] for [`SampleRate::Unknown`].
    pub fn configure(&mut self, rate: SampleRate) -> Result<(), SrcError> {
        if rate == SampleRate::Unknown {
            return Err(SrcError::InvalidRate);
        }
        self.ready = false;
        self.rate = rate;

        if rate != SampleRate::Hz96000 {
            for ch in &mut self.int2 {
                ch.reset();
            }
            if rate == SampleRate::Hz44100 {
                for ch in &mut self.fixed {
                    ch.reset();
                }
            }
        }
        for ch in &mut self.adaptive {
            let _ = ch.set_step_frac(BATCH as f32);
            ch.reset();
        }

        self.read_ptr = 0;
        self.write_ptr = 0;
        self.input_since_output = 0;
        Ok(())
    }

    /// Feed one batch of input samples per channel, pre-shifted by
    /// `in_shift` (0 = full scale).
    ///
    /// If there is not enough space the oldest buffered samples are silently
    /// discarded.
    ///
    /// # Errors
    ///
    /// [`SrcError::NotConfigured`] before a rate is set,
    /// [`SrcError::InvalidInput`] for bad slice shapes.
    pub fn write_input(
        &mut self,
        inputs: [&[i32]; SRC_CHANNELS],
        in_shift: i8,
    ) -> Result<(), SrcError> {
        let n = inputs[0].len();
        if n == 0 || n > INPUT_MAX || inputs[1].len() != n {
            return Err(SrcError::InvalidInput);
        }

        let required = match self.rate {
            SampleRate::Hz44100 => n * 320 / 147 + 1,
            SampleRate::Hz48000 => 2 * n,
            SampleRate::Hz96000 => n,
            SampleRate::Unknown => return Err(SrcError::NotConfigured),
        };

        let free = self.free_space();
        if free < required {
            // not enough room: drop the oldest samples
            let discard = required - free;
            self.read_ptr = (self.read_ptr + discard) % BUF_TOTAL;
        }

        let shift = INPUT_SHIFT - in_shift;
        let wp = self.write_ptr;
        let mut written = 0usize;

        match self.rate {
            SampleRate::Hz96000 => {
                for (ch, input) in inputs.iter().enumerate() {
                    shift_block(input, shift, &mut self.buffers[ch][wp..wp + n]);
                }
                written = n;
            }
            SampleRate::Hz48000 => {
                for (ch, input) in inputs.iter().enumerate() {
                    shift_block(input, shift, &mut self.scratch_a[ch][..n]);
                    self.int2[ch].process(
                        &self.scratch_a[ch][..n],
                        &mut self.buffers[ch][wp..wp + 2 * n],
                    );
                }
                written = 2 * n;
            }
            SampleRate::Hz44100 => {
                for (ch, input) in inputs.iter().enumerate() {
                    shift_block(input, shift, &mut self.scratch_a[ch][..n]);
                    let (a, b) = (&self.scratch_a[ch][..n], &mut self.scratch_b[ch][..2 * n]);
                    self.int2[ch].process(a, b);
                    let (produced, _consumed) = self.fixed[ch]
                        .process(&self.scratch_b[ch][..2 * n], &mut self.buffers[ch][wp..wp + required]);
                    // all channels resample in lock-step; track the max just in case
                    written = written.max(produced);
                }
            }
            SampleRate::Unknown => {}
        }

        self.finish_buffer_write(written);
        self.input_since_output = self.input_since_output.saturating_add(written as u16);
        Ok(())
    }

    /// Mirror freshly written samples so reads stay contiguous across wrap,
    /// then advance the write pointer. Marks the converter ready once the
    /// fill passes the ideal level.
    fn finish_buffer_write(&mut self, written: usize) {
        if written == 0 || written >= BUF_TOTAL {
            return;
        }
        let start = self.write_ptr;
        let end = start + written;

        // first-half portion mirrors into the upper copy
        let first_end = end.min(BUF_TOTAL - 1);
        if first_end > start {
            for buf in &mut self.buffers {
                buf.copy_within(start..first_end, start + BUF_TOTAL);
            }
        }
        // wrapped portion mirrors back into the lower copy
        if end > BUF_TOTAL {
            for buf in &mut self.buffers {
                buf.copy_within(BUF_TOTAL..end, 0);
            }
        }

        self.write_ptr = end % BUF_TOTAL;

        if !self.ready && self.available_data() > BUF_IDEAL {
            self.reset_averaging();
            self.ready = true;
        }
    }

    fn reset_averaging(&mut self) {
        self.rate_err_hist = [0; RATE_ERR_LEN];
        self.rate_err_pos = 0;
        self.rate_err_len = RATE_ERR_INITIAL;
        self.rate_err_sum = 0;
        self.buf_err_hist = [0; BUF_ERR_LEN];
        self.buf_err_pos = 0;
        self.buf_err_sum = 0;
        self.last_buf_err_avg = 0.0;
    }

    /// Produce exactly one [`BATCH`]-sample output batch per channel.
    pub fn produce_batch(&mut self, outputs: [&mut [i32]; SRC_CHANNELS]) -> BatchOutcome {
        if !self.ready {
            self.input_since_output = 0;
            return BatchOutcome::NotReady;
        }

        let available = self.available_data();
        if available < BUF_CRITICAL {
            // level critically low: back to pre-fill, caller parks the input
            self.ready = false;
            self.input_since_output = 0;
            return BatchOutcome::Starved;
        }

        self.update_averages(available);
        let step = self.compute_step();
        for ch in &mut self.adaptive {
            let _ = ch.set_step_frac(step);
        }

        let mut consumed_max = 0usize;
        for (ch, out) in outputs.into_iter().enumerate() {
            let region = &self.buffers[ch][self.read_ptr..self.read_ptr + BUF_TOTAL];
            let (produced, consumed) = self.adaptive[ch].process(region, &mut out[..BATCH]);
            debug_assert!(produced == BATCH);
            consumed_max = consumed_max.max(consumed);
        }
        self.read_ptr = (self.read_ptr + consumed_max) % BUF_TOTAL;

        BatchOutcome::Produced
    }

    fn update_averages(&mut self, available: usize) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let rate_err = i32::from(self.input_since_output) - BATCH as i32;
        self.input_since_output = 0;

        if self.rate_err_len >= RATE_ERR_LEN as u32 {
            self.rate_err_len = RATE_ERR_LEN as u32;
            self.rate_err_sum -= i32::from(self.rate_err_hist[self.rate_err_pos]);
        } else {
            self.rate_err_len += 1;
        }
        self.rate_err_sum += rate_err;
        #[allow(clippy::cast_possible_truncation)]
        {
            self.rate_err_hist[self.rate_err_pos] = rate_err as i16;
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let buf_err = available as i32 - BUF_IDEAL as i32;
        self.buf_err_sum -= i32::from(self.buf_err_hist[self.buf_err_pos]);
        self.buf_err_sum += buf_err;
        #[allow(clippy::cast_possible_truncation)]
        {
            self.buf_err_hist[self.buf_err_pos] = buf_err as i16;
        }

        self.rate_err_pos = (self.rate_err_pos + 1) % RATE_ERR_LEN;
        self.buf_err_pos = (self.buf_err_pos + 1) % BUF_ERR_LEN;
    }

    fn compute_step(&mut self) -> f32 {
        let rate_err_avg = self.rate_err_sum as f32 / self.rate_err_len as f32;
        let buf_err_avg = self.buf_err_sum as f32 / BUF_ERR_LEN as f32;
        let buf_err_d = buf_err_avg - self.last_buf_err_avg;
        self.last_buf_err_avg = buf_err_avg;

        let step =
            BATCH as f32 + rate_err_avg + FILL_COEFF_P * buf_err_avg + FILL_COEFF_D * buf_err_d;
        step.clamp(BATCH_INPUT_MIN, BATCH_INPUT_MAX)
    }

    /// Current adaptive step (telemetry / tests).
    #[must_use]
    pub fn adaptive_step(&self) -> f32 {
        self.adaptive[0].step_frac()
    }

    /// Semi-circular mirror invariant (debug assertion helper for tests).
    #[must_use]
    pub fn mirror_invariant_holds(&self) -> bool {
        self.buffers.iter().all(|buf| {
            (0..BUF_TOTAL - 1).all(|i| buf[i] == buf[i + BUF_TOTAL])
        })
    }
}
