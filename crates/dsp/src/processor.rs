//! Signal processing chain behind the sample-rate converter.
//!
//! Per output batch: mixer (Q31 gain matrix, post-doubled) → per-channel
//! biquad cascade (direct-form-I Q31 with per-channel post-shift) →
//! per-channel FIR (reverse-ordered coefficients) → volume/loudness gain →
//! shift back to full scale and stride-aware copy out.

use libm::powf;

use crate::converter::{BATCH, INPUT_SHIFT, SRC_CHANNELS};
use crate::q31::{sat, shift_sample, DelayLine};

/// Output channels of the signal processor.
pub const SP_CHANNELS: usize = 2;
/// Maximum biquad stages per channel.
pub const SP_MAX_BIQUADS: usize = 16;
/// Maximum FIR length per channel.
pub const SP_MAX_FIR_LENGTH: usize = 320;

/// Lowest accepted volume gain in dB.
pub const SP_MIN_VOL_GAIN_DB: f32 = -120.0;
/// Highest accepted volume gain in dB (requires the allow-positive flag).
pub const SP_MAX_VOL_GAIN_DB: f32 = 20.0;
/// Highest accepted loudness gain in dB.
pub const SP_MAX_LOUDNESS_GAIN_DB: f32 = 20.0;

/// Setup parameter errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpError {
    /// Stage count, post-shift, FIR length or coefficient window out of range.
    InvalidSetup,
    /// Gain outside the accepted range (or positive without the enable flag).
    InvalidGain,
}

struct BiquadChannel {
    /// `b0 b1 b2 a1 a2` per stage, scaled down by `2^post_shift`.
    coeffs: [i32; 5 * SP_MAX_BIQUADS],
    /// `x1 x2 y1 y2` per stage.
    state: [i32; 4 * SP_MAX_BIQUADS],
    stages: u8,
    post_shift: u8,
}

impl BiquadChannel {
    fn new() -> Self {
        let mut coeffs = [0i32; 5 * SP_MAX_BIQUADS];
        // identity b0 at half scale, matching the default post-shift of 1
        let mut i = 0;
        while i < SP_MAX_BIQUADS {
            coeffs[5 * i] = 0x4000_0000;
            i += 1;
        }
        Self {
            coeffs,
            state: [0; 4 * SP_MAX_BIQUADS],
            stages: 0,
            post_shift: 1,
        }
    }

    fn reset(&mut self) {
        self.state = [0; 4 * SP_MAX_BIQUADS];
    }

    fn process(&mut self, samples: &mut [i32]) {
        let shift = 31 - u32::from(self.post_shift);
        for s in 0..usize::from(self.stages) {
            let c = &self.coeffs[5 * s..5 * s + 5];
            let st = &mut self.state[4 * s..4 * s + 4];
            let (b0, b1, b2, a1, a2) = (c[0], c[1], c[2], c[3], c[4]);
            let (mut x1, mut x2, mut y1, mut y2) = (st[0], st[1], st[2], st[3]);
            for x in samples.iter_mut() {
                let acc = i64::from(b0) * i64::from(*x)
                    + i64::from(b1) * i64::from(x1)
                    + i64::from(b2) * i64::from(x2)
                    + i64::from(a1) * i64::from(y1)
                    + i64::from(a2) * i64::from(y2);
                let y = sat(acc >> shift);
                x2 = x1;
                x1 = *x;
                y2 = y1;
                y1 = y;
                *x = y;
            }
            st.copy_from_slice(&[x1, x2, y1, y2]);
        }
    }
}

struct FirChannel {
    /// Reverse-ordered taps: the first coefficient applies to the oldest
    /// sample.
    coeffs: [i32; SP_MAX_FIR_LENGTH],
    delay: DelayLine<{ 2 * (SP_MAX_FIR_LENGTH - 1) }>,
    length: u16,
}

impl FirChannel {
    fn new() -> Self {
        Self {
            coeffs: [0; SP_MAX_FIR_LENGTH],
            delay: DelayLine::new(SP_MAX_FIR_LENGTH),
            length: 0,
        }
    }

    fn set_length(&mut self, length: u16) {
        self.length = length;
        if length >= 2 {
            self.delay = DelayLine::new(usize::from(length));
        }
    }

    fn reset(&mut self) {
        self.delay.reset();
    }

    fn process(&mut self, samples: &mut [i32]) {
        let len = usize::from(self.length);
        if len < 2 {
            // length 0/1: bypass (a 1-tap FIR is just a gain, not supported)
            return;
        }
        for x in samples.iter_mut() {
            let y = self.delay.eval(&self.coeffs[..len], *x);
            self.delay.push(*x);
            *x = y;
        }
    }
}

/// The post-SRC processing chain for both output channels.
pub struct SignalProcessor {
    mixer_gains: [[i32; SRC_CHANNELS]; SP_CHANNELS],
    biquads: [BiquadChannel; SP_CHANNELS],
    firs: [FirChannel; SP_CHANNELS],
    volume_db: [f32; SP_CHANNELS],
    loudness_db: [f32; SP_CHANNELS],
    allow_positive_gain: bool,
    scratch: [[i32; BATCH]; SP_CHANNELS],
}

impl SignalProcessor {
    /// Identity chain: unity mixer, no biquads, no FIR, 0 dB gain.
    #[must_use]
    pub fn new() -> Self {
        let mut mixer_gains = [[0i32; SRC_CHANNELS]; SP_CHANNELS];
        for (ch, row) in mixer_gains.iter_mut().enumerate() {
            if ch < SRC_CHANNELS {
                // identity at half scale; the mixer output is doubled
                row[ch] = 0x4000_0000;
            }
        }
        Self {
            mixer_gains,
            biquads: [BiquadChannel::new(), BiquadChannel::new()],
            firs: [FirChannel::new(), FirChannel::new()],
            volume_db: [0.0; SP_CHANNELS],
            loudness_db: [0.0; SP_CHANNELS],
            allow_positive_gain: false,
            scratch: [[0; BATCH]; SP_CHANNELS],
        }
    }

    /// Zero all filter state (mandatory after setup changes so stale state
    /// cannot produce numerical artefacts).
    pub fn reset(&mut self) {
        for b in &mut self.biquads {
            b.reset();
        }
        for f in &mut self.firs {
            f.reset();
        }
    }

    // ── setup ───────────────────────────────────────────────────────────

    /// Replace the mixer gain matrix (rows = output channels).
    pub fn set_mixer_gains(&mut self, gains: [[i32; SRC_CHANNELS]; SP_CHANNELS]) {
        self.mixer_gains = gains;
    }

    /// Current mixer gain matrix.
    #[must_use]
    pub fn mixer_gains(&self) -> [[i32; SRC_CHANNELS]; SP_CHANNELS] {
        self.mixer_gains
    }

    /// Configure stage counts and post-shifts; follow with [`Self::reset`].
    ///
    /// # Errors
    ///
    /// [`SpError::InvalidSetup`] when a count exceeds [`SP_MAX_BIQUADS`] or a
    /// post-shift exceeds 31.
    pub fn setup_biquads(
        &mut self,
        stages: [u8; SP_CHANNELS],
        post_shifts: [u8; SP_CHANNELS],
    ) -> Result<(), SpError> {
        for ch in 0..SP_CHANNELS {
            if usize::from(stages[ch]) > SP_MAX_BIQUADS || post_shifts[ch] > 31 {
                return Err(SpError::InvalidSetup);
            }
        }
        for ch in 0..SP_CHANNELS {
            self.biquads[ch].stages = stages[ch];
            self.biquads[ch].post_shift = post_shifts[ch];
        }
        Ok(())
    }

    /// Biquad setup readback `(stages, post_shifts)`.
    #[must_use]
    pub fn biquad_setup(&self) -> ([u8; SP_CHANNELS], [u8; SP_CHANNELS]) {
        (
            [self.biquads[0].stages, self.biquads[1].stages],
            [self.biquads[0].post_shift, self.biquads[1].post_shift],
        )
    }

    /// Write one stage's `b0 b1 b2 a1 a2` coefficient block.
    ///
    /// # Errors
    ///
    /// [`SpError::InvalidSetup`] for out-of-range channel or stage.
    pub fn write_biquad_stage(
        &mut self,
        ch: usize,
        stage: usize,
        coeffs: [i32; 5],
    ) -> Result<(), SpError> {
        if ch >= SP_CHANNELS || stage >= SP_MAX_BIQUADS {
            return Err(SpError::InvalidSetup);
        }
        self.biquads[ch].coeffs[5 * stage..5 * stage + 5].copy_from_slice(&coeffs);
        Ok(())
    }

    /// Read one stage's coefficient block.
    ///
    /// # Errors
    ///
    /// [`SpError::InvalidSetup`] for out-of-range channel or stage.
    pub fn read_biquad_stage(&self, ch: usize, stage: usize) -> Result<[i32; 5], SpError> {
        if ch >= SP_CHANNELS || stage >= SP_MAX_BIQUADS {
            return Err(SpError::InvalidSetup);
        }
        let mut out = [0i32; 5];
        out.copy_from_slice(&self.biquads[ch].coeffs[5 * stage..5 * stage + 5]);
        Ok(out)
    }

    /// Configure FIR lengths (0 bypasses the stage); follow with
    /// [`Self::reset`].
    ///
    /// # Errors
    ///
    /// [`SpError::InvalidSetup`] when a length exceeds [`SP_MAX_FIR_LENGTH`]
    /// or is 1.
    pub fn setup_firs(&mut self, lengths: [u16; SP_CHANNELS]) -> Result<(), SpError> {
        for &len in &lengths {
            if usize::from(len) > SP_MAX_FIR_LENGTH || len == 1 {
                return Err(SpError::InvalidSetup);
            }
        }
        for ch in 0..SP_CHANNELS {
            self.firs[ch].set_length(lengths[ch]);
        }
        Ok(())
    }

    /// FIR length readback.
    #[must_use]
    pub fn fir_setup(&self) -> [u16; SP_CHANNELS] {
        [self.firs[0].length, self.firs[1].length]
    }

    /// Write a window of FIR taps at `offset` (reverse-ordered).
    ///
    /// # Errors
    ///
    /// [`SpError::InvalidSetup`] when the window runs past
    /// [`SP_MAX_FIR_LENGTH`].
    pub fn write_fir_taps(&mut self, ch: usize, offset: usize, taps: &[i32]) -> Result<(), SpError> {
        if ch >= SP_CHANNELS || offset + taps.len() > SP_MAX_FIR_LENGTH {
            return Err(SpError::InvalidSetup);
        }
        self.firs[ch].coeffs[offset..offset + taps.len()].copy_from_slice(taps);
        Ok(())
    }

    /// Read a window of FIR taps at `offset`.
    ///
    /// # Errors
    ///
    /// [`SpError::InvalidSetup`] when the window runs past
    /// [`SP_MAX_FIR_LENGTH`].
    pub fn read_fir_taps(&self, ch: usize, offset: usize, out: &mut [i32]) -> Result<(), SpError> {
        if ch >= SP_CHANNELS || offset + out.len() > SP_MAX_FIR_LENGTH {
            return Err(SpError::InvalidSetup);
        }
        out.copy_from_slice(&self.firs[ch].coeffs[offset..offset + out.len()]);
        Ok(())
    }

    /// Allow or disallow positive total gains.
    pub fn set_allow_positive_gain(&mut self, allow: bool) {
        self.allow_positive_gain = allow;
    }

    /// Whether positive total gains are allowed.
    #[must_use]
    pub fn allow_positive_gain(&self) -> bool {
        self.allow_positive_gain
    }

    /// Set one channel's volume gain in dB.
    ///
    /// # Errors
    ///
    /// [`SpError::InvalidGain`] for NaN, below [`SP_MIN_VOL_GAIN_DB`], or
    /// positive without the allow flag.
    pub fn set_volume_db(&mut self, ch: usize, db: f32) -> Result<(), SpError> {
        if ch >= SP_CHANNELS || db.is_nan() || db < SP_MIN_VOL_GAIN_DB {
            return Err(SpError::InvalidGain);
        }
        if db > 0.0 && (!self.allow_positive_gain || db > SP_MAX_VOL_GAIN_DB) {
            return Err(SpError::InvalidGain);
        }
        self.volume_db[ch] = db;
        Ok(())
    }

    /// Volume gains in dB.
    #[must_use]
    pub fn volume_db(&self) -> [f32; SP_CHANNELS] {
        self.volume_db
    }

    /// Set one channel's loudness-compensation gain in dB.
    ///
    /// # Errors
    ///
    /// [`SpError::InvalidGain`] for NaN or above
    /// [`SP_MAX_LOUDNESS_GAIN_DB`].
    pub fn set_loudness_db(&mut self, ch: usize, db: f32) -> Result<(), SpError> {
        if ch >= SP_CHANNELS || db.is_nan() || db > SP_MAX_LOUDNESS_GAIN_DB {
            return Err(SpError::InvalidGain);
        }
        self.loudness_db[ch] = db;
        Ok(())
    }

    /// Loudness gains in dB.
    #[must_use]
    pub fn loudness_db(&self) -> [f32; SP_CHANNELS] {
        self.loudness_db
    }

    // ── processing ──────────────────────────────────────────────────────

    /// Process one SRC batch through the chain into `out`.
    ///
    /// `out` holds both channels: `[l0..l95, r0..r95]` non-interleaved or
    /// `[l0, r0, l1, r1, …]` interleaved; either way `2 * BATCH` samples.
    pub fn process(
        &mut self,
        input: &[[i32; BATCH]; SRC_CHANNELS],
        out: &mut [i32],
        interleaved: bool,
    ) {
        debug_assert!(out.len() >= SP_CHANNELS * BATCH);

        // mixer: matrix product into scratch, post-doubled for gain range
        for ch in 0..SP_CHANNELS {
            for n in 0..BATCH {
                let mut acc = 0i64;
                for (j, input_ch) in input.iter().enumerate() {
                    acc += i64::from(self.mixer_gains[ch][j]) * i64::from(input_ch[n]);
                }
                self.scratch[ch][n] = shift_sample(sat(acc >> 31), 1);
            }
        }

        for ch in 0..SP_CHANNELS {
            self.biquads[ch].process(&mut self.scratch[ch]);
            self.firs[ch].process(&mut self.scratch[ch]);

            // volume + loudness as one Q8.23 factor
            let mut total_db = self.volume_db[ch] + self.loudness_db[ch];
            if !self.allow_positive_gain && total_db > 0.0 {
                total_db = 0.0;
            }
            let gain = gain_q23(total_db);
            for x in self.scratch[ch].iter_mut() {
                *x = sat((i64::from(*x) * i64::from(gain)) >> 23);
            }

            // back to full scale, stride-aware copy out
            for n in 0..BATCH {
                let y = shift_sample(self.scratch[ch][n], -INPUT_SHIFT);
                let idx = if interleaved {
                    n * SP_CHANNELS + ch
                } else {
                    ch * BATCH + n
                };
                out[idx] = y;
            }
        }
    }
}

impl Default for SignalProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// dB → linear gain in Q8.23.
fn gain_q23(db: f32) -> i32 {
    let linear = powf(10.0, db / 20.0);
    let scaled = linear * (1 << 23) as f32;
    if scaled >= i32::MAX as f32 {
        i32::MAX
    } else {
        scaled as i32
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // tests use unwrap() for readable assertions
mod tests {
    use super::*;

    fn batch(value: i32) -> [[i32; BATCH]; SRC_CHANNELS] {
        [[value; BATCH]; SRC_CHANNELS]
    }

    #[test]
    fn identity_chain_restores_full_scale() {
        let mut sp = SignalProcessor::new();
        // input at the SRC's internal scale (pre-shifted right by 4)
        let input = batch(0x0010_0000);
        let mut out = [0i32; 2 * BATCH];
        sp.process(&input, &mut out, false);
        // identity mixer + shift-back: ~16x the internal level
        let expected = 0x0100_0000;
        assert!((out[0] - expected).abs() <= 0x20, "got {:#x}", out[0]);
        assert_eq!(out[0], out[BATCH]); // both channels identical
    }

    #[test]
    fn interleaved_output_strides_channels() {
        let mut sp = SignalProcessor::new();
        let input = [[1000i32; BATCH], [-1000i32; BATCH]];
        let mut non = [0i32; 2 * BATCH];
        let mut inter = [0i32; 2 * BATCH];
        sp.process(&input, &mut non, false);
        sp.reset();
        sp.process(&input, &mut inter, true);
        for n in 0..BATCH {
            assert_eq!(inter[2 * n], non[n]);
            assert_eq!(inter[2 * n + 1], non[BATCH + n]);
        }
    }

    #[test]
    fn mixer_swap_matrix_swaps_channels() {
        let mut sp = SignalProcessor::new();
        sp.set_mixer_gains([[0, 0x4000_0000], [0x4000_0000, 0]]);
        let input = [[2000i32; BATCH], [-4000i32; BATCH]];
        let mut out = [0i32; 2 * BATCH];
        sp.process(&input, &mut out, false);
        assert!(out[0] < 0); // left now carries the right input
        assert!(out[BATCH] > 0);
    }

    #[test]
    fn biquad_identity_stage_is_transparent() {
        let mut sp = SignalProcessor::new();
        // b0 = 0.5 with post-shift 1 → unity
        sp.setup_biquads([1, 1], [1, 1]).unwrap();
        for ch in 0..SP_CHANNELS {
            sp.write_biquad_stage(ch, 0, [0x4000_0000, 0, 0, 0, 0]).unwrap();
        }
        sp.reset();

        let mut with = [0i32; 2 * BATCH];
        sp.process(&batch(0x0008_0000), &mut with, false);

        let mut sp_ref = SignalProcessor::new();
        let mut without = [0i32; 2 * BATCH];
        sp_ref.process(&batch(0x0008_0000), &mut without, false);

        for (a, b) in with.iter().zip(&without) {
            assert!((a - b).abs() <= 1);
        }
    }

    #[test]
    fn volume_minus_six_db_halves_output() {
        let mut sp = SignalProcessor::new();
        let mut reference = [0i32; 2 * BATCH];
        sp.process(&batch(0x0020_0000), &mut reference, false);

        sp.set_volume_db(0, -6.0206).unwrap();
        sp.set_volume_db(1, -6.0206).unwrap();
        let mut halved = [0i32; 2 * BATCH];
        sp.process(&batch(0x0020_0000), &mut halved, false);

        let ratio = f64::from(halved[0]) / f64::from(reference[0]);
        assert!((ratio - 0.5).abs() < 0.001, "ratio {ratio}");
    }

    #[test]
    fn positive_gain_requires_enable_flag() {
        let mut sp = SignalProcessor::new();
        assert_eq!(sp.set_volume_db(0, 3.0), Err(SpError::InvalidGain));
        sp.set_allow_positive_gain(true);
        sp.set_volume_db(0, 3.0).unwrap();
        assert_eq!(sp.set_volume_db(0, 40.0), Err(SpError::InvalidGain));
    }

    #[test]
    fn fir_moving_average_smooths_steps(){
        let mut sp = SignalProcessor::new();
        sp.setup_firs([4, 0]).unwrap();
        // 4-tap moving average (reverse order is symmetric here)
        let quarter = 0x2000_0000;
        sp.write_fir_taps(0, 0, &[quarter; 4]).unwrap();
        sp.reset();

        let mut out = [0i32; 2 * BATCH];
        sp.process(&batch(0x0010_0000), &mut out, false);
        // left ramps up over 4 samples; right (bypassed) jumps immediately
        assert!(out[0] < out[3]);
        assert!(out[3] > 0);
        let right_first = out[BATCH];
        assert!(right_first > out[0]);
    }

    #[test]
    fn setup_validation_rejects_out_of_range() {
        let mut sp = SignalProcessor::new();
        assert!(sp.setup_biquads([17, 0], [1, 1]).is_err());
        assert!(sp.setup_biquads([1, 0], [32, 1]).is_err());
        assert!(sp.setup_firs([321, 0]).is_err());
        assert!(sp.setup_firs([1, 0]).is_err());
        assert!(sp.write_fir_taps(0, 318, &[0, 0, 0]).is_err());
    }
}
