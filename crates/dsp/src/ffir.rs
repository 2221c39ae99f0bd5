//! Fractional polyphase FIR resampling.
//!
//! A `P`-phase filter of `T` taps per phase: every output is one phase's FIR
//! over a shared delay line; the phase then advances by the (fractional)
//! step, and each whole-`P` wrap consumes one input sample. Arbitrary real
//! resampling ratios come down to bounded per-sample work.

use crate::q31::DelayLine;

/// Generated coefficient tables (see `build.rs` for the layout contract).
pub mod coeffs {
    include!(concat!(env!("OUT_DIR"), "/coeffs.rs"));
}

/// Parameter errors for the resampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FfirError {
    /// Fractional step is NaN, negative or out of range.
    InvalidStep,
}

/// Fractional polyphase FIR over a static coefficient table.
///
/// `P` phases × `T` taps; `STATE` must equal `2 * (T - 1)` (mirrored delay
/// line).
pub struct FractionalFir<const P: usize, const T: usize, const STATE: usize> {
    coeffs: &'static [[i32; T]; P],
    delay: DelayLine<STATE>,
    step_int: u16,
    step_frac: f32,
    phase_int: u32,
    phase_frac: f32,
}

impl<const P: usize, const T: usize, const STATE: usize> FractionalFir<P, T, STATE> {
    /// Create a resampler with the given integer/fractional phase step.
    ///
    /// # Errors
    ///
    /// [`FfirError::InvalidStep`] for NaN or out-of-range fractional steps.
    pub fn new(
        coeffs: &'static [[i32; T]; P],
        step_int: u16,
        step_frac: f32,
    ) -> Result<Self, FfirError> {
        check_step(step_frac)?;
        Ok(Self {
            coeffs,
            delay: DelayLine::new(T),
            step_int,
            step_frac,
            phase_int: 0,
            phase_frac: 0.0,
        })
    }

    /// Zero the delay line and return the phase to zero. The configured step
    /// is kept.
    pub fn reset(&mut self) {
        self.delay.reset();
        self.phase_int = 0;
        self.phase_frac = 0.0;
    }

    /// Current fractional step.
    #[must_use]
    pub fn step_frac(&self) -> f32 {
        self.step_frac
    }

    /// Replace the fractional step (the adaptive controller does this once
    /// per output batch, identically on every channel).
    ///
    /// # Errors
    ///
    /// [`FfirError::InvalidStep`] for NaN or out-of-range values; the old
    /// step stays in effect.
    pub fn set_step_frac(&mut self, step_frac: f32) -> Result<(), FfirError> {
        check_step(step_frac)?;
        self.step_frac = step_frac;
        Ok(())
    }

    /// Resample `input` into `output`.
    ///
    /// Stops at whichever buffer is exhausted first and returns
    /// `(produced, consumed)`. The phase state carries over, so arbitrary
    /// input batching yields identical sample streams.
    pub fn process(&mut self, input: &[i32], output: &mut [i32]) -> (usize, usize) {
        if input.is_empty() || output.is_empty() {
            return (0, 0);
        }

        let phases = P as u32;
        let mut idx = 0usize;
        let mut produced = 0usize;

        loop {
            // consume input until the phase is back in [0, P)
            while self.phase_int >= phases {
                self.delay.push(input[idx]);
                self.phase_int -= phases;
                idx += 1;
                if idx == input.len() {
                    return (produced, idx);
                }
            }

            if produced == output.len() {
                return (produced, idx);
            }

            output[produced] = self
                .delay
                .eval(&self.coeffs[self.phase_int as usize], input[idx]);
            produced += 1;

            // advance the phase: integer part, then fractional carry
            self.phase_int += u32::from(self.step_int);
            if self.step_frac > 0.0 {
                self.phase_frac += self.step_frac;
                if self.phase_frac >= 1.0 {
                    let whole = self.phase_frac as u32;
                    self.phase_frac -= whole as f32;
                    self.phase_int += whole;
                }
            }
        }
    }
}

fn check_step(step_frac: f32) -> Result<(), FfirError> {
    if step_frac.is_nan() || !(0.0..=f32::from(u16::MAX)).contains(&step_frac) {
        return Err(FfirError::InvalidStep);
    }
    Ok(())
}

/// Adaptive final-stage resampler (one per channel).
pub type AdaptiveFfir = FractionalFir<96, 50, 98>;
/// Fixed 160/147 resampler (one per channel).
pub type Ffir160147 = FractionalFir<160, 20, 38>;

impl AdaptiveFfir {
    /// Adaptive resampler at its nominal 1:1 step.
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept as `Result` to match [`FractionalFir::new`].
    pub fn adaptive() -> Result<Self, FfirError> {
        // whole step lives in the fractional part; the controller trims it
        Self::new(&coeffs::FFIR_ADAPTIVE_COEFFS, 0, 96.0)
    }
}

impl Ffir160147 {
    /// Fixed 160/147 resampler (88.2 kHz → 96 kHz stage).
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept as `Result` to match [`FractionalFir::new`].
    pub fn fixed_160_147() -> Result<Self, FfirError> {
        Self::new(&coeffs::FFIR_160147_COEFFS, 147, 0.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // tests use unwrap() for readable assertions
mod tests {
    use super::*;

    /// Small synthetic table: 4 phases × 3 taps, each phase passes the
    /// current sample through at (almost) unity.
    static PASS: [[i32; 3]; 4] = {
        let one = i32::MAX;
        [[0, 0, one], [0, 0, one], [0, 0, one], [0, 0, one]]
    };

    #[test]
    fn unity_step_is_one_to_one() {
        let mut f: FractionalFir<4, 3, 4> = FractionalFir::new(&PASS, 4, 0.0).unwrap();
        let input = [1000i32; 32];
        let mut out = [0i32; 32];
        let (produced, consumed) = f.process(&input, &mut out);
        assert_eq!(produced, consumed);
        // steady state passes the signal through
        assert!(out[8..produced].iter().all(|&y| (y - 1000).abs() <= 1));
    }

    #[test]
    fn fractional_step_downsamples() {
        // step 6 on 4 phases: consume 3 inputs per 2 outputs
        let mut f: FractionalFir<4, 3, 4> = FractionalFir::new(&PASS, 6, 0.0).unwrap();
        let input = [500i32; 60];
        let mut out = [0i32; 60];
        let (produced, consumed) = f.process(&input, &mut out);
        assert_eq!(consumed, 60);
        assert!((40 - 2..=40).contains(&produced));
    }

    #[test]
    fn split_input_matches_single_call() {
        let ramp: [i32; 48] = core::array::from_fn(|i| (i as i32) * 1_000_000);
        let mut whole: FractionalFir<4, 3, 4> = FractionalFir::new(&PASS, 3, 0.5).unwrap();
        let mut out_whole = [0i32; 96];
        let (p_whole, c_whole) = whole.process(&ramp, &mut out_whole);

        let mut split: FractionalFir<4, 3, 4> = FractionalFir::new(&PASS, 3, 0.5).unwrap();
        let mut out_split = [0i32; 96];
        let (p1, c1) = split.process(&ramp[..17], &mut out_split);
        let (p2, c2) = split.process(&ramp[17..], &mut out_split[p1..]);

        assert_eq!(c1 + c2, c_whole);
        assert_eq!(p1 + p2, p_whole);
        assert_eq!(out_split[..p_whole], out_whole[..p_whole]);
    }

    #[test]
    fn invalid_step_is_rejected_with_no_processing() {
        let r: Result<FractionalFir<4, 3, 4>, _> = FractionalFir::new(&PASS, 4, f32::NAN);
        assert_eq!(r.err().unwrap(), FfirError::InvalidStep);

        let mut f: FractionalFir<4, 3, 4> = FractionalFir::new(&PASS, 4, 0.0).unwrap();
        assert!(f.set_step_frac(-1.0).is_err());
        assert_eq!(f.step_frac(), 0.0);
    }

    #[test]
    fn exhausted_input_returns_early() {
        let mut f: FractionalFir<4, 3, 4> = FractionalFir::new(&PASS, 8, 0.0).unwrap();
        let input = [1i32; 3];
        let mut out = [0i32; 16];
        let (produced, consumed) = f.process(&input, &mut out);
        assert_eq!(consumed, 3);
        assert!(produced <= 2);
    }

    #[test]
    fn generated_tables_have_unity_phase_gain() {
        for phase in coeffs::FFIR_ADAPTIVE_COEFFS.iter() {
            let sum: i64 = phase.iter().map(|&c| i64::from(c)).sum();
            let gain = sum as f64 / 2_147_483_648.0;
            assert!((gain - 1.0).abs() < 0.05, "phase gain {gain}");
        }
    }
}
