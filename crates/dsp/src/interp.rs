//! Fixed 2× FIR interpolator (first SRC stage for 44.1/48 kHz inputs).

use crate::ffir::coeffs::FIR_INT2_COEFFS;
use crate::q31::DelayLine;

/// Taps per phase of the interpolation filter.
pub const INT2_TAPS: usize = 110;

/// Polyphase 2× interpolator: every input sample yields two outputs, one per
/// phase, then shifts into the shared delay line.
pub struct Interpolator2x {
    delay: DelayLine<{ 2 * (INT2_TAPS - 1) }>,
}

impl Interpolator2x {
    /// Zero-history interpolator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            delay: DelayLine::new(INT2_TAPS),
        }
    }

    /// Zero the history.
    pub fn reset(&mut self) {
        self.delay.reset();
    }

    /// Interpolate `input` into `output`; `output.len()` must be
    /// `2 * input.len()`.
    pub fn process(&mut self, input: &[i32], output: &mut [i32]) {
        debug_assert!(output.len() == 2 * input.len());
        for (n, &x) in input.iter().enumerate() {
            output[2 * n] = self.delay.eval(&FIR_INT2_COEFFS[0], x);
            output[2 * n + 1] = self.delay.eval(&FIR_INT2_COEFFS[1], x);
            self.delay.push(x);
        }
    }
}

impl Default for Interpolator2x {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dc_passes_at_unity_after_settling() {
        let mut interp = Interpolator2x::new();
        let input = [0x0100_0000i32; 256];
        let mut out = [0i32; 512];
        interp.process(&input, &mut out);
        // after the filter delay the output sits at the input level
        for &y in &out[300..] {
            let err = (y - 0x0100_0000).abs();
            assert!(err < 0x0002_0000, "dc error {err}");
        }
    }

    #[test]
    fn output_rate_is_doubled() {
        let mut interp = Interpolator2x::new();
        let input = [1i32; 8];
        let mut out = [0i32; 16];
        interp.process(&input, &mut out);
        // length contract is the whole story; content settles over the
        // filter's group delay
    }
}
