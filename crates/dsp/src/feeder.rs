//! Double-buffered output feeder.
//!
//! The serial-audio DMA streams a two-batch circular buffer; every
//! half-complete interrupt hands the just-freed half back to the pipeline.
//! If the converter is not ready the half is zero-filled so the output
//! stays clocked with silence instead of underrunning.

use crate::converter::{BatchOutcome, SampleRateConverter, BATCH, INPUT_SHIFT, SRC_CHANNELS};
use crate::processor::SignalProcessor;

/// Interleaved samples per buffer half (one batch, both channels).
pub const HALF_SAMPLES: usize = BATCH * SRC_CHANNELS;
/// Total DMA buffer size in samples.
pub const BUF_SAMPLES: usize = 2 * HALF_SAMPLES;

/// Which half of the buffer to refill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Half {
    /// First half (refilled after the half-complete interrupt).
    First,
    /// Second half (refilled after the transfer-complete interrupt).
    Second,
}

/// The DMA-backed output buffer and its refill logic.
pub struct OutputFeeder {
    buffer: [i32; BUF_SAMPLES],
}

impl OutputFeeder {
    /// Silent buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffer: [0; BUF_SAMPLES],
        }
    }

    /// Backing buffer for the DMA engine.
    #[must_use]
    pub fn buffer(&self) -> &[i32; BUF_SAMPLES] {
        &self.buffer
    }

    /// Refill one half from the pipeline; zero-fills when the converter has
    /// no batch to give. Returns the converter outcome so the node can react
    /// to starvation.
    pub fn refill_half(
        &mut self,
        half: Half,
        src: &mut SampleRateConverter,
        sp: &mut SignalProcessor,
        sp_enabled: bool,
    ) -> BatchOutcome {
        let offset = match half {
            Half::First => 0,
            Half::Second => HALF_SAMPLES,
        };

        let mut left = [0i32; BATCH];
        let mut right = [0i32; BATCH];
        let outcome = src.produce_batch([&mut left, &mut right]);

        let slot = &mut self.buffer[offset..offset + HALF_SAMPLES];
        if outcome == BatchOutcome::Produced {
            if sp_enabled {
                sp.process(&[left, right], slot, true);
            } else {
                // processor bypass: interleave and restore full scale
                for n in 0..BATCH {
                    slot[SRC_CHANNELS * n] = crate::q31::shift_sample(left[n], -INPUT_SHIFT);
                    slot[SRC_CHANNELS * n + 1] = crate::q31::shift_sample(right[n], -INPUT_SHIFT);
                }
            }
        } else {
            slot.fill(0);
        }
        outcome
    }
}

impl Default for OutputFeeder {
    fn default() -> Self {
        Self::new()
    }
}
