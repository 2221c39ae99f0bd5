//! The audio pipeline of the processor node: router → converter → signal
//! processor → feeder, with the glue rules between them.
//!
//! An active-source change is the only compound operation: it queries the
//! source's nominal rate, reconfigures the converter and resets the signal
//! processor. The node driver runs it with the audio interrupts masked so
//! the feeder never observes a half-reconfigured chain.

use crate::converter::{BatchOutcome, SampleRate, SampleRateConverter, SrcError};
use crate::feeder::{Half, OutputFeeder};
use crate::ffir::FfirError;
use crate::processor::SignalProcessor;
use crate::router::{InputRouter, RouterError, RouterEvent, Source, SOURCE_COUNT};

/// The complete pipeline state owned by the processor node.
pub struct AudioPipeline {
    /// Input availability/selection.
    pub router: InputRouter,
    /// Three-stage sample-rate converter.
    pub src: SampleRateConverter,
    /// Post-conversion processing chain.
    pub sp: SignalProcessor,
    /// DMA-side output buffer.
    pub feeder: OutputFeeder,
    /// Whether the processing chain is engaged (bypass otherwise).
    pub sp_enabled: bool,
    /// Last reported rate per source (I²S rates are host-written, USB and
    /// S/PDIF report their own).
    source_rates: [SampleRate; SOURCE_COUNT],
}

impl AudioPipeline {
    /// Build an idle pipeline.
    ///
    /// # Errors
    ///
    /// Propagates filter construction errors.
    pub fn new() -> Result<Self, FfirError> {
        Ok(Self {
            router: InputRouter::new(),
            src: SampleRateConverter::new()?,
            sp: SignalProcessor::new(),
            feeder: OutputFeeder::new(),
            sp_enabled: false,
            source_rates: [SampleRate::Unknown; SOURCE_COUNT],
        })
    }

    /// Record the self-reported rate of a source (USB/S-PDIF drivers).
    pub fn set_source_rate(&mut self, source: Source, rate: SampleRate) {
        self.source_rates[source as usize] = rate;
        if source == self.router.active() {
            // rate change under an active stream forces a reconfigure
            let _ = self.apply_active_change(source);
        }
    }

    /// Host write of an I²S nominal rate register.
    pub fn set_i2s_rate(&mut self, index: usize, rate: SampleRate) {
        self.router.set_i2s_rate(index, rate);
        let source = match index {
            0 => Source::I2s1,
            1 => Source::I2s2,
            _ => Source::I2s3,
        };
        self.source_rates[source as usize] = rate;
        if source == self.router.active() {
            let _ = self.apply_active_change(source);
        }
    }

    /// Host selection of the active input.
    ///
    /// # Errors
    ///
    /// [`RouterError::NotAvailable`] when the source has no signal.
    pub fn activate(&mut self, source: Source) -> Result<(), RouterError> {
        if let Some(RouterEvent::ActiveChanged(s)) = self.router.activate(source)? {
            let _ = self.apply_active_change(s);
        }
        Ok(())
    }

    /// ISR entry: a batch of samples arrived from `source`.
    ///
    /// Routes the batch into the converter when the source is active;
    /// always refreshes the source's liveness.
    pub fn on_input_batch(&mut self, source: Source, left: &[i32], right: &[i32], in_shift: i8) {
        let forward = self.router.note_activity(source);
        if forward {
            let _ = self.src.write_input([left, right], in_shift);
        }
    }

    /// ISR entry: the output DMA freed one buffer half.
    pub fn on_output_half(&mut self, half: Half) {
        let outcome = self
            .feeder
            .refill_half(half, &mut self.src, &mut self.sp, self.sp_enabled);
        if outcome == BatchOutcome::Starved {
            // park the starving input until it refills the buffer
            let active = self.router.active();
            if let Some(RouterEvent::ActiveChanged(next)) = self.router.stop(active) {
                let _ = self.apply_active_change(next);
            }
        }
    }

    /// Main-loop tick: silence sweep and fall-back switching.
    pub fn poll(&mut self) {
        if let Some(RouterEvent::ActiveChanged(next)) = self.router.poll() {
            let _ = self.apply_active_change(next);
        }
    }

    fn apply_active_change(&mut self, source: Source) -> Result<(), SrcError> {
        self.sp.reset();
        if source == Source::None {
            return Ok(());
        }
        let rate = match source {
            Source::I2s1 => self.router.i2s_rate(0),
            Source::I2s2 => self.router.i2s_rate(1),
            Source::I2s3 => self.router.i2s_rate(2),
            _ => self.source_rates[source as usize],
        };
        self.src.configure(rate).map_err(|e| {
            // unconfigurable rate: drop the source again
            let _ = self.router.stop(source);
            e
        })
    }
}
