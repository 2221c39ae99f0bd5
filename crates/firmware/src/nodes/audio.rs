//! Audio-processor node driver.
//!
//! The audio ISRs deposit sample batches and refill the output halves; the
//! main loop runs the silence sweep and serves the host. The binary wraps
//! the node in a [`crate::runtime::Shared`] cell, which is what makes the
//! source-switch reconfiguration atomic with respect to the audio ISRs.

use dsp::registers::int_flags;
use dsp::{AudioPipeline, DapRegisters, Half, Source};
use embedded_hal::digital::OutputPin;
use modules::I2cSlave;
use platform::pins::InterruptLine;

/// The audio-processor node.
pub struct AudioNode<L: OutputPin> {
    /// Host-facing I²C slave around the register bank.
    pub slave: I2cSlave<DapRegisters>,
    int_line: InterruptLine<L>,
    last_ready: bool,
    last_available: u8,
}

impl<L: OutputPin> AudioNode<L> {
    /// Build the node around a fresh pipeline.
    ///
    /// # Errors
    ///
    /// Propagates the interrupt pin error.
    pub fn new(bus_address: u8, pipeline: AudioPipeline, int_pin: L) -> Result<Self, L::Error> {
        let int_line = InterruptLine::new(int_pin)?;
        Ok(Self {
            slave: I2cSlave::new(DapRegisters::new(pipeline), bus_address, true),
            int_line,
            last_ready: false,
            last_available: 0,
        })
    }

    /// ISR entry: a batch of input samples arrived from `source`.
    pub fn on_input_batch(&mut self, source: Source, left: &[i32], right: &[i32], in_shift: i8) {
        self.slave
            .bank_mut()
            .pipeline
            .on_input_batch(source, left, right, in_shift);
    }

    /// ISR entry: the output DMA freed one buffer half.
    pub fn on_output_half(&mut self, half: Half) {
        self.slave.bank_mut().pipeline.on_output_half(half);
    }

    /// ISR entry: a source driver reports its stream rate (USB/S-PDIF).
    pub fn on_source_rate(&mut self, source: Source, rate: dsp::SampleRate) {
        self.slave.bank_mut().pipeline.set_source_rate(source, rate);
    }

    /// USB enumeration state (STATUS register bit).
    pub fn set_usb_connected(&mut self, connected: bool) {
        self.slave.bank_mut().usb_connected = connected;
    }

    /// Whether the host commanded a controller reset.
    #[must_use]
    pub fn reset_requested(&self) -> bool {
        self.slave.bank().reset_requested()
    }

    /// One main-loop cycle. Returns `true` when the I²C peripheral should be
    /// reset.
    pub fn poll(&mut self, bus_busy: bool) -> bool {
        {
            let bank = self.slave.bank_mut();
            bank.pipeline.poll();

            // edge-detect the states the host wants interrupts for
            let ready = bank.pipeline.src.is_ready();
            if ready != self.last_ready {
                self.last_ready = ready;
                bank.ints.trigger(int_flags::SRC_STATE);
            }
            let available = bank.pipeline.router.available_mask();
            if available != self.last_available {
                self.last_available = available;
                bank.ints.trigger(int_flags::INPUT_CHANGE);
            }

            let _ = self.int_line.set_asserted(bank.ints.line_asserted());
        }

        self.slave.poll(bus_busy).is_some()
    }
}
