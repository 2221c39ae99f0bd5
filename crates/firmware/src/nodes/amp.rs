//! Power-amp node driver.
//!
//! ADC batches feed the monitor and the instantaneous safety check from the
//! conversion ISR; the main loop runs the smoothed checks, the PVDD
//! controller and the shutdown mirroring onto the amp reset line. The node
//! owns the line and the open-drain host interrupt; the register bank owns
//! everything behind them.

use embedded_hal::digital::OutputPin;
use modules::I2cSlave;
use platform::pins::InterruptLine;
use platform::timing::{cycles, Cycles};
use poweramp::registers::int_flags;
use poweramp::safety::SafetyEvent;
use poweramp::{AmpRegisters, OutputMonitor, PvddError};

/// EMA settle time before the init quiescence check runs.
const INIT_SETTLE: Cycles = cycles(500);

/// Hardware side-effects of one poll, for the vendor glue to apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AmpOutputs {
    /// New tracking-DAC code to program, if any.
    pub dac_code: Option<u16>,
    /// Whether the I²C peripheral should be reset (slave fault).
    pub reset_peripheral: bool,
}

/// The power-amp node.
pub struct AmpNode<R: OutputPin, L: OutputPin> {
    /// Host-facing I²C slave around the register bank.
    pub slave: I2cSlave<AmpRegisters>,
    amp_reset_n: R,
    int_line: InterruptLine<L>,
    settle_remaining: Cycles,
}

impl<R: OutputPin, L: OutputPin> AmpNode<R, L> {
    /// Build the node: amp held in reset, maximum rail requested (going up
    /// is always safe after a spurious restart).
    ///
    /// # Errors
    ///
    /// Propagates pin errors and the (statically impossible) initial DAC
    /// range error.
    pub fn new(
        bus_address: u8,
        monitor: OutputMonitor,
        mut amp_reset_n: R,
        int_pin: L,
    ) -> Result<(Self, AmpOutputs), NodeInitError<R::Error, L::Error>> {
        amp_reset_n.set_low().map_err(NodeInitError::ResetPin)?;
        let int_line = InterruptLine::new(int_pin).map_err(NodeInitError::IntPin)?;

        let mut bank = AmpRegisters::new(monitor);
        let action = bank
            .pvdd
            .set_target(poweramp::pvdd::MAX_VOLTAGE)
            .map_err(NodeInitError::Pvdd)?;

        let node = Self {
            slave: I2cSlave::new(bank, bus_address, true),
            amp_reset_n,
            int_line,
            settle_remaining: INIT_SETTLE,
        };
        let outputs = AmpOutputs {
            dac_code: action.dac_code,
            reset_peripheral: false,
        };
        Ok((node, outputs))
    }

    /// ISR entry: one channel's ADC batch, already converted to volts/amps.
    ///
    /// Feeds the monitor and runs the instantaneous safety check; an error
    /// breach drops the reset line before this returns.
    pub fn on_adc_batch(&mut self, ch: usize, voltage: &[f32], current: &[f32]) {
        let bank = self.slave.bank_mut();
        bank.monitor.feed_batch(ch, voltage, current);
        match bank.safety.check_inst(&bank.monitor) {
            Some(SafetyEvent::Error) => {
                bank.ints.trigger(int_flags::SERR);
                // deassert immediately; the main loop will confirm
                let _ = self.amp_reset_n.set_low();
            }
            Some(SafetyEvent::Warning) => bank.ints.trigger(int_flags::SWARN),
            None => {}
        }
    }

    /// ISR entries for the bus protocol are forwarded straight to
    /// [`I2cSlave`]; see its methods.
    pub fn slave_mut(&mut self) -> &mut I2cSlave<AmpRegisters> {
        &mut self.slave
    }

    /// One main-loop cycle with the raw PVDD rail measurement.
    pub fn poll(&mut self, pvdd_measured_volts: f32, bus_busy: bool) -> AmpOutputs {
        let mut outputs = AmpOutputs::default();

        // init settle: once the EMAs are meaningful, run the quiescence
        // check and release the boot latch
        if self.settle_remaining > 0 {
            self.settle_remaining -= 1;
            if self.settle_remaining == 0 {
                let bank = self.slave.bank_mut();
                if bank.safety.finish_init(&bank.monitor).is_err() {
                    bank.ints.trigger(int_flags::SERR);
                }
            }
        }

        {
            let bank = self.slave.bank_mut();

            // PVDD regulation
            let action = bank.pvdd.poll(pvdd_measured_volts);
            if let Some(event) = action.event {
                bank.note_pvdd_event(event);
            }
            if action.dac_code.is_some() {
                outputs.dac_code = action.dac_code;
            }
            // host PVDD writes stage their DAC code in the bank
            if let Some(code) = bank.take_dac_code() {
                outputs.dac_code = Some(code);
            }

            // smoothed safety checks
            match bank.safety.check_loop(&bank.monitor) {
                Some(SafetyEvent::Error) => bank.ints.trigger(int_flags::SERR),
                Some(SafetyEvent::Warning) => bank.ints.trigger(int_flags::SWARN),
                None => {}
            }

            // the reset line mirrors the combined shutdown rule
            let shutdown = bank.safety.is_shutdown(bank.pvdd.is_valid());
            if shutdown {
                let _ = self.amp_reset_n.set_low();
            } else {
                let _ = self.amp_reset_n.set_high();
            }

            let _ = self.int_line.set_asserted(bank.ints.line_asserted());
        }

        if self.slave.poll(bus_busy).is_some() {
            outputs.reset_peripheral = true;
        }

        outputs
    }
}

/// Construction errors of [`AmpNode`].
#[derive(Debug)]
pub enum NodeInitError<RE, LE> {
    /// Amp reset pin failed.
    ResetPin(RE),
    /// Interrupt line pin failed.
    IntPin(LE),
    /// Initial PVDD request failed.
    Pvdd(PvddError),
}
