//! Battery-monitor node driver.
//!
//! Wires the gauge supervisor, the host UART slave and the power switch
//! together: the switch decides the desired deepsleep/FET state, supervisor
//! errors surface as host error events, and timed-shutdown changes force a
//! change-notification pass so the host hears about them promptly.

use battery::registers::BatteryRegisters;
use battery::{BatterySupervisor, HealthStore, SupervisorEvent, BMS_SHADOW_SIZE};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::InputPin;
use embedded_hal::i2c::I2c;
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};
use heapless::Vec;
use modules::uart_slave::TX_FRAME_MAX;
use modules::{ErrorCode, UartSlave};
use platform::pins::{PowerSwitch, SwitchState};
use platform::timing::cycles;

/// Power-switch debounce window.
const SWITCH_DEBOUNCE: u32 = cycles(50);

/// The battery node.
pub struct BatteryNode<S, P: InputPin> {
    /// Host-facing UART slave around the register bank.
    pub slave: UartSlave<BatteryRegisters<S>, BMS_SHADOW_SIZE>,
    switch: PowerSwitch<P>,
    gauge_error_reported: bool,
}

impl<S: ReadNorFlash + NorFlash, P: InputPin> BatteryNode<S, P> {
    /// Build the node and queue the MCU-reset announcement.
    ///
    /// # Errors
    ///
    /// Propagates the switch pin's read error.
    pub fn new(
        supervisor: BatterySupervisor,
        health: HealthStore<S>,
        switch_pin: P,
    ) -> Result<Self, P::Error> {
        let mut slave = UartSlave::new(BatteryRegisters::new(supervisor, health));
        slave.announce_mcu_reset();
        Ok(Self {
            slave,
            switch: PowerSwitch::new(switch_pin, SWITCH_DEBOUNCE)?,
            gauge_error_reported: false,
        })
    }

    /// Gauge initialisation (runs once at boot, blocking on the gauge bus).
    ///
    /// # Errors
    ///
    /// Propagates gauge errors after retries; the node still serves the
    /// host, reporting the error state.
    pub fn init<B: I2c, D: DelayNs>(
        &mut self,
        bus: &mut B,
        delay: &mut D,
        alert_low: impl Fn() -> bool,
    ) -> Result<(), battery::GaugeError> {
        let result = self
            .slave
            .bank_mut()
            .supervisor
            .init(bus, delay, alert_low);
        if result.is_err() {
            self.slave.report_error(ErrorCode::BMS_I2C, true);
        }
        result
    }

    /// ISR entry: gauge alert line fell.
    pub fn on_alert_edge(&mut self) {
        self.slave.bank_mut().supervisor.on_alert_edge();
    }

    /// ISR entry: power-switch pin edge.
    pub fn on_switch_edge(&mut self) {
        self.switch.on_edge();
    }

    /// ISR entry: one byte received from the host link.
    pub fn on_rx_byte(&mut self, byte: u8) {
        self.slave.on_rx_byte(byte);
    }

    /// ISR entry: host-link transmission completed.
    pub fn on_tx_complete(&mut self) {
        self.slave.on_tx_complete();
    }

    /// ISR entry: host-link transmission failed.
    pub fn on_tx_error(&mut self) {
        self.slave.on_tx_error();
    }

    /// Whether the node may enter its low-power stop state: switch off and
    /// settled, gauge in deepsleep, no alert pending.
    #[must_use]
    pub fn may_stop(&mut self, alert_low: bool) -> bool {
        self.switch.state() == SwitchState::Off
            && !self.switch.is_settling()
            && self.slave.bank().supervisor.status.mode == battery::GaugeMode::DeepSleep
            && !alert_low
    }

    /// One main-loop cycle. Returns the next host frame to transmit, if any.
    pub fn poll<B: I2c, D: DelayNs>(
        &mut self,
        bus: &mut B,
        delay: &mut D,
        loop_count: u32,
        alert_low: bool,
    ) -> Option<Vec<u8, TX_FRAME_MAX>> {
        if let Ok(Some(state)) = self.switch.poll() {
            if state == SwitchState::Off {
                // user turned the system off: stale shutdown requests die
                self.slave.bank_mut().supervisor.reset_shutdown_state();
            }
        }
        let powered = self.switch.state() == SwitchState::On;
        {
            let supervisor = &mut self.slave.bank_mut().supervisor;
            supervisor.set_power_on(powered);
            supervisor.should_deepsleep = !powered;
            supervisor.should_disable_fets = !powered;
        }

        let event = self
            .slave
            .bank_mut()
            .supervisor
            .poll(bus, delay, loop_count, alert_low);
        if let Some(SupervisorEvent::ShutdownFired(_)) = event {
            self.slave.force_change_check();
        }

        // surface gauge communication errors as host events, once per episode
        let pending = self.slave.bank().supervisor.comm_error_pending();
        if pending && !self.gauge_error_reported {
            self.slave.report_error(ErrorCode::BMS_I2C, false);
        }
        self.gauge_error_reported = pending;

        self.slave.poll(loop_count)
    }
}
