//! Controller ↔ battery module end-to-end over an in-memory UART link.

#![allow(clippy::unwrap_used)] // tests use unwrap() for readable assertions

use battery::registers::{BatteryRegisters, REG_CELLS_SERIES, REG_MIN_VOLTAGE};
use battery::{BatterySupervisor, BMS_SHADOW_SIZE, HealthStore, GAUGE_ADDR};
use embedded_hal::i2c::{self, ErrorType, I2c, Operation};
use firmware::controller::{ControllerEvent, Module};
use firmware::Controller;
use modules::UartSlave;
use platform::mocks::MockFlash;

/// I²C bus with nothing attached (the amp/dap clients fail and retry; this
/// test only cares about the battery link).
struct DeadBus;

#[derive(Debug)]
struct DeadBusError;

impl i2c::Error for DeadBusError {
    fn kind(&self) -> i2c::ErrorKind {
        i2c::ErrorKind::Other
    }
}

impl ErrorType for DeadBus {
    type Error = DeadBusError;
}

impl I2c for DeadBus {
    fn transaction(
        &mut self,
        _address: u8,
        _operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        Err(DeadBusError)
    }
}

type Slave = UartSlave<BatteryRegisters<MockFlash<256>>, BMS_SHADOW_SIZE>;

fn new_slave() -> Slave {
    let supervisor = BatterySupervisor::new(GAUGE_ADDR);
    let health = HealthStore::load(MockFlash::new());
    UartSlave::new(BatteryRegisters::new(supervisor, health))
}

/// One wire-perfect main-loop cycle between controller and battery module.
fn pump(controller: &mut Controller, slave: &mut Slave, lc: &mut u32) {
    controller.poll(&mut DeadBus, *lc);
    while let Some(frame) = controller.battery.take_tx() {
        for &b in &frame {
            slave.on_rx_byte(b);
        }
    }
    while let Some(frame) = slave.poll(*lc) {
        slave.on_tx_complete();
        for &b in &frame {
            controller.battery.on_rx_byte(b);
        }
    }
    *lc += 1;
}

fn run_until_battery_ready(
    controller: &mut Controller,
    slave: &mut Slave,
    lc: &mut u32,
) -> bool {
    for _ in 0..500 {
        pump(controller, slave, lc);
        while let Some(event) = controller.next_event() {
            if event == ControllerEvent::ModuleReady(Module::Battery) {
                return true;
            }
        }
    }
    false
}

#[test]
fn battery_module_initialises_and_populates_shadow() {
    let mut controller = Controller::new();
    let mut slave = new_slave();
    let mut lc = 1;

    assert!(run_until_battery_ready(&mut controller, &mut slave, &mut lc));

    // prefetched constants are visible through the shadow
    assert_eq!(controller.battery.shadow().reg8(REG_CELLS_SERIES), 4);
    assert_eq!(controller.battery.shadow().reg16(REG_MIN_VOLTAGE), 3000);

    // no estimate yet: NaN fraction, invalid confidence
    let (fraction, confidence) = controller.battery_soc();
    assert!(fraction.is_nan());
    assert_eq!(confidence, 0);
}

#[test]
fn health_write_round_trips_to_the_module() {
    let mut controller = Controller::new();
    let mut slave = new_slave();
    let mut lc = 1;
    assert!(run_until_battery_ready(&mut controller, &mut slave, &mut lc));

    controller.write_battery_health(0.9).unwrap();
    for _ in 0..10 {
        pump(&mut controller, &mut slave, &mut lc);
    }
    assert_eq!(slave.bank().health.value(), 0.9);
}

#[test]
fn module_reset_triggers_reinitialisation() {
    let mut controller = Controller::new();
    let mut slave = new_slave();
    let mut lc = 1;
    assert!(run_until_battery_ready(&mut controller, &mut slave, &mut lc));

    // the module reboots: MCU_RESET event goes out, the controller re-runs
    // the whole handshake
    slave.announce_mcu_reset();
    let mut saw_reset = false;
    let mut saw_ready = false;
    for _ in 0..500 {
        pump(&mut controller, &mut slave, &mut lc);
        while let Some(event) = controller.next_event() {
            match event {
                ControllerEvent::ModuleReset(Module::Battery) => saw_reset = true,
                ControllerEvent::ModuleReady(Module::Battery) if saw_reset => saw_ready = true,
                _ => {}
            }
        }
        if saw_ready {
            break;
        }
    }
    assert!(saw_reset && saw_ready);
}
