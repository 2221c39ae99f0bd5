//! Amp register bank served through the I²C slave state machine.

#![allow(clippy::unwrap_used)] // tests use unwrap() for readable assertions

use link::crc::crc8;
use modules::{BusDirection, I2cSlave, RegisterBank, ReadAccess, ReadKind};
use poweramp::registers::{
    amp_layout, control, int_flags, status, AMP_MODULE_ID, REG_CONTROL, REG_INT_FLAGS,
    REG_MODULE_ID, REG_PVDD_TARGET, REG_SERR_BASE, REG_STATUS,
};
use poweramp::{AmpRegisters, OutputMonitor};

const BUS_ADDR: u8 = 0x4A;
const ADDR_W: u8 = BUS_ADDR << 1;
const ADDR_R: u8 = (BUS_ADDR << 1) | 1;

fn new_slave() -> I2cSlave<AmpRegisters> {
    I2cSlave::new(AmpRegisters::new(OutputMonitor::new(1000)), BUS_ADDR, true)
}

/// Read `count` sequential registers starting at `reg`, verifying CRCs.
fn bus_read(slave: &mut I2cSlave<AmpRegisters>, reg: u8, count: usize) -> Vec<Vec<u8>> {
    slave.on_addressed(BusDirection::MasterWrite);
    slave.on_byte_written(reg);
    slave.on_stop();
    slave.on_addressed(BusDirection::MasterRead);

    let layout = amp_layout();
    let mut result = Vec::new();
    let mut current = reg;
    for i in 0..count {
        let width = layout.width(current).max(1);
        let mut data = Vec::new();
        for _ in 0..width {
            data.push(slave.next_read_byte());
        }
        let crc_byte = slave.next_read_byte();
        let mut crc = if i == 0 {
            crc8(0, &[ADDR_W, reg, ADDR_R])
        } else {
            0
        };
        crc = crc8(crc, &data);
        assert_eq!(crc, crc_byte, "crc of register {current:#x}");
        result.push(data);
        current = current.wrapping_add(1);
    }
    slave.on_stop();
    result
}

/// Write one register with a correct CRC.
fn bus_write(slave: &mut I2cSlave<AmpRegisters>, reg: u8, data: &[u8]) {
    slave.on_addressed(BusDirection::MasterWrite);
    slave.on_byte_written(reg);
    let mut crc = crc8(0, &[ADDR_W, reg]);
    crc = crc8(crc, data);
    for &b in data {
        slave.on_byte_written(b);
    }
    slave.on_byte_written(crc);
    slave.on_stop();
}

#[test]
fn module_id_and_width_law() {
    let mut slave = new_slave();
    let regs = bus_read(&mut slave, REG_MODULE_ID, 1);
    assert_eq!(regs[0], vec![AMP_MODULE_ID]);

    // every valid register returns exactly width(a) bytes
    let layout = amp_layout();
    for addr in 1..=0xFFu8 {
        let width = layout.width(addr);
        if width == 0 {
            continue;
        }
        let mut slave = new_slave();
        let regs = bus_read(&mut slave, addr, 1);
        assert_eq!(regs[0].len(), width, "register {addr:#x}");
    }
}

#[test]
fn invalid_address_serves_dummy_and_sets_error_bit() {
    let mut slave = new_slave();
    // 0x05 is not a register
    slave.on_addressed(BusDirection::MasterWrite);
    slave.on_byte_written(0x05);
    slave.on_stop();
    slave.on_addressed(BusDirection::MasterRead);
    let b = slave.next_read_byte();
    assert_eq!(b, 0);
    slave.on_stop();
    assert!(slave.link_error_pending());

    // the next STATUS read reports and clears I2CERR
    let regs = bus_read(&mut slave, REG_STATUS, 1);
    let word = u16::from_le_bytes([regs[0][0], regs[0][1]]);
    assert_ne!(word & status::I2CERR, 0);
    let regs = bus_read(&mut slave, REG_STATUS, 1);
    let word = u16::from_le_bytes([regs[0][0], regs[0][1]]);
    assert_eq!(word & status::I2CERR, 0);
}

#[test]
fn sequential_read_chains_pvdd_block() {
    let mut slave = new_slave();
    slave
        .bank_mut()
        .pvdd
        .set_target(30.0)
        .unwrap();
    let regs = bus_read(&mut slave, REG_PVDD_TARGET, 3);
    let target = f32::from_le_bytes(regs[0].clone().try_into().unwrap());
    let requested = f32::from_le_bytes(regs[1].clone().try_into().unwrap());
    assert_eq!(target, 30.0);
    assert_eq!(requested, 30.0);
}

#[test]
fn threshold_write_outside_manual_shutdown_is_rejected() {
    let mut slave = new_slave();
    // leave manual shutdown: CONTROL with AMP_MAN_SD clear
    bus_write(&mut slave, REG_CONTROL, &[control::INT_EN]);
    assert!(!slave.bank().safety.manual_shutdown());

    let before = slave.bank_mut().read_threshold_for_test();
    bus_write(&mut slave, REG_SERR_BASE, &5.0f32.to_le_bytes());
    assert!(slave.link_error_pending());
    assert_eq!(slave.bank_mut().read_threshold_for_test(), before);

    // back in shutdown the write lands
    bus_write(&mut slave, REG_CONTROL, &[control::AMP_MAN_SD]);
    bus_write(&mut slave, REG_SERR_BASE, &5.0f32.to_le_bytes());
    assert_eq!(slave.bank_mut().read_threshold_for_test(), 5.0);
}

#[test]
fn corrupted_write_crc_is_discarded() {
    let mut slave = new_slave();
    bus_write(&mut slave, REG_CONTROL, &[control::AMP_MAN_SD]);

    // write a threshold with a bad CRC byte
    let data = 6.0f32.to_le_bytes();
    slave.on_addressed(BusDirection::MasterWrite);
    slave.on_byte_written(REG_SERR_BASE);
    for &b in &data {
        slave.on_byte_written(b);
    }
    slave.on_byte_written(0xDE); // wrong CRC
    slave.on_stop();

    assert_ne!(slave.bank_mut().read_threshold_for_test(), 6.0);
    assert!(slave.link_error_pending());
}

#[test]
fn reset_flag_is_present_at_boot_and_write_cleared() {
    let mut slave = new_slave();
    let regs = bus_read(&mut slave, REG_INT_FLAGS, 1);
    assert_ne!(regs[0][0] & int_flags::RESET, 0);

    bus_write(&mut slave, REG_INT_FLAGS, &[!int_flags::RESET]);
    let regs = bus_read(&mut slave, REG_INT_FLAGS, 1);
    assert_eq!(regs[0][0] & int_flags::RESET, 0);
}

/// Test-only helper: first error threshold (I_rms inst A).
trait ThresholdPeek {
    fn read_threshold_for_test(&mut self) -> f32;
}

impl ThresholdPeek for AmpRegisters {
    fn read_threshold_for_test(&mut self) -> f32 {
        let mut out = [0u8; 4];
        let mut link_error = false;
        let access = ReadAccess {
            kind: ReadKind::Notification,
            link_error: &mut link_error,
        };
        let _ = RegisterBank::read(self, REG_SERR_BASE, &mut out, access);
        f32::from_le_bytes(out)
    }
}
