//! On-wire byte checks for the I²C master, including the CRC chaining rules.

#![allow(clippy::unwrap_used)] // tests use unwrap() for readable assertions

use embedded_hal_mock::eh1::i2c::{Mock, Transaction};
use link::crc::crc8;
use modules::{total_size, I2cMaster, ModuleEvent, RegisterLayout};

const ADDR: u8 = 0x2A;
const ADDR_W: u8 = ADDR << 1;
const ADDR_R: u8 = (ADDR << 1) | 1;

const REG_INT_FLAGS: u8 = 0x11;
const REG_TARGET: u8 = 0x20;
const REG_NEXT: u8 = 0x21;

const fn widths() -> [u8; 256] {
    let mut w = [0u8; 256];
    w[REG_INT_FLAGS as usize] = 1;
    w[REG_TARGET as usize] = 4;
    w[REG_NEXT as usize] = 4;
    w
}
static WIDTHS: [u8; 256] = widths();
const SHADOW_SIZE: usize = total_size(&WIDTHS);

type Client = I2cMaster<SHADOW_SIZE, 8>;

fn client(crc: bool) -> Client {
    I2cMaster::new(RegisterLayout::new(&WIDTHS), ADDR, REG_INT_FLAGS, crc)
}

#[test]
fn write_appends_crc_over_address_and_data() {
    let data = 25.0_f32.to_le_bytes();
    let mut crc = crc8(0, &[ADDR_W, REG_TARGET]);
    crc = crc8(crc, &data);

    let expected = vec![
        Transaction::write(
            ADDR,
            vec![REG_TARGET, data[0], data[1], data[2], data[3], crc],
        ),
    ];
    let mut bus = Mock::new(&expected);

    let mut m = client(true);
    let token = m.write_register(REG_TARGET, &data).unwrap();
    m.poll(&mut bus);

    let c = m.next_completion().unwrap();
    assert_eq!((c.token, c.ok, c.width), (token, true, 4));
    bus.done();
}

#[test]
fn read_checks_crc_over_header_and_data() {
    let data = 42.5_f32.to_le_bytes();
    let mut crc = crc8(0, &[ADDR_W, REG_TARGET, ADDR_R]);
    crc = crc8(crc, &data);

    let expected = vec![Transaction::write_read(
        ADDR,
        vec![REG_TARGET],
        vec![data[0], data[1], data[2], data[3], crc],
    )];
    let mut bus = Mock::new(&expected);

    let mut m = client(true);
    m.read_register(REG_TARGET).unwrap();
    m.poll(&mut bus);

    let c = m.next_completion().unwrap();
    assert!(c.ok);
    assert_eq!(m.shadow().regf32(REG_TARGET), 42.5);
    bus.done();
}

#[test]
fn sequential_read_restarts_crc_with_data_only() {
    let d0 = 1.0_f32.to_le_bytes();
    let d1 = 2.0_f32.to_le_bytes();
    let mut crc0 = crc8(0, &[ADDR_W, REG_TARGET, ADDR_R]);
    crc0 = crc8(crc0, &d0);
    let crc1 = crc8(0, &d1); // chained register: data bytes only

    let mut response = Vec::new();
    response.extend_from_slice(&d0);
    response.push(crc0);
    response.extend_from_slice(&d1);
    response.push(crc1);

    let expected = vec![Transaction::write_read(ADDR, vec![REG_TARGET], response)];
    let mut bus = Mock::new(&expected);

    let mut m = client(true);
    m.read_registers(REG_TARGET, 2).unwrap();
    m.poll(&mut bus);

    assert!(m.next_completion().unwrap().ok);
    assert_eq!(m.shadow().regf32(REG_TARGET), 1.0);
    assert_eq!(m.shadow().regf32(REG_NEXT), 2.0);
    bus.done();
}

#[test]
fn corrupted_crc_retries_and_then_succeeds() {
    let data = 7.0_f32.to_le_bytes();
    let mut good = crc8(0, &[ADDR_W, REG_TARGET, ADDR_R]);
    good = crc8(good, &data);

    let expected = vec![
        Transaction::write_read(
            ADDR,
            vec![REG_TARGET],
            vec![data[0], data[1], data[2], data[3], good ^ 0xFF],
        ),
        Transaction::write_read(
            ADDR,
            vec![REG_TARGET],
            vec![data[0], data[1], data[2], data[3], good],
        ),
    ];
    let mut bus = Mock::new(&expected);

    let mut m = client(true);
    let token = m.read_register(REG_TARGET).unwrap();
    m.poll(&mut bus); // first attempt: bad CRC, requeued
    assert!(m.next_completion().is_none());
    m.poll(&mut bus); // retry succeeds

    let c = m.next_completion().unwrap();
    assert_eq!((c.token, c.ok), (token, true));
    bus.done();
}

#[test]
fn crc_disabled_uses_plain_register_bytes() {
    let data = [0x11, 0x22, 0x33, 0x44];
    let expected = vec![
        Transaction::write(ADDR, vec![REG_TARGET, 0x11, 0x22, 0x33, 0x44]),
        Transaction::write_read(ADDR, vec![REG_TARGET], data.to_vec()),
    ];
    let mut bus = Mock::new(&expected);

    let mut m = client(false);
    m.write_register(REG_TARGET, &data).unwrap();
    m.poll(&mut bus);
    m.read_register(REG_TARGET).unwrap();
    m.poll(&mut bus);

    assert!(m.next_completion().unwrap().ok);
    assert!(m.next_completion().unwrap().ok);
    bus.done();
}

#[test]
fn interrupt_line_service_reads_and_clears_flags() {
    let flags = 0b0000_0110u8;
    let mut read_crc = crc8(0, &[ADDR_W, REG_INT_FLAGS, ADDR_R]);
    read_crc = crc8(read_crc, &[flags]);
    let mut clear_crc = crc8(0, &[ADDR_W, REG_INT_FLAGS]);
    clear_crc = crc8(clear_crc, &[!flags]);

    let expected = vec![
        Transaction::write_read(ADDR, vec![REG_INT_FLAGS], vec![flags, read_crc]),
        Transaction::write(ADDR, vec![REG_INT_FLAGS, !flags, clear_crc]),
    ];
    let mut bus = Mock::new(&expected);

    let mut m = client(true);
    m.on_interrupt_edge();
    m.poll(&mut bus);

    assert_eq!(m.next_event(), Some(ModuleEvent::Interrupt(flags)));
    bus.done();
}
